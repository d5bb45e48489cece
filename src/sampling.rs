//! Pure point-generation helpers for multi-point queries: a line between
//! two endpoints, a multi-leg path, and a regular grid (supplemental to
//! the distilled spec; see SPEC_FULL.md §6.1). These never touch the
//! network or the spatial index — callers feed their output into the
//! batch planner (§4.6).

/// `count` evenly spaced points from `(lat0, lon0)` to `(lat1, lon1)`
/// inclusive of both endpoints. `count` must be at least 2.
pub fn line_points(lat0: f64, lon0: f64, lat1: f64, lon1: f64, count: usize) -> Vec<(f64, f64)> {
    let count = count.max(2);
    (0..count)
        .map(|i| {
            let t = i as f64 / (count - 1) as f64;
            (lat0 + (lat1 - lat0) * t, lon0 + (lon1 - lon0) * t)
        })
        .collect()
}

/// Evenly spaced points along each leg of a multi-vertex path, with
/// `points_per_leg` points per leg (endpoints shared between adjacent
/// legs are not duplicated).
pub fn path_points(vertices: &[(f64, f64)], points_per_leg: usize) -> Vec<(f64, f64)> {
    if vertices.len() < 2 {
        return vertices.to_vec();
    }
    let mut out = Vec::new();
    for (i, window) in vertices.windows(2).enumerate() {
        let (lat0, lon0) = window[0];
        let (lat1, lon1) = window[1];
        let leg = line_points(lat0, lon0, lat1, lon1, points_per_leg);
        if i == 0 {
            out.extend(leg);
        } else {
            out.extend(leg.into_iter().skip(1));
        }
    }
    out
}

/// A regular `rows` x `cols` grid of points spanning the bounding box
/// defined by its two opposite corners.
pub fn grid_points(
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
    rows: usize,
    cols: usize,
) -> Vec<(f64, f64)> {
    let rows = rows.max(1);
    let cols = cols.max(1);
    let mut out = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        let row_t = if rows == 1 { 0.0 } else { r as f64 / (rows - 1) as f64 };
        let lat = min_lat + (max_lat - min_lat) * row_t;
        for c in 0..cols {
            let col_t = if cols == 1 { 0.0 } else { c as f64 / (cols - 1) as f64 };
            let lon = min_lon + (max_lon - min_lon) * col_t;
            out.push((lat, lon));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_points_includes_both_endpoints() {
        let points = line_points(0.0, 0.0, 10.0, 20.0, 5);
        assert_eq!(points.first(), Some(&(0.0, 0.0)));
        assert_eq!(points.last(), Some(&(10.0, 20.0)));
        assert_eq!(points.len(), 5);
    }

    #[test]
    fn path_points_does_not_duplicate_shared_vertices() {
        let vertices = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0)];
        let points = path_points(&vertices, 3);
        // 3 points per leg, 2 legs, minus 1 shared vertex = 5 points.
        assert_eq!(points.len(), 5);
        assert_eq!(points[2], (1.0, 0.0));
    }

    #[test]
    fn grid_points_covers_all_four_corners() {
        let points = grid_points(0.0, 0.0, 10.0, 10.0, 3, 3);
        assert_eq!(points.len(), 9);
        assert!(points.contains(&(0.0, 0.0)));
        assert!(points.contains(&(10.0, 10.0)));
        assert!(points.contains(&(0.0, 10.0)));
        assert!(points.contains(&(10.0, 0.0)));
    }
}
