//! Campaign scorer: ranks candidate datasets best-first (spec.md §4.2).

use crate::config::ScoringWeights;
use crate::types::{Confidence, Dataset};

/// Piecewise-linear anchors for the resolution sub-score, in meters.
const RESOLUTION_ANCHORS: &[(f64, f64)] = &[
    (0.5, 1.00),
    (1.0, 0.90),
    (2.0, 0.75),
    (5.0, 0.55),
    (10.0, 0.35),
    (30.0, 0.10),
];

fn resolution_score(resolution_m: f64) -> f64 {
    if resolution_m <= RESOLUTION_ANCHORS[0].0 {
        return RESOLUTION_ANCHORS[0].1;
    }
    if resolution_m >= RESOLUTION_ANCHORS[RESOLUTION_ANCHORS.len() - 1].0 {
        return RESOLUTION_ANCHORS[RESOLUTION_ANCHORS.len() - 1].1;
    }
    for window in RESOLUTION_ANCHORS.windows(2) {
        let (lo_res, lo_score) = window[0];
        let (hi_res, hi_score) = window[1];
        if resolution_m >= lo_res && resolution_m <= hi_res {
            let t = (resolution_m - lo_res) / (hi_res - lo_res);
            return lo_score + t * (hi_score - lo_score);
        }
    }
    RESOLUTION_ANCHORS[RESOLUTION_ANCHORS.len() - 1].1
}

fn temporal_score(acquisition_year: i32) -> f64 {
    (((acquisition_year - 2000) as f64) / 25.0).clamp(0.0, 1.0)
}

/// City-sized footprint (~0.01 deg^2) scores ~0.9; continental mosaics
/// (~1000 deg^2 or more) score ~0.2. Interpolated in log-area space so
/// the curve is monotone decreasing without a cliff at either end.
fn spatial_score(area_deg2: f64) -> f64 {
    const CITY_AREA: f64 = 0.01;
    const CITY_SCORE: f64 = 0.9;
    const CONTINENTAL_AREA: f64 = 1000.0;
    const CONTINENTAL_SCORE: f64 = 0.2;

    let area = area_deg2.max(1e-6);
    let log_city = CITY_AREA.ln();
    let log_continental = CONTINENTAL_AREA.ln();
    let t = ((area.ln() - log_city) / (log_continental - log_city)).clamp(0.0, 1.0);
    (CITY_SCORE + t * (CONTINENTAL_SCORE - CITY_SCORE)).clamp(0.0, 1.0)
}

fn provider_score(provider: &str) -> f64 {
    match provider {
        "elvis" => 1.0,
        "ga" => 0.9,
        "csiro" => 0.8,
        _ => 0.6,
    }
}

/// A scored candidate dataset, ready for sorting best-first.
#[derive(Debug, Clone)]
pub struct ScoredDataset {
    pub dataset: Dataset,
    pub score: f64,
}

/// Rank datasets best-first per the weighted multi-factor score, and
/// report an overall confidence for the top pick (spec.md §4.2).
///
/// Ties are broken by greater `acquisition_year`, then by `dataset.id`
/// lexicographic order, so the ranking is a total order independent of
/// the candidates' input order.
pub fn rank(candidates: &[Dataset], weights: &ScoringWeights) -> (Vec<ScoredDataset>, Confidence) {
    let mut scored: Vec<ScoredDataset> = candidates
        .iter()
        .map(|dataset| {
            let score = weights.resolution * resolution_score(dataset.resolution_m)
                + weights.temporal * temporal_score(dataset.acquisition_year)
                + weights.spatial * spatial_score(dataset.coverage_bbox.area_deg2())
                + weights.provider * provider_score(&dataset.provider);
            ScoredDataset {
                dataset: dataset.clone(),
                score,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.dataset.acquisition_year.cmp(&a.dataset.acquisition_year))
            .then_with(|| a.dataset.id.cmp(&b.dataset.id))
    });

    let confidence = match scored.as_slice() {
        [] => Confidence::Low,
        [only] if only.score >= 0.8 => Confidence::High,
        [top, second, ..] if top.score >= 0.8 && (top.score - second.score) >= 0.1 => {
            Confidence::High
        }
        [top, ..] if top.score >= 0.5 => Confidence::Medium,
        _ => Confidence::Low,
    };

    (scored, confidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BBox, DatasetId, PriorityClass};

    fn dataset(id: &str, resolution_m: f64, year: i32, provider: &str, area_deg2: f64) -> Dataset {
        Dataset {
            id: DatasetId(id.to_string()),
            name: id.to_string(),
            provider: provider.to_string(),
            native_crs: "EPSG:4326".into(),
            resolution_m,
            acquisition_year: year,
            coverage_bbox: BBox {
                min_lat: 0.0,
                min_lon: 0.0,
                max_lat: area_deg2.sqrt(),
                max_lon: area_deg2.sqrt(),
            },
            confidence: 0.9,
            priority_class: PriorityClass::High,
            file_list: vec![],
        }
    }

    #[test]
    fn resolution_anchors_match_spec_values() {
        assert!((resolution_score(0.5) - 1.00).abs() < 1e-9);
        assert!((resolution_score(1.0) - 0.90).abs() < 1e-9);
        assert!((resolution_score(2.0) - 0.75).abs() < 1e-9);
        assert!((resolution_score(5.0) - 0.55).abs() < 1e-9);
        assert!((resolution_score(10.0) - 0.35).abs() < 1e-9);
        assert!((resolution_score(30.0) - 0.10).abs() < 1e-9);
        assert!((resolution_score(100.0) - 0.10).abs() < 1e-9);
    }

    #[test]
    fn scoring_monotonicity_in_resolution() {
        // Two datasets equal on all factors except resolution: the finer
        // one must rank higher (spec.md §8).
        let weights = ScoringWeights::default();
        let fine = dataset("fine", 0.5, 2020, "elvis", 0.01);
        let coarse = dataset("coarse", 10.0, 2020, "elvis", 0.01);
        let (ranked, _) = rank(&[coarse, fine], &weights);
        assert_eq!(ranked[0].dataset.id.0, "fine");
    }

    #[test]
    fn ties_broken_by_acquisition_year_then_id() {
        let weights = ScoringWeights::default();
        let older = dataset("sydney_2013_1m", 1.0, 2013, "elvis", 0.01);
        let newer = dataset("sydney_2020_1m", 1.0, 2020, "elvis", 0.01);
        let (ranked, _) = rank(&[older, newer], &weights);
        assert_eq!(ranked[0].dataset.id.0, "sydney_2020_1m");
    }

    #[test]
    fn confidence_high_requires_top_score_and_margin() {
        let weights = ScoringWeights::default();
        let best = dataset("best", 0.5, 2024, "elvis", 0.01);
        let close_second = dataset("second", 0.5, 2023, "elvis", 0.01);
        let (_, confidence) = rank(&[best, close_second], &weights);
        // Nearly identical datasets should not produce High confidence:
        // the margin between top and second is too small.
        assert_ne!(confidence, Confidence::High);
    }

    #[test]
    fn confidence_low_when_no_candidates() {
        let weights = ScoringWeights::default();
        let (_, confidence) = rank(&[], &weights);
        assert_eq!(confidence, Confidence::Low);
    }
}
