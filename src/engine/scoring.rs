use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::directory::CandidateCourier;

const AVAILABILITY_BASELINE: f64 = 50.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub proximity_score: f64,
    pub route_score: f64,
    pub rating_score: f64,
    pub availability_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub courier_id: Uuid,
    pub distance_to_origin_km: f64,
    pub total_route_km: f64,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
}

pub fn compute_score(
    rating: f64,
    distance_to_origin_km: f64,
    total_route_km: f64,
) -> (f64, ScoreBreakdown) {
    let breakdown = ScoreBreakdown {
        proximity_score: proximity_score(distance_to_origin_km),
        route_score: route_score(total_route_km),
        rating_score: rating_score(rating),
        availability_score: AVAILABILITY_BASELINE,
    };

    (total(&breakdown), breakdown)
}

pub fn total(breakdown: &ScoreBreakdown) -> f64 {
    breakdown.proximity_score
        + breakdown.route_score
        + breakdown.rating_score
        + breakdown.availability_score
}

fn proximity_score(distance_to_origin_km: f64) -> f64 {
    (100.0 - distance_to_origin_km * 10.0).max(0.0)
}

fn route_score(total_route_km: f64) -> f64 {
    (100.0 - total_route_km * 5.0).max(0.0)
}

fn rating_score(rating: f64) -> f64 {
    (rating * 10.0).max(0.0)
}

/// Highest score first; equal scores fall back to courier id so the order is
/// reproducible.
pub fn rank(candidates: &[CandidateCourier]) -> Vec<ScoredCandidate> {
    let mut scored: Vec<ScoredCandidate> = candidates
        .iter()
        .map(|candidate| {
            let (score, score_breakdown) = compute_score(
                candidate.courier.rating,
                candidate.distance_to_origin_km,
                candidate.total_route_km,
            );
            ScoredCandidate {
                courier_id: candidate.courier.id,
                distance_to_origin_km: candidate.distance_to_origin_km,
                total_route_km: candidate.total_route_km,
                score,
                score_breakdown,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.courier_id.cmp(&b.courier_id))
    });
    scored
}
