//! Picks a small, diverse subset of the Pareto front for live selection.
//!
//! Ties on any objective go to the lowest trial id.

use serde::{Deserialize, Serialize};

use common::ObjectiveVector;

use crate::pareto::{FrontPoint, ParetoFront};

/// Upper bound on candidates handed to the bandit.
pub const MAX_CANDIDATES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateRole {
    BestWinRate,
    BestRiskReward,
    BestExpectedValue,
    /// Closest to the ideal point in normalized objective space.
    Balanced,
    /// Next closest to the ideal point; fills slots freed by de-duplication.
    NearIdeal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub roles: Vec<CandidateRole>,
    pub point: FrontPoint,
}

/// Select `min(4, |front|)` distinct front points: the extreme of each
/// objective, then the balanced compromise, then the next points nearest the
/// ideal until the slots are filled.
pub fn select_candidates(front: &ParetoFront) -> Vec<Candidate> {
    let points = front.points();
    if points.is_empty() {
        return Vec::new();
    }

    let mut picks: Vec<(usize, CandidateRole)> = vec![
        (argmax(points, |o| o.win_rate), CandidateRole::BestWinRate),
        (argmax(points, |o| o.risk_reward_ratio), CandidateRole::BestRiskReward),
        (argmax(points, |o| o.expected_value), CandidateRole::BestExpectedValue),
    ];

    let distances = ideal_distances(points);
    let mut by_distance: Vec<usize> = (0..points.len()).collect();
    // Stable sort keeps trial-id order among equal distances.
    by_distance.sort_by(|&a, &b| distances[a].total_cmp(&distances[b]));
    picks.push((by_distance[0], CandidateRole::Balanced));

    let mut candidates: Vec<(usize, Candidate)> = Vec::new();
    for (idx, role) in picks {
        match candidates.iter_mut().find(|(i, _)| *i == idx) {
            Some((_, c)) => c.roles.push(role),
            None => candidates.push((
                idx,
                Candidate {
                    roles: vec![role],
                    point: points[idx].clone(),
                },
            )),
        }
    }

    let target = MAX_CANDIDATES.min(points.len());
    for idx in by_distance {
        if candidates.len() >= target {
            break;
        }
        if candidates.iter().all(|(i, _)| *i != idx) {
            candidates.push((
                idx,
                Candidate {
                    roles: vec![CandidateRole::NearIdeal],
                    point: points[idx].clone(),
                },
            ));
        }
    }

    candidates.truncate(target);
    candidates.into_iter().map(|(_, c)| c).collect()
}

fn argmax(points: &[FrontPoint], key: impl Fn(&ObjectiveVector) -> f64) -> usize {
    let mut best = 0;
    for (i, p) in points.iter().enumerate().skip(1) {
        if key(&p.objectives) > key(&points[best].objectives) {
            best = i;
        }
    }
    best
}

/// Euclidean distance of each point to the ideal point (1, 1, 1) after
/// min-max normalizing every objective over the front.
fn ideal_distances(points: &[FrontPoint]) -> Vec<f64> {
    let mut lo = [f64::INFINITY; 3];
    let mut hi = [f64::NEG_INFINITY; 3];
    for p in points {
        for (m, v) in p.objectives.as_array().into_iter().enumerate() {
            lo[m] = lo[m].min(v);
            hi[m] = hi[m].max(v);
        }
    }

    points
        .iter()
        .map(|p| {
            p.objectives
                .as_array()
                .into_iter()
                .enumerate()
                .map(|(m, v)| {
                    let span = hi[m] - lo[m];
                    let normalized = if span > 0.0 { (v - lo[m]) / span } else { 1.0 };
                    (1.0 - normalized).powi(2)
                })
                .sum::<f64>()
                .sqrt()
        })
        .collect()
}
