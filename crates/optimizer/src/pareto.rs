use serde::{Deserialize, Serialize};

use common::{ObjectiveVector, RiskConfiguration, Trial};

/// True if `a` is at least as good as `b` on every objective and strictly
/// better on at least one.
pub fn dominates(a: &ObjectiveVector, b: &ObjectiveVector) -> bool {
    let (a, b) = (a.as_array(), b.as_array());
    a.iter().zip(&b).all(|(x, y)| x >= y) && a.iter().zip(&b).any(|(x, y)| x > y)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrontPoint {
    pub trial_id: u32,
    pub config: RiskConfiguration,
    pub objectives: ObjectiveVector,
}

/// Non-dominated set of one optimization run. Points are ordered by trial id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParetoFront {
    points: Vec<FrontPoint>,
}

impl ParetoFront {
    /// Non-dominated subset of the complete trials. Pruned and failed trials
    /// never enter the front.
    pub fn from_trials(trials: &[Trial]) -> Self {
        let mut complete: Vec<FrontPoint> = trials
            .iter()
            .filter(|t| t.is_complete())
            .filter_map(|t| {
                t.objectives.map(|objectives| FrontPoint {
                    trial_id: t.trial_id,
                    config: t.config,
                    objectives,
                })
            })
            .collect();
        complete.sort_by_key(|p| p.trial_id);

        let points = complete
            .iter()
            .filter(|p| {
                !complete
                    .iter()
                    .any(|q| dominates(&q.objectives, &p.objectives))
            })
            .cloned()
            .collect();
        Self { points }
    }

    pub fn points(&self) -> &[FrontPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn contains_trial(&self, trial_id: u32) -> bool {
        self.points.iter().any(|p| p.trial_id == trial_id)
    }

    pub fn objectives(&self) -> impl Iterator<Item = &ObjectiveVector> + '_ {
        self.points.iter().map(|p| &p.objectives)
    }
}

/// Non-domination rank (0 = first front) and crowding distance for each
/// vector, used by the evolutionary sampler for parent selection.
pub(crate) fn rank_and_crowding(objectives: &[ObjectiveVector]) -> Vec<(usize, f64)> {
    let n = objectives.len();
    let mut rank = vec![usize::MAX; n];
    let mut dominated_by_count = vec![0usize; n];
    let mut dominates_list: Vec<Vec<usize>> = vec![Vec::new(); n];

    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }
            if dominates(&objectives[i], &objectives[j]) {
                dominates_list[i].push(j);
            } else if dominates(&objectives[j], &objectives[i]) {
                dominated_by_count[i] += 1;
            }
        }
    }

    let mut fronts: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = (0..n).filter(|&i| dominated_by_count[i] == 0).collect();
    let mut level = 0;
    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            rank[i] = level;
            for &j in &dominates_list[i] {
                dominated_by_count[j] -= 1;
                if dominated_by_count[j] == 0 {
                    next.push(j);
                }
            }
        }
        fronts.push(std::mem::take(&mut current));
        current = next;
        level += 1;
    }

    let mut crowding = vec![0.0_f64; n];
    for front in &fronts {
        for m in 0..3 {
            let mut sorted = front.clone();
            sorted.sort_by(|&a, &b| {
                objectives[a].as_array()[m].total_cmp(&objectives[b].as_array()[m])
            });
            let (Some(&lo), Some(&hi)) = (sorted.first(), sorted.last()) else {
                continue;
            };
            crowding[lo] = f64::INFINITY;
            crowding[hi] = f64::INFINITY;
            let span = objectives[hi].as_array()[m] - objectives[lo].as_array()[m];
            if span <= 0.0 || !span.is_finite() {
                continue;
            }
            for w in sorted.windows(3) {
                let gap = objectives[w[2]].as_array()[m] - objectives[w[0]].as_array()[m];
                crowding[w[1]] += gap / span;
            }
        }
    }

    rank.into_iter().zip(crowding).collect()
}
