//! Samplers propose the next point of the search space to evaluate.
//!
//! The optimizer only talks to the [`Sampler`] trait, so any Bayesian or
//! evolutionary strategy can be substituted.

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::Trial;

use crate::pareto::rank_and_crowding;
use crate::space::{Point, SearchSpace};

pub trait Sampler: Send {
    /// Propose a point not yet in `history` or `pending`.
    /// Returns `None` once every point of the space has been proposed.
    fn suggest(&mut self, space: &SearchSpace, history: &[Trial], pending: &[Point])
        -> Option<Point>;
}

fn visited(history: &[Trial], pending: &[Point]) -> HashSet<Point> {
    history
        .iter()
        .map(|t| t.indices)
        .chain(pending.iter().copied())
        .collect()
}

/// Walks the space in row-major order. Used when the trial budget covers
/// the whole space.
#[derive(Debug, Default)]
pub struct ExhaustiveSampler {
    cursor: usize,
}

impl ExhaustiveSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Sampler for ExhaustiveSampler {
    fn suggest(
        &mut self,
        space: &SearchSpace,
        history: &[Trial],
        pending: &[Point],
    ) -> Option<Point> {
        let seen = visited(history, pending);
        while self.cursor < space.size() {
            let point = space.point_at(self.cursor);
            self.cursor += 1;
            if !seen.contains(&point) {
                return Some(point);
            }
        }
        None
    }
}

/// NSGA-II style sampler over the discrete grid.
///
/// The first `startup_trials` points are uniform random. After that, two
/// parents are drawn by binary tournament on (non-domination rank, crowding
/// distance) among complete trials, recombined per dimension and mutated, so
/// new trials concentrate around the current front. Seeded for reproducibility.
#[derive(Debug)]
pub struct EvolutionarySampler {
    rng: StdRng,
    startup_trials: usize,
    mutation_rate: f64,
}

impl EvolutionarySampler {
    const MAX_CHILD_ATTEMPTS: usize = 32;
    const MAX_RANDOM_ATTEMPTS: usize = 64;

    pub fn new(seed: u64, startup_trials: usize, mutation_rate: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            startup_trials,
            mutation_rate: mutation_rate.clamp(0.0, 1.0),
        }
    }

    fn random_point(&mut self, space: &SearchSpace) -> Point {
        let dims = space.dims();
        [
            self.rng.gen_range(0..dims[0]),
            self.rng.gen_range(0..dims[1]),
            self.rng.gen_range(0..dims[2]),
            self.rng.gen_range(0..dims[3]),
        ]
    }

    fn random_unvisited(&mut self, space: &SearchSpace, seen: &HashSet<Point>) -> Option<Point> {
        if seen.len() >= space.size() {
            return None;
        }
        for _ in 0..Self::MAX_RANDOM_ATTEMPTS {
            let point = self.random_point(space);
            if !seen.contains(&point) {
                return Some(point);
            }
        }
        // Dense history: scan from a random offset so the result is still seeded.
        let size = space.size();
        let offset = self.rng.gen_range(0..size);
        (0..size)
            .map(|i| space.point_at((offset + i) % size))
            .find(|p| !seen.contains(p))
    }

    fn tournament<'a>(&mut self, pool: &[(&'a Trial, (usize, f64))]) -> &'a Trial {
        let a = &pool[self.rng.gen_range(0..pool.len())];
        let b = &pool[self.rng.gen_range(0..pool.len())];
        let (ra, ca) = a.1;
        let (rb, cb) = b.1;
        if ra < rb || (ra == rb && ca >= cb) {
            a.0
        } else {
            b.0
        }
    }

    fn child(&mut self, space: &SearchSpace, p1: &Point, p2: &Point) -> Point {
        let dims = space.dims();
        let mut child = [0; 4];
        for d in 0..4 {
            child[d] = if self.rng.gen_bool(0.5) { p1[d] } else { p2[d] };
            if dims[d] > 1 && self.rng.gen_bool(self.mutation_rate) {
                child[d] = if self.rng.gen_bool(0.5) {
                    // Local step to a neighbouring grid value.
                    if self.rng.gen_bool(0.5) {
                        (child[d] + 1).min(dims[d] - 1)
                    } else {
                        child[d].saturating_sub(1)
                    }
                } else {
                    self.rng.gen_range(0..dims[d])
                };
            }
        }
        child
    }
}

impl Sampler for EvolutionarySampler {
    fn suggest(
        &mut self,
        space: &SearchSpace,
        history: &[Trial],
        pending: &[Point],
    ) -> Option<Point> {
        let seen = visited(history, pending);
        let complete: Vec<&Trial> = history.iter().filter(|t| t.is_complete()).collect();

        if complete.len() < self.startup_trials.max(2) {
            return self.random_unvisited(space, &seen);
        }

        let objectives: Vec<_> = complete.iter().filter_map(|t| t.objectives).collect();
        let pool: Vec<(&Trial, (usize, f64))> = complete
            .iter()
            .copied()
            .zip(rank_and_crowding(&objectives))
            .collect();

        for _ in 0..Self::MAX_CHILD_ATTEMPTS {
            let p1 = self.tournament(&pool).indices;
            let p2 = self.tournament(&pool).indices;
            let child = self.child(space, &p1, &p2);
            if !seen.contains(&child) {
                return Some(child);
            }
        }
        self.random_unvisited(space, &seen)
    }
}
