use common::{ObjectiveVector, RiskConfiguration, Trial, TrialState};
use optimizer::{dominates, select_candidates, ParetoFront};
use proptest::prelude::*;

fn arb_trials() -> impl Strategy<Value = Vec<Trial>> {
    prop::collection::vec(
        (
            0.0..=1.0_f64,
            0.0..5.0_f64,
            -2.0..3.0_f64,
            prop_oneof![
                6 => Just(TrialState::Complete),
                1 => Just(TrialState::Pruned),
                1 => Just(TrialState::Failed),
            ],
        ),
        0..40,
    )
    .prop_map(|rows| {
        rows.into_iter()
            .enumerate()
            .map(|(i, (w, r, e, state))| Trial {
                trial_id: i as u32,
                indices: [i, 0, 0, 0],
                config: RiskConfiguration::fixed(1.0 + i as f64, 1.0),
                state,
                objectives: (state == TrialState::Complete).then_some(ObjectiveVector {
                    // Coarse grid so ties and duplicates show up.
                    win_rate: (w * 10.0).round() / 10.0,
                    risk_reward_ratio: (r * 2.0).round() / 2.0,
                    expected_value: (e * 4.0).round() / 4.0,
                }),
                triggered_trades: 30,
                note: None,
            })
            .collect()
    })
}

proptest! {
    /// No front point dominates another, and every complete trial left out
    /// is dominated by some front point.
    #[test]
    fn front_is_exactly_the_non_dominated_set(trials in arb_trials()) {
        let front = ParetoFront::from_trials(&trials);
        for a in front.points() {
            for b in front.points() {
                prop_assert!(!dominates(&a.objectives, &b.objectives));
            }
        }
        for t in trials.iter().filter(|t| t.state == TrialState::Complete) {
            let obj = t.objectives.unwrap();
            if !front.contains_trial(t.trial_id) {
                prop_assert!(front.objectives().any(|p| dominates(p, &obj)));
            }
        }
        for p in front.points() {
            prop_assert_eq!(trials[p.trial_id as usize].state, TrialState::Complete);
        }
    }

    /// Candidates are distinct front points, `min(4, |front|)` of them.
    #[test]
    fn candidates_are_a_distinct_subset_of_the_front(trials in arb_trials()) {
        let front = ParetoFront::from_trials(&trials);
        let candidates = select_candidates(&front);
        prop_assert_eq!(candidates.len(), front.len().min(4));

        let mut ids: Vec<u32> = candidates.iter().map(|c| c.point.trial_id).collect();
        prop_assert!(ids.iter().all(|&id| front.contains_trial(id)));
        ids.sort_unstable();
        ids.dedup();
        prop_assert_eq!(ids.len(), candidates.len());
        prop_assert!(candidates.iter().all(|c| !c.roles.is_empty()));
    }
}
