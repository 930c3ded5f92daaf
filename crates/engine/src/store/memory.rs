use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use common::{
    Error, Outcome, OutcomeStore, PricePath, PricePathFeed, Result, RunRecord, RunStatus,
    SourceKey, Trial, TrialLog,
};

use super::SelectionStore;
use crate::state::SelectionState;

struct RunRow {
    key: SourceKey,
    seed: u64,
    status: RunStatus,
}

#[derive(Default)]
struct Inner {
    outcomes: HashMap<SourceKey, Vec<Outcome>>,
    outcome_keys: HashMap<String, SourceKey>,
    paths: HashMap<String, PricePath>,
    runs: HashMap<String, RunRow>,
    run_order: Vec<String>,
    trials: HashMap<String, BTreeMap<u32, Trial>>,
    selections: HashMap<SourceKey, SelectionState>,
}

/// In-process implementation of every store trait. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stand-in for the market-data subsystem.
    pub async fn insert_price_path(&self, path: PricePath) {
        self.inner
            .write()
            .await
            .paths
            .insert(path.outcome_id.clone(), path);
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn append_outcome(&self, outcome: &Outcome) -> Result<bool> {
        let mut inner = self.inner.write().await;
        if inner.outcome_keys.contains_key(&outcome.outcome_id) {
            return Ok(false);
        }
        inner
            .outcome_keys
            .insert(outcome.outcome_id.clone(), outcome.key.clone());
        let list = inner.outcomes.entry(outcome.key.clone()).or_default();
        list.push(outcome.clone());
        list.sort_by(|a, b| {
            a.closed_at
                .cmp(&b.closed_at)
                .then_with(|| a.outcome_id.cmp(&b.outcome_id))
        });
        Ok(true)
    }

    async fn outcomes(&self, key: &SourceKey) -> Result<Vec<Outcome>> {
        Ok(self
            .inner
            .read()
            .await
            .outcomes
            .get(key)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PricePathFeed for MemoryStore {
    async fn price_path(&self, outcome_id: &str) -> Result<Option<PricePath>> {
        Ok(self.inner.read().await.paths.get(outcome_id).cloned())
    }
}

#[async_trait]
impl TrialLog for MemoryStore {
    async fn open_run(&self, key: &SourceKey, seed: u64) -> Result<RunRecord> {
        let mut inner = self.inner.write().await;
        let unfinished = inner.run_order.iter().rev().find(|id| {
            inner
                .runs
                .get(*id)
                .is_some_and(|r| &r.key == key && r.status == RunStatus::Running)
        });
        if let Some(run_id) = unfinished {
            let seed = inner.runs[run_id].seed;
            return Ok(RunRecord {
                run_id: run_id.clone(),
                seed,
                resumed: true,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        inner.runs.insert(
            run_id.clone(),
            RunRow {
                key: key.clone(),
                seed,
                status: RunStatus::Running,
            },
        );
        inner.run_order.push(run_id.clone());
        Ok(RunRecord {
            run_id,
            seed,
            resumed: false,
        })
    }

    async fn append_trial(&self, _key: &SourceKey, run_id: &str, trial: &Trial) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.runs.contains_key(run_id) {
            return Err(Error::Other(format!("unknown run '{run_id}'")));
        }
        inner
            .trials
            .entry(run_id.to_string())
            .or_default()
            .entry(trial.trial_id)
            .or_insert_with(|| trial.clone());
        Ok(())
    }

    async fn trials(&self, _key: &SourceKey, run_id: &str) -> Result<Vec<Trial>> {
        Ok(self
            .inner
            .read()
            .await
            .trials
            .get(run_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn close_run(&self, _key: &SourceKey, run_id: &str, status: RunStatus) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.runs.get_mut(run_id) {
            Some(run) => {
                run.status = status;
                Ok(())
            }
            None => Err(Error::Other(format!("unknown run '{run_id}'"))),
        }
    }
}

#[async_trait]
impl SelectionStore for MemoryStore {
    async fn load(&self, key: &SourceKey) -> Result<Option<SelectionState>> {
        Ok(self.inner.read().await.selections.get(key).cloned())
    }

    async fn save(&self, state: &SelectionState) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let stored = inner.selections.get(&state.key).map_or(0, |s| s.version);
        if stored != state.version {
            return Err(Error::ConcurrentUpdate {
                key: state.key.clone(),
                expected_version: state.version,
            });
        }
        let mut next = state.clone();
        next.version = stored + 1;
        inner.selections.insert(state.key.clone(), next);
        Ok(stored + 1)
    }

    async fn load_all(&self) -> Result<Vec<SelectionState>> {
        let mut all: Vec<SelectionState> =
            self.inner.read().await.selections.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use common::{Direction, TrialState};

    fn key() -> SourceKey {
        SourceKey::new("BTCUSDT", Direction::Long, "tv")
    }

    fn outcome(id: &str, minute: i64) -> Outcome {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute);
        Outcome {
            outcome_id: id.into(),
            key: key(),
            realized_pnl_pct: 1.0,
            opened_at: t,
            closed_at: t,
            applied_configuration: None,
        }
    }

    #[tokio::test]
    async fn outcomes_are_idempotent_and_ordered_by_close() {
        let store = MemoryStore::new();
        assert!(store.append_outcome(&outcome("b", 5)).await.unwrap());
        assert!(store.append_outcome(&outcome("a", 1)).await.unwrap());
        assert!(!store.append_outcome(&outcome("b", 5)).await.unwrap());
        let ids: Vec<String> = store
            .outcomes(&key())
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.outcome_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unfinished_run_is_resumed_with_its_seed() {
        let store = MemoryStore::new();
        let first = store.open_run(&key(), 11).await.unwrap();
        assert!(!first.resumed);
        let again = store.open_run(&key(), 99).await.unwrap();
        assert!(again.resumed);
        assert_eq!(again.run_id, first.run_id);
        assert_eq!(again.seed, 11);

        store
            .close_run(&key(), &first.run_id, RunStatus::Completed)
            .await
            .unwrap();
        let fresh = store.open_run(&key(), 99).await.unwrap();
        assert_ne!(fresh.run_id, first.run_id);
        assert_eq!(fresh.seed, 99);
    }

    #[tokio::test]
    async fn trial_append_is_idempotent() {
        let store = MemoryStore::new();
        let run = store.open_run(&key(), 1).await.unwrap();
        let trial = Trial {
            trial_id: 0,
            indices: [0, 0, 0, 0],
            config: common::RiskConfiguration::fixed(1.0, 1.0),
            state: TrialState::Pruned,
            objectives: None,
            triggered_trades: 3,
            note: None,
        };
        store.append_trial(&key(), &run.run_id, &trial).await.unwrap();
        store.append_trial(&key(), &run.run_id, &trial).await.unwrap();
        assert_eq!(store.trials(&key(), &run.run_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_version_is_a_concurrent_update() {
        let store = MemoryStore::new();
        let mut state = SelectionState::new(key());
        state.version = store.save(&state).await.unwrap();
        assert_eq!(state.version, 1);

        let stale = state.clone();
        state.version = store.save(&state).await.unwrap();
        assert_eq!(state.version, 2);

        let err = store.save(&stale).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentUpdate { expected_version: 1, .. }));
    }
}
