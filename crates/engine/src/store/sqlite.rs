use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use common::{
    Direction, Error, ObjectiveVector, Outcome, OutcomeStore, PriceBar, PricePath, PricePathFeed,
    Result, RiskConfiguration, RunRecord, RunStatus, SourceKey, Trial, TrialLog, TrialState,
};

use super::SelectionStore;
use crate::state::SelectionState;

/// SQLite implementation of every store trait. Schema lives in `migrations/`.
#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("bad timestamp '{raw}': {e}")))
}

fn outcome_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Outcome> {
    let applied: Option<String> = row.try_get("applied_configuration")?;
    let applied_configuration = match applied {
        Some(json) => Some(serde_json::from_str::<RiskConfiguration>(&json)?),
        None => None,
    };
    Ok(Outcome {
        outcome_id: row.try_get("outcome_id")?,
        key: SourceKey::new(
            row.try_get::<String, _>("symbol")?,
            row.try_get::<Direction, _>("direction")?,
            row.try_get::<String, _>("source")?,
        ),
        realized_pnl_pct: row.try_get("realized_pnl_pct")?,
        opened_at: parse_time(&row.try_get::<String, _>("opened_at")?)?,
        closed_at: parse_time(&row.try_get::<String, _>("closed_at")?)?,
        applied_configuration,
    })
}

#[async_trait]
impl OutcomeStore for SqliteStore {
    async fn append_outcome(&self, outcome: &Outcome) -> Result<bool> {
        let applied = outcome
            .applied_configuration
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            r#"
            INSERT INTO outcomes
                (outcome_id, symbol, direction, source, realized_pnl_pct, opened_at, closed_at, applied_configuration)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(outcome_id) DO NOTHING
            "#,
        )
        .bind(&outcome.outcome_id)
        .bind(&outcome.key.symbol)
        .bind(outcome.key.direction)
        .bind(&outcome.key.source)
        .bind(outcome.realized_pnl_pct)
        .bind(outcome.opened_at.to_rfc3339())
        .bind(outcome.closed_at.to_rfc3339())
        .bind(applied)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn outcomes(&self, key: &SourceKey) -> Result<Vec<Outcome>> {
        let rows = sqlx::query(
            r#"
            SELECT outcome_id, symbol, direction, source, realized_pnl_pct,
                   opened_at, closed_at, applied_configuration
            FROM outcomes
            WHERE symbol = ?1 AND direction = ?2 AND source = ?3
            ORDER BY closed_at ASC, outcome_id ASC
            "#,
        )
        .bind(&key.symbol)
        .bind(key.direction)
        .bind(&key.source)
        .fetch_all(&self.db)
        .await?;
        rows.iter().map(outcome_from_row).collect()
    }
}

#[async_trait]
impl PricePathFeed for SqliteStore {
    async fn price_path(&self, outcome_id: &str) -> Result<Option<PricePath>> {
        let row = sqlx::query("SELECT entry_price, bars FROM price_paths WHERE outcome_id = ?1")
            .bind(outcome_id)
            .fetch_optional(&self.db)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let bars: Vec<PriceBar> = serde_json::from_str(&row.try_get::<String, _>("bars")?)?;
        Ok(Some(PricePath {
            outcome_id: outcome_id.to_string(),
            entry_price: row.try_get("entry_price")?,
            bars,
        }))
    }
}

impl SqliteStore {
    /// Write a replay path. The engine itself only reads them.
    pub async fn insert_price_path(&self, path: &PricePath) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO price_paths (outcome_id, entry_price, bars) VALUES (?1, ?2, ?3)
            ON CONFLICT(outcome_id) DO UPDATE SET entry_price = excluded.entry_price, bars = excluded.bars
            "#,
        )
        .bind(&path.outcome_id)
        .bind(path.entry_price)
        .bind(serde_json::to_string(&path.bars)?)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

/// Stored trial parameters: grid indices plus the resolved configuration.
#[derive(serde::Serialize, serde::Deserialize)]
struct TrialParams {
    indices: [usize; 4],
    config: RiskConfiguration,
}

#[async_trait]
impl TrialLog for SqliteStore {
    async fn open_run(&self, key: &SourceKey, seed: u64) -> Result<RunRecord> {
        let existing = sqlx::query(
            r#"
            SELECT run_id, seed FROM optimization_runs
            WHERE symbol = ?1 AND direction = ?2 AND source = ?3 AND status = 'running'
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(&key.symbol)
        .bind(key.direction)
        .bind(&key.source)
        .fetch_optional(&self.db)
        .await?;

        if let Some(row) = existing {
            let raw_seed: String = row.try_get("seed")?;
            let seed = raw_seed
                .parse()
                .map_err(|_| Error::Other(format!("bad stored seed '{raw_seed}'")))?;
            return Ok(RunRecord {
                run_id: row.try_get("run_id")?,
                seed,
                resumed: true,
            });
        }

        let run_id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO optimization_runs (run_id, symbol, direction, source, seed, status, started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)
            "#,
        )
        .bind(&run_id)
        .bind(&key.symbol)
        .bind(key.direction)
        .bind(&key.source)
        .bind(seed.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;

        Ok(RunRecord {
            run_id,
            seed,
            resumed: false,
        })
    }

    async fn append_trial(&self, _key: &SourceKey, run_id: &str, trial: &Trial) -> Result<()> {
        let params = serde_json::to_string(&TrialParams {
            indices: trial.indices,
            config: trial.config,
        })?;
        let objectives = trial.objectives.as_ref().map(serde_json::to_string).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO trials
                (run_id, trial_id, state, params, objectives, triggered_trades, note, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(run_id, trial_id) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(trial.trial_id as i64)
        .bind(trial.state)
        .bind(params)
        .bind(objectives)
        .bind(trial.triggered_trades as i64)
        .bind(&trial.note)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn trials(&self, _key: &SourceKey, run_id: &str) -> Result<Vec<Trial>> {
        let rows = sqlx::query(
            r#"
            SELECT trial_id, state, params, objectives, triggered_trades, note
            FROM trials WHERE run_id = ?1 ORDER BY trial_id ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter()
            .map(|row| -> Result<Trial> {
                let params: TrialParams =
                    serde_json::from_str(&row.try_get::<String, _>("params")?)?;
                let objectives = match row.try_get::<Option<String>, _>("objectives")? {
                    Some(json) => Some(serde_json::from_str::<ObjectiveVector>(&json)?),
                    None => None,
                };
                Ok(Trial {
                    trial_id: row.try_get::<i64, _>("trial_id")? as u32,
                    indices: params.indices,
                    config: params.config,
                    state: row.try_get::<TrialState, _>("state")?,
                    objectives,
                    triggered_trades: row.try_get::<i64, _>("triggered_trades")? as usize,
                    note: row.try_get("note")?,
                })
            })
            .collect()
    }

    async fn close_run(&self, _key: &SourceKey, run_id: &str, status: RunStatus) -> Result<()> {
        sqlx::query("UPDATE optimization_runs SET status = ?1, ended_at = ?2 WHERE run_id = ?3")
            .bind(status)
            .bind(Utc::now().to_rfc3339())
            .bind(run_id)
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SelectionStore for SqliteStore {
    async fn load(&self, key: &SourceKey) -> Result<Option<SelectionState>> {
        let row = sqlx::query(
            r#"
            SELECT version, state FROM selection_states
            WHERE symbol = ?1 AND direction = ?2 AND source = ?3
            "#,
        )
        .bind(&key.symbol)
        .bind(key.direction)
        .bind(&key.source)
        .fetch_optional(&self.db)
        .await?;

        row.map(|row| -> Result<SelectionState> {
            let mut state: SelectionState =
                serde_json::from_str(&row.try_get::<String, _>("state")?)?;
            state.version = row.try_get::<i64, _>("version")? as u64;
            Ok(state)
        })
        .transpose()
    }

    async fn save(&self, state: &SelectionState) -> Result<u64> {
        let next = state.version + 1;
        let json = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();

        let result = if state.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO selection_states (symbol, direction, source, version, phase, state, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                ON CONFLICT(symbol, direction, source) DO NOTHING
                "#,
            )
            .bind(&state.key.symbol)
            .bind(state.key.direction)
            .bind(&state.key.source)
            .bind(next as i64)
            .bind(state.phase)
            .bind(&json)
            .bind(&now)
            .execute(&self.db)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE selection_states
                SET version = ?1, phase = ?2, state = ?3, updated_at = ?4
                WHERE symbol = ?5 AND direction = ?6 AND source = ?7 AND version = ?8
                "#,
            )
            .bind(next as i64)
            .bind(state.phase)
            .bind(&json)
            .bind(&now)
            .bind(&state.key.symbol)
            .bind(state.key.direction)
            .bind(&state.key.source)
            .bind(state.version as i64)
            .execute(&self.db)
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(Error::ConcurrentUpdate {
                key: state.key.clone(),
                expected_version: state.version,
            });
        }
        Ok(next)
    }

    async fn load_all(&self) -> Result<Vec<SelectionState>> {
        let rows = sqlx::query(
            "SELECT version, state FROM selection_states ORDER BY symbol, direction, source",
        )
        .fetch_all(&self.db)
        .await?;
        rows.iter()
            .map(|row| -> Result<SelectionState> {
                let mut state: SelectionState =
                    serde_json::from_str(&row.try_get::<String, _>("state")?)?;
                state.version = row.try_get::<i64, _>("version")? as u64;
                Ok(state)
            })
            .collect()
    }
}
