//! PostgreSQL storage implementation
//!
//! Rows carry the full entity as JSONB in a `data` column, with a few
//! typed columns for filtering. Decision methods take a row lock with
//! `SELECT ... FOR UPDATE`, run the deciding closure on the locked
//! aggregate, and commit the outcome in the same transaction.

use crate::traits::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sage_types::{
    BreachRecord, ChangeId, ChangeStatus, ChangeType, ConsensusProposal, MetricSample, Pattern,
    PatternId, PatternType, ProposalId, ProposalStatus, ProposedChange, RollbackEvent, StoreError,
    StoreResult, Vote,
};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Row, Transaction};
use std::time::Duration;

/// PostgreSQL-backed storage
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to PostgreSQL and initialize the schema
    pub async fn new(
        url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> StoreResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS proposed_changes (
                id TEXT PRIMARY KEY,
                change_type TEXT NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                status_changed_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS proposed_changes_type_status ON proposed_changes(change_type, status);"#,
            r#"
            CREATE TABLE IF NOT EXISTS metric_samples (
                sequence BIGSERIAL PRIMARY KEY,
                change_id TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS metric_samples_change ON metric_samples(change_id, sequence DESC);"#,
            r#"
            CREATE TABLE IF NOT EXISTS breach_records (
                sequence BIGSERIAL PRIMARY KEY,
                change_id TEXT NOT NULL,
                recorded_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"CREATE INDEX IF NOT EXISTS breach_records_change ON breach_records(change_id);"#,
            r#"
            CREATE TABLE IF NOT EXISTS rollback_events (
                change_id TEXT PRIMARY KEY,
                recorded_at TIMESTAMPTZ NOT NULL,
                data JSONB NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS consensus_proposals (
                id UUID PRIMARY KEY,
                change_id TEXT NOT NULL,
                status TEXT NOT NULL,
                data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            );
            "#,
            r#"CREATE UNIQUE INDEX IF NOT EXISTS consensus_proposals_open_change ON consensus_proposals(change_id) WHERE status = 'voting';"#,
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                proposal_id UUID NOT NULL,
                instance_id TEXT NOT NULL,
                data JSONB NOT NULL,
                PRIMARY KEY (proposal_id, instance_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS patterns (
                id UUID PRIMARY KEY,
                pattern_type TEXT NOT NULL,
                canonical_key TEXT NOT NULL,
                promoted BOOLEAN NOT NULL,
                data JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT patterns_type_key UNIQUE (pattern_type, canonical_key)
            );
            "#,
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
        }

        Ok(())
    }

    fn to_json<T: serde::Serialize>(value: &T) -> StoreResult<Value> {
        serde_json::to_value(value)
            .map_err(|e| StoreError::Serialization(format!("json serialize error: {}", e)))
    }

    fn from_json<T: serde::de::DeserializeOwned>(value: Value) -> StoreResult<T> {
        serde_json::from_value(value)
            .map_err(|e| StoreError::Serialization(format!("json deserialize error: {}", e)))
    }

    fn data_column<T: serde::de::DeserializeOwned>(row: &sqlx::postgres::PgRow) -> StoreResult<T> {
        let data: Value = row
            .try_get("data")
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Self::from_json(data)
    }

    /// Loads and row-locks a change inside `tx`.
    async fn lock_change(
        tx: &mut Transaction<'_, Postgres>,
        id: &ChangeId,
    ) -> StoreResult<ProposedChange> {
        let row = sqlx::query("SELECT data FROM proposed_changes WHERE id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        match row {
            Some(record) => Self::data_column(&record),
            None => Err(StoreError::NotFound(format!("change {}", id))),
        }
    }

    /// Writes an updated change row back inside `tx`.
    async fn store_change(
        tx: &mut Transaction<'_, Postgres>,
        change: &ProposedChange,
    ) -> StoreResult<()> {
        let data = Self::to_json(change)?;
        sqlx::query(
            "UPDATE proposed_changes SET status = $2, data = $3, status_changed_at = $4 WHERE id = $1",
        )
        .bind(change.id.as_str())
        .bind(change.status.as_str())
        .bind(data)
        .bind(change.status_changed_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_breaches(
        tx: &mut Transaction<'_, Postgres>,
        breaches: &[BreachRecord],
    ) -> StoreResult<()> {
        for breach in breaches {
            let data = Self::to_json(breach)?;
            sqlx::query(
                "INSERT INTO breach_records (change_id, recorded_at, data) VALUES ($1, $2, $3)",
            )
            .bind(breach.change_id.as_str())
            .bind(breach.timestamp)
            .bind(data)
            .execute(&mut **tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        }
        Ok(())
    }

    async fn insert_rollback_event(
        tx: &mut Transaction<'_, Postgres>,
        event: &RollbackEvent,
    ) -> StoreResult<()> {
        let data = Self::to_json(event)?;
        sqlx::query(
            "INSERT INTO rollback_events (change_id, recorded_at, data) VALUES ($1, $2, $3)",
        )
        .bind(event.change_id.as_str())
        .bind(event.timestamp)
        .bind(data)
        .execute(&mut **tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    fn begin_error(e: sqlx::Error) -> StoreError {
        StoreError::Connection(e.to_string())
    }
}

fn apply_status(change: &mut ProposedChange, to: ChangeStatus, now: DateTime<Utc>) {
    change.status = to;
    change.status_changed_at = now;
    if to == ChangeStatus::Stable {
        change.stabilized_at = Some(now);
    }
}

#[async_trait]
impl ChangeStore for PostgresStore {
    async fn insert_change(&self, change: ProposedChange) -> StoreResult<()> {
        let data = Self::to_json(&change)?;
        let result = sqlx::query(
            r#"
            INSERT INTO proposed_changes (id, change_type, status, data, created_at, status_changed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(change.id.as_str())
        .bind(change.change_type.as_str())
        .bind(change.status.as_str())
        .bind(data)
        .bind(change.created_at)
        .bind(change.status_changed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "change {} already registered",
                change.id
            )));
        }
        Ok(())
    }

    async fn get_change(&self, id: &ChangeId) -> StoreResult<Option<ProposedChange>> {
        let row = sqlx::query("SELECT data FROM proposed_changes WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        row.map(|record| Self::data_column(&record)).transpose()
    }

    async fn list_changes(&self, status: Option<ChangeStatus>) -> StoreResult<Vec<ProposedChange>> {
        let rows = if let Some(status) = status {
            sqlx::query("SELECT data FROM proposed_changes WHERE status = $1 ORDER BY created_at")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT data FROM proposed_changes ORDER BY created_at")
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(Self::data_column).collect()
    }

    async fn stable_payloads_for_type(
        &self,
        change_type: &ChangeType,
    ) -> StoreResult<Vec<Value>> {
        let rows = sqlx::query(
            "SELECT data FROM proposed_changes WHERE change_type = $1 AND status = $2",
        )
        .bind(change_type.as_str())
        .bind(ChangeStatus::Stable.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| Self::data_column::<ProposedChange>(row).map(|c| c.payload))
            .collect()
    }

    async fn transition_change(
        &self,
        id: &ChangeId,
        from: &[ChangeStatus],
        to: ChangeStatus,
    ) -> StoreResult<ChangeTransition> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;
        let mut change = Self::lock_change(&mut tx, id).await?;

        if change.status == to {
            return Ok(ChangeTransition::Unchanged(change));
        }
        if change.status.is_terminal() {
            return Err(StoreError::TerminalState(format!(
                "change {} is {}",
                id, change.status
            )));
        }
        if !from.contains(&change.status) {
            return Err(StoreError::Conflict(format!(
                "change {} is {}, expected one of {:?}",
                id, change.status, from
            )));
        }

        apply_status(&mut change, to, Utc::now());
        Self::store_change(&mut tx, &change).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(ChangeTransition::Applied(change))
    }

    async fn execute_rollback(
        &self,
        id: &ChangeId,
        cause: BreachRecord,
    ) -> StoreResult<RollbackExecution> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;
        let mut change = Self::lock_change(&mut tx, id).await?;

        match change.status {
            ChangeStatus::RolledBack => {
                let row = sqlx::query("SELECT data FROM rollback_events WHERE change_id = $1")
                    .bind(id.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?
                    .ok_or_else(|| StoreError::NotFound(format!("rollback event for {}", id)))?;
                let event = Self::data_column(&row)?;
                Ok(RollbackExecution::AlreadyRolledBack(event))
            }
            ChangeStatus::Rejected => Err(StoreError::TerminalState(format!(
                "change {} is rejected, nothing to roll back",
                id
            ))),
            _ => {
                let now = Utc::now();
                apply_status(&mut change, ChangeStatus::RolledBack, now);
                let event = RollbackEvent {
                    change_id: id.clone(),
                    metric: cause.metric,
                    threshold: cause.threshold,
                    observed_value: cause.observed_value,
                    timestamp: now,
                };
                Self::store_change(&mut tx, &change).await?;
                Self::insert_rollback_event(&mut tx, &event).await?;
                tx.commit()
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                Ok(RollbackExecution::Performed(event))
            }
        }
    }

    async fn list_rollback_events(&self, change_id: &ChangeId) -> StoreResult<Vec<RollbackEvent>> {
        let rows = sqlx::query("SELECT data FROM rollback_events WHERE change_id = $1")
            .bind(change_id.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(Self::data_column).collect()
    }
}

#[async_trait]
impl MetricStore for PostgresStore {
    async fn ingest_sample(
        &self,
        sample: MetricSample,
        window: SampleWindow,
        evaluate: SampleEvaluator<'_>,
    ) -> StoreResult<IngestOutcome> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;
        let mut change = Self::lock_change(&mut tx, &sample.change_id).await?;

        let last: Option<DateTime<Utc>> = sqlx::query(
            "SELECT recorded_at FROM metric_samples WHERE change_id = $1 ORDER BY sequence DESC LIMIT 1",
        )
        .bind(sample.change_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?
        .map(|row| row.try_get("recorded_at"))
        .transpose()
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if let Some(last) = last {
            if sample.timestamp < last {
                return Err(StoreError::InvalidData(format!(
                    "sample for {} is older than the latest recorded sample",
                    sample.change_id
                )));
            }
        }

        let change_id = sample.change_id.clone();
        let data = Self::to_json(&sample)?;
        sqlx::query(
            "INSERT INTO metric_samples (change_id, recorded_at, data) VALUES ($1, $2, $3)",
        )
        .bind(change_id.as_str())
        .bind(sample.timestamp)
        .bind(data)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        // Trim by age anchored on the newest sample, then by count.
        let cutoff = sample.timestamp - window.max_age;
        sqlx::query("DELETE FROM metric_samples WHERE change_id = $1 AND recorded_at < $2")
            .bind(change_id.as_str())
            .bind(cutoff)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        sqlx::query(
            r#"
            DELETE FROM metric_samples
            WHERE change_id = $1
              AND sequence NOT IN (
                SELECT sequence FROM metric_samples
                WHERE change_id = $1
                ORDER BY sequence DESC
                LIMIT $2
              )
            "#,
        )
        .bind(change_id.as_str())
        .bind(window.max_samples as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let rows = sqlx::query(
            "SELECT data FROM metric_samples WHERE change_id = $1 ORDER BY sequence",
        )
        .bind(change_id.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        let samples: Vec<MetricSample> = rows
            .iter()
            .map(Self::data_column)
            .collect::<StoreResult<_>>()?;

        // Dropping the transaction on error discards the append.
        let decision = evaluate(&change, &samples)?;

        let now = Utc::now();
        let outcome = match decision {
            SampleDecision::Continue {
                breaches,
                new_status,
            } => {
                Self::insert_breaches(&mut tx, &breaches).await?;
                if let Some(status) = new_status {
                    apply_status(&mut change, status, now);
                    Self::store_change(&mut tx, &change).await?;
                }
                IngestOutcome::Continued(change)
            }
            SampleDecision::RollBack { breaches, cause } => {
                Self::insert_breaches(&mut tx, &breaches).await?;
                apply_status(&mut change, ChangeStatus::RolledBack, now);
                let event = RollbackEvent {
                    change_id: change_id.clone(),
                    metric: cause.metric,
                    threshold: cause.threshold,
                    observed_value: cause.observed_value,
                    timestamp: now,
                };
                Self::store_change(&mut tx, &change).await?;
                Self::insert_rollback_event(&mut tx, &event).await?;
                IngestOutcome::RolledBack(event)
            }
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(outcome)
    }

    async fn list_samples(&self, change_id: &ChangeId) -> StoreResult<Vec<MetricSample>> {
        let rows = sqlx::query(
            "SELECT data FROM metric_samples WHERE change_id = $1 ORDER BY sequence",
        )
        .bind(change_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(Self::data_column).collect()
    }

    async fn list_breaches(&self, change_id: &ChangeId) -> StoreResult<Vec<BreachRecord>> {
        let rows = sqlx::query(
            "SELECT data FROM breach_records WHERE change_id = $1 ORDER BY sequence",
        )
        .bind(change_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(Self::data_column).collect()
    }
}

#[async_trait]
impl ProposalStore for PostgresStore {
    async fn insert_proposal(&self, proposal: ConsensusProposal) -> StoreResult<()> {
        let data = Self::to_json(&proposal)?;
        sqlx::query(
            r#"
            INSERT INTO consensus_proposals (id, change_id, status, data, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(proposal.id.as_uuid())
        .bind(proposal.change_id.as_str())
        .bind(proposal.status.as_str())
        .bind(data)
        .bind(proposal.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db)
                if db.constraint() == Some("consensus_proposals_open_change") =>
            {
                StoreError::Conflict(format!(
                    "change {} already has an open proposal",
                    proposal.change_id
                ))
            }
            _ => StoreError::Query(e.to_string()),
        })?;
        Ok(())
    }

    async fn get_proposal(&self, id: &ProposalId) -> StoreResult<Option<ConsensusProposal>> {
        let row = sqlx::query("SELECT data FROM consensus_proposals WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        row.map(|record| Self::data_column(&record)).transpose()
    }

    async fn active_proposal_for(
        &self,
        change_id: &ChangeId,
    ) -> StoreResult<Option<ConsensusProposal>> {
        let row = sqlx::query(
            "SELECT data FROM consensus_proposals WHERE change_id = $1 AND status = $2",
        )
        .bind(change_id.as_str())
        .bind(ProposalStatus::Voting.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        row.map(|record| Self::data_column(&record)).transpose()
    }

    async fn record_vote(
        &self,
        proposal_id: &ProposalId,
        vote: Vote,
        decide: VoteDecider<'_>,
    ) -> StoreResult<VoteRecorded> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;

        let row = sqlx::query("SELECT data FROM consensus_proposals WHERE id = $1 FOR UPDATE")
            .bind(proposal_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
            .ok_or_else(|| StoreError::NotFound(format!("proposal {}", proposal_id)))?;
        let mut proposal: ConsensusProposal = Self::data_column(&row)?;

        if proposal.status != ProposalStatus::Voting {
            return Err(StoreError::TerminalState(format!(
                "proposal {} is already {}",
                proposal_id, proposal.status
            )));
        }

        let vote_data = Self::to_json(&vote)?;
        sqlx::query(
            r#"
            INSERT INTO votes (proposal_id, instance_id, data)
            VALUES ($1, $2, $3)
            ON CONFLICT (proposal_id, instance_id)
            DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(proposal_id.as_uuid())
        .bind(vote.instance_id.as_str())
        .bind(vote_data)
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let rows = sqlx::query(
            "SELECT data FROM votes WHERE proposal_id = $1 ORDER BY instance_id",
        )
        .bind(proposal_id.as_uuid())
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        let votes: Vec<Vote> = rows
            .iter()
            .map(Self::data_column)
            .collect::<StoreResult<_>>()?;

        let decided_now = match decide(&votes) {
            Some(status) => {
                proposal.status = status;
                proposal.decided_at = Some(Utc::now());
                let data = Self::to_json(&proposal)?;
                sqlx::query("UPDATE consensus_proposals SET status = $2, data = $3 WHERE id = $1")
                    .bind(proposal_id.as_uuid())
                    .bind(proposal.status.as_str())
                    .bind(data)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                true
            }
            None => false,
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(VoteRecorded {
            proposal,
            votes,
            decided_now,
        })
    }

    async fn list_votes(&self, proposal_id: &ProposalId) -> StoreResult<Vec<Vote>> {
        let rows = sqlx::query(
            "SELECT data FROM votes WHERE proposal_id = $1 ORDER BY instance_id",
        )
        .bind(proposal_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;
        rows.iter().map(Self::data_column).collect()
    }

    async fn expire_proposals(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<ConsensusProposal>> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;

        let rows = sqlx::query(
            "SELECT data FROM consensus_proposals WHERE status = $1 AND created_at <= $2 FOR UPDATE",
        )
        .bind(ProposalStatus::Voting.as_str())
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let now = Utc::now();
        let mut expired = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut proposal: ConsensusProposal = Self::data_column(row)?;
            proposal.status = ProposalStatus::TimedOut;
            proposal.decided_at = Some(now);
            let data = Self::to_json(&proposal)?;
            sqlx::query("UPDATE consensus_proposals SET status = $2, data = $3 WHERE id = $1")
                .bind(proposal.id.as_uuid())
                .bind(proposal.status.as_str())
                .bind(data)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
            expired.push(proposal);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(expired)
    }
}

#[async_trait]
impl PatternStore for PostgresStore {
    async fn upsert_pattern(
        &self,
        report: PatternReport,
        rescore: &(dyn for<'a> Fn(&'a Pattern) -> f64 + Send + Sync),
    ) -> StoreResult<Pattern> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;
        let now = Utc::now();

        let row = sqlx::query(
            "SELECT data FROM patterns WHERE pattern_type = $1 AND canonical_key = $2 FOR UPDATE",
        )
        .bind(report.pattern_type.as_str())
        .bind(report.canonical_key.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        let pattern = match row {
            Some(record) => {
                let mut pattern: Pattern = Self::data_column(&record)?;
                pattern.source_instances.insert(report.instance_id.clone());
                pattern
                    .per_instance_success_rate
                    .insert(report.instance_id, report.success_rate);
                pattern.payload = report.payload;
                pattern.usage_count += 1;
                pattern.updated_at = now;
                pattern.consensus_score = rescore(&pattern);

                let data = Self::to_json(&pattern)?;
                sqlx::query("UPDATE patterns SET data = $2, updated_at = $3 WHERE id = $1")
                    .bind(pattern.id.as_uuid())
                    .bind(data)
                    .bind(now)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;
                pattern
            }
            None => {
                let mut pattern = Pattern {
                    id: PatternId::generate(),
                    pattern_type: report.pattern_type,
                    canonical_key: report.canonical_key,
                    payload: report.payload,
                    source_instances: [report.instance_id.clone()].into_iter().collect(),
                    per_instance_success_rate: [(report.instance_id, report.success_rate)]
                        .into_iter()
                        .collect(),
                    consensus_score: 0.0,
                    usage_count: 1,
                    promoted: false,
                    created_at: now,
                    updated_at: now,
                };
                pattern.consensus_score = rescore(&pattern);

                let data = Self::to_json(&pattern)?;
                sqlx::query(
                    r#"
                    INSERT INTO patterns (id, pattern_type, canonical_key, promoted, data, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(pattern.id.as_uuid())
                .bind(pattern.pattern_type.as_str())
                .bind(pattern.canonical_key.as_str())
                .bind(pattern.promoted)
                .bind(data)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;
                pattern
            }
        };

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(pattern)
    }

    async fn get_pattern(&self, id: &PatternId) -> StoreResult<Option<Pattern>> {
        let row = sqlx::query("SELECT data FROM patterns WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        row.map(|record| Self::data_column(&record)).transpose()
    }

    async fn list_patterns(&self, pattern_type: Option<&PatternType>) -> StoreResult<Vec<Pattern>> {
        let rows = if let Some(pattern_type) = pattern_type {
            sqlx::query("SELECT data FROM patterns WHERE pattern_type = $1 ORDER BY updated_at DESC")
                .bind(pattern_type.as_str())
                .fetch_all(&self.pool)
                .await
        } else {
            sqlx::query("SELECT data FROM patterns ORDER BY updated_at DESC")
                .fetch_all(&self.pool)
                .await
        }
        .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(Self::data_column).collect()
    }

    async fn promote_if(
        &self,
        predicate: &(dyn for<'a> Fn(&'a Pattern) -> bool + Send + Sync),
    ) -> StoreResult<Vec<Pattern>> {
        let mut tx = self.pool.begin().await.map_err(Self::begin_error)?;

        let rows = sqlx::query("SELECT data FROM patterns WHERE promoted = FALSE FOR UPDATE")
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let now = Utc::now();
        let mut promoted = Vec::new();
        for row in &rows {
            let mut pattern: Pattern = Self::data_column(row)?;
            if !predicate(&pattern) {
                continue;
            }
            pattern.promoted = true;
            pattern.updated_at = now;
            let data = Self::to_json(&pattern)?;
            sqlx::query(
                "UPDATE patterns SET promoted = TRUE, data = $2, updated_at = $3 WHERE id = $1",
            )
            .bind(pattern.id.as_uuid())
            .bind(data)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
            promoted.push(pattern);
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(promoted)
    }
}

impl GovernanceStore for PostgresStore {}
