use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{info, warn};

use super::{
    Comparison, ComparisonSession, Criterion, Directory, MagnitudeConsensus, MagnitudeScore,
    PriorityResult, SessionStatus, Storage, Vote,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory instance. A single pooled connection keeps every
    /// query on the same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            warn!(error = %e, raw = %raw, "Unparsable timestamp in database");
            Utc::now()
        })
}

fn parse_criterion(raw: &str) -> StorageResult<Criterion> {
    raw.parse().map_err(|message| StorageError::Query { message })
}

fn encode_ids(ids: &[i64]) -> StorageResult<String> {
    serde_json::to_string(ids).map_err(|e| StorageError::Query {
        message: format!("Failed to encode id list: {}", e),
    })
}

fn decode_ids(raw: &str) -> StorageResult<Vec<i64>> {
    serde_json::from_str(raw).map_err(|e| StorageError::Query {
        message: format!("Failed to decode id list: {}", e),
    })
}

const SESSION_COLUMNS: &str = "id, project_id, criterion, status, participant_ids, item_ids, \
                               started_by, started_at, completed_at";

#[async_trait]
impl Storage for SqliteStorage {
    async fn create_session(
        &self,
        session: &ComparisonSession,
        comparisons: &[Comparison],
    ) -> StorageResult<()> {
        let participant_ids = encode_ids(&session.participant_ids)?;
        let item_ids = encode_ids(&session.item_ids)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO comparison_sessions
                (id, project_id, criterion, status, participant_ids, item_ids, started_by, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&session.id)
        .bind(session.project_id)
        .bind(session.criterion.as_str())
        .bind(session.status.to_string())
        .bind(&participant_ids)
        .bind(&item_ids)
        .bind(session.started_by)
        .bind(timestamp(&session.started_at))
        .bind(session.completed_at.as_ref().map(timestamp))
        .execute(&mut *tx)
        .await?;

        for comparison in comparisons {
            sqlx::query(
                r#"
                INSERT INTO comparisons (id, session_id, item_a_id, item_b_id, winner_id, is_tie, consensus_reached)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&comparison.id)
            .bind(&comparison.session_id)
            .bind(comparison.item_a_id)
            .bind(comparison.item_b_id)
            .bind(comparison.winner_id)
            .bind(comparison.is_tie)
            .bind(comparison.consensus_reached)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_session(&self, id: &str) -> StorageResult<Option<ComparisonSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM comparison_sessions WHERE id = ?",
            SESSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ComparisonSession::try_from).transpose()
    }

    async fn get_active_session(
        &self,
        project_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Option<ComparisonSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM comparison_sessions \
             WHERE project_id = ? AND criterion = ? AND status = 'active'",
            SESSION_COLUMNS
        ))
        .bind(project_id)
        .bind(criterion.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ComparisonSession::try_from).transpose()
    }

    async fn get_latest_session(
        &self,
        project_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Option<ComparisonSession>> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM comparison_sessions \
             WHERE project_id = ? AND criterion = ? \
             ORDER BY started_at DESC, rowid DESC LIMIT 1",
            SESSION_COLUMNS
        ))
        .bind(project_id)
        .bind(criterion.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(ComparisonSession::try_from).transpose()
    }

    async fn update_session(&self, session: &ComparisonSession) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE comparison_sessions
            SET status = ?, completed_at = ?
            WHERE id = ?
            "#,
        )
        .bind(session.status.to_string())
        .bind(session.completed_at.as_ref().map(timestamp))
        .bind(&session.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Session",
                id: session.id.clone(),
            });
        }

        Ok(())
    }

    async fn get_comparison(&self, id: &str) -> StorageResult<Option<Comparison>> {
        let row: Option<ComparisonRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, item_a_id, item_b_id, winner_id, is_tie, consensus_reached
            FROM comparisons
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.into()))
    }

    async fn get_session_comparisons(&self, session_id: &str) -> StorageResult<Vec<Comparison>> {
        let rows: Vec<ComparisonRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, item_a_id, item_b_id, winner_id, is_tie, consensus_reached
            FROM comparisons
            WHERE session_id = ?
            ORDER BY item_a_id ASC, item_b_id ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn update_comparison(&self, comparison: &Comparison) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE comparisons
            SET winner_id = ?, is_tie = ?, consensus_reached = ?
            WHERE id = ?
            "#,
        )
        .bind(comparison.winner_id)
        .bind(comparison.is_tie)
        .bind(comparison.consensus_reached)
        .bind(&comparison.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "Comparison",
                id: comparison.id.clone(),
            });
        }

        Ok(())
    }

    async fn upsert_vote(&self, vote: &Vote) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO votes (comparison_id, participant_id, preferred_item_id, is_tie, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (comparison_id, participant_id) DO UPDATE SET
                preferred_item_id = excluded.preferred_item_id,
                is_tie = excluded.is_tie,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&vote.comparison_id)
        .bind(vote.participant_id)
        .bind(vote.preferred_item_id)
        .bind(vote.is_tie)
        .bind(timestamp(&vote.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_comparison_votes(&self, comparison_id: &str) -> StorageResult<Vec<Vote>> {
        let rows: Vec<VoteRow> = sqlx::query_as(
            r#"
            SELECT comparison_id, participant_id, preferred_item_id, is_tie, updated_at
            FROM votes
            WHERE comparison_id = ?
            ORDER BY participant_id ASC
            "#,
        )
        .bind(comparison_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }

    async fn upsert_magnitude_score(&self, score: &MagnitudeScore) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO magnitude_scores (item_id, criterion, participant_id, value, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (item_id, criterion, participant_id) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(score.item_id)
        .bind(score.criterion.as_str())
        .bind(score.participant_id)
        .bind(score.value)
        .bind(timestamp(&score.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_magnitude_scores(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Vec<MagnitudeScore>> {
        let rows: Vec<MagnitudeScoreRow> = sqlx::query_as(
            r#"
            SELECT item_id, criterion, participant_id, value, updated_at
            FROM magnitude_scores
            WHERE item_id = ? AND criterion = ?
            ORDER BY participant_id ASC
            "#,
        )
        .bind(item_id)
        .bind(criterion.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MagnitudeScore::try_from).collect()
    }

    async fn get_magnitude_consensus(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> StorageResult<Option<MagnitudeConsensus>> {
        let row: Option<MagnitudeConsensusRow> = sqlx::query_as(
            r#"
            SELECT item_id, criterion, value, locked_by, locked_at, rationale
            FROM magnitude_consensus
            WHERE item_id = ? AND criterion = ?
            "#,
        )
        .bind(item_id)
        .bind(criterion.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(MagnitudeConsensus::try_from).transpose()
    }

    async fn insert_magnitude_consensus(
        &self,
        consensus: &MagnitudeConsensus,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO magnitude_consensus (item_id, criterion, value, locked_by, locked_at, rationale)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(consensus.item_id)
        .bind(consensus.criterion.as_str())
        .bind(consensus.value)
        .bind(consensus.locked_by)
        .bind(timestamp(&consensus.locked_at))
        .bind(&consensus.rationale)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_magnitude_consensus(
        &self,
        item_id: i64,
        criterion: Criterion,
    ) -> StorageResult<bool> {
        let result =
            sqlx::query("DELETE FROM magnitude_consensus WHERE item_id = ? AND criterion = ?")
                .bind(item_id)
                .bind(criterion.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn replace_priority_results(
        &self,
        project_id: i64,
        results: &[PriorityResult],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM priority_results WHERE project_id = ?")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        for result in results {
            sqlx::query(
                r#"
                INSERT INTO priority_results
                    (project_id, item_id, value_weight, complexity_weight, value_magnitude,
                     complexity_magnitude, weighted_value, weighted_complexity, final_score,
                     rank, calculated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(project_id)
            .bind(result.item_id)
            .bind(result.value_weight)
            .bind(result.complexity_weight)
            .bind(result.value_magnitude)
            .bind(result.complexity_magnitude)
            .bind(result.weighted_value)
            .bind(result.weighted_complexity)
            .bind(result.final_score)
            .bind(i64::from(result.rank))
            .bind(timestamp(&result.calculated_at))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_priority_results(&self, project_id: i64) -> StorageResult<Vec<PriorityResult>> {
        let rows: Vec<PriorityResultRow> = sqlx::query_as(
            r#"
            SELECT project_id, item_id, value_weight, complexity_weight, value_magnitude,
                   complexity_magnitude, weighted_value, weighted_complexity, final_score,
                   rank, calculated_at
            FROM priority_results
            WHERE project_id = ?
            ORDER BY rank ASC
            "#,
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.into()).collect())
    }
}

#[async_trait]
impl Directory for SqliteStorage {
    async fn list_participants(&self, project_id: i64) -> StorageResult<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM participants WHERE project_id = ? ORDER BY id ASC")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn resolve_participant(
        &self,
        project_id: i64,
        participant_id: i64,
    ) -> StorageResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM participants WHERE project_id = ? AND id = ?")
                .bind(project_id)
                .bind(participant_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn list_items(&self, project_id: i64) -> StorageResult<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM items WHERE project_id = ? ORDER BY id ASC")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    async fn resolve_item(&self, project_id: i64, item_id: i64) -> StorageResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT id FROM items WHERE project_id = ? AND id = ?")
                .bind(project_id)
                .bind(item_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionRow {
    id: String,
    project_id: i64,
    criterion: String,
    status: String,
    participant_ids: String,
    item_ids: String,
    started_by: Option<i64>,
    started_at: String,
    completed_at: Option<String>,
}

impl TryFrom<SessionRow> for ComparisonSession {
    type Error = StorageError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(Self {
            criterion: parse_criterion(&row.criterion)?,
            status: row
                .status
                .parse::<SessionStatus>()
                .map_err(|message| StorageError::Query { message })?,
            participant_ids: decode_ids(&row.participant_ids)?,
            item_ids: decode_ids(&row.item_ids)?,
            started_at: parse_timestamp(&row.started_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            id: row.id,
            project_id: row.project_id,
            started_by: row.started_by,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ComparisonRow {
    id: String,
    session_id: String,
    item_a_id: i64,
    item_b_id: i64,
    winner_id: Option<i64>,
    is_tie: bool,
    consensus_reached: bool,
}

impl From<ComparisonRow> for Comparison {
    fn from(row: ComparisonRow) -> Self {
        Self {
            id: row.id,
            session_id: row.session_id,
            item_a_id: row.item_a_id,
            item_b_id: row.item_b_id,
            winner_id: row.winner_id,
            is_tie: row.is_tie,
            consensus_reached: row.consensus_reached,
        }
    }
}

#[derive(sqlx::FromRow)]
struct VoteRow {
    comparison_id: String,
    participant_id: i64,
    preferred_item_id: Option<i64>,
    is_tie: bool,
    updated_at: String,
}

impl From<VoteRow> for Vote {
    fn from(row: VoteRow) -> Self {
        Self {
            updated_at: parse_timestamp(&row.updated_at),
            comparison_id: row.comparison_id,
            participant_id: row.participant_id,
            preferred_item_id: row.preferred_item_id,
            is_tie: row.is_tie,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MagnitudeScoreRow {
    item_id: i64,
    criterion: String,
    participant_id: i64,
    value: i64,
    updated_at: String,
}

impl TryFrom<MagnitudeScoreRow> for MagnitudeScore {
    type Error = StorageError;

    fn try_from(row: MagnitudeScoreRow) -> Result<Self, Self::Error> {
        Ok(Self {
            item_id: row.item_id,
            criterion: parse_criterion(&row.criterion)?,
            participant_id: row.participant_id,
            value: row.value,
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct MagnitudeConsensusRow {
    item_id: i64,
    criterion: String,
    value: i64,
    locked_by: Option<i64>,
    locked_at: String,
    rationale: Option<String>,
}

impl TryFrom<MagnitudeConsensusRow> for MagnitudeConsensus {
    type Error = StorageError;

    fn try_from(row: MagnitudeConsensusRow) -> Result<Self, Self::Error> {
        Ok(Self {
            item_id: row.item_id,
            criterion: parse_criterion(&row.criterion)?,
            value: row.value,
            locked_by: row.locked_by,
            locked_at: parse_timestamp(&row.locked_at),
            rationale: row.rationale,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PriorityResultRow {
    project_id: i64,
    item_id: i64,
    value_weight: f64,
    complexity_weight: f64,
    value_magnitude: i64,
    complexity_magnitude: i64,
    weighted_value: f64,
    weighted_complexity: f64,
    final_score: f64,
    rank: i64,
    calculated_at: String,
}

impl From<PriorityResultRow> for PriorityResult {
    fn from(row: PriorityResultRow) -> Self {
        Self {
            project_id: row.project_id,
            item_id: row.item_id,
            value_weight: row.value_weight,
            complexity_weight: row.complexity_weight,
            value_magnitude: row.value_magnitude,
            complexity_magnitude: row.complexity_magnitude,
            weighted_value: row.weighted_value,
            weighted_complexity: row.weighted_complexity,
            final_score: row.final_score,
            rank: u32::try_from(row.rank).unwrap_or(u32::MAX),
            calculated_at: parse_timestamp(&row.calculated_at),
        }
    }
}
