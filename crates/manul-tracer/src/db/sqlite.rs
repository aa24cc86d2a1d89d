//! SQLite trace store

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{
    ImageDescriptor, LatencyStatistics, Message, MessageContent, ModelUsage, Session,
    StoreStatistics, TraceFilter, TraceRecord, TraceStatus, TraceSummary, User,
};

/// Columns of the `traces` table, in bind order
const TRACE_COLUMNS: &[&str] = &[
    "trace_id",
    "session_id",
    "user_id",
    "model_id",
    "endpoint",
    "api_version",
    "request_timestamp",
    "response_timestamp",
    "temperature",
    "max_tokens",
    "top_p",
    "frequency_penalty",
    "presence_penalty",
    "stream",
    "stop_sequences",
    "logit_bias",
    "seed",
    "request_size_bytes",
    "finish_reason",
    "choice_index",
    "response_id",
    "prompt_tokens",
    "completion_tokens",
    "total_tokens",
    "prompt_cached_tokens",
    "prompt_audio_tokens",
    "completion_reasoning_tokens",
    "completion_audio_tokens",
    "completion_accepted_prediction_tokens",
    "completion_rejected_prediction_tokens",
    "total_latency_ms",
    "processing_time_ms",
    "tokens_per_second",
    "response_size_bytes",
    "cost_usd",
    "rate_limit_requests_limit",
    "rate_limit_remaining",
    "rate_limit_tokens_limit",
    "rate_limit_tokens_remaining",
    "success",
    "error_code",
    "error_message",
    "error_category",
    "retry_count",
    "data_completeness_score",
    "missing_fields",
    "trace_status",
    "trace_created_at",
    "trace_updated_at",
    "trace_completed_at",
];

/// Upsert statement for a trace row; `trace_created_at` is kept on update
fn trace_upsert_sql() -> &'static str {
    static SQL: OnceLock<String> = OnceLock::new();
    SQL.get_or_init(|| {
        let placeholders = (1..=TRACE_COLUMNS.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let updates = TRACE_COLUMNS
            .iter()
            .filter(|column| !matches!(**column, "trace_id" | "trace_created_at"))
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO traces ({}) VALUES ({placeholders}) ON CONFLICT(trace_id) DO UPDATE SET {updates}",
            TRACE_COLUMNS.join(", ")
        )
    })
}

/// Store of traces, sessions, users, messages and images
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open the database described by the configuration
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.url, config.max_connections).await
    }

    /// Open a database by URL with default pool settings
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::open(url, DatabaseConfig::default().max_connections).await
    }

    async fn open(url: &str, max_connections: u32) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| Error::config(format!("Invalid database URL '{url}': {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        if let Some(parent) = database_file(url).as_deref().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Every connection to :memory: sees its own database
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        debug!(url, max_connections, "Opened trace database");
        Ok(Self { pool })
    }

    /// Apply pending schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Trace database schema is up to date");
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a user or refresh its name and email
    pub async fn upsert_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (user_id, username, email, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(user_id) DO UPDATE SET
                username = COALESCE(excluded.username, users.username),
                email = COALESCE(excluded.email, users.email)
            "#,
        )
        .bind(&user.user_id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(user.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create or overwrite a session row
    pub async fn upsert_session(&self, session: &Session) -> Result<()> {
        if let Some(user_id) = &session.user_id {
            ensure_user(&self.pool, user_id).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO sessions (
                session_id, user_id, session_type, created_at, last_activity_at,
                ended_at, total_requests, total_tokens, total_cost
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(session_id) DO UPDATE SET
                user_id = excluded.user_id,
                session_type = excluded.session_type,
                created_at = COALESCE(sessions.created_at, excluded.created_at),
                last_activity_at = excluded.last_activity_at,
                ended_at = excluded.ended_at,
                total_requests = excluded.total_requests,
                total_tokens = excluded.total_tokens,
                total_cost = excluded.total_cost
            "#,
        )
        .bind(&session.session_id)
        .bind(&session.user_id)
        .bind(&session.session_type)
        .bind(session.created_at)
        .bind(session.last_activity_at)
        .bind(session.ended_at)
        .bind(session.total_requests)
        .bind(session.total_tokens)
        .bind(session.total_cost)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Create or update a trace with its conversation and images
    pub async fn persist_trace(&self, trace: &TraceRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        write_trace(&mut tx, trace).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Persist several traces in one transaction
    pub async fn persist_batch(&self, traces: &[TraceRecord]) -> Result<usize> {
        if traces.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for trace in traces {
            write_trace(&mut tx, trace).await?;
        }
        tx.commit().await?;

        debug!(count = traces.len(), "Persisted trace batch");
        Ok(traces.len())
    }

    /// Refresh last activity and recompute the session totals from its traces.
    ///
    /// Returns `false` when the session does not exist.
    pub async fn update_session_activity(&self, session_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sessions SET
                last_activity_at = ?2,
                total_requests = (SELECT COUNT(*) FROM traces WHERE session_id = ?1),
                total_tokens = (
                    SELECT COALESCE(SUM(total_tokens), 0) FROM traces WHERE session_id = ?1
                ),
                total_cost = (
                    SELECT COALESCE(SUM(cost_usd), 0.0) FROM traces WHERE session_id = ?1
                )
            WHERE session_id = ?1
            "#,
        )
        .bind(session_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Close a session. Returns `false` if it is unknown or already closed.
    pub async fn end_session(&self, session_id: &str, ended_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE sessions SET ended_at = ?2 WHERE session_id = ?1 AND ended_at IS NULL",
        )
        .bind(session_id)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a trace with its conversation and images
    pub async fn get_trace(&self, trace_id: &str) -> Result<Option<TraceRecord>> {
        let row = sqlx::query("SELECT * FROM traces WHERE trace_id = ?1")
            .bind(trace_id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut trace = row_to_trace(&row)?;

        let rows = sqlx::query(
            r#"
            SELECT m.message_id, m.role, m.content, m.content_format, m.content_hash,
                   m.has_images, m.created_at, tm.message_order, tm.token_count
            FROM trace_messages tm
            JOIN messages m ON m.message_id = tm.message_id
            WHERE tm.trace_id = ?1
            ORDER BY tm.message_order
            "#,
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;
        trace.conversation = rows
            .iter()
            .map(|row| row_to_message(row, trace_id))
            .collect::<Result<_>>()?;

        let rows = sqlx::query(
            r#"
            SELECT i.image_hash, i.format, i.size_bytes, i.width, i.height
            FROM trace_images ti
            JOIN images i ON i.image_hash = ti.image_hash
            WHERE ti.trace_id = ?1
            ORDER BY ti.position
            "#,
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;
        trace.images = rows.iter().map(row_to_image).collect::<Result<_>>()?;

        Ok(Some(trace))
    }

    /// Get a session by id
    pub async fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?1")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_session).transpose()
    }

    /// Most recently active sessions first
    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<Session>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM sessions
            ORDER BY COALESCE(last_activity_at, created_at) DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect()
    }

    /// List trace summaries matching a filter, newest first
    pub async fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<TraceSummary>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            r#"
            SELECT t.trace_id, t.session_id, t.user_id, t.model_id, t.trace_status,
                   t.success, t.total_tokens, t.total_latency_ms, t.cost_usd,
                   t.error_category, t.request_timestamp,
                   (SELECT COUNT(*) FROM trace_messages tm WHERE tm.trace_id = t.trace_id)
                       AS conversation_length
            FROM traces t
            WHERE 1 = 1
            "#,
        );

        if let Some(session_id) = &filter.session_id {
            qb.push(" AND t.session_id = ");
            qb.push_bind(session_id.clone());
        }
        if let Some(user_id) = &filter.user_id {
            qb.push(" AND t.user_id = ");
            qb.push_bind(user_id.clone());
        }
        if let Some(model_id) = &filter.model_id {
            qb.push(" AND t.model_id = ");
            qb.push_bind(model_id.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND t.trace_status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(success) = filter.success {
            qb.push(" AND t.success = ");
            qb.push_bind(success);
        }
        if let Some(since) = filter.since {
            qb.push(" AND t.request_timestamp >= ");
            qb.push_bind(since);
        }

        qb.push(" ORDER BY t.request_timestamp DESC, t.trace_created_at DESC LIMIT ");
        qb.push_bind(filter.limit.unwrap_or(50));
        qb.push(" OFFSET ");
        qb.push_bind(filter.offset.unwrap_or(0));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_summary).collect()
    }

    /// Store-wide aggregates
    pub async fn statistics(&self) -> Result<StoreStatistics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_traces,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful_traces,
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed_traces,
                COALESCE(SUM(prompt_tokens), 0) AS total_prompt_tokens,
                COALESCE(SUM(completion_tokens), 0) AS total_completion_tokens,
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(cost_usd), 0.0) AS total_cost,
                AVG(CASE WHEN success = 1 THEN total_latency_ms END) AS avg_latency_ms,
                COUNT(DISTINCT model_id) AS unique_models
            FROM traces
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let sessions = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_sessions,
                COALESCE(SUM(CASE WHEN ended_at IS NULL THEN 1 ELSE 0 END), 0) AS active_sessions
            FROM sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStatistics {
            total_traces: row.try_get("total_traces")?,
            successful_traces: row.try_get("successful_traces")?,
            failed_traces: row.try_get("failed_traces")?,
            total_sessions: sessions.try_get("total_sessions")?,
            active_sessions: sessions.try_get("active_sessions")?,
            total_prompt_tokens: row.try_get("total_prompt_tokens")?,
            total_completion_tokens: row.try_get("total_completion_tokens")?,
            total_tokens: row.try_get("total_tokens")?,
            total_cost: row.try_get("total_cost")?,
            avg_latency_ms: row.try_get("avg_latency_ms")?,
            unique_models: row.try_get("unique_models")?,
        })
    }

    /// Token and cost usage grouped by model, heaviest first
    pub async fn token_usage_by_model(&self) -> Result<Vec<ModelUsage>> {
        let rows = sqlx::query(
            r#"
            SELECT
                model_id,
                COUNT(*) AS request_count,
                COALESCE(SUM(prompt_tokens), 0) AS prompt_tokens,
                COALESCE(SUM(completion_tokens), 0) AS completion_tokens,
                COALESCE(SUM(total_tokens), 0) AS total_tokens,
                COALESCE(SUM(cost_usd), 0.0) AS total_cost,
                AVG(total_latency_ms) AS avg_latency_ms
            FROM traces
            WHERE model_id IS NOT NULL
            GROUP BY model_id
            ORDER BY total_tokens DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ModelUsage {
                    model_id: row.try_get("model_id")?,
                    request_count: row.try_get("request_count")?,
                    prompt_tokens: row.try_get("prompt_tokens")?,
                    completion_tokens: row.try_get("completion_tokens")?,
                    total_tokens: row.try_get("total_tokens")?,
                    total_cost: row.try_get("total_cost")?,
                    avg_latency_ms: row.try_get("avg_latency_ms")?,
                })
            })
            .collect()
    }

    /// Latency distribution of successful traces, optionally for one session
    pub async fn latency_statistics(&self, session_id: Option<&str>) -> Result<LatencyStatistics> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT total_latency_ms FROM traces WHERE success = 1 AND total_latency_ms IS NOT NULL",
        );
        if let Some(session_id) = session_id {
            qb.push(" AND session_id = ");
            qb.push_bind(session_id.to_string());
        }
        qb.push(" ORDER BY total_latency_ms");

        let latencies: Vec<f64> = qb
            .build()
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| row.try_get("total_latency_ms"))
            .collect::<std::result::Result<_, _>>()?;

        Ok(latency_distribution(&latencies))
    }
}

/// Path of the database file behind a `sqlite:` URL, `None` for in-memory databases
fn database_file(url: &str) -> Option<PathBuf> {
    if url.contains(":memory:") {
        return None;
    }
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url);
    let path = path.split('?').next().unwrap_or(path);
    (!path.is_empty()).then(|| PathBuf::from(path))
}

/// Distribution over latencies sorted ascending
fn latency_distribution(sorted: &[f64]) -> LatencyStatistics {
    if sorted.is_empty() {
        return LatencyStatistics::default();
    }

    let percentile = |p: f64| {
        let rank = (p * (sorted.len() - 1) as f64).round() as usize;
        sorted[rank.min(sorted.len() - 1)]
    };

    LatencyStatistics {
        count: sorted.len() as i64,
        min_ms: sorted.first().copied(),
        max_ms: sorted.last().copied(),
        avg_ms: Some(sorted.iter().sum::<f64>() / sorted.len() as f64),
        p50_ms: Some(percentile(0.50)),
        p95_ms: Some(percentile(0.95)),
    }
}

async fn ensure_user<'e, E>(executor: E, user_id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    sqlx::query("INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)")
        .bind(user_id)
        .bind(Utc::now())
        .execute(executor)
        .await?;
    Ok(())
}

/// Write one trace and its links inside an open transaction
async fn write_trace(conn: &mut SqliteConnection, trace: &TraceRecord) -> Result<()> {
    if let Some(user_id) = &trace.user_id {
        ensure_user(&mut *conn, user_id).await?;
    }

    sqlx::query(
        r#"
        INSERT INTO sessions (session_id, user_id, created_at, last_activity_at)
        VALUES (?1, ?2, ?3, ?3)
        ON CONFLICT(session_id) DO NOTHING
        "#,
    )
    .bind(&trace.session_id)
    .bind(&trace.user_id)
    .bind(trace.request_timestamp.unwrap_or(trace.trace_created_at))
    .execute(&mut *conn)
    .await?;

    let logit_bias = trace
        .logit_bias
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(trace_upsert_sql())
        .bind(&trace.trace_id)
        .bind(&trace.session_id)
        .bind(&trace.user_id)
        .bind(&trace.model_id)
        .bind(&trace.endpoint)
        .bind(&trace.api_version)
        .bind(trace.request_timestamp)
        .bind(trace.response_timestamp)
        .bind(trace.temperature)
        .bind(trace.max_tokens)
        .bind(trace.top_p)
        .bind(trace.frequency_penalty)
        .bind(trace.presence_penalty)
        .bind(trace.stream)
        .bind(serde_json::to_string(&trace.stop_sequences)?)
        .bind(logit_bias)
        .bind(trace.seed)
        .bind(trace.request_size_bytes)
        .bind(&trace.finish_reason)
        .bind(trace.choice_index)
        .bind(&trace.response_id)
        .bind(trace.prompt_tokens)
        .bind(trace.completion_tokens)
        .bind(trace.total_tokens)
        .bind(trace.prompt_cached_tokens)
        .bind(trace.prompt_audio_tokens)
        .bind(trace.completion_reasoning_tokens)
        .bind(trace.completion_audio_tokens)
        .bind(trace.completion_accepted_prediction_tokens)
        .bind(trace.completion_rejected_prediction_tokens)
        .bind(trace.total_latency_ms)
        .bind(trace.processing_time_ms)
        .bind(trace.tokens_per_second)
        .bind(trace.response_size_bytes)
        .bind(trace.cost_usd)
        .bind(trace.rate_limit_requests_limit)
        .bind(trace.rate_limit_remaining)
        .bind(trace.rate_limit_tokens_limit)
        .bind(trace.rate_limit_tokens_remaining)
        .bind(trace.success)
        .bind(&trace.error_code)
        .bind(&trace.error_message)
        .bind(&trace.error_category)
        .bind(trace.retry_count)
        .bind(trace.data_completeness_score)
        .bind(serde_json::to_string(&trace.missing_fields)?)
        .bind(trace.trace_status.as_str())
        .bind(trace.trace_created_at)
        .bind(trace.trace_updated_at)
        .bind(trace.trace_completed_at)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM trace_messages WHERE trace_id = ?1")
        .bind(&trace.trace_id)
        .execute(&mut *conn)
        .await?;

    for (order, message) in trace.conversation.iter().enumerate() {
        let (content, format) = match &message.content {
            Some(content @ MessageContent::Text(_)) => (Some(content.canonical()), "text"),
            Some(content @ MessageContent::Parts(_)) => (Some(content.canonical()), "json"),
            None => (None, "text"),
        };

        sqlx::query(
            r#"
            INSERT INTO messages (
                message_id, role, content, content_format, content_hash, has_images, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(message_id) DO NOTHING
            "#,
        )
        .bind(&message.message_id)
        .bind(message.role.as_str())
        .bind(content)
        .bind(format)
        .bind(&message.content_hash)
        .bind(message.has_images)
        .bind(message.message_timestamp)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO trace_messages (trace_id, message_id, message_order, token_count)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&trace.trace_id)
        .bind(&message.message_id)
        .bind(message.message_order.unwrap_or(order as i64))
        .bind(message.token_count)
        .execute(&mut *conn)
        .await?;
    }

    sqlx::query("DELETE FROM trace_images WHERE trace_id = ?1")
        .bind(&trace.trace_id)
        .execute(&mut *conn)
        .await?;

    for (position, image) in trace.images.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO images (image_hash, format, size_bytes, width, height, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&image.image_hash)
        .bind(&image.format)
        .bind(image.size_bytes)
        .bind(image.width)
        .bind(image.height)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "INSERT INTO trace_images (trace_id, image_hash, position) VALUES (?1, ?2, ?3)",
        )
        .bind(&trace.trace_id)
        .bind(&image.image_hash)
        .bind(position as i64)
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned + Default>(
    row: &SqliteRow,
    column: &str,
) -> Result<T> {
    let raw: Option<String> = row.try_get(column)?;
    match raw {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(&raw)?),
        _ => Ok(T::default()),
    }
}

fn row_to_trace(row: &SqliteRow) -> Result<TraceRecord> {
    let status: String = row.try_get("trace_status")?;
    let logit_bias: Option<String> = row.try_get("logit_bias")?;
    let logit_bias = logit_bias
        .map(|raw| serde_json::from_str::<BTreeMap<String, f64>>(&raw))
        .transpose()?;

    Ok(TraceRecord {
        trace_id: row.try_get("trace_id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        model_id: row.try_get("model_id")?,
        endpoint: row.try_get("endpoint")?,
        api_version: row.try_get("api_version")?,
        request_timestamp: row.try_get("request_timestamp")?,
        response_timestamp: row.try_get("response_timestamp")?,
        temperature: row.try_get("temperature")?,
        max_tokens: row.try_get("max_tokens")?,
        top_p: row.try_get("top_p")?,
        frequency_penalty: row.try_get("frequency_penalty")?,
        presence_penalty: row.try_get("presence_penalty")?,
        stream: row.try_get("stream")?,
        stop_sequences: json_column(row, "stop_sequences")?,
        logit_bias,
        seed: row.try_get("seed")?,
        request_size_bytes: row.try_get("request_size_bytes")?,
        conversation: Vec::new(),
        images: Vec::new(),
        finish_reason: row.try_get("finish_reason")?,
        choice_index: row.try_get("choice_index")?,
        response_id: row.try_get("response_id")?,
        prompt_tokens: row.try_get("prompt_tokens")?,
        completion_tokens: row.try_get("completion_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        prompt_cached_tokens: row.try_get("prompt_cached_tokens")?,
        prompt_audio_tokens: row.try_get("prompt_audio_tokens")?,
        completion_reasoning_tokens: row.try_get("completion_reasoning_tokens")?,
        completion_audio_tokens: row.try_get("completion_audio_tokens")?,
        completion_accepted_prediction_tokens: row
            .try_get("completion_accepted_prediction_tokens")?,
        completion_rejected_prediction_tokens: row
            .try_get("completion_rejected_prediction_tokens")?,
        total_latency_ms: row.try_get("total_latency_ms")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        tokens_per_second: row.try_get("tokens_per_second")?,
        response_size_bytes: row.try_get("response_size_bytes")?,
        cost_usd: row.try_get("cost_usd")?,
        rate_limit_requests_limit: row.try_get("rate_limit_requests_limit")?,
        rate_limit_remaining: row.try_get("rate_limit_remaining")?,
        rate_limit_tokens_limit: row.try_get("rate_limit_tokens_limit")?,
        rate_limit_tokens_remaining: row.try_get("rate_limit_tokens_remaining")?,
        success: row.try_get("success")?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        error_category: row.try_get("error_category")?,
        retry_count: row.try_get("retry_count")?,
        data_completeness_score: row.try_get("data_completeness_score")?,
        missing_fields: json_column(row, "missing_fields")?,
        trace_status: status.parse()?,
        trace_created_at: row.try_get("trace_created_at")?,
        trace_updated_at: row.try_get("trace_updated_at")?,
        trace_completed_at: row.try_get("trace_completed_at")?,
    })
}

fn row_to_message(row: &SqliteRow, trace_id: &str) -> Result<Message> {
    let role: String = row.try_get("role")?;
    let raw: Option<String> = row.try_get("content")?;
    let format: String = row.try_get("content_format")?;
    let content = match (raw, format.as_str()) {
        (Some(raw), "json") => Some(MessageContent::Parts(serde_json::from_str(&raw)?)),
        (Some(raw), _) => Some(MessageContent::Text(raw)),
        (None, _) => None,
    };

    Ok(Message {
        message_id: row.try_get("message_id")?,
        trace_id: Some(trace_id.to_string()),
        role: role.into(),
        content,
        content_hash: row.try_get("content_hash")?,
        has_images: row.try_get("has_images")?,
        message_order: row.try_get("message_order")?,
        message_timestamp: row.try_get("created_at")?,
        token_count: row.try_get("token_count")?,
    })
}

fn row_to_image(row: &SqliteRow) -> Result<ImageDescriptor> {
    Ok(ImageDescriptor {
        image_hash: row.try_get("image_hash")?,
        format: row.try_get("format")?,
        size_bytes: row.try_get("size_bytes")?,
        width: row.try_get("width")?,
        height: row.try_get("height")?,
    })
}

fn row_to_session(row: &SqliteRow) -> Result<Session> {
    Ok(Session {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        session_type: row.try_get("session_type")?,
        created_at: row.try_get("created_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        ended_at: row.try_get("ended_at")?,
        total_requests: row.try_get("total_requests")?,
        total_tokens: row.try_get("total_tokens")?,
        total_cost: row.try_get("total_cost")?,
    })
}

fn row_to_summary(row: &SqliteRow) -> Result<TraceSummary> {
    let status: String = row.try_get("trace_status")?;
    let total_tokens: Option<i64> = row.try_get("total_tokens")?;

    Ok(TraceSummary {
        trace_id: row.try_get("trace_id")?,
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        model_id: row.try_get("model_id")?,
        trace_status: TraceStatus::from_str(&status)?,
        success: row.try_get("success")?,
        total_tokens: total_tokens.unwrap_or(0),
        total_latency_ms: row.try_get("total_latency_ms")?,
        cost_usd: row.try_get("cost_usd")?,
        error_category: row.try_get("error_category")?,
        request_timestamp: row.try_get("request_timestamp")?,
        conversation_length: row.try_get("conversation_length")?,
    })
}
