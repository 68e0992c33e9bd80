//! Message trace and payload storage, plus the analytics aggregation the
//! admin surface serves. Traces are append-mostly; concurrent writes to
//! different trace ids never touch the same rows.

use chrono::{DateTime, Utc};
use omnihub_schema::{
    ChannelType, Direction, MessageKind, MessageTrace, TracePayload, TraceStage, TraceStatus,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use serde::Serialize;
use tokio::task;
use uuid::Uuid;

use crate::{lock_err, parse_dt, ConfigStore, Result, StoreError};

/// Filters for bounded trace listings. Unset fields do not constrain.
#[derive(Debug, Clone)]
pub struct TraceQuery {
    pub instance_name: Option<String>,
    pub sender_phone: Option<String>,
    pub session_name: Option<String>,
    pub status: Option<TraceStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for TraceQuery {
    fn default() -> Self {
        Self {
            instance_name: None,
            sender_phone: None,
            session_name: None,
            status: None,
            since: None,
            until: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CountBucket {
    pub key: String,
    pub count: i64,
}

/// Aggregates derived from `message_traces` alone; payload rows are never
/// decompressed for analytics.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsSummary {
    pub total_messages: i64,
    pub completed: i64,
    pub failed: i64,
    pub access_denied: i64,
    pub in_flight: i64,
    pub success_rate: f64,
    pub avg_agent_processing_ms: Option<f64>,
    pub avg_total_processing_ms: Option<f64>,
    pub by_message_type: Vec<CountBucket>,
    pub by_error_stage: Vec<CountBucket>,
    pub by_instance: Vec<CountBucket>,
}

fn row_to_trace(row: &Row<'_>) -> rusqlite::Result<MessageTrace> {
    let conv = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };
    let trace_raw: String = row.get("trace_id")?;
    let trace_id = Uuid::parse_str(&trace_raw)
        .map_err(|e| conv(0, format!("bad trace_id: {e}")))?;
    let channel_raw: String = row.get("channel_type")?;
    let channel_type = ChannelType::parse(&channel_raw)
        .ok_or_else(|| conv(2, format!("unknown channel_type: {channel_raw}")))?;
    let direction_raw: String = row.get("direction")?;
    let direction = match direction_raw.as_str() {
        "inbound" => Direction::Inbound,
        "outbound" => Direction::Outbound,
        other => return Err(conv(3, format!("unknown direction: {other}"))),
    };
    let status_raw: String = row.get("status")?;
    let status = TraceStatus::parse(&status_raw)
        .ok_or_else(|| conv(12, format!("unknown status: {status_raw}")))?;
    let kind_raw: String = row.get("message_type")?;
    let user_raw: Option<String> = row.get("user_id")?;
    let user_id = match user_raw {
        Some(raw) => Some(
            Uuid::parse_str(&raw).map_err(|e| conv(6, format!("bad user_id: {e}")))?,
        ),
        None => None,
    };
    let received_raw: String = row.get("received_at")?;
    let completed_raw: Option<String> = row.get("completed_at")?;
    let completed_at = match completed_raw {
        Some(raw) => Some(parse_dt(&raw)?),
        None => None,
    };
    Ok(MessageTrace {
        trace_id,
        instance_name: row.get("instance_name")?,
        channel_type,
        direction,
        message_id: row.get("message_id")?,
        session_name: row.get("session_name")?,
        user_id,
        sender_phone: row.get("sender_phone")?,
        sender_name: row.get("sender_name")?,
        message_type: MessageKind::from_raw_key(&kind_raw),
        has_media: row.get("has_media")?,
        has_quoted_message: row.get("has_quoted_message")?,
        status,
        error_message: row.get("error_message")?,
        error_stage: row.get("error_stage")?,
        received_at: parse_dt(&received_raw)?,
        completed_at,
        agent_processing_time_ms: row.get("agent_processing_time_ms")?,
        total_processing_time_ms: row.get("total_processing_time_ms")?,
        agent_response_success: row.get("agent_response_success")?,
        channel_send_success: row.get("channel_send_success")?,
    })
}

fn row_to_payload(row: &Row<'_>) -> rusqlite::Result<TracePayload> {
    let conv = |idx: usize, msg: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, msg.into())
    };
    let trace_raw: String = row.get("trace_id")?;
    let trace_id = Uuid::parse_str(&trace_raw)
        .map_err(|e| conv(1, format!("bad trace_id: {e}")))?;
    let stage_raw: String = row.get("stage")?;
    let stage = TraceStage::parse(&stage_raw)
        .ok_or_else(|| conv(2, format!("unknown stage: {stage_raw}")))?;
    let ts_raw: String = row.get("timestamp")?;
    let status_code: Option<i64> = row.get("status_code")?;
    Ok(TracePayload {
        id: row.get("id")?,
        trace_id,
        stage,
        payload_type: row.get("payload_type")?,
        timestamp: parse_dt(&ts_raw)?,
        status_code: status_code.map(|c| c as u16),
        payload_size_original: row.get("payload_size_original")?,
        payload_size_compressed: row.get("payload_size_compressed")?,
        compression_ratio: row.get("compression_ratio")?,
        contains_media: row.get("contains_media")?,
        contains_base64: row.get("contains_base64")?,
        payload: row.get("payload")?,
    })
}

const TRACE_COLUMNS: &str = "trace_id, instance_name, channel_type, direction, message_id, \
     session_name, user_id, sender_phone, sender_name, message_type, has_media, \
     has_quoted_message, status, error_message, error_stage, received_at, completed_at, \
     agent_processing_time_ms, total_processing_time_ms, agent_response_success, \
     channel_send_success";

const PAYLOAD_COLUMNS: &str = "id, trace_id, stage, payload_type, timestamp, status_code, \
     payload_size_original, payload_size_compressed, compression_ratio, contains_media, \
     contains_base64, payload";

const TERMINAL_GUARD: &str = "status NOT IN ('completed', 'failed', 'access_denied')";

impl ConfigStore {
    pub async fn insert_trace(&self, trace: MessageTrace) -> Result<()> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            conn.execute(
                &format!(
                    "INSERT INTO message_traces ({TRACE_COLUMNS}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
                      ?17, ?18, ?19, ?20, ?21)"
                ),
                params![
                    trace.trace_id.to_string(),
                    trace.instance_name,
                    trace.channel_type.as_str(),
                    trace.direction.as_str(),
                    trace.message_id,
                    trace.session_name,
                    trace.user_id.map(|u| u.to_string()),
                    trace.sender_phone,
                    trace.sender_name,
                    trace.message_type.as_str(),
                    trace.has_media,
                    trace.has_quoted_message,
                    trace.status.as_str(),
                    trace.error_message,
                    trace.error_stage,
                    trace.received_at.to_rfc3339(),
                    trace.completed_at.map(|t| t.to_rfc3339()),
                    trace.agent_processing_time_ms,
                    trace.total_processing_time_ms,
                    trace.agent_response_success,
                    trace.channel_send_success,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Promote a trace's status. The terminal guard makes status monotonic:
    /// once a trace is terminal its status never changes again. Returns
    /// whether a row was updated.
    pub async fn update_trace_status(
        &self,
        trace_id: Uuid,
        status: TraceStatus,
        error_message: Option<String>,
        error_stage: Option<String>,
    ) -> Result<bool> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let updated = conn.execute(
                &format!(
                    "UPDATE message_traces SET status = ?2, \
                     error_message = COALESCE(?3, error_message), \
                     error_stage = COALESCE(?4, error_stage) \
                     WHERE trace_id = ?1 AND {TERMINAL_GUARD}"
                ),
                params![
                    trace_id.to_string(),
                    status.as_str(),
                    error_message,
                    error_stage
                ],
            )?;
            Ok(updated > 0)
        })
        .await?
    }

    /// Attach the resolved identity and derived session to a trace.
    pub async fn update_trace_context(
        &self,
        trace_id: Uuid,
        user_id: Option<Uuid>,
        session_name: Option<String>,
    ) -> Result<()> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            conn.execute(
                "UPDATE message_traces SET \
                 user_id = COALESCE(?2, user_id), \
                 session_name = COALESCE(?3, session_name) \
                 WHERE trace_id = ?1",
                params![
                    trace_id.to_string(),
                    user_id.map(|u| u.to_string()),
                    session_name
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Close a trace: set the terminal status, completion time, timings and
    /// success flags. Only the first finalize wins; a trace already
    /// terminal keeps its status (timings are still owned by the router
    /// that finalized it).
    #[allow(clippy::too_many_arguments)]
    pub async fn finalize_trace(
        &self,
        trace_id: Uuid,
        status: TraceStatus,
        error_message: Option<String>,
        error_stage: Option<String>,
        agent_processing_time_ms: Option<i64>,
        total_processing_time_ms: Option<i64>,
        agent_response_success: bool,
        channel_send_success: bool,
    ) -> Result<bool> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let updated = conn.execute(
                &format!(
                    "UPDATE message_traces SET status = ?2, error_message = ?3, \
                     error_stage = ?4, completed_at = ?5, agent_processing_time_ms = ?6, \
                     total_processing_time_ms = ?7, agent_response_success = ?8, \
                     channel_send_success = ?9 \
                     WHERE trace_id = ?1 AND {TERMINAL_GUARD}"
                ),
                params![
                    trace_id.to_string(),
                    status.as_str(),
                    error_message,
                    error_stage,
                    Utc::now().to_rfc3339(),
                    agent_processing_time_ms,
                    total_processing_time_ms,
                    agent_response_success,
                    channel_send_success,
                ],
            )?;
            Ok(updated > 0)
        })
        .await?
    }

    pub async fn get_trace(&self, trace_id: Uuid) -> Result<Option<MessageTrace>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let trace = conn
                .query_row(
                    &format!("SELECT {TRACE_COLUMNS} FROM message_traces WHERE trace_id = ?1"),
                    params![trace_id.to_string()],
                    row_to_trace,
                )
                .optional()?;
            Ok(trace)
        })
        .await?
    }

    pub async fn list_traces(&self, query: TraceQuery) -> Result<Vec<MessageTrace>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let mut sql = format!("SELECT {TRACE_COLUMNS} FROM message_traces WHERE 1=1");
            let mut args: Vec<SqlValue> = Vec::new();
            if let Some(instance) = query.instance_name {
                args.push(SqlValue::Text(instance));
                sql.push_str(&format!(" AND instance_name = ?{}", args.len()));
            }
            if let Some(phone) = query.sender_phone {
                args.push(SqlValue::Text(phone));
                sql.push_str(&format!(" AND sender_phone = ?{}", args.len()));
            }
            if let Some(session) = query.session_name {
                args.push(SqlValue::Text(session));
                sql.push_str(&format!(" AND session_name = ?{}", args.len()));
            }
            if let Some(status) = query.status {
                args.push(SqlValue::Text(status.as_str().to_string()));
                sql.push_str(&format!(" AND status = ?{}", args.len()));
            }
            if let Some(since) = query.since {
                args.push(SqlValue::Text(since.to_rfc3339()));
                sql.push_str(&format!(" AND received_at >= ?{}", args.len()));
            }
            if let Some(until) = query.until {
                args.push(SqlValue::Text(until.to_rfc3339()));
                sql.push_str(&format!(" AND received_at <= ?{}", args.len()));
            }
            args.push(SqlValue::Integer(i64::from(query.limit)));
            sql.push_str(&format!(" ORDER BY received_at DESC LIMIT ?{}", args.len()));
            args.push(SqlValue::Integer(i64::from(query.offset)));
            sql.push_str(&format!(" OFFSET ?{}", args.len()));

            let conn = db.lock().map_err(|_| lock_err())?;
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args), row_to_trace)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    /// Insert or replace the payload row for `(trace_id, stage)`. Streaming
    /// aggregation re-writes the `agent_response` row as chunks coalesce.
    pub async fn upsert_payload(&self, payload: TracePayload) -> Result<()> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            conn.execute(
                "INSERT INTO trace_payloads (trace_id, stage, payload_type, timestamp, \
                 status_code, payload_size_original, payload_size_compressed, \
                 compression_ratio, contains_media, contains_base64, payload) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT (trace_id, stage) DO UPDATE SET \
                 payload_type = excluded.payload_type, \
                 timestamp = excluded.timestamp, \
                 status_code = excluded.status_code, \
                 payload_size_original = excluded.payload_size_original, \
                 payload_size_compressed = excluded.payload_size_compressed, \
                 compression_ratio = excluded.compression_ratio, \
                 contains_media = excluded.contains_media, \
                 contains_base64 = excluded.contains_base64, \
                 payload = excluded.payload",
                params![
                    payload.trace_id.to_string(),
                    payload.stage.as_str(),
                    payload.payload_type,
                    payload.timestamp.to_rfc3339(),
                    payload.status_code.map(i64::from),
                    payload.payload_size_original,
                    payload.payload_size_compressed,
                    payload.compression_ratio,
                    payload.contains_media,
                    payload.contains_base64,
                    payload.payload,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn list_payloads(&self, trace_id: Uuid) -> Result<Vec<TracePayload>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {PAYLOAD_COLUMNS} FROM trace_payloads WHERE trace_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![trace_id.to_string()], row_to_payload)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn get_payload(
        &self,
        trace_id: Uuid,
        stage: TraceStage,
    ) -> Result<Option<TracePayload>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let payload = conn
                .query_row(
                    &format!(
                        "SELECT {PAYLOAD_COLUMNS} FROM trace_payloads \
                         WHERE trace_id = ?1 AND stage = ?2"
                    ),
                    params![trace_id.to_string(), stage.as_str()],
                    row_to_payload,
                )
                .optional()?;
            Ok(payload)
        })
        .await?
    }

    /// Trace ids still carrying `unknown` message types, for backfill.
    pub async fn traces_with_unknown_type(&self, limit: u32) -> Result<Vec<Uuid>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let mut stmt = conn.prepare(
                "SELECT trace_id FROM message_traces WHERE message_type = 'unknown' LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![i64::from(limit)], |row| {
                row.get::<_, String>(0)
            })?;
            let mut out = Vec::new();
            for row in rows {
                let raw = row?;
                let id = Uuid::parse_str(&raw)
                    .map_err(|e| StoreError::Persistence(format!("bad trace_id: {e}")))?;
                out.push(id);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn update_trace_message_type(
        &self,
        trace_id: Uuid,
        kind: MessageKind,
    ) -> Result<()> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            conn.execute(
                "UPDATE message_traces SET message_type = ?2 WHERE trace_id = ?1",
                params![trace_id.to_string(), kind.as_str()],
            )?;
            Ok(())
        })
        .await?
    }

    /// Aggregate counts and timings over an optional date window.
    pub async fn analytics_summary(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<AnalyticsSummary> {
        let db = self.db();
        task::spawn_blocking(move || {
            let mut window = String::new();
            let mut args: Vec<SqlValue> = Vec::new();
            if let Some(since) = since {
                args.push(SqlValue::Text(since.to_rfc3339()));
                window.push_str(&format!(" AND received_at >= ?{}", args.len()));
            }
            if let Some(until) = until {
                args.push(SqlValue::Text(until.to_rfc3339()));
                window.push_str(&format!(" AND received_at <= ?{}", args.len()));
            }

            let conn = db.lock().map_err(|_| lock_err())?;

            let (total, completed, failed, access_denied, avg_agent, avg_total) = conn
                .query_row(
                    &format!(
                        "SELECT COUNT(*), \
                         SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), \
                         SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), \
                         SUM(CASE WHEN status = 'access_denied' THEN 1 ELSE 0 END), \
                         AVG(agent_processing_time_ms), \
                         AVG(total_processing_time_ms) \
                         FROM message_traces WHERE 1=1{window}"
                    ),
                    params_from_iter(args.clone()),
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                            row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                            row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                            row.get::<_, Option<f64>>(4)?,
                            row.get::<_, Option<f64>>(5)?,
                        ))
                    },
                )?;

            let bucket_query = |conn: &rusqlite::Connection,
                                column: &str,
                                extra: &str|
             -> Result<Vec<CountBucket>> {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {column}, COUNT(*) FROM message_traces \
                     WHERE {column} IS NOT NULL{window}{extra} \
                     GROUP BY {column} ORDER BY COUNT(*) DESC"
                ))?;
                let rows = stmt.query_map(params_from_iter(args.clone()), |row| {
                    Ok(CountBucket {
                        key: row.get(0)?,
                        count: row.get(1)?,
                    })
                })?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            };

            let by_message_type = bucket_query(&conn, "message_type", "")?;
            let by_error_stage = bucket_query(&conn, "error_stage", "")?;
            let by_instance = bucket_query(&conn, "instance_name", "")?;

            let terminal = completed + failed + access_denied;
            let success_rate = if terminal > 0 {
                completed as f64 / terminal as f64
            } else {
                0.0
            };

            Ok(AnalyticsSummary {
                total_messages: total,
                completed,
                failed,
                access_denied,
                in_flight: total - terminal,
                success_rate,
                avg_agent_processing_ms: avg_agent,
                avg_total_processing_ms: avg_total,
                by_message_type,
                by_error_stage,
                by_instance,
            })
        })
        .await?
    }
}
