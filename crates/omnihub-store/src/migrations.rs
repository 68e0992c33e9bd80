use rusqlite::Connection;
use std::collections::HashSet;

use crate::Result;

type Migration = (i64, &'static str);

fn migrations() -> Vec<Migration> {
    vec![
        (
            1,
            r#"
            CREATE TABLE IF NOT EXISTS instance_configs (
                name TEXT PRIMARY KEY,
                channel_type TEXT NOT NULL,
                evolution_url TEXT,
                evolution_key TEXT,
                whatsapp_instance_id TEXT,
                discord_bot_token TEXT,
                discord_guild_id TEXT,
                agent_api_url TEXT NOT NULL,
                agent_api_key TEXT,
                agent_id TEXT NOT NULL,
                agent_timeout_ms INTEGER NOT NULL,
                agent_stream_mode INTEGER NOT NULL DEFAULT 0,
                is_default INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                enable_auto_split INTEGER NOT NULL DEFAULT 1,
                session_id_prefix TEXT,
                error_fallback_message TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        ),
        (
            2,
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_external_ids (
                provider TEXT NOT NULL,
                external_id TEXT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(id),
                extra TEXT,
                created_at TEXT NOT NULL,
                PRIMARY KEY (provider, external_id)
            );

            CREATE INDEX IF NOT EXISTS idx_user_external_ids_user
                ON user_external_ids(user_id);
            "#,
        ),
        (
            3,
            r#"
            CREATE TABLE IF NOT EXISTS access_rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_name TEXT,
                phone_number TEXT NOT NULL,
                rule_type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_access_rules_instance
                ON access_rules(instance_name);
            "#,
        ),
        (
            4,
            r#"
            CREATE TABLE IF NOT EXISTS message_traces (
                trace_id TEXT PRIMARY KEY,
                instance_name TEXT NOT NULL,
                channel_type TEXT NOT NULL,
                direction TEXT NOT NULL,
                message_id TEXT NOT NULL,
                session_name TEXT,
                user_id TEXT,
                sender_phone TEXT,
                sender_name TEXT,
                message_type TEXT NOT NULL,
                has_media INTEGER NOT NULL DEFAULT 0,
                has_quoted_message INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                error_message TEXT,
                error_stage TEXT,
                received_at TEXT NOT NULL,
                completed_at TEXT,
                agent_processing_time_ms INTEGER,
                total_processing_time_ms INTEGER,
                agent_response_success INTEGER NOT NULL DEFAULT 0,
                channel_send_success INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_traces_instance_received
                ON message_traces(instance_name, received_at DESC);
            CREATE INDEX IF NOT EXISTS idx_traces_sender_phone
                ON message_traces(sender_phone);
            CREATE INDEX IF NOT EXISTS idx_traces_session
                ON message_traces(session_name);
            CREATE INDEX IF NOT EXISTS idx_traces_status
                ON message_traces(status);
            "#,
        ),
        (
            5,
            r#"
            CREATE TABLE IF NOT EXISTS trace_payloads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trace_id TEXT NOT NULL REFERENCES message_traces(trace_id),
                stage TEXT NOT NULL,
                payload_type TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                status_code INTEGER,
                payload_size_original INTEGER NOT NULL,
                payload_size_compressed INTEGER NOT NULL,
                compression_ratio REAL NOT NULL,
                contains_media INTEGER NOT NULL DEFAULT 0,
                contains_base64 INTEGER NOT NULL DEFAULT 0,
                payload BLOB NOT NULL,
                UNIQUE (trace_id, stage)
            );

            CREATE INDEX IF NOT EXISTS idx_trace_payloads_trace
                ON trace_payloads(trace_id);
            "#,
        ),
    ]
}

pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS __schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );
        "#,
    )?;

    let mut stmt = conn.prepare("SELECT version FROM __schema_version")?;
    let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
    let mut applied = HashSet::new();
    for row in rows {
        applied.insert(row?);
    }

    for (version, sql) in migrations() {
        if applied.contains(&version) {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.execute(
            "INSERT INTO __schema_version(version, applied_at) VALUES (?1, datetime('now'))",
            [version],
        )?;
        tx.commit()?;
    }

    Ok(())
}
