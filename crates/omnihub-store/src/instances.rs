//! Instance, identity and access-rule storage.

use chrono::Utc;
use omnihub_schema::{AccessRule, ChannelType, InstanceConfig, RuleType, User};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::task;
use uuid::Uuid;

use crate::{is_unique_violation, lock_err, parse_dt, ConfigStore, Result, StoreError};

fn row_to_instance(row: &Row<'_>) -> rusqlite::Result<InstanceConfig> {
    let channel_raw: String = row.get("channel_type")?;
    let channel_type = ChannelType::parse(&channel_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown channel_type: {channel_raw}").into(),
        )
    })?;
    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;
    Ok(InstanceConfig {
        name: row.get("name")?,
        channel_type,
        evolution_url: row.get("evolution_url")?,
        evolution_key: row.get("evolution_key")?,
        whatsapp_instance_id: row.get("whatsapp_instance_id")?,
        discord_bot_token: row.get("discord_bot_token")?,
        discord_guild_id: row.get("discord_guild_id")?,
        agent_api_url: row.get("agent_api_url")?,
        agent_api_key: row.get("agent_api_key")?,
        agent_id: row.get("agent_id")?,
        agent_timeout_ms: row.get::<_, i64>("agent_timeout_ms")? as u64,
        agent_stream_mode: row.get("agent_stream_mode")?,
        is_default: row.get("is_default")?,
        is_active: row.get("is_active")?,
        enable_auto_split: row.get("enable_auto_split")?,
        session_id_prefix: row.get("session_id_prefix")?,
        error_fallback_message: row.get("error_fallback_message")?,
        created_at: parse_dt(&created_raw)?,
        updated_at: parse_dt(&updated_raw)?,
    })
}

fn row_to_rule(row: &Row<'_>) -> rusqlite::Result<AccessRule> {
    let rule_raw: String = row.get("rule_type")?;
    let rule_type = RuleType::parse(&rule_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown rule_type: {rule_raw}").into(),
        )
    })?;
    let created_raw: String = row.get("created_at")?;
    let updated_raw: String = row.get("updated_at")?;
    Ok(AccessRule {
        id: row.get("id")?,
        instance_name: row.get("instance_name")?,
        phone_number: row.get("phone_number")?,
        rule_type,
        created_at: parse_dt(&created_raw)?,
        updated_at: parse_dt(&updated_raw)?,
    })
}

fn row_to_user(row: &Row<'_>) -> rusqlite::Result<User> {
    let id_raw: String = row.get("id")?;
    let id = Uuid::parse_str(&id_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let created_raw: String = row.get("created_at")?;
    Ok(User {
        id,
        display_name: row.get("display_name")?,
        created_at: parse_dt(&created_raw)?,
    })
}

const INSTANCE_COLUMNS: &str = "name, channel_type, evolution_url, evolution_key, \
     whatsapp_instance_id, discord_bot_token, discord_guild_id, agent_api_url, \
     agent_api_key, agent_id, agent_timeout_ms, agent_stream_mode, is_default, \
     is_active, enable_auto_split, session_id_prefix, error_fallback_message, \
     created_at, updated_at";

fn insert_instance_row(conn: &Connection, cfg: &InstanceConfig) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "INSERT INTO instance_configs ({INSTANCE_COLUMNS}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
        ),
        params![
            cfg.name,
            cfg.channel_type.as_str(),
            cfg.evolution_url,
            cfg.evolution_key,
            cfg.whatsapp_instance_id,
            cfg.discord_bot_token,
            cfg.discord_guild_id,
            cfg.agent_api_url,
            cfg.agent_api_key,
            cfg.agent_id,
            cfg.agent_timeout_ms as i64,
            cfg.agent_stream_mode,
            cfg.is_default,
            cfg.is_active,
            cfg.enable_auto_split,
            cfg.session_id_prefix,
            cfg.error_fallback_message,
            cfg.created_at.to_rfc3339(),
            cfg.updated_at.to_rfc3339(),
        ],
    )
}

impl ConfigStore {
    // ───────────────────────── Instances ─────────────────────────

    /// Insert a new instance. `is_default` on the new row clears the flag
    /// on every other row so at most one default exists.
    pub async fn create_instance(&self, cfg: InstanceConfig) -> Result<InstanceConfig> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let tx = conn.unchecked_transaction()?;
            if cfg.is_default {
                tx.execute("UPDATE instance_configs SET is_default = 0", [])?;
            }
            match insert_instance_row(&tx, &cfg) {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => {
                    return Err(StoreError::Conflict(format!(
                        "instance '{}' already exists",
                        cfg.name
                    )));
                }
                Err(e) => return Err(e.into()),
            }
            tx.commit()?;
            Ok(cfg)
        })
        .await?
    }

    pub async fn get_instance(&self, name: &str) -> Result<Option<InstanceConfig>> {
        let db = self.db();
        let name = name.to_owned();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let cfg = conn
                .query_row(
                    &format!("SELECT {INSTANCE_COLUMNS} FROM instance_configs WHERE name = ?1"),
                    params![name],
                    row_to_instance,
                )
                .optional()?;
            Ok(cfg)
        })
        .await?
    }

    pub async fn get_default_instance(&self) -> Result<Option<InstanceConfig>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let cfg = conn
                .query_row(
                    &format!(
                        "SELECT {INSTANCE_COLUMNS} FROM instance_configs \
                         WHERE is_default = 1 LIMIT 1"
                    ),
                    [],
                    row_to_instance,
                )
                .optional()?;
            Ok(cfg)
        })
        .await?
    }

    pub async fn list_instances(&self) -> Result<Vec<InstanceConfig>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {INSTANCE_COLUMNS} FROM instance_configs ORDER BY name"
            ))?;
            let rows = stmt.query_map([], row_to_instance)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    /// Full-row update keyed by `cfg.name`.
    pub async fn update_instance(&self, cfg: InstanceConfig) -> Result<InstanceConfig> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let tx = conn.unchecked_transaction()?;
            if cfg.is_default {
                tx.execute(
                    "UPDATE instance_configs SET is_default = 0 WHERE name != ?1",
                    params![cfg.name],
                )?;
            }
            let updated = tx.execute(
                "UPDATE instance_configs SET channel_type = ?2, evolution_url = ?3, \
                 evolution_key = ?4, whatsapp_instance_id = ?5, discord_bot_token = ?6, \
                 discord_guild_id = ?7, agent_api_url = ?8, agent_api_key = ?9, \
                 agent_id = ?10, agent_timeout_ms = ?11, agent_stream_mode = ?12, \
                 is_default = ?13, is_active = ?14, enable_auto_split = ?15, \
                 session_id_prefix = ?16, error_fallback_message = ?17, updated_at = ?18 \
                 WHERE name = ?1",
                params![
                    cfg.name,
                    cfg.channel_type.as_str(),
                    cfg.evolution_url,
                    cfg.evolution_key,
                    cfg.whatsapp_instance_id,
                    cfg.discord_bot_token,
                    cfg.discord_guild_id,
                    cfg.agent_api_url,
                    cfg.agent_api_key,
                    cfg.agent_id,
                    cfg.agent_timeout_ms as i64,
                    cfg.agent_stream_mode,
                    cfg.is_default,
                    cfg.is_active,
                    cfg.enable_auto_split,
                    cfg.session_id_prefix,
                    cfg.error_fallback_message,
                    Utc::now().to_rfc3339(),
                ],
            )?;
            if updated == 0 {
                return Err(StoreError::NotFound(format!("instance '{}'", cfg.name)));
            }
            tx.commit()?;
            Ok(cfg)
        })
        .await?
    }

    /// Delete an instance. Refused when it is the sole remaining one.
    pub async fn delete_instance(&self, name: &str) -> Result<()> {
        let db = self.db();
        let name = name.to_owned();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let tx = conn.unchecked_transaction()?;
            let total: i64 =
                tx.query_row("SELECT COUNT(*) FROM instance_configs", [], |r| r.get(0))?;
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM instance_configs WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(StoreError::NotFound(format!("instance '{name}'")));
            }
            if total <= 1 {
                return Err(StoreError::LastInstance);
            }
            tx.execute(
                "DELETE FROM instance_configs WHERE name = ?1",
                params![name],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    // ───────────────────────── Users ─────────────────────────────

    pub async fn create_user(&self, display_name: Option<String>) -> Result<User> {
        let db = self.db();
        task::spawn_blocking(move || {
            let user = User {
                id: Uuid::new_v4(),
                display_name,
                created_at: Utc::now(),
            };
            let conn = db.lock().map_err(|_| lock_err())?;
            conn.execute(
                "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
                params![
                    user.id.to_string(),
                    user.display_name,
                    user.created_at.to_rfc3339()
                ],
            )?;
            Ok(user)
        })
        .await?
    }

    pub async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let user = conn
                .query_row(
                    "SELECT id, display_name, created_at FROM users WHERE id = ?1",
                    params![id.to_string()],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
        .await?
    }

    pub async fn get_user_by_external(
        &self,
        provider: &str,
        external_id: &str,
    ) -> Result<Option<User>> {
        let db = self.db();
        let provider = provider.to_owned();
        let external_id = external_id.to_owned();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let user = conn
                .query_row(
                    "SELECT u.id, u.display_name, u.created_at FROM users u \
                     JOIN user_external_ids x ON x.user_id = u.id \
                     WHERE x.provider = ?1 AND x.external_id = ?2",
                    params![provider, external_id],
                    row_to_user,
                )
                .optional()?;
            Ok(user)
        })
        .await?
    }

    /// Pre-link a channel-native id to an existing user (admin operation,
    /// used to stitch identities across channels ahead of first contact).
    pub async fn link_external_id(
        &self,
        provider: &str,
        external_id: &str,
        user_id: Uuid,
        extra: Option<serde_json::Value>,
    ) -> Result<()> {
        let db = self.db();
        let provider = provider.to_owned();
        let external_id = external_id.to_owned();
        task::spawn_blocking(move || {
            let extra = extra.map(|v| v.to_string());
            let conn = db.lock().map_err(|_| lock_err())?;
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM users WHERE id = ?1",
                params![user_id.to_string()],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(StoreError::NotFound(format!("user '{user_id}'")));
            }
            match conn.execute(
                "INSERT INTO user_external_ids (provider, external_id, user_id, extra, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    provider,
                    external_id,
                    user_id.to_string(),
                    extra,
                    Utc::now().to_rfc3339()
                ],
            ) {
                Ok(_) => Ok(()),
                Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                    "external id ({provider}, {external_id}) is already linked"
                ))),
                Err(e) => Err(e.into()),
            }
        })
        .await?
    }

    /// Resolve a `(provider, external_id)` pair to its user, creating the
    /// user and the link on first contact. Insert-or-lookup on the unique
    /// constraint keeps a concurrent first contact from minting two users.
    pub async fn resolve_or_create_user(
        &self,
        provider: &str,
        external_id: &str,
        display_hint: Option<String>,
        extra: Option<serde_json::Value>,
    ) -> Result<(User, bool)> {
        let db = self.db();
        let provider = provider.to_owned();
        let external_id = external_id.to_owned();
        task::spawn_blocking(move || {
            let extra = extra.map(|v| v.to_string());
            let conn = db.lock().map_err(|_| lock_err())?;
            let tx = conn.unchecked_transaction()?;

            if let Some(user) = lookup_linked_user(&tx, &provider, &external_id)? {
                tx.commit()?;
                return Ok((user, false));
            }

            let user = User {
                id: Uuid::new_v4(),
                display_name: display_hint,
                created_at: Utc::now(),
            };
            tx.execute(
                "INSERT INTO users (id, display_name, created_at) VALUES (?1, ?2, ?3)",
                params![
                    user.id.to_string(),
                    user.display_name,
                    user.created_at.to_rfc3339()
                ],
            )?;
            let inserted = tx.execute(
                "INSERT INTO user_external_ids (provider, external_id, user_id, extra, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT (provider, external_id) DO NOTHING",
                params![
                    provider,
                    external_id,
                    user.id.to_string(),
                    extra,
                    Utc::now().to_rfc3339()
                ],
            )?;
            if inserted == 0 {
                // Another writer won the race: drop the speculative user and
                // return the link's owner.
                tracing::debug!(provider, external_id, "lost first-contact race, reusing link");
                tx.execute("DELETE FROM users WHERE id = ?1", params![user.id.to_string()])?;
                let existing = lookup_linked_user(&tx, &provider, &external_id)?
                    .ok_or_else(|| {
                        StoreError::Persistence("external id link vanished mid-resolve".into())
                    })?;
                tx.commit()?;
                return Ok((existing, false));
            }
            tx.commit()?;
            Ok((user, true))
        })
        .await?
    }

    // ───────────────────────── Access rules ──────────────────────

    pub async fn add_access_rule(
        &self,
        instance_name: Option<String>,
        phone_number: String,
        rule_type: RuleType,
    ) -> Result<AccessRule> {
        let db = self.db();
        task::spawn_blocking(move || {
            let now = Utc::now();
            let conn = db.lock().map_err(|_| lock_err())?;
            conn.execute(
                "INSERT INTO access_rules (instance_name, phone_number, rule_type, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    instance_name,
                    phone_number,
                    rule_type.as_str(),
                    now.to_rfc3339(),
                    now.to_rfc3339()
                ],
            )?;
            let id = conn.last_insert_rowid();
            Ok(AccessRule {
                id,
                instance_name,
                phone_number,
                rule_type,
                created_at: now,
                updated_at: now,
            })
        })
        .await?
    }

    /// List rules, optionally narrowed to one instance's scoped rules.
    pub async fn list_access_rules(
        &self,
        instance_name: Option<&str>,
    ) -> Result<Vec<AccessRule>> {
        let db = self.db();
        let instance_name = instance_name.map(str::to_owned);
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let mut out = Vec::new();
            match instance_name {
                Some(name) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, instance_name, phone_number, rule_type, created_at, updated_at \
                         FROM access_rules WHERE instance_name = ?1 ORDER BY id",
                    )?;
                    let rows = stmt.query_map(params![name], row_to_rule)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, instance_name, phone_number, rule_type, created_at, updated_at \
                         FROM access_rules ORDER BY id",
                    )?;
                    let rows = stmt.query_map([], row_to_rule)?;
                    for row in rows {
                        out.push(row?);
                    }
                }
            }
            Ok(out)
        })
        .await?
    }

    /// Rules applicable to an instance: its scoped rules plus globals.
    pub async fn rules_for_instance(&self, instance_name: &str) -> Result<Vec<AccessRule>> {
        let db = self.db();
        let instance_name = instance_name.to_owned();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let mut stmt = conn.prepare(
                "SELECT id, instance_name, phone_number, rule_type, created_at, updated_at \
                 FROM access_rules \
                 WHERE instance_name IS NULL OR instance_name = ?1 \
                 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![instance_name], row_to_rule)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn delete_access_rule(&self, id: i64) -> Result<()> {
        let db = self.db();
        task::spawn_blocking(move || {
            let conn = db.lock().map_err(|_| lock_err())?;
            let deleted = conn.execute("DELETE FROM access_rules WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(StoreError::NotFound(format!("access rule {id}")));
            }
            Ok(())
        })
        .await?
    }
}

fn lookup_linked_user(
    conn: &Connection,
    provider: &str,
    external_id: &str,
) -> Result<Option<User>> {
    let user = conn
        .query_row(
            "SELECT u.id, u.display_name, u.created_at FROM users u \
             JOIN user_external_ids x ON x.user_id = u.id \
             WHERE x.provider = ?1 AND x.external_id = ?2",
            params![provider, external_id],
            row_to_user,
        )
        .optional()?;
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use omnihub_schema::ChannelType;

    fn instance(name: &str) -> InstanceConfig {
        InstanceConfig {
            name: name.into(),
            channel_type: ChannelType::WhatsApp,
            evolution_url: Some("http://gateway:8080".into()),
            evolution_key: Some("evo-key".into()),
            whatsapp_instance_id: Some(name.into()),
            discord_bot_token: None,
            discord_guild_id: None,
            agent_api_url: "http://agent:8000".into(),
            agent_api_key: None,
            agent_id: "default".into(),
            agent_timeout_ms: 60_000,
            agent_stream_mode: false,
            is_default: false,
            is_active: true,
            enable_auto_split: true,
            session_id_prefix: None,
            error_fallback_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_and_get_instance() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.create_instance(instance("prod-wa")).await.unwrap();
        let got = store.get_instance("prod-wa").await.unwrap().unwrap();
        assert_eq!(got.name, "prod-wa");
        assert_eq!(got.channel_type, ChannelType::WhatsApp);
        assert_eq!(got.agent_timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn duplicate_instance_name_conflicts() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.create_instance(instance("prod-wa")).await.unwrap();
        let err = store.create_instance(instance("prod-wa")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn at_most_one_default_instance() {
        let store = ConfigStore::open_in_memory().unwrap();
        let mut a = instance("a");
        a.is_default = true;
        store.create_instance(a).await.unwrap();
        let mut b = instance("b");
        b.is_default = true;
        store.create_instance(b).await.unwrap();

        let defaults: Vec<_> = store
            .list_instances()
            .await
            .unwrap()
            .into_iter()
            .filter(|i| i.is_default)
            .collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].name, "b");
        assert_eq!(
            store.get_default_instance().await.unwrap().unwrap().name,
            "b"
        );
    }

    #[tokio::test]
    async fn delete_last_instance_refused() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.create_instance(instance("only")).await.unwrap();
        let err = store.delete_instance("only").await.unwrap_err();
        assert!(matches!(err, StoreError::LastInstance));

        store.create_instance(instance("second")).await.unwrap();
        store.delete_instance("only").await.unwrap();
        assert!(store.get_instance("only").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_missing_instance_not_found() {
        let store = ConfigStore::open_in_memory().unwrap();
        store.create_instance(instance("a")).await.unwrap();
        let err = store.delete_instance("ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn update_missing_instance_not_found() {
        let store = ConfigStore::open_in_memory().unwrap();
        let err = store.update_instance(instance("ghost")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn resolve_or_create_is_stable() {
        let store = ConfigStore::open_in_memory().unwrap();
        let (user, created) = store
            .resolve_or_create_user("whatsapp", "+5511990000101", Some("Alice".into()), None)
            .await
            .unwrap();
        assert!(created);
        assert_eq!(user.display_name.as_deref(), Some("Alice"));

        let (again, created) = store
            .resolve_or_create_user("whatsapp", "+5511990000101", Some("Other".into()), None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, user.id);
    }

    #[tokio::test]
    async fn prelinked_external_id_resolves_same_user() {
        let store = ConfigStore::open_in_memory().unwrap();
        let (user, _) = store
            .resolve_or_create_user("discord", "U123", None, None)
            .await
            .unwrap();
        store
            .link_external_id("whatsapp", "+5511990000101", user.id, None)
            .await
            .unwrap();

        let (wa_user, created) = store
            .resolve_or_create_user("whatsapp", "+5511990000101", None, None)
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(wa_user.id, user.id);
    }

    #[tokio::test]
    async fn double_link_conflicts() {
        let store = ConfigStore::open_in_memory().unwrap();
        let u1 = store.create_user(None).await.unwrap();
        let u2 = store.create_user(None).await.unwrap();
        store
            .link_external_id("discord", "U1", u1.id, None)
            .await
            .unwrap();
        let err = store
            .link_external_id("discord", "U1", u2.id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn rules_for_instance_includes_globals() {
        let store = ConfigStore::open_in_memory().unwrap();
        store
            .add_access_rule(None, "+5511*".into(), RuleType::Block)
            .await
            .unwrap();
        store
            .add_access_rule(Some("prod-wa".into()), "+5511990000101".into(), RuleType::Allow)
            .await
            .unwrap();
        store
            .add_access_rule(Some("other".into()), "+1*".into(), RuleType::Block)
            .await
            .unwrap();

        let rules = store.rules_for_instance("prod-wa").await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().any(|r| r.instance_name.is_none()));
        assert!(rules
            .iter()
            .any(|r| r.instance_name.as_deref() == Some("prod-wa")));
    }

    #[tokio::test]
    async fn delete_access_rule_by_id() {
        let store = ConfigStore::open_in_memory().unwrap();
        let rule = store
            .add_access_rule(None, "+1*".into(), RuleType::Block)
            .await
            .unwrap();
        store.delete_access_rule(rule.id).await.unwrap();
        let err = store.delete_access_rule(rule.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
