//! The narrow interface the command and event layers call into.

use serde_json::{Map, Value};
use tracing::info;

use crate::cache::SettingsCache;
use crate::config::Config;
use crate::db::Database;
use crate::error::StoreResult;
use crate::models::{AuditCategory, AuditEvent, AuditFilter, NewAuditEvent};
use crate::services::audit::AuditLog;
use crate::services::scanner::{CorruptionScanner, Finding, RepairReport, ShapeRules};
use crate::services::settings::SettingsService;
use crate::setting_kinds::{SettingKey, SettingValue};

/// Longest value excerpt copied into an audit entry.
const AUDIT_VALUE_EXCERPT: usize = 200;

#[derive(Clone)]
pub struct GuildStore {
    settings: SettingsService,
    audit: AuditLog,
    scanner: CorruptionScanner,
}

impl GuildStore {
    /// Opens the database and brings the schema up to date. Nothing else is
    /// reachable until this returns, and a failed migration is returned as-is.
    pub async fn bootstrap(config: &Config) -> StoreResult<Self> {
        let db = Database::new(config)?;
        Self::with_database(db, config).await
    }

    pub async fn with_database(db: Database, config: &Config) -> StoreResult<Self> {
        let applied = db.run_blocking(|db| db.ensure_schema()).await?;
        if !applied.is_empty() {
            info!("Store: applied migrations {:?}", applied);
        }

        let cache = SettingsCache::new(config.settings_cache_capacity);
        Ok(Self {
            settings: SettingsService::new(db.clone(), cache.clone()),
            audit: AuditLog::new(db.clone(), config.audit_query_max_limit),
            scanner: CorruptionScanner::new(db, cache),
        })
    }

    pub fn settings(&self) -> &SettingsService {
        &self.settings
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // --- Settings ---

    pub async fn get_setting(&self, guild_id: u64, key: &str) -> StoreResult<Option<String>> {
        self.settings.get(guild_id, key).await
    }

    /// Writes the setting, then appends a CONFIG audit entry. The audit append
    /// is best-effort: if it fails the write still stands.
    pub async fn set_setting(
        &self,
        guild_id: u64,
        key: &str,
        value: &str,
        actor_id: Option<u64>,
    ) -> StoreResult<()> {
        self.settings.set(guild_id, key, value).await?;

        let mut event = NewAuditEvent::new(AuditCategory::Config, "setting_updated")
            .guild(guild_id)
            .details(format!("{} = {}", key, excerpt(value)));
        if let Some(actor_id) = actor_id {
            event = event.actor(actor_id);
        }
        self.audit.record(event).await;
        Ok(())
    }

    pub async fn delete_setting(
        &self,
        guild_id: u64,
        key: &str,
        actor_id: Option<u64>,
    ) -> StoreResult<bool> {
        let removed = self.settings.delete(guild_id, key).await?;
        if removed {
            let mut event = NewAuditEvent::new(AuditCategory::Config, "setting_removed")
                .guild(guild_id)
                .details(key.to_string());
            if let Some(actor_id) = actor_id {
                event = event.actor(actor_id);
            }
            self.audit.record(event).await;
        }
        Ok(removed)
    }

    pub async fn list_settings(&self, guild_id: u64) -> StoreResult<Vec<(String, String)>> {
        self.settings.list_for_guild(guild_id).await
    }

    pub async fn get_typed<T: SettingValue>(
        &self,
        guild_id: u64,
        key: &SettingKey<T>,
    ) -> StoreResult<Option<T>> {
        self.settings.get_typed(guild_id, key).await
    }

    pub async fn get_typed_or<T: SettingValue>(
        &self,
        guild_id: u64,
        key: &SettingKey<T>,
        default: T,
    ) -> T {
        self.settings.get_typed_or(guild_id, key, default).await
    }

    pub async fn set_typed<T: SettingValue>(
        &self,
        guild_id: u64,
        key: &SettingKey<T>,
        value: &T,
        actor_id: Option<u64>,
    ) -> StoreResult<()> {
        self.set_setting(guild_id, key.name, &value.encode(), actor_id)
            .await
    }

    pub async fn is_protected_role(&self, guild_id: u64, role_id: u64) -> bool {
        self.settings.is_protected_role(guild_id, role_id).await
    }

    /// Every setting of a guild as a JSON object. JSON-looking values are
    /// embedded as JSON, everything else as a string.
    pub async fn export_guild(&self, guild_id: u64) -> StoreResult<Value> {
        let settings = self.settings.list_for_guild(guild_id).await?;
        let mut object = Map::new();
        for (key, raw) in settings {
            let value = match serde_json::from_str::<Value>(&raw) {
                Ok(v @ (Value::Array(_) | Value::Object(_))) => v,
                _ => Value::String(raw),
            };
            object.insert(key, value);
        }
        Ok(serde_json::json!({
            "guild_id": guild_id.to_string(),
            "settings": Value::Object(object),
        }))
    }

    // --- Audit Log ---

    pub async fn log_event(&self, event: NewAuditEvent) {
        self.audit.record(event).await
    }

    pub async fn query_audit_log(
        &self,
        guild_id: u64,
        filter: AuditFilter,
        limit: usize,
    ) -> StoreResult<Vec<AuditEvent>> {
        self.audit.query(guild_id, filter, limit).await
    }

    // --- Maintenance ---

    pub async fn scan(&self, rules: &ShapeRules) -> StoreResult<Vec<Finding>> {
        self.scanner.scan(rules).await
    }

    /// Repairs the findings and records one CONFIG entry per removed row.
    pub async fn repair(&self, findings: &[Finding]) -> StoreResult<RepairReport> {
        let report = self.scanner.repair(findings).await?;
        for finding in findings {
            let record = &finding.record;
            if !report
                .affected
                .iter()
                .any(|(g, k)| *g == record.guild_id && *k == record.key)
            {
                continue;
            }
            self.audit
                .record(
                    NewAuditEvent::new(AuditCategory::Config, "corrupt_setting_removed")
                        .guild(record.guild_id)
                        .details(format!(
                            "{} = {} ({})",
                            record.key,
                            excerpt(&record.value),
                            finding.reason
                        )),
                )
                .await;
        }
        Ok(report)
    }
}

fn excerpt(value: &str) -> String {
    if value.chars().count() <= AUDIT_VALUE_EXCERPT {
        return value.to_string();
    }
    let mut out: String = value.chars().take(AUDIT_VALUE_EXCERPT).collect();
    out.push_str("...");
    out
}
