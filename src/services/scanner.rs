//! Operator-triggered scan and repair of setting values with the wrong shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::cache::SettingsCache;
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::SettingRecord;
use crate::setting_kinds::{
    Flag, MonthDay, RoleList, SettingValue, Snowflake, APPEAL_CHANNEL, MOD_LOG_CHANNEL,
    PROTECTED_ROLES, SERVER_BIRTHDAY, VERIFICATION_ENABLED, VERIFIED_ROLE, VERIFY_CHANNEL,
};

/// Shortest all-digit run treated as a platform identifier.
pub const IDENTIFIER_MIN_DIGITS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeRule {
    Date,
    Snowflake,
    SnowflakeList,
    Flag,
    Json,
}

impl ShapeRule {
    /// Returns the reason the value does not fit, if it does not.
    pub fn check(self, value: &str) -> Option<String> {
        match self {
            ShapeRule::Date => {
                let trimmed = value.trim();
                if trimmed.len() >= IDENTIFIER_MIN_DIGITS
                    && trimmed.chars().all(|c| c.is_ascii_digit())
                {
                    return Some(format!(
                        "identifier-shaped value ({} digits) in a date setting",
                        trimmed.len()
                    ));
                }
                MonthDay::decode(value).err()
            }
            ShapeRule::Snowflake => Snowflake::decode(value).err(),
            ShapeRule::SnowflakeList => RoleList::decode(value).err(),
            ShapeRule::Flag => Flag::decode(value).err(),
            ShapeRule::Json => serde_json::from_str::<serde_json::Value>(value)
                .err()
                .map(|e| format!("invalid JSON: {}", e)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

#[derive(Debug, Deserialize)]
struct RuleEntry {
    key: String,
    kind: ShapeRule,
}

/// Per-key shape rules. Keys without a rule are never flagged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShapeRules {
    rules: BTreeMap<String, ShapeRule>,
}

impl ShapeRules {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rules for every typed key the bot knows about.
    pub fn builtin() -> Self {
        Self::empty()
            .with_rule(PROTECTED_ROLES.name, ShapeRule::SnowflakeList)
            .with_rule(VERIFY_CHANNEL.name, ShapeRule::Snowflake)
            .with_rule(VERIFIED_ROLE.name, ShapeRule::Snowflake)
            .with_rule(APPEAL_CHANNEL.name, ShapeRule::Snowflake)
            .with_rule(MOD_LOG_CHANNEL.name, ShapeRule::Snowflake)
            .with_rule(VERIFICATION_ENABLED.name, ShapeRule::Flag)
            .with_rule(SERVER_BIRTHDAY.name, ShapeRule::Date)
    }

    pub fn with_rule(mut self, key: impl Into<String>, rule: ShapeRule) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    /// Entries in the file override the built-in rule for the same key.
    pub fn from_toml_str(content: &str) -> StoreResult<Self> {
        let file: RulesFile = toml::from_str(content)
            .map_err(|e| StoreError::InvalidInput(format!("invalid shape rules: {}", e)))?;
        let mut rules = Self::builtin();
        for entry in file.rules {
            if entry.key.trim().is_empty() {
                return Err(StoreError::InvalidInput("shape rule with empty key".into()));
            }
            rules = rules.with_rule(entry.key, entry.kind);
        }
        Ok(rules)
    }

    /// Falls back to the built-in rules when the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("Scanner: {} not found, using built-in rules", path.display());
                Ok(Self::builtin())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn rule_for(&self, key: &str) -> Option<ShapeRule> {
        self.rules.get(key).copied()
    }

    pub fn keys(&self) -> Vec<String> {
        self.rules.keys().cloned().collect()
    }

    pub fn check(&self, record: &SettingRecord) -> Option<String> {
        self.rule_for(&record.key)?.check(&record.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub record: SettingRecord,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub removed: usize,
    /// Rows whose value changed after the scan, or that were already gone.
    pub skipped: usize,
    pub affected: Vec<(u64, String)>,
}

#[derive(Clone)]
pub struct CorruptionScanner {
    db: Database,
    cache: SettingsCache,
}

impl CorruptionScanner {
    pub fn new(db: Database, cache: SettingsCache) -> Self {
        Self { db, cache }
    }

    pub async fn scan(&self, rules: &ShapeRules) -> StoreResult<Vec<Finding>> {
        let rules = rules.clone();
        self.scan_with(rules.keys(), move |record| rules.check(record))
            .await
    }

    /// Read-only pass over the rows for `keys`; `predicate` returns a reason for each offender.
    pub async fn scan_with<P>(&self, keys: Vec<String>, predicate: P) -> StoreResult<Vec<Finding>>
    where
        P: Fn(&SettingRecord) -> Option<String> + Send + 'static,
    {
        let records = self
            .db
            .run_blocking(move |db| db.settings_with_keys(&keys))
            .await?;
        let scanned = records.len();

        let findings: Vec<Finding> = records
            .into_iter()
            .filter_map(|record| {
                predicate(&record).map(|reason| Finding { record, reason })
            })
            .collect();

        info!(
            "Scanner: {} of {} rows failed their shape rule",
            findings.len(),
            scanned
        );
        Ok(findings)
    }

    /// Deletes exactly the flagged rows, and only while they still hold the flagged value.
    pub async fn repair(&self, findings: &[Finding]) -> StoreResult<RepairReport> {
        let records: Vec<SettingRecord> = findings.iter().map(|f| f.record.clone()).collect();
        let outcomes = self
            .db
            .run_blocking(move |db| {
                let mut outcomes = Vec::with_capacity(records.len());
                for record in records {
                    let removed = db.delete_setting_exact(&record)? > 0;
                    outcomes.push((record, removed));
                }
                Ok(outcomes)
            })
            .await?;

        let mut report = RepairReport::default();
        for (record, removed) in outcomes {
            if removed {
                self.cache.invalidate(record.guild_id, &record.key)?;
                warn!(
                    "Scanner: removed corrupt setting {} for guild {} (value {:?})",
                    record.key, record.guild_id, record.value
                );
                report.removed += 1;
                report.affected.push((record.guild_id, record.key));
            } else {
                report.skipped += 1;
            }
        }
        Ok(report)
    }
}
