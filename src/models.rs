//! Row and event types shared by the database layer and the services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

pub const MAX_ACTION_LEN: usize = 64;

/// One row of the `settings` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingRecord {
    pub id: i64,
    pub guild_id: u64,
    pub key: String,
    pub value: String,
    pub created_at: Option<String>,
    pub updated_at: String,
}

/// Fixed set of audit categories. Action codes inside a category are open text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditCategory {
    Moderation,
    Appeal,
    Verification,
    Config,
}

impl AuditCategory {
    pub const ALL: [AuditCategory; 4] = [
        AuditCategory::Moderation,
        AuditCategory::Appeal,
        AuditCategory::Verification,
        AuditCategory::Config,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditCategory::Moderation => "MODERATION",
            AuditCategory::Appeal => "APPEAL",
            AuditCategory::Verification => "VERIFICATION",
            AuditCategory::Config => "CONFIG",
        }
    }

    /// Embed colour used by dashboards.
    pub fn color(self) -> u32 {
        match self {
            AuditCategory::Moderation => 0xED4245,
            AuditCategory::Appeal => 0xFEE75C,
            AuditCategory::Verification => 0x57F287,
            AuditCategory::Config => 0x5865F2,
        }
    }
}

impl fmt::Display for AuditCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditCategory {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        AuditCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == upper)
            .ok_or_else(|| StoreError::InvalidInput(format!("unknown audit category '{}'", s)))
    }
}

/// An audit event that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAuditEvent {
    pub category: AuditCategory,
    pub action: String,
    pub actor_id: Option<u64>,
    pub target_id: Option<u64>,
    pub channel_id: Option<u64>,
    pub details: Option<String>,
    pub guild_id: Option<u64>,
}

impl NewAuditEvent {
    pub fn new(category: AuditCategory, action: impl Into<String>) -> Self {
        Self {
            category,
            action: action.into(),
            actor_id: None,
            target_id: None,
            channel_id: None,
            details: None,
            guild_id: None,
        }
    }

    pub fn actor(mut self, actor_id: u64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn target(mut self, target_id: u64) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn channel(mut self, channel_id: u64) -> Self {
        self.channel_id = Some(channel_id);
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn guild(mut self, guild_id: u64) -> Self {
        self.guild_id = Some(guild_id);
        self
    }

    /// Trims the action code and rejects empty or oversized codes.
    pub fn validate(mut self) -> Result<Self, StoreError> {
        let action = self.action.trim();
        if action.is_empty() {
            return Err(StoreError::InvalidInput("audit action must not be empty".into()));
        }
        if action.chars().count() > MAX_ACTION_LEN {
            return Err(StoreError::InvalidInput(format!(
                "audit action longer than {} characters",
                MAX_ACTION_LEN
            )));
        }
        self.action = action.to_string();
        Ok(self)
    }
}

/// A stored audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub id: i64,
    pub category: AuditCategory,
    pub action: String,
    pub actor_id: Option<u64>,
    pub target_id: Option<u64>,
    pub channel_id: Option<u64>,
    pub details: Option<String>,
    pub guild_id: Option<u64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditFilter {
    pub category: Option<AuditCategory>,
    pub actor_id: Option<u64>,
    pub target_id: Option<u64>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn with_category(mut self, category: AuditCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_actor(mut self, actor_id: u64) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    pub fn with_target(mut self, target_id: u64) -> Self {
        self.target_id = Some(target_id);
        self
    }

    pub fn with_since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }
}
