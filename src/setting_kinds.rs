//! Typed views over the string values kept in the settings table.
//!
//! The store never looks inside a value. Callers that want structure go
//! through a [`SettingKey`] whose value type knows its own encoding.

use chrono::NaiveDate;
use serde::Deserialize;
use std::fmt;
use std::marker::PhantomData;

pub trait SettingValue: Sized {
    fn encode(&self) -> String;
    /// Returns a human-readable reason when `raw` does not have this shape.
    fn decode(raw: &str) -> Result<Self, String>;
}

pub struct SettingKey<T> {
    pub name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SettingKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for SettingKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for SettingKey<T> {}

impl<T> fmt::Debug for SettingKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SettingKey").field(&self.name).finish()
    }
}

pub const PROTECTED_ROLES: SettingKey<RoleList> = SettingKey::new("protected_roles");
pub const VERIFY_CHANNEL: SettingKey<Snowflake> = SettingKey::new("verify_channel");
pub const VERIFIED_ROLE: SettingKey<Snowflake> = SettingKey::new("verified_role");
pub const APPEAL_CHANNEL: SettingKey<Snowflake> = SettingKey::new("appeal_channel");
pub const MOD_LOG_CHANNEL: SettingKey<Snowflake> = SettingKey::new("mod_log_channel");
pub const VERIFICATION_ENABLED: SettingKey<Flag> = SettingKey::new("verification_enabled");
pub const SERVER_BIRTHDAY: SettingKey<MonthDay> = SettingKey::new("server_birthday");

/// Platform identifiers are sometimes serialized as JSON strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum IdRepr {
    Num(u64),
    Str(String),
}

fn parse_id(raw: &str) -> Result<u64, String> {
    let id: u64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a numeric identifier", raw))?;
    if id == 0 {
        return Err("identifier must be non-zero".to_string());
    }
    Ok(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snowflake(pub u64);

impl SettingValue for Snowflake {
    fn encode(&self) -> String {
        self.0.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let unquoted = trimmed
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .unwrap_or(trimmed);
        parse_id(unquoted).map(Snowflake)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleList(pub Vec<u64>);

impl RoleList {
    pub fn contains(&self, role_id: u64) -> bool {
        self.0.contains(&role_id)
    }
}

impl SettingValue for RoleList {
    fn encode(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".to_string())
    }

    fn decode(raw: &str) -> Result<Self, String> {
        let items: Vec<IdRepr> = serde_json::from_str(raw)
            .map_err(|e| format!("not a JSON list of identifiers: {}", e))?;
        items
            .into_iter()
            .map(|item| match item {
                IdRepr::Num(0) => Err("identifier must be non-zero".to_string()),
                IdRepr::Num(id) => Ok(id),
                IdRepr::Str(s) => parse_id(&s),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(RoleList)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flag(pub bool);

impl SettingValue for Flag {
    fn encode(&self) -> String {
        self.0.to_string()
    }

    fn decode(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(Flag(true)),
            "false" | "0" | "no" | "off" => Ok(Flag(false)),
            other => Err(format!("'{}' is not a boolean", other)),
        }
    }
}

/// A yearly date without a year, stored as `MM-DD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn new(month: u32, day: u32) -> Option<Self> {
        // 2000 is a leap year, so 02-29 is accepted.
        NaiveDate::from_ymd_opt(2000, month, day).map(|_| MonthDay { month, day })
    }
}

impl SettingValue for MonthDay {
    fn encode(&self) -> String {
        format!("{:02}-{:02}", self.month, self.day)
    }

    fn decode(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        let parts: Vec<&str> = trimmed.split('-').collect();
        let (month, day) = match parts.as_slice() {
            [m, d] => (*m, *d),
            [y, m, d] if y.len() == 4 => (*m, *d),
            _ => return Err(format!("'{}' is not a MM-DD or YYYY-MM-DD date", trimmed)),
        };
        let month: u32 = month
            .parse()
            .map_err(|_| format!("'{}' has a non-numeric month", trimmed))?;
        let day: u32 = day
            .parse()
            .map_err(|_| format!("'{}' has a non-numeric day", trimmed))?;
        MonthDay::new(month, day).ok_or_else(|| format!("'{}' is not a calendar date", trimmed))
    }
}
