use dotenvy::dotenv;
use std::env;

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub db_busy_timeout_secs: u64,
    /// 0 keeps every entry until it is invalidated.
    pub settings_cache_capacity: usize,
    pub audit_query_max_limit: usize,
    pub shape_rules_path: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    fn build() -> anyhow::Result<Self> {
        Ok(Config {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "data/guildkeep.db".to_string()),
            db_busy_timeout_secs: env::var("DB_BUSY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            settings_cache_capacity: env::var("SETTINGS_CACHE_CAPACITY")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            audit_query_max_limit: env::var("AUDIT_QUERY_MAX_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .ok()
                .filter(|limit: &usize| *limit > 0)
                .unwrap_or(100),
            shape_rules_path: env::var("SHAPE_RULES_PATH")
                .unwrap_or_else(|_| "shape_rules.toml".to_string()),
        })
    }

    /// In-memory database with default limits, for tests and dry runs.
    pub fn in_memory() -> Self {
        Config {
            database_url: ":memory:".to_string(),
            db_busy_timeout_secs: 5,
            settings_cache_capacity: 0,
            audit_query_max_limit: 100,
            shape_rules_path: "shape_rules.toml".to_string(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field("db_busy_timeout_secs", &self.db_busy_timeout_secs)
            .field("settings_cache_capacity", &self.settings_cache_capacity)
            .field("audit_query_max_limit", &self.audit_query_max_limit)
            .field("shape_rules_path", &self.shape_rules_path)
            .finish()
    }
}
