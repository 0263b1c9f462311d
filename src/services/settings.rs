use async_trait::async_trait;
use tracing::{debug, warn};

use crate::cache::{SettingsCache, SettingsSource};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::setting_kinds::{RoleList, SettingKey, SettingValue, PROTECTED_ROLES};

pub const MAX_KEY_LEN: usize = 100;

#[async_trait]
impl SettingsSource for Database {
    async fn fetch(&self, guild_id: u64, key: &str) -> StoreResult<Option<String>> {
        let key = key.to_string();
        self.run_blocking(move |db| db.get_setting(guild_id, &key))
            .await
    }
}

/// Guild settings with a read-through cache in front of the store.
///
/// Every write invalidates its cache entry before returning, so a `get` issued
/// after a `set` in this process always sees the new value.
#[derive(Clone)]
pub struct SettingsService {
    db: Database,
    cache: SettingsCache,
}

impl SettingsService {
    pub fn new(db: Database, cache: SettingsCache) -> Self {
        Self { db, cache }
    }

    pub fn cache(&self) -> &SettingsCache {
        &self.cache
    }

    pub async fn get(&self, guild_id: u64, key: &str) -> StoreResult<Option<String>> {
        self.cache.get(&self.db, guild_id, key).await
    }

    /// Reads the store directly, bypassing and not populating the cache.
    pub async fn get_uncached(&self, guild_id: u64, key: &str) -> StoreResult<Option<String>> {
        self.db.fetch(guild_id, key).await
    }

    pub async fn set(&self, guild_id: u64, key: &str, value: &str) -> StoreResult<()> {
        validate_key(key)?;
        let key_owned = key.to_string();
        let value = value.to_string();
        let result = self
            .db
            .run_blocking(move |db| db.upsert_setting(guild_id, &key_owned, &value))
            .await;
        // Invalidate even on error: the write may have landed before the failure surfaced.
        self.cache.invalidate(guild_id, key)?;
        result?;
        debug!("Settings: set {} for guild {}", key, guild_id);
        Ok(())
    }

    /// Returns whether a row was removed. Deleting an absent key is not an error.
    pub async fn delete(&self, guild_id: u64, key: &str) -> StoreResult<bool> {
        let key_owned = key.to_string();
        let result = self
            .db
            .run_blocking(move |db| db.delete_setting(guild_id, &key_owned))
            .await;
        self.cache.invalidate(guild_id, key)?;
        let removed = result? > 0;
        debug!(
            "Settings: delete {} for guild {} (removed={})",
            key, guild_id, removed
        );
        Ok(removed)
    }

    pub async fn list_for_guild(&self, guild_id: u64) -> StoreResult<Vec<(String, String)>> {
        self.db
            .run_blocking(move |db| db.list_settings(guild_id))
            .await
    }

    pub async fn get_typed<T: SettingValue>(
        &self,
        guild_id: u64,
        key: &SettingKey<T>,
    ) -> StoreResult<Option<T>> {
        let Some(raw) = self.get(guild_id, key.name).await? else {
            return Ok(None);
        };
        T::decode(&raw)
            .map(Some)
            .map_err(|reason| StoreError::CorruptValue {
                guild_id,
                key: key.name.to_string(),
                reason,
            })
    }

    /// Like `get_typed`, but any failure is logged and replaced by `default`.
    pub async fn get_typed_or<T: SettingValue>(
        &self,
        guild_id: u64,
        key: &SettingKey<T>,
        default: T,
    ) -> T {
        match self.get_typed(guild_id, key).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(e) => {
                warn!("Settings: falling back to default for {}: {}", key.name, e);
                default
            }
        }
    }

    pub async fn set_typed<T: SettingValue>(
        &self,
        guild_id: u64,
        key: &SettingKey<T>,
        value: &T,
    ) -> StoreResult<()> {
        self.set(guild_id, key.name, &value.encode()).await
    }

    pub async fn is_protected_role(&self, guild_id: u64, role_id: u64) -> bool {
        self.get_typed_or(guild_id, &PROTECTED_ROLES, RoleList::default())
            .await
            .contains(role_id)
    }
}

fn validate_key(key: &str) -> StoreResult<()> {
    if key.trim().is_empty() {
        return Err(StoreError::InvalidInput("setting key must not be empty".into()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidInput(format!(
            "setting key longer than {} bytes",
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setting_kinds::{Flag, Snowflake, VERIFICATION_ENABLED, VERIFY_CHANNEL};

    fn service() -> SettingsService {
        let db = Database::open_in_memory().unwrap();
        db.ensure_schema().unwrap();
        SettingsService::new(db, SettingsCache::new(0))
    }

    #[tokio::test]
    async fn test_protected_roles_scenario() {
        let settings = service();

        settings.set(100, "protected_roles", "[111,222]").await.unwrap();
        assert_eq!(
            settings.get(100, "protected_roles").await.unwrap().as_deref(),
            Some("[111,222]")
        );

        settings.set(100, "protected_roles", "[111]").await.unwrap();
        assert_eq!(
            settings.get(100, "protected_roles").await.unwrap().as_deref(),
            Some("[111]")
        );
        assert_eq!(settings.db.setting_row_count(100, "protected_roles").unwrap(), 1);

        assert!(settings.is_protected_role(100, 111).await);
        assert!(!settings.is_protected_role(100, 222).await);
    }

    #[tokio::test]
    async fn test_write_is_visible_after_cached_read() {
        let settings = service();
        settings.set(1, "welcome", "hello").await.unwrap();

        // Populate the cache with the first value.
        assert_eq!(settings.get(1, "welcome").await.unwrap().as_deref(), Some("hello"));
        assert!(settings.cache().peek(1, "welcome").is_some());

        settings.set(1, "welcome", "bonjour").await.unwrap();
        assert_eq!(settings.get(1, "welcome").await.unwrap().as_deref(), Some("bonjour"));
    }

    #[tokio::test]
    async fn test_cached_absence_is_replaced_by_write() {
        let settings = service();
        assert_eq!(settings.get(1, "verify_channel").await.unwrap(), None);

        settings.set(1, "verify_channel", "42").await.unwrap();
        assert_eq!(settings.get(1, "verify_channel").await.unwrap().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn test_delete_twice_succeeds() {
        let settings = service();
        settings.set(5, "k", "v").await.unwrap();
        settings.get(5, "k").await.unwrap();

        assert!(settings.delete(5, "k").await.unwrap());
        assert!(!settings.delete(5, "k").await.unwrap());
        assert_eq!(settings.get(5, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let settings = service();
        let err = settings.set(5, "  ", "v").await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_typed_values() {
        let settings = service();
        settings
            .set_typed(7, &VERIFY_CHANNEL, &Snowflake(999))
            .await
            .unwrap();
        assert_eq!(
            settings.get_typed(7, &VERIFY_CHANNEL).await.unwrap(),
            Some(Snowflake(999))
        );
        assert_eq!(settings.get_typed(7, &VERIFICATION_ENABLED).await.unwrap(), None);

        settings.set(7, "verification_enabled", "sometimes").await.unwrap();
        let err = settings
            .get_typed(7, &VERIFICATION_ENABLED)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::CorruptValue { guild_id: 7, .. }));

        // The raw value is still readable; only the typed view refuses it.
        assert_eq!(
            settings.get(7, "verification_enabled").await.unwrap().as_deref(),
            Some("sometimes")
        );
        assert_eq!(
            settings
                .get_typed_or(7, &VERIFICATION_ENABLED, Flag(true))
                .await,
            Flag(true)
        );
    }

    #[tokio::test]
    async fn test_corrupt_protected_roles_do_not_protect() {
        let settings = service();
        settings.set(3, "protected_roles", "not json").await.unwrap();
        assert!(!settings.is_protected_role(3, 1).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_leave_one_row() {
        let settings = service();
        let mut handles = Vec::new();
        for i in 0..16 {
            let settings = settings.clone();
            handles.push(tokio::spawn(async move {
                settings.set(77, "mod_log_channel", &(i + 1).to_string()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(settings.db.setting_row_count(77, "mod_log_channel").unwrap(), 1);
        let cached = settings.get(77, "mod_log_channel").await.unwrap();
        let stored = settings.get_uncached(77, "mod_log_channel").await.unwrap();
        assert_eq!(cached, stored);
    }
}
