use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::error::{StoreError, StoreResult};

/// Where the cache reads through to on a miss.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn fetch(&self, guild_id: u64, key: &str) -> StoreResult<Option<String>>;
}

type CacheKey = (u64, String);

#[derive(Debug, Clone)]
pub struct CachedEntry {
    /// `None` records that the setting is absent.
    pub value: Option<String>,
    pub loaded_at: DateTime<Utc>,
}

struct CacheState {
    entries: LruCache<CacheKey, CachedEntry>,
    /// Bumped on every invalidation of a key. Entries are dropped whenever the
    /// epoch moves, so this only holds keys invalidated since the last bump.
    generations: HashMap<CacheKey, u64>,
    /// Bumped by `clear` and `invalidate_guild`, covers every key they touch.
    epoch: u64,
}

impl CacheState {
    fn ticket(&self, key: &CacheKey) -> (u64, u64) {
        (self.epoch, self.generations.get(key).copied().unwrap_or(0))
    }
}

/// Process-local read-through mirror of the settings table.
///
/// Writers must call [`SettingsCache::invalidate`] before their write returns.
/// A read that started before an invalidation never stores what it read, so a
/// slow reader cannot put an old value back after a newer write.
#[derive(Clone)]
pub struct SettingsCache {
    state: Arc<Mutex<CacheState>>,
}

impl SettingsCache {
    /// `capacity` of 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        let entries = match NonZeroUsize::new(capacity) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries,
                generations: HashMap::new(),
                epoch: 0,
            })),
        }
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    pub fn peek(&self, guild_id: u64, key: &str) -> Option<CachedEntry> {
        let mut state = self.lock().ok()?;
        state.entries.get(&(guild_id, key.to_string())).cloned()
    }

    pub async fn get<S>(
        &self,
        source: &S,
        guild_id: u64,
        key: &str,
    ) -> StoreResult<Option<String>>
    where
        S: SettingsSource + ?Sized,
    {
        let cache_key = (guild_id, key.to_string());
        let ticket = {
            let mut state = self.lock()?;
            if let Some(entry) = state.entries.get(&cache_key) {
                return Ok(entry.value.clone());
            }
            state.ticket(&cache_key)
        };

        let value = source.fetch(guild_id, key).await?;

        let mut state = self.lock()?;
        if state.ticket(&cache_key) == ticket {
            state.entries.put(
                cache_key,
                CachedEntry {
                    value: value.clone(),
                    loaded_at: Utc::now(),
                },
            );
        } else {
            debug!(
                "Cache: skipped fill for {}/{} after concurrent invalidation",
                guild_id, key
            );
        }
        Ok(value)
    }

    pub fn invalidate(&self, guild_id: u64, key: &str) -> StoreResult<()> {
        let cache_key = (guild_id, key.to_string());
        let mut state = self.lock()?;
        state.entries.pop(&cache_key);
        *state.generations.entry(cache_key).or_insert(0) += 1;
        Ok(())
    }

    pub fn invalidate_guild(&self, guild_id: u64) -> StoreResult<usize> {
        let mut state = self.lock()?;
        let keys: Vec<CacheKey> = state
            .entries
            .iter()
            .filter(|((gid, _), _)| *gid == guild_id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            state.entries.pop(key);
        }
        // Reads for keys not currently cached may still be in flight.
        state.epoch += 1;
        state.generations.retain(|(gid, _), _| *gid != guild_id);
        Ok(keys.len())
    }

    pub fn clear(&self) -> StoreResult<()> {
        let mut state = self.lock()?;
        state.entries.clear();
        state.epoch += 1;
        state.generations.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
