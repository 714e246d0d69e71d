//! Persistent cooldown ledger for rule firings.
//!
//! The ledger maps `(rule, symbol, timeframe)` keys to the last firing
//! instant and blocks re-fires inside a rule's cooldown window. The write
//! ordering is load-bearing: the new timestamp is durable **before** the
//! caller publishes the signal, so at-most-once-per-cooldown survives a
//! restart. When the durable write fails, the signal is suppressed and a
//! counter records the loss; the backtest keeps running.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::error::{BacktestError, Result};

/// Durable key/value store behind the ledger.
///
/// Keys are `rule|symbol|timeframe`; values are epoch seconds of the last
/// firing. `set` must be durable when it returns `Ok`.
pub trait CooldownStore: Send + Sync {
    /// Last persisted firing time for `key`, or 0 when never fired.
    fn get(&self, key: &str) -> i64;
    /// Durably record a firing time.
    fn set(&self, key: &str, ts: i64) -> Result<()>;
    /// Load every persisted entry; used to hydrate the in-memory cache.
    fn load_all(&self) -> Result<HashMap<String, i64>>;
}

/// Compose the ledger key for a rule firing.
pub fn cooldown_key(rule: &str, symbol: &str, timeframe: &str) -> String {
    format!("{rule}|{symbol}|{timeframe}")
}

/// In-memory store; durable for the lifetime of one process. Test double
/// and default for runs that do not need cross-run cooldown state.
#[derive(Debug, Default)]
pub struct MemoryCooldownStore {
    entries: Mutex<HashMap<String, i64>>,
}

impl CooldownStore for MemoryCooldownStore {
    fn get(&self, key: &str) -> i64 {
        self.entries
            .lock()
            .expect("cooldown store poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn set(&self, key: &str, ts: i64) -> Result<()> {
        self.entries
            .lock()
            .expect("cooldown store poisoned")
            .insert(key.to_string(), ts);
        Ok(())
    }

    fn load_all(&self) -> Result<HashMap<String, i64>> {
        Ok(self.entries.lock().expect("cooldown store poisoned").clone())
    }
}

/// JSON-file store with atomic rewrite (tmpfile + rename).
///
/// Suitable for single-writer use; evaluation is sequential within one
/// source and keys do not collide across sources.
#[derive(Debug)]
pub struct FileCooldownStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, i64>>,
}

impl FileCooldownStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn persist(&self, entries: &HashMap<String, i64>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CooldownStore for FileCooldownStore {
    fn get(&self, key: &str) -> i64 {
        self.cache
            .lock()
            .expect("cooldown store poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn set(&self, key: &str, ts: i64) -> Result<()> {
        let mut cache = self.cache.lock().expect("cooldown store poisoned");
        let previous = cache.insert(key.to_string(), ts);
        if let Err(err) = self.persist(&cache) {
            // Roll back the cache so a later retry re-attempts the write.
            match previous {
                Some(prev) => cache.insert(key.to_string(), prev),
                None => cache.remove(key),
            };
            return Err(err);
        }
        Ok(())
    }

    fn load_all(&self) -> Result<HashMap<String, i64>> {
        Ok(self.cache.lock().expect("cooldown store poisoned").clone())
    }
}

/// Write-through ledger: in-memory cache hydrated from a durable store.
pub struct CooldownLedger {
    store: Box<dyn CooldownStore>,
    cache: Mutex<HashMap<String, i64>>,
    persist_failures: Mutex<u64>,
}

impl CooldownLedger {
    /// Build a ledger over `store`, hydrating the cache via `load_all`.
    pub fn new(store: Box<dyn CooldownStore>) -> Result<Self> {
        let cache = store.load_all()?;
        debug!(entries = cache.len(), "cooldown ledger hydrated");
        Ok(Self {
            store,
            cache: Mutex::new(cache),
            persist_failures: Mutex::new(0),
        })
    }

    /// Ledger with no durability beyond the process.
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryCooldownStore::default()),
            cache: Mutex::new(HashMap::new()),
            persist_failures: Mutex::new(0),
        }
    }

    /// Whether a firing at `now` is allowed for `key` under `cooldown_s`.
    ///
    /// A rule may re-fire only when `now >= last + cooldown_s`.
    pub fn ready(&self, key: &str, now: DateTime<Utc>, cooldown_s: u64) -> bool {
        let last = self
            .cache
            .lock()
            .expect("cooldown ledger poisoned")
            .get(key)
            .copied()
            .unwrap_or(0);
        if last == 0 {
            return true;
        }
        now.timestamp() - last >= cooldown_s as i64
    }

    /// Durably record a firing. Must be called — and must succeed — before
    /// the signal is emitted.
    ///
    /// On failure the cache is left untouched, the failure counter is
    /// incremented, and the caller must suppress the signal.
    pub fn commit(&self, key: &str, ts: DateTime<Utc>) -> Result<()> {
        let epoch = ts.timestamp();
        if let Err(err) = self.store.set(key, epoch) {
            *self.persist_failures.lock().expect("cooldown ledger poisoned") += 1;
            return Err(BacktestError::CooldownPersist {
                key: key.to_string(),
                message: err.to_string(),
            });
        }
        self.cache
            .lock()
            .expect("cooldown ledger poisoned")
            .insert(key.to_string(), epoch);
        Ok(())
    }

    /// Last firing instant for `key`, if any.
    pub fn last_fire(&self, key: &str) -> Option<DateTime<Utc>> {
        let last = self
            .cache
            .lock()
            .expect("cooldown ledger poisoned")
            .get(key)
            .copied()
            .unwrap_or(0);
        if last == 0 {
            None
        } else {
            Utc.timestamp_opt(last, 0).single()
        }
    }

    /// Number of durable writes that failed (signals suppressed).
    pub fn persist_failures(&self) -> u64 {
        *self.persist_failures.lock().expect("cooldown ledger poisoned")
    }
}
