//! Versioned config store backed by redb.
//!
//! Every config carries a `version`. Mutations present the version they
//! read; the store compares it against the stored one and bumps it by one
//! inside the same redb write transaction, so the check and the write are
//! atomic. A mismatch is a dirty write ([`StateError::VersionMismatch`]).
//! There are no locks beyond redb's single-writer transactions.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::CONFIGS;
use crate::types::{Config, ManifestState};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe config store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONFIGS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Store a new config at version 0. Fails if the name is taken.
    pub fn create_config(&self, config: &Config) -> StateResult<u64> {
        let mut stored = config.clone();
        stored.version = 0;
        let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            if table.get(config.name.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::AlreadyExists(config.name.clone()));
            }
            table
                .insert(config.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(config = %config.name, "config created");
        Ok(0)
    }

    /// Replace a config, conditioned on `config.version` being the stored
    /// version. Returns the new version (stored + 1).
    pub fn update_config(&self, config: &Config) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let version;
        {
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            let stored = load_checked(&table, &config.name, config.version)?;

            let mut next = config.clone();
            next.version = stored.version + 1;
            version = next.version;
            let value = serde_json::to_vec(&next).map_err(map_err!(Serialize))?;
            table
                .insert(config.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(config = %config.name, version, "config updated");
        Ok(version)
    }

    /// Get a config by name.
    pub fn get_config(&self, name: &str) -> StateResult<Option<Config>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let config: Config =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(config))
            }
            None => Ok(None),
        }
    }

    /// List configs whose manifest is in one of `states` (all when empty).
    pub fn list_configs(&self, states: &[ManifestState]) -> StateResult<Vec<Config>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let config: Config =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if states.is_empty() || states.contains(&config.manifest.state) {
                results.push(config);
            }
        }
        Ok(results)
    }

    /// Physically delete a config, conditioned on `version`.
    pub fn delete_config(&self, name: &str, version: u64) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            load_checked(&table, name, version)?;
            table.remove(name).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(config = %name, version, "config deleted");
        Ok(())
    }

    /// Clear the raw manifest and its checksum, conditioned on `version`.
    /// The watchers then tear down every cluster of the config.
    pub fn mark_for_deletion(&self, name: &str, version: u64) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next_version;
        {
            let mut table = txn.open_table(CONFIGS).map_err(map_err!(Table))?;
            let mut config = load_checked(&table, name, version)?;
            config.manifest.raw.clear();
            config.manifest.checksum = None;
            config.version += 1;
            next_version = config.version;
            let value = serde_json::to_vec(&config).map_err(map_err!(Serialize))?;
            table
                .insert(name, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(config = %name, version = next_version, "config marked for deletion");
        Ok(next_version)
    }
}

/// Read a config inside a write transaction and check the presented version.
fn load_checked(
    table: &Table<&str, &[u8]>,
    name: &str,
    expected: u64,
) -> StateResult<Config> {
    let stored: Config = match table.get(name).map_err(map_err!(Read))? {
        Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
        None => return Err(StateError::NotFound(name.to_string())),
    };
    if stored.version != expected {
        return Err(StateError::VersionMismatch {
            name: name.to_string(),
            expected,
            found: stored.version,
        });
    }
    Ok(stored)
}
