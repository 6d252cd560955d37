//! Application state shared across handlers.

use crate::auth::{Authorizer, ConfigAuthorizer};
use crate::config::Config;
use crate::cover::AssetNormalizer;
use crate::error::Result;
use crate::history::{HistoryRecorder, ReaderIdentity};
use crate::ingest::Ingestor;
use crate::library::StorageTarget;
use crate::reader::Shelf;
use crate::router::{CloudWriter, LocalWriter, PersistenceRouter};
use crate::store::{BlobStore, DocumentStore, FsBlobStore, SqliteDocumentStore};
use std::collections::HashMap;
use std::sync::Arc;

/// Shelves are per reader identity and per store.
type ShelfKey = (ReaderIdentity, StorageTarget);

struct ShelfSlot {
    shelf: Arc<tokio::sync::Mutex<Shelf>>,
    last_used: u64,
}

/// Open shelves, bounded by `reader.max_shelves`.
#[derive(Default)]
struct Shelves {
    slots: HashMap<ShelfKey, ShelfSlot>,
    tick: u64,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Upload pipeline.
    pub ingestor: Ingestor,
    /// Shared catalog documents.
    pub remote: Arc<dyn DocumentStore>,
    /// Device documents.
    pub local: Arc<dyn DocumentStore>,
    /// Reading history.
    pub history: HistoryRecorder,
    /// Tier lookup.
    pub authorizer: Arc<dyn Authorizer>,
    shelves: Arc<parking_lot::Mutex<Shelves>>,
}

impl AppState {
    /// Assemble the pipeline over the given stores.
    pub fn new(
        config: Config,
        remote: Arc<dyn DocumentStore>,
        local: Arc<dyn DocumentStore>,
        remote_blobs: Arc<dyn BlobStore>,
        local_blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let attempts = config.upload.write_attempts;
        let cloud = CloudWriter::new(remote.clone(), remote_blobs, attempts);
        let device = LocalWriter::new(local.clone(), local_blobs, attempts);
        let router = PersistenceRouter::new(Arc::new(cloud), Arc::new(device));
        let ingestor = Ingestor::new(router, AssetNormalizer::new(&config.covers));
        let history = HistoryRecorder::new(remote.clone(), local.clone());
        let authorizer = Arc::new(ConfigAuthorizer::new(&config.auth));

        Self {
            config: Arc::new(config),
            ingestor,
            remote,
            local,
            history,
            authorizer,
            shelves: Arc::new(parking_lot::Mutex::new(Shelves::default())),
        }
    }

    /// Open the SQLite stores and blob directories named in the configuration.
    pub fn open(config: Config) -> Result<Self> {
        let storage = &config.storage;
        for db_path in [&storage.local_db, &storage.remote_db] {
            if let Some(parent) = db_path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&storage.local_blobs)?;
        std::fs::create_dir_all(&storage.remote_blobs)?;

        let remote = Arc::new(SqliteDocumentStore::open(&storage.remote_db)?);
        let local = Arc::new(SqliteDocumentStore::open(&storage.local_db)?);
        let remote_blobs = Arc::new(FsBlobStore::new(
            &storage.remote_blobs,
            storage.remote_base_url.as_str(),
        ));
        let local_blobs = Arc::new(FsBlobStore::new(
            &storage.local_blobs,
            format!("file://{}", storage.local_blobs.display()),
        ));

        tracing::info!(
            remote_db = %storage.remote_db.display(),
            local_db = %storage.local_db.display(),
            "Opened stores"
        );

        Ok(Self::new(config, remote, local, remote_blobs, local_blobs))
    }

    /// Document store for a target.
    pub fn store(&self, target: StorageTarget) -> Arc<dyn DocumentStore> {
        match target {
            StorageTarget::Remote => self.remote.clone(),
            StorageTarget::Local => self.local.clone(),
        }
    }

    /// The reader's shelf for a store, created on first use.
    ///
    /// Past `reader.max_shelves`, the least recently used shelf is dropped.
    /// A request still holding it finishes normally.
    pub fn shelf(
        &self,
        reader: &ReaderIdentity,
        target: StorageTarget,
    ) -> Arc<tokio::sync::Mutex<Shelf>> {
        let mut shelves = self.shelves.lock();
        shelves.tick += 1;
        let tick = shelves.tick;

        let key = (reader.clone(), target);
        if let Some(slot) = shelves.slots.get_mut(&key) {
            slot.last_used = tick;
            return slot.shelf.clone();
        }

        let limit = self.config.reader.max_shelves.max(1);
        while shelves.slots.len() >= limit {
            let Some(oldest) = shelves
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            shelves.slots.remove(&oldest);
            tracing::debug!(device = %oldest.0.device_id, target = %oldest.1, "Dropped idle shelf");
        }

        let shelf = Arc::new(tokio::sync::Mutex::new(Shelf::new(
            self.store(target),
            self.history.clone(),
            reader.clone(),
            self.config.reader.cache_capacity,
        )));
        shelves.slots.insert(
            key,
            ShelfSlot {
                shelf: shelf.clone(),
                last_used: tick,
            },
        );
        shelf
    }

    #[cfg(test)]
    pub(crate) fn shelf_count(&self) -> usize {
        self.shelves.lock().slots.len()
    }
}
