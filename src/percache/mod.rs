//! Permanent cache
//!
//! A size-bounded, on-disk, content-addressed cache. Blobs live in one
//! sled database under two key namespaces: `","++nodeID` maps an
//! application-level name to a content ref, and `"/"++binary(ref)` rows
//! hold the chunks themselves. A TinyLFU policy mirrors the `/` rows in
//! RAM with cost = byte length; evicting a RAM entry deletes the
//! persistent row, so the disk footprint stays bounded while uploads
//! still deduplicate through content addressing.

pub mod tinylfu;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::blobref::{BlobRef, SizedRef};
use crate::schema::{self, FileReader};
use crate::store::{BlobStore, Generation, KvStore, StatFn, TraceStore};
use crate::types::{GateError, Result};
use tinylfu::TinyLfu;

const NAME_PREFIX: &str = ",";
const VALUE_PREFIX: &str = "/";

pub const DEFAULT_MAX_COUNT: i64 = 10_000;
pub const DEFAULT_MAX_COST: i64 = 1 << 30;
pub const DEFAULT_BUFFER_ITEMS: usize = 64;

#[derive(Debug, Clone)]
pub struct PerCacheConfig {
    pub root: PathBuf,
    /// Expected entry count; the frequency sketch gets 10x this many
    /// counters.
    pub max_count: i64,
    /// Bound on the summed byte length of cached rows.
    pub max_cost_bytes: i64,
    /// Size of the TinyLFU get-signal ring.
    pub buffer_items: usize,
}

impl PerCacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_count: DEFAULT_MAX_COUNT,
            max_cost_bytes: DEFAULT_MAX_COST,
            buffer_items: DEFAULT_BUFFER_ITEMS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PerCacheStats {
    pub entry_count: usize,
    pub total_cost: i64,
}

pub struct PerCache {
    db: sled::Db,
    store: Arc<TraceStore>,
    policy: Arc<Mutex<TinyLfu>>,
    closing: Arc<AtomicBool>,
}

fn name_key(node_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(NAME_PREFIX.len() + node_id.len());
    key.extend_from_slice(NAME_PREFIX.as_bytes());
    key.extend_from_slice(node_id.as_bytes());
    key
}

fn value_key(raw_ref: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(VALUE_PREFIX.len() + raw_ref.len());
    key.extend_from_slice(VALUE_PREFIX.as_bytes());
    key.extend_from_slice(raw_ref);
    key
}

/// Delete the persistent rows behind evicted policy entries.
fn delete_evicted(db: &sled::Db, evicted: &[(Vec<u8>, i64)]) {
    for (raw, cost) in evicted {
        debug!(cost, "evicting cached blob row");
        if let Err(e) = db.remove(value_key(raw)) {
            warn!(error = %e, "removing evicted row");
        }
    }
}

fn open_with_recovery(root: &Path) -> Result<sled::Db> {
    match sled::open(root) {
        Ok(db) => Ok(db),
        Err(first) => {
            warn!(root = %root.display(), error = %first, "cache store damaged, recreating");
            let _ = std::fs::remove_dir_all(root);
            std::fs::create_dir_all(root)
                .map_err(|e| GateError::StorageInit(format!("{}: {e}", root.display())))?;
            sled::open(root).map_err(|e| GateError::StorageInit(format!("{}: {e}", root.display())))
        }
    }
}

impl PerCache {
    pub fn open(cfg: PerCacheConfig) -> Result<Arc<Self>> {
        let db = open_with_recovery(&cfg.root)?;
        let policy = Arc::new(Mutex::new(TinyLfu::new(
            (cfg.max_count * 10).max(10) as usize,
            cfg.max_cost_bytes,
            cfg.buffer_items,
        )));
        let closing = Arc::new(AtomicBool::new(false));

        // Warm up: admit every persisted row so in-RAM costs reflect
        // the on-disk footprint. Admission may already evict here if
        // the persisted set outgrew the budget while we were down.
        {
            let mut pol = policy.lock();
            let mut warmed = 0usize;
            for row in db.scan_prefix(VALUE_PREFIX.as_bytes()) {
                let (key, value) = row?;
                let raw = &key[VALUE_PREFIX.len()..];
                if BlobRef::from_bytes(raw).is_err() {
                    continue;
                }
                let evicted = pol.insert(raw, value.len() as i64);
                delete_evicted(&db, &evicted);
                warmed += 1;
            }
            info!(
                rows = warmed,
                cost = pol.total_cost(),
                root = %cfg.root.display(),
                "permanent cache warmed up"
            );
        }

        let kv: Arc<dyn BlobStore> = Arc::new(KvStore::managed(db.clone(), VALUE_PREFIX));

        let fetch_policy = Arc::clone(&policy);
        let fetch_closing = Arc::clone(&closing);
        let recv_policy = Arc::clone(&policy);
        let recv_closing = Arc::clone(&closing);
        let recv_db = db.clone();
        let rm_policy = Arc::clone(&policy);
        let rm_closing = Arc::clone(&closing);

        let store = TraceStore::new(kv)
            .on_fetch(Box::new(move |srs, err| {
                // shutdown-time callbacks must not take the mutex
                if fetch_closing.load(Ordering::Acquire) {
                    return;
                }
                let mut pol = fetch_policy.lock();
                for sr in srs {
                    let raw = sr.blob_ref.to_bytes();
                    match err {
                        None => pol.touch(&raw),
                        Some(GateError::NotFound(_)) => {
                            pol.remove(&raw);
                        }
                        Some(_) => {}
                    }
                }
            }))
            .on_receive(Box::new(move |srs, err| {
                if err.is_some() || recv_closing.load(Ordering::Acquire) {
                    return;
                }
                let mut pol = recv_policy.lock();
                for sr in srs {
                    let evicted = pol.insert(&sr.blob_ref.to_bytes(), sr.size as i64);
                    delete_evicted(&recv_db, &evicted);
                }
            }))
            .on_remove(Box::new(move |srs, _| {
                if rm_closing.load(Ordering::Acquire) {
                    return;
                }
                let mut pol = rm_policy.lock();
                for sr in srs {
                    pol.remove(&sr.blob_ref.to_bytes());
                }
            }));

        Ok(Arc::new(Self {
            db,
            store: Arc::new(store),
            policy,
            closing,
        }))
    }

    /// Chunk `data` into the content-addressed store and record the
    /// `nodeID -> content ref` mapping. The mapping is written last, so
    /// a failed put leaves no reachable name.
    pub async fn put<R>(&self, node_id: &str, data: R) -> Result<()>
    where
        R: AsyncRead + Unpin + Send,
    {
        let br = schema::write_file_from_reader(self.store.as_ref(), node_id, data).await?;
        self.db.insert(name_key(node_id), br.to_bytes())?;
        debug!(node = node_id, blob = %br, "cached");
        Ok(())
    }

    /// Resolve the mapping and reassemble the cached bytes. All chunks
    /// load eagerly; a missing chunk (evicted from under the mapping)
    /// is reported as corruption, not absence.
    pub async fn get(&self, node_id: &str) -> Result<Cursor<Vec<u8>>> {
        let raw = self
            .db
            .get(name_key(node_id))?
            .ok_or_else(|| GateError::NotFound(node_id.to_string()))?;
        let br = BlobRef::from_bytes(&raw)?;
        let fr = FileReader::open(self.store.as_ref(), &br)
            .await
            .map_err(|e| match e {
                GateError::NotFound(_) => {
                    GateError::Corrupt(format!("stale mapping {node_id:?}: file blob {br} gone"))
                }
                other => other,
            })?;
        let data = fr.read_all(self.store.as_ref()).await?;
        Ok(Cursor::new(data))
    }

    pub async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        self.store.fetch(br).await
    }

    pub async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        self.store.receive(br, data).await
    }

    pub async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        self.store.stat(refs, f).await
    }

    pub async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        self.store.remove(refs).await
    }

    pub fn stats(&self) -> PerCacheStats {
        let pol = self.policy.lock();
        PerCacheStats {
            entry_count: pol.len(),
            total_cost: pol.total_cost(),
        }
    }

    /// Resident policy entries, for mirror checks against the store.
    pub fn policy_entries(&self) -> Vec<(Vec<u8>, i64)> {
        self.policy.lock().entries()
    }

    /// Sum of persisted `/`-row value bytes.
    pub fn persisted_cost(&self) -> Result<i64> {
        let mut total = 0i64;
        for row in self.db.scan_prefix(VALUE_PREFIX.as_bytes()) {
            let (_, value) = row?;
            total += value.len() as i64;
        }
        Ok(total)
    }

    /// Periodically fold buffered get signals into the frequency
    /// sketch. Stops once the cache is closing.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if cache.closing.load(Ordering::Acquire) {
                    return;
                }
                cache.policy.lock().drain_buffer();
            }
        });
    }

    /// Mark the cache closing and flush. Eviction callbacks racing
    /// with shutdown see the flag and skip the policy mutex.
    pub fn close(&self) -> Result<()> {
        self.closing.store(true, Ordering::Release);
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for PerCache {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
    }
}

/// Read-through cache: fetches hit the permanent cache first and fill
/// it from the origin store on a miss. Everything else goes straight to
/// the origin.
pub struct CachingFetcher {
    cache: Arc<PerCache>,
    origin: Arc<dyn BlobStore>,
}

impl CachingFetcher {
    pub fn new(cache: Arc<PerCache>, origin: Arc<dyn BlobStore>) -> Self {
        Self { cache, origin }
    }
}

#[async_trait]
impl BlobStore for CachingFetcher {
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        match self.cache.fetch(br).await {
            Ok(hit) => {
                debug!(blob = %br, "cache hit");
                Ok(hit)
            }
            Err(_) => {
                let (data, size) = self.origin.fetch(br).await?;
                if let Err(e) = self.cache.receive(br, &data).await {
                    warn!(blob = %br, error = %e, "filling cache");
                }
                Ok((data, size))
            }
        }
    }

    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        self.origin.receive(br, data).await
    }

    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        self.origin.stat(refs, f).await
    }

    async fn enumerate(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
        dest: mpsc::Sender<SizedRef>,
    ) -> Result<()> {
        self.origin.enumerate(after, limit, dest).await
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        self.cache.remove(refs).await?;
        self.origin.remove(refs).await
    }

    async fn generation(&self) -> Result<Generation> {
        self.origin.generation().await
    }

    async fn reset_generation(&self) -> Result<Generation> {
        self.origin.reset_generation().await
    }
}

#[async_trait]
impl BlobStore for PerCache {
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        PerCache::fetch(self, br).await
    }

    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        PerCache::receive(self, br, data).await
    }

    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        PerCache::stat(self, refs, f).await
    }

    async fn enumerate(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
        dest: mpsc::Sender<SizedRef>,
    ) -> Result<()> {
        self.store.enumerate(after, limit, dest).await
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        PerCache::remove(self, refs).await
    }

    async fn generation(&self) -> Result<Generation> {
        self.store.generation().await
    }

    async fn reset_generation(&self) -> Result<Generation> {
        self.store.reset_generation().await
    }
}
