//! Blob store adapters
//!
//! One interface over every place blobs can live: the sled-backed local
//! store, an in-memory variant for tests and the `hash` subcommand, and
//! the HTTP client against the upstream blob server. A trace decorator
//! exposes post-hooks so a cache can watch traffic go by.

pub mod kv;
pub mod memory;
pub mod remote;
pub mod trace;

pub use kv::KvStore;
pub use memory::MemoryStore;
pub use remote::RemoteStore;
pub use trace::TraceStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::blobref::{BlobRef, SizedRef};
use crate::types::Result;

/// Callback invoked by [`BlobStore::stat`] for each present ref.
pub type StatFn<'a> = &'a mut (dyn FnMut(SizedRef) + Send);

/// Storage generation: when the store was initialized plus a random id,
/// so clients can detect a wiped-and-recreated store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Generation {
    pub init_time: DateTime<Utc>,
    pub random: String,
}

impl Generation {
    pub fn new() -> Self {
        let mut raw = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut raw);
        Self {
            init_time: Utc::now(),
            random: hex::encode(raw),
        }
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::new()
    }
}

/// The blob store contract.
///
/// Every implementation must keep these guarantees:
/// * `fetch` returns `NotFound` for absent refs, never empty bytes.
/// * `receive` rejects bytes whose hash does not match the ref.
/// * `enumerate` yields refs in ascending key order and closes the
///   channel by returning.
/// * `remove` is idempotent; missing refs are not an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch a blob's bytes and length.
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)>;

    /// Store bytes under their ref.
    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef>;

    /// Invoke `f` for each ref in `refs` that is present.
    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()>;

    /// Send refs after `after` (exclusive), ascending, at most `limit`
    /// (0 = unlimited). The channel closes when this returns.
    async fn enumerate(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
        dest: mpsc::Sender<SizedRef>,
    ) -> Result<()>;

    /// Delete blobs. Missing refs are silently skipped.
    async fn remove(&self, refs: &[BlobRef]) -> Result<()>;

    /// The store's generation record.
    async fn generation(&self) -> Result<Generation>;

    /// Install a fresh `(now, random)` generation.
    async fn reset_generation(&self) -> Result<Generation>;
}

/// Verify that `data` hashes to `br`; used by receive paths.
pub(crate) fn verify_hash(br: &BlobRef, data: &[u8]) -> Result<()> {
    let computed = BlobRef::from_data(br.algo(), data);
    if &computed != br {
        return Err(crate::types::GateError::Corrupt(format!(
            "hash mismatch: wrote {br}, bytes are {computed}"
        )));
    }
    Ok(())
}
