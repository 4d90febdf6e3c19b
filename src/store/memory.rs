//! In-memory blob store
//!
//! Backs tests and the `hash` subcommand, which computes file-schema
//! refs without writing anywhere durable.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::blobref::{BlobRef, SizedRef};
use crate::store::{verify_hash, BlobStore, Generation, StatFn};
use crate::types::{GateError, Result};

/// BTreeMap keyed by the binary ref form, so enumeration order matches
/// the sled-backed store.
pub struct MemoryStore {
    blobs: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    generation: Mutex<Option<Generation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(BTreeMap::new()),
            generation: Mutex::new(Some(Generation::new())),
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Total bytes stored, across all blobs.
    pub fn total_bytes(&self) -> u64 {
        self.blobs.read().values().map(|v| v.len() as u64).sum()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        let blobs = self.blobs.read();
        match blobs.get(&br.to_bytes()) {
            Some(v) => Ok((v.clone(), v.len() as u32)),
            None => Err(GateError::NotFound(br.to_string())),
        }
    }

    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        verify_hash(br, data)?;
        self.blobs.write().insert(br.to_bytes(), data.to_vec());
        Ok(SizedRef {
            blob_ref: br.clone(),
            size: data.len() as u32,
        })
    }

    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        let blobs = self.blobs.read();
        for br in refs {
            if let Some(v) = blobs.get(&br.to_bytes()) {
                f(SizedRef {
                    blob_ref: br.clone(),
                    size: v.len() as u32,
                });
            }
        }
        Ok(())
    }

    async fn enumerate(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
        dest: mpsc::Sender<SizedRef>,
    ) -> Result<()> {
        let snapshot: Vec<(Vec<u8>, usize)> = {
            let blobs = self.blobs.read();
            blobs.iter().map(|(k, v)| (k.clone(), v.len())).collect()
        };
        let after_key = after.map(|br| br.to_bytes());
        let mut sent = 0;
        for (key, len) in snapshot {
            if let Some(ref ak) = after_key {
                if &key <= ak {
                    continue;
                }
            }
            let br = match BlobRef::from_bytes(&key) {
                Ok(br) => br,
                Err(_) => continue,
            };
            if dest
                .send(SizedRef {
                    blob_ref: br,
                    size: len as u32,
                })
                .await
                .is_err()
            {
                break;
            }
            sent += 1;
            if limit != 0 && sent >= limit {
                break;
            }
        }
        Ok(())
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        let mut blobs = self.blobs.write();
        for br in refs {
            blobs.remove(&br.to_bytes());
        }
        Ok(())
    }

    async fn generation(&self) -> Result<Generation> {
        self.generation
            .lock()
            .clone()
            .ok_or_else(|| GateError::NotFound("generation".into()))
    }

    async fn reset_generation(&self) -> Result<Generation> {
        let gen = Generation::new();
        *self.generation.lock() = Some(gen.clone());
        Ok(gen)
    }
}
