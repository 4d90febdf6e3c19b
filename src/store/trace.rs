//! Tracing decorator for blob stores
//!
//! Wraps a store and calls post-hooks after each operation with the
//! SizedRefs involved and the operation's error, if any. The permanent
//! cache uses this to keep its in-RAM working set in sync with the rows
//! that actually land in, or leave, the persistent store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::blobref::{BlobRef, SizedRef};
use crate::store::{BlobStore, Generation, StatFn};
use crate::types::{GateError, Result};

pub type TraceHook = Box<dyn Fn(&[SizedRef], Option<&GateError>) + Send + Sync>;

pub struct TraceStore {
    inner: Arc<dyn BlobStore>,
    on_fetch: Option<TraceHook>,
    on_receive: Option<TraceHook>,
    on_remove: Option<TraceHook>,
    on_stat: Option<TraceHook>,
    on_enumerate: Option<TraceHook>,
}

impl TraceStore {
    pub fn new(inner: Arc<dyn BlobStore>) -> Self {
        Self {
            inner,
            on_fetch: None,
            on_receive: None,
            on_remove: None,
            on_stat: None,
            on_enumerate: None,
        }
    }

    pub fn on_fetch(mut self, hook: TraceHook) -> Self {
        self.on_fetch = Some(hook);
        self
    }

    pub fn on_receive(mut self, hook: TraceHook) -> Self {
        self.on_receive = Some(hook);
        self
    }

    pub fn on_remove(mut self, hook: TraceHook) -> Self {
        self.on_remove = Some(hook);
        self
    }

    pub fn on_stat(mut self, hook: TraceHook) -> Self {
        self.on_stat = Some(hook);
        self
    }

    pub fn on_enumerate(mut self, hook: TraceHook) -> Self {
        self.on_enumerate = Some(hook);
        self
    }
}

#[async_trait]
impl BlobStore for TraceStore {
    async fn fetch(&self, br: &BlobRef) -> Result<(Vec<u8>, u32)> {
        let res = self.inner.fetch(br).await;
        if let Some(hook) = &self.on_fetch {
            let size = res.as_ref().map(|(_, s)| *s).unwrap_or(0);
            let sized = [SizedRef {
                blob_ref: br.clone(),
                size,
            }];
            hook(&sized, res.as_ref().err());
        }
        res
    }

    async fn receive(&self, br: &BlobRef, data: &[u8]) -> Result<SizedRef> {
        let res = self.inner.receive(br, data).await;
        if let Some(hook) = &self.on_receive {
            let sized = [res.as_ref().cloned().unwrap_or(SizedRef {
                blob_ref: br.clone(),
                size: 0,
            })];
            hook(&sized, res.as_ref().err());
        }
        res
    }

    async fn stat(&self, refs: &[BlobRef], f: StatFn<'_>) -> Result<()> {
        let Some(hook) = &self.on_stat else {
            return self.inner.stat(refs, f).await;
        };
        let mut sized = Vec::with_capacity(refs.len());
        let res = self
            .inner
            .stat(refs, &mut |sr: SizedRef| {
                sized.push(sr.clone());
                f(sr);
            })
            .await;
        hook(&sized, res.as_ref().err());
        res
    }

    async fn enumerate(
        &self,
        after: Option<&BlobRef>,
        limit: usize,
        dest: mpsc::Sender<SizedRef>,
    ) -> Result<()> {
        let Some(hook) = &self.on_enumerate else {
            return self.inner.enumerate(after, limit, dest).await;
        };
        let (tx, mut rx) = mpsc::channel::<SizedRef>(16);
        let forward = async {
            let mut sized = Vec::new();
            while let Some(sr) = rx.recv().await {
                sized.push(sr.clone());
                if dest.send(sr).await.is_err() {
                    break;
                }
            }
            sized
        };
        let (res, sized) = tokio::join!(self.inner.enumerate(after, limit, tx), forward);
        hook(&sized, res.as_ref().err());
        res
    }

    async fn remove(&self, refs: &[BlobRef]) -> Result<()> {
        let res = self.inner.remove(refs).await;
        if let Some(hook) = &self.on_remove {
            let sized: Vec<SizedRef> = refs
                .iter()
                .map(|br| SizedRef {
                    blob_ref: br.clone(),
                    size: 0,
                })
                .collect();
            hook(&sized, res.as_ref().err());
        }
        res
    }

    async fn generation(&self) -> Result<Generation> {
        self.inner.generation().await
    }

    async fn reset_generation(&self) -> Result<Generation> {
        self.inner.reset_generation().await
    }
}
