//! Per-server uploader/downloader registry
//!
//! Uploaders and downloaders are expensive (stores, caches, gates), so
//! one of each is kept per server URL. The registry is an explicit
//! value constructed at startup and passed into the HTTP state rather
//! than a process-wide global; population races are resolved by the
//! map's entry API.

use std::sync::Arc;

use dashmap::DashMap;

use crate::download::{Downloader, DownloaderConfig};
use crate::types::Result;
use crate::upload::{Uploader, UploaderConfig};

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub cap_ctime: bool,
    pub skip_have_cache: bool,
    pub insecure_tls: bool,
    pub skip_irregular: bool,
    /// Concurrent chunking permits per uploader; 0 means one per CPU.
    pub gate_permits: usize,
    pub cache_root: Option<std::path::PathBuf>,
}

pub struct Registry {
    cfg: RegistryConfig,
    uploaders: DashMap<String, Arc<Uploader>>,
    downloaders: DashMap<String, Arc<Downloader>>,
}

impl Registry {
    pub fn new(cfg: RegistryConfig) -> Self {
        Self {
            cfg,
            uploaders: DashMap::new(),
            downloaders: DashMap::new(),
        }
    }

    /// The uploader for `server`, created on first use.
    pub fn uploader(&self, server: &str) -> Result<Arc<Uploader>> {
        if let Some(u) = self.uploaders.get(server) {
            return Ok(Arc::clone(&u));
        }
        let mut ucfg = UploaderConfig::new(server);
        ucfg.cap_ctime = self.cfg.cap_ctime;
        ucfg.skip_have_cache = self.cfg.skip_have_cache;
        ucfg.insecure_tls = self.cfg.insecure_tls;
        ucfg.gate_permits = self.cfg.gate_permits;
        let built = Uploader::new(ucfg)?;
        // a racing creator may have won; keep whichever landed first
        let entry = self
            .uploaders
            .entry(server.to_string())
            .or_insert_with(|| built);
        Ok(Arc::clone(&entry))
    }

    /// The downloader for `server`, created on first use.
    pub fn downloader(&self, server: &str) -> Result<Arc<Downloader>> {
        if let Some(d) = self.downloaders.get(server) {
            return Ok(Arc::clone(&d));
        }
        let mut dcfg = DownloaderConfig::new(server);
        dcfg.insecure_tls = self.cfg.insecure_tls;
        dcfg.skip_irregular = self.cfg.skip_irregular;
        dcfg.cache_root = self.cfg.cache_root.clone();
        let built = Downloader::new(dcfg)?;
        let entry = self
            .downloaders
            .entry(server.to_string())
            .or_insert_with(|| built);
        Ok(Arc::clone(&entry))
    }

    /// Install pre-built endpoints for a server; used by tests and the
    /// `file://` fast path.
    pub fn install(&self, server: &str, up: Arc<Uploader>, down: Arc<Downloader>) {
        self.uploaders.insert(server.to_string(), up);
        self.downloaders.insert(server.to_string(), down);
    }
}
