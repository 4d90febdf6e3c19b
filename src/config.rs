//! Configuration for camgate
//!
//! CLI arguments and environment variable handling using clap.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::registry::RegistryConfig;

/// camgate - HTTP gateway in front of a content-addressed blob store
///
/// Clients that cannot link the native client libraries upload opaque
/// files here and fetch them back by content ref, while the upstream
/// store keeps doing the deduplication and chunking.
#[derive(Parser, Debug, Clone)]
#[command(name = "camgate")]
#[command(about = "HTTP gateway in front of a content-addressed blob store")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3178")]
    pub listen: SocketAddr,

    /// Upstream blob server URL, or file:///path for a local store
    #[arg(long, env = "CAMLI_SERVER", default_value = "http://localhost:3179")]
    pub server: String,

    /// Verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Allow insecure TLS connections to the blob server
    #[arg(short = 'k', long, env = "CAMLI_INSECURE_TLS")]
    pub insecure_tls: bool,

    /// Skip irregular files (symlinks, fifos, sockets) when saving trees
    #[arg(long)]
    pub skip_irregular: bool,

    /// Forge ctime to be less than or equal to mtime
    #[arg(long)]
    pub capctime: bool,

    /// No HTTP Basic authentication, even if CAMLI_AUTH is set
    #[arg(long)]
    pub noauth: bool,

    /// Paranoid mode: save uploaded files also under this directory
    #[arg(long, env = "CAMGATE_PARANOID")]
    pub paranoid: Option<PathBuf>,

    /// Skip the upload CLI's have-cache (more stress on the blob server)
    #[arg(long)]
    pub skip_have_cache: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Concurrent chunking permits (0 = one per CPU)
    #[arg(long, env = "UPLOAD_GATE", default_value_t = 0)]
    pub gate_permits: usize,

    /// On-disk mime cache path (defaults under the OS temp dir)
    #[arg(long, env = "MIME_CACHE")]
    pub mime_cache_path: Option<PathBuf>,

    /// Permanent cache root (defaults under the OS temp dir, per server)
    #[arg(long, env = "CACHE_ROOT")]
    pub cache_root: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the HTTP proxy (the default)
    Serve,
    /// Convert a ref between canonical and short form
    Ref {
        /// A ref in either form
        text: String,
    },
    /// Upload a byte stream (stdin or a file) and print its content ref
    Upbytes {
        /// File to upload; stdin when absent
        file: Option<PathBuf>,
    },
    /// Compute file-schema refs without writing to any remote store
    Hash {
        /// Files to hash
        files: Vec<PathBuf>,
    },
}

impl Args {
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            cap_ctime: self.capctime,
            skip_have_cache: self.skip_have_cache,
            insecure_tls: self.insecure_tls,
            skip_irregular: self.skip_irregular,
            gate_permits: self.gate_permits,
            cache_root: self.cache_root.clone(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.server.is_empty() {
            return Err("a blob server is required (--server)".to_string());
        }
        if let Some(dir) = &self.paranoid {
            if !dir.is_dir() {
                return Err(format!(
                    "paranoid directory {} does not exist",
                    dir.display()
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["camgate"]);
        assert!(args.command.is_none());
        assert_eq!(args.listen.port(), 3178);
        assert!(!args.noauth);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn subcommands_parse() {
        let args = Args::parse_from(["camgate", "ref", "sha1-00"]);
        assert!(matches!(args.command, Some(Command::Ref { .. })));
        let args = Args::parse_from(["camgate", "hash", "a.txt", "b.txt"]);
        match args.command {
            Some(Command::Hash { files }) => assert_eq!(files.len(), 2),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn missing_paranoid_dir_fails_validation() {
        let mut args = Args::parse_from(["camgate"]);
        args.paranoid = Some(PathBuf::from("/definitely/not/here"));
        assert!(args.validate().is_err());
    }
}
