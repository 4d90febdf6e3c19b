//! camgate - HTTP gateway in front of a content-addressed blob store
//!
//! Clients that cannot link the native client libraries (legacy
//! machines, shell scripts, embedded devices) upload opaque files over
//! plain HTTP and fetch them back by content ref, while the upstream
//! blob server keeps providing deduplication, chunking and permanode
//! metadata.
//!
//! ## Pieces
//!
//! - **blobref**: parse/format content-addressed references
//! - **schema**: file-schema blobs, the chunking writer, the file reader
//! - **store**: one adapter over sled-backed, in-memory and remote stores
//! - **percache**: bounded on-disk cache with TinyLFU eviction
//! - **transport**: retrying HTTP execution against the blob server
//! - **upload / download**: the write and read pipelines
//! - **server**: the thin HTTP boundary

pub mod auth;
pub mod blobref;
pub mod config;
pub mod download;
pub mod mime;
pub mod percache;
pub mod registry;
pub mod schema;
pub mod server;
pub mod store;
pub mod transport;
pub mod types;
pub mod upload;

pub use config::{Args, Command};
pub use server::{run, AppState};
pub use types::{GateError, Result};
