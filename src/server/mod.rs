//! HTTP boundary

pub mod http;

pub use http::{run, serve_listener, AppState, SniffWriter};
