//! # Manul Tracer
//!
//! Transport-level tracing for LLM API calls.
//!
//! Manul sits between an HTTP client and the network. Every chat-completion
//! call that goes through it is recorded as a [`models::TraceRecord`]: the
//! request parameters, the conversation with stable per-session message ids,
//! the response (buffered or streamed), token usage, cost, latency, rate
//! limits and error classification. The caller sees exactly the status,
//! headers, bytes and errors it would have seen without tracing.
//!
//! ## Architecture
//!
//! - **Transport**: [`transport::TracedTransport`] decorates any
//!   [`transport::Transport`] and captures response bodies as they are read
//! - **Parsers**: request, response and SSE stream parsing that never fails
//! - **Collector**: cost estimation and the [`collector::TraceSink`] port,
//!   with a batching [`collector::Pipeline`] into SQLite
//! - **Storage**: [`db::SqliteStore`] with a normalized schema
//!
//! ## Quick Start
//!
//! ```no_run
//! use manul_tracer::prelude::*;
//!
//! # async fn run() -> manul_tracer::Result<()> {
//! let config = Config::load(None)?;
//! let tracer = Tracer::open(&config).await?;
//!
//! let url = Url::parse("https://api.openai.com/v1/chat/completions").unwrap();
//! let request = Request::post_json(url, &serde_json::json!({
//!     "model": "gpt-4o-mini",
//!     "messages": [{"role": "user", "content": "Hello"}],
//! }))?;
//! let reply: serde_json::Value = tracer.handle_request(request).await.unwrap().json().await.unwrap();
//!
//! println!("{reply}");
//! tracer.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod classify;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod logging;
pub mod models;
pub mod parser;
pub mod tracer;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};
pub use tracer::Tracer;

/// Re-exports for convenience
pub mod prelude {
    pub use crate::classify::ErrorCategory;
    pub use crate::collector::{MemorySink, NoopSink, Pipeline, TraceSink};
    pub use crate::config::Config;
    pub use crate::db::SqliteStore;
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
    pub use crate::tracer::Tracer;
    pub use crate::transport::{
        Request, Response, TracedTransport, TracerOptions, Transport, TransportError, Url,
    };
}
