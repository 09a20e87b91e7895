//! Batch Mux
//!
//! A client-side batching and multiplexing layer for bidirectional
//! streaming transports. Many small, concurrent, logically independent
//! requests to the same remote endpoint are coalesced into fewer, larger
//! wire batches carried over a small pool of long-lived streams, while
//! each request keeps its own completion semantics: response delivery,
//! cancellation, timeout, errors, and priority.
//!
//! The transport itself is supplied by the caller as an implementation
//! of [`Connection`] and [`BatchStream`]; this crate never dials or
//! encodes payloads.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use batch_mux::{BatchConn, Config, IdleNotify};
//! use bytes::Bytes;
//! use std::time::Duration;
//!
//! // `MyConnection` implements batch_mux::Connection for your transport.
//! let conns = vec![my_connection.clone(), my_connection_2];
//! let conn = BatchConn::new("node-1:20160", conns, Config::default(), IdleNotify::new());
//!
//! let response = conn
//!     .submit(Bytes::from_static(b"get k1"), "", Duration::from_secs(2), 0)
//!     .await?;
//! ```

mod backoff;
mod builder;
mod config;
mod conn;
mod entry;
mod error;
mod metrics;
mod queue;
mod stream_client;
mod transport;
mod trigger;

pub use backoff::{apply_jitter, JitterMode, RetryConfig};
pub use config::{BatchPolicy, Config, DIAL_TIMEOUT, IDLE_TIMEOUT};
pub use conn::{BatchConn, IdleNotify};
pub use entry::HIGH_TASK_PRIORITY;
pub use error::Error;
pub use stream_client::HealthFeedbackCallback;
pub use transport::{BatchRequest, BatchResponse, BatchStream, ConnState, Connection};
pub use trigger::{TriggerOptions, TriggerStrategy};
