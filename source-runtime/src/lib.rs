//! Declarative, concurrent source runtime.
//!
//! A YAML manifest describes streams: where to send requests, how to page,
//! how to slice time and partitions, and where records live in a response.
//! The runtime lowers it into components and reads the configured catalog.
//!
//! ```text
//!                manifest.yaml
//!                     ↓
//!   manifest ── refs, $parameters, factory ──▶ DeclarativeStream
//!                     ↓
//!   source   ── groups streams (concurrent | synchronous)
//!                     ↓
//!   reader   ── partitions ──▶ workers ──▶ retriever ──▶ http
//!                     │                      │
//!                     │           requester, paginator, extractor
//!                     ↓
//!   cursor   ── folds completed slices into STATE
//!                     ↓
//!             RECORD / STATE / TRACE (stdout)
//! ```

pub mod cursor;
pub mod datetime;
pub mod error_handler;
pub mod extractor;
pub mod http;
pub mod interpolation;
pub mod manifest;
pub mod paginator;
pub mod partition_router;
pub mod reader;
pub mod requester;
pub mod retriever;
pub mod source;
pub mod stream;

#[cfg(test)]
mod testing;

pub use manifest::Manifest;
pub use source::{DeclarativeSource, Source};
