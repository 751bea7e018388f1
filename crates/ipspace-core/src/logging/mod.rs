//! Per-profile JSONL logging
//!
//! Every profile process can mirror its `tracing` events into an
//! append-only JSONL file, one file per profile per day:
//!
//! ```text
//! <data_dir>/logs/
//! └── raw/
//!     ├── 2026-10-19_alice.jsonl
//!     └── 2026-10-19_bob.jsonl
//! ```
//!
//! ```ignore
//! use ipspace_core::logging::JsonlLayer;
//! use tracing_subscriber::prelude::*;
//!
//! let layer = JsonlLayer::new(data_dir.join("logs"), "alice")?;
//! tracing_subscriber::registry()
//!     .with(layer)
//!     .with(tracing_subscriber::fmt::layer())
//!     .init();
//! ```
//!
//! Query with jq: `jq 'select(.level == "warn")' logs/raw/*.jsonl`

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogEntry;
pub use layer::JsonlLayer;
pub use writer::{read_entries, ProfileLogWriter};
