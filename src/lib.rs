//! Tributary core types shared by the declarative source runtime.
//!
//! ```text
//!   --config / --catalog / --state files
//!              ↓
//! ┌────────────────────────────────────┐
//! │  config   ConnectorConfig,         │
//! │           RuntimeConfig (TOML+env) │
//! │  state    StateManager             │
//! └────────────────────────────────────┘
//!              ↓
//!       source-runtime (reader)
//!              ↓
//! ┌────────────────────────────────────┐
//! │  protocol Message (RECORD, STATE,  │
//! │           TRACE, CATALOG, ...)     │
//! └────────────────────────────────────┘
//!              ↓
//!         stdout (NDJSON)
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rate_limit;
pub mod record;
pub mod state;

pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{FailureType, SourceError};
pub use protocol::{Message, StreamDescriptor, SyncMode};
pub use record::{Record, StreamSlice};
