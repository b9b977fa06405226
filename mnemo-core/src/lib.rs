//! # MnemoDB Core
//!
//! Building blocks shared by the MnemoDB storage engine and tools:
//! - The value model and polymorphic column types
//! - Table schemas, merge rules and schema inference
//! - The binary WAL column codec
//! - Error types, configuration and metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   mnemo-core                    │
//! ├─────────────────────────────────────────────────┤
//! │  • value         - Values and their ordering   │
//! │  • column_type   - Types, wire & WAL codecs    │
//! │  • schema        - Table schema merge          │
//! │  • statistics    - Schema inference            │
//! │  • serialization - WAL column binary format    │
//! │  • error         - Error handling              │
//! │  • config        - Engine configuration        │
//! │  • metrics       - Counters                    │
//! │  • utils         - Backoff, checksums          │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod column_type;
pub mod config;
pub mod error;
pub mod metrics;
pub mod schema;
pub mod serialization;
pub mod statistics;
pub mod utils;
pub mod value;

// Re-export commonly used types
pub use column_type::{ColumnType, ScalarKind};
pub use config::Config;
pub use error::{Error, Result};
pub use metrics::Metrics;
pub use schema::{ColumnSchema, ColumnSchemaDesc, TableSchema, TableSchemaDesc};
pub use statistics::ColumnStatistics;
pub use value::{Record, TypeKind, Value};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
