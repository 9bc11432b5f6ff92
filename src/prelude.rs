//! Convenient imports for common functionality.

pub use crate::cache::{LedgerKind, MigrationLedger, QueryCache, QueryCacheEntry};
pub use crate::config::{DatabaseConfig, OrchestratorConfig, QueueScaleConfig, ScalingConfig};
pub use crate::connstring::{ConnectionConfig, mask_connection_string};
pub use crate::engine::{EngineConnection, EngineRegistry};
pub use crate::error::{DbQueueError, MigrationStage};
pub use crate::logging::init_tracing;
pub use crate::manager::QueueManager;
pub use crate::migration::{MigrationFile, MigrationSet};
pub use crate::params::{convert_named_to_positional, parse_typed_parameters};
pub use crate::pending::QueryStatus;
pub use crate::queue::{DatabaseQueue, LeadPhase, QueueContext};
pub use crate::types::{
    CellValue, DatabaseQuery, EngineType, QueryRequest, QueryResult, QueueType, TypedParameter,
    TypedValue,
};
