// Flowmap sensor - passive flow capture and reconciliation
//
// This library holds the pieces shared by the capture agent and the
// reconcile tool:
// 1. Classifying captured frames into flow keys
// 2. Suppressing flows seen recently
// 3. Deferring best-effort writes to an expiring store
// 4. Reading the store back into mapping chains

pub mod config;
pub mod gateway;
pub mod logging;
pub mod metrics;
pub mod packet;
pub mod recency;
pub mod reconcile;
pub mod service;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use config::{AgentConfig, CaptureConfig, ConfigError, LoggingConfig, RecencyConfig, StatsConfig, StoreConfig, WriterConfig};
pub use gateway::{CloseMode, WriteGateway, WriteUnit};
pub use metrics::{CaptureMetrics, MetricsSnapshot, WriteOutcome};
pub use packet::{FlowClassifier, FlowKey, PacketHeader, SkipReason};
pub use recency::RecentCache;
pub use reconcile::{list_clients, load_client_artifacts, reconcile, LoadedArtifacts, ReconcileReport};
pub use service::{CaptureService, CaptureSummary, StopReason};
pub use source::{PacketSource, ReplaySource, SourceError};
pub use store::{open_store, ExpiringStore, MemoryStore, RedisStore, StoreError, StoreResult};
