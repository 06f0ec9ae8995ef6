pub mod controller;
pub mod cooldown;
pub mod dedup;
pub mod pipeline;
pub mod store;
pub mod transport;

pub use controller::{ConnectionController, ConnectionSnapshot, ConnectionStatus};
pub use cooldown::{Admission, StopCooldownGuard};
pub use dedup::DedupCache;
pub use pipeline::{
    AnalysisOutcome, AnalysisSink, PipelineEvent, ScreenshotIngestionPipeline, Tier, TierPolicy,
};
pub use store::{PairingStore, StoredPairing};
pub use transport::{RelayTransport, TransportEvent, reconnect_delay_ms};
