pub mod classifier;
pub mod orchestrator;
pub mod profiles;
pub mod types;

pub use classifier::{PoolCandidate, classify, matches_creation_logs};
pub use orchestrator::{DetectorConfig, DetectorState, PoolDetector, PoolSnapshotSource};
pub use profiles::{ExchangeProfile, default_profiles, load_profiles};
pub use types::{
    DetectionEvent, DetectionEventKind, DetectionSource, DexKind, Notice, NoticeKind, PoolRecord,
};
