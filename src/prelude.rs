//! Convenient re-exports for common usage.

pub use crate::env::{ActionMap, BotPolicy, Environment, ServerEnvironment, StepOutcome};
pub use crate::episode_sync::{EpisodeSync, SyncPhase};
pub use crate::error::EngineError;
pub use crate::focus::{FixedStepTicks, FocusTracker, TickSource};
pub use crate::frame_info::{EpisodeExport, FrameRecord, SessionStatus, TerminationReason};
pub use crate::network::hub::TransportHub;
pub use crate::network::messages::{ClientMessage, ServerMessage};
pub use crate::rollback::{
    DataChannel, EngineConfig, EngineEvent, NullChannel, RollbackEngine, TickReport,
};
pub use crate::server::admin::AdminAggregator;
pub use crate::server::config::{ExperimentConfig, MultiplayerConfig};
pub use crate::server::export::ExportSink;
pub use crate::server::matchmaker::Matchmaker;
pub use crate::server::probe::{ProbeCoordinator, ProbeRunner};
pub use crate::server::registry::{EligibilityPolicy, ParticipantRegistry};
pub use crate::server::supervisor::{SessionConfig, SessionSupervisor};
pub use crate::{
    ConnectionId, Frame, IceState, PlayerId, ProbeId, SessionId, SessionMode, SubjectId,
};
