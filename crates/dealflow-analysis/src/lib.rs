//! Scheduling, waterfall completion, zombie reclamation, conflict guarding
//! and kill-switches for the analysis pipeline.

pub mod config;
pub mod conflict;
pub mod kill_switch;
pub mod queue;
pub mod reclaimer;
pub mod scheduler;
pub mod services;
pub mod waterfall;

pub use config::{AnalysisConfig, EngineSpec, RuntimeConfig};
pub use conflict::{ConflictGuard, SafeUpdateError, SafeUpdateOutcome};
pub use kill_switch::{ControlState, EmergencyBlock, KillSwitch, EMERGENCY_BLOCKS};
pub use queue::{AnalysisQueue, EnqueueError, EnqueueRequest};
pub use reclaimer::ZombieReclaimer;
pub use scheduler::{Scheduler, TickPhase};
pub use services::{AnalysisServices, Collaborators};
pub use waterfall::{score_results, WaterfallPolicy, WaterfallTracker};

pub const CRATE_NAME: &str = "dealflow-analysis";
