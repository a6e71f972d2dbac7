use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dealflow_core::{BlockScope, BlockSource, BlockStatus, Clock, KillSwitchEntry};
use dealflow_storage::{AnalysisStore, StoreResult};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyBlock {
    pub subject_id: &'static str,
    pub reason: &'static str,
}

/// Compiled-in blocks. These cannot be lifted at runtime; use the blocklist
/// table for anything new.
pub const EMERGENCY_BLOCKS: &[EmergencyBlock] = &[EmergencyBlock {
    subject_id: "deal-7c1f02e4",
    reason: "runaway enrichment loop; halted pending incident review",
}];

/// Runtime on/off switch for dispatch, shared by the scheduler and operators.
#[derive(Debug)]
pub struct ControlState {
    enabled: AtomicBool,
}

impl ControlState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new(true)
    }
}

pub struct KillSwitch {
    store: Arc<dyn AnalysisStore>,
    control: Arc<ControlState>,
    clock: Arc<dyn Clock>,
    emergency: &'static [EmergencyBlock],
}

impl KillSwitch {
    pub fn new(
        store: Arc<dyn AnalysisStore>,
        control: Arc<ControlState>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_emergency_blocks(store, control, clock, EMERGENCY_BLOCKS)
    }

    pub fn with_emergency_blocks(
        store: Arc<dyn AnalysisStore>,
        control: Arc<ControlState>,
        clock: Arc<dyn Clock>,
        emergency: &'static [EmergencyBlock],
    ) -> Self {
        Self {
            store,
            control,
            clock,
            emergency,
        }
    }

    /// Emergency list, then subject-scoped table entries, then the subject's
    /// own `blocked_until`. First match wins.
    pub async fn is_blocked(&self, subject_id: &str) -> StoreResult<BlockStatus> {
        if let Some(block) = self.emergency.iter().find(|b| b.subject_id == subject_id) {
            return Ok(BlockStatus::blocked(
                BlockSource::Emergency,
                block.reason,
                None,
            ));
        }

        let now = self.clock.now();
        let scope = BlockScope::Subject(subject_id.to_string());
        if let Some(entry) = self.store.active_blocks(&scope, now).await?.into_iter().next() {
            return Ok(BlockStatus::blocked(
                BlockSource::Blocklist,
                entry.reason,
                entry.blocked_until,
            ));
        }

        if let Some(subject) = self.store.get_subject(subject_id).await? {
            if let Some(until) = subject.blocked_until.filter(|until| *until > now) {
                let reason = subject
                    .block_reason
                    .unwrap_or_else(|| "subject analysis suspended".to_string());
                return Ok(BlockStatus::blocked(
                    BlockSource::SubjectField,
                    reason,
                    Some(until),
                ));
            }
        }

        Ok(BlockStatus::clear())
    }

    pub async fn system_disabled(&self) -> StoreResult<bool> {
        if !self.control.is_enabled() {
            return Ok(true);
        }
        let global = self
            .store
            .active_blocks(&BlockScope::Global, self.clock.now())
            .await?;
        Ok(!global.is_empty())
    }

    pub fn emergency_subjects(&self) -> HashSet<String> {
        self.emergency
            .iter()
            .map(|b| b.subject_id.to_string())
            .collect()
    }

    pub async fn block(
        &self,
        scope: BlockScope,
        reason: impl Into<String>,
        blocked_until: Option<DateTime<Utc>>,
    ) -> StoreResult<KillSwitchEntry> {
        let entry = KillSwitchEntry {
            id: Uuid::new_v4(),
            scope,
            reason: reason.into(),
            blocked_until,
            created_at: self.clock.now(),
        };
        self.store.add_block(&entry).await?;
        warn!(
            id = %entry.id,
            scope = %entry.scope,
            reason = %entry.reason,
            "kill-switch entry added"
        );
        Ok(entry)
    }

    pub async fn unblock(&self, id: Uuid) -> StoreResult<bool> {
        let removed = self.store.remove_block(id).await?;
        if removed {
            info!(%id, "kill-switch entry removed");
        }
        Ok(removed)
    }

    /// Suspend one subject through its own config row until `until`.
    pub async fn suspend_subject(
        &self,
        subject_id: &str,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> StoreResult<()> {
        self.store
            .set_subject_block(subject_id, until, reason, self.clock.now())
            .await?;
        Ok(())
    }

    pub async fn list(&self) -> StoreResult<Vec<KillSwitchEntry>> {
        self.store.list_blocks().await
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.control.set_enabled(enabled);
        if enabled {
            info!("analysis dispatch enabled");
        } else {
            warn!("analysis dispatch disabled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }
}
