//! Isolated training baseline
//!
//! Every submitted model is echoed back to its sender only, so workers train
//! in isolation while the coordinator still sees and logs every model.

use super::{BalancingSet, SyncDecision};
use crate::error::{Result, SyncError};
use crate::types::ModelFlags;

/// No synchronization between nodes
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSync;

impl NoSync {
    pub(crate) fn evaluate(&self, set: &mut BalancingSet) -> Result<SyncDecision> {
        if set.len() > 1 {
            return Err(SyncError::Protocol(
                "more than one node sent its model for a no-sync round".to_string(),
            ));
        }
        let (id, slot) = set.first().ok_or_else(|| {
            SyncError::Protocol("no-sync round evaluated with an empty balancing set".to_string())
        })?;
        let param = slot.clone().ok_or_else(|| {
            SyncError::Protocol("no-sync balancing entry carries no parameters".to_string())
        })?;
        Ok(SyncDecision {
            nodes: vec![id.clone()],
            params: Some(param),
            flags: ModelFlags::nosync_echo(),
        })
    }
}
