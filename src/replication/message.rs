// Session-sync log entries.
//
// Each consensus entry is one `SessionSyncMessage`: a message type, the name
// of the destination session map (absent means root), and a type-specific
// payload in the shared binary encoding. Leader and followers must agree on
// the encoding; everything else about the entry is opaque to the consensus
// service.

use crate::common::BranchId;
use crate::error::CoordinatorResult;
use crate::session::{BranchSession, BranchStatus, GlobalSession, GlobalStatus};
use crate::store::SessionQueue;

/// Discriminator of a session-sync entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum SyncMsgType {
    AddGlobalSession,
    UpdateGlobalSessionStatus,
    RemoveGlobalSession,
    AddBranchSession,
    UpdateBranchSessionStatus,
    RemoveBranchSession,
    AcquireLock,
    ReleaseGlobalSessionLock,
    DoCommit,
    DoRollback,
}

/// One replicated coordinator mutation.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct SessionSyncMessage {
    pub msg_type: SyncMsgType,
    /// Destination session map; `None` is the root map.
    pub queue_name: Option<String>,
    /// Type-specific payload bytes.
    pub payload: Vec<u8>,
}

/// Payload of a global status transition.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct GlobalStatusDo {
    pub xid: String,
    pub status: GlobalStatus,
}

/// Payload of a global removal or a global lock release.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct XidDo {
    pub xid: String,
}

/// Payload of a branch status transition.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct BranchStatusDo {
    pub xid: String,
    pub branch_id: BranchId,
    pub status: BranchStatus,
}

/// Payload of a branch removal.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct BranchRefDo {
    pub xid: String,
    pub branch_id: BranchId,
}

/// Payload of a phase-two outcome: the branch statuses observed by the
/// leader's driver, applied as the same terminal transitions on followers.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct PhaseTwoDo {
    pub xid: String,
    pub status: GlobalStatus,
    pub branch_statuses: Vec<(BranchId, BranchStatus)>,
}

fn queue_name(queue: SessionQueue) -> Option<String> {
    match queue {
        SessionQueue::Root => None,
        other => Some(other.name().to_string()),
    }
}

fn encode_payload<T: bincode::Encode>(payload: &T) -> CoordinatorResult<Vec<u8>> {
    Ok(bincode::encode_to_vec(payload, bincode::config::standard())?)
}

impl SessionSyncMessage {
    /// Binary form appended to the consensus log.
    pub fn encode(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> CoordinatorResult<Self> {
        let (message, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(message)
    }

    /// Destination map of this entry.
    pub fn queue(&self) -> SessionQueue {
        SessionQueue::from_name(self.queue_name.as_deref())
    }

    /// Decodes the type-specific payload.
    pub fn payload<T: bincode::Decode<()>>(&self) -> CoordinatorResult<T> {
        let (payload, _) = bincode::decode_from_slice(&self.payload, bincode::config::standard())?;
        Ok(payload)
    }

    pub fn add_global(queue: SessionQueue, session: &GlobalSession) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::AddGlobalSession,
            queue_name: queue_name(queue),
            payload: session.encode()?,
        })
    }

    pub fn update_global_status(xid: &str, status: GlobalStatus) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::UpdateGlobalSessionStatus,
            queue_name: None,
            payload: encode_payload(&GlobalStatusDo {
                xid: xid.to_string(),
                status,
            })?,
        })
    }

    pub fn remove_global(queue: SessionQueue, xid: &str) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::RemoveGlobalSession,
            queue_name: queue_name(queue),
            payload: encode_payload(&XidDo {
                xid: xid.to_string(),
            })?,
        })
    }

    pub fn add_branch(branch: &BranchSession) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::AddBranchSession,
            queue_name: None,
            payload: branch.encode()?,
        })
    }

    pub fn update_branch_status(
        xid: &str,
        branch_id: BranchId,
        status: BranchStatus,
    ) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::UpdateBranchSessionStatus,
            queue_name: None,
            payload: encode_payload(&BranchStatusDo {
                xid: xid.to_string(),
                branch_id,
                status,
            })?,
        })
    }

    pub fn remove_branch(xid: &str, branch_id: BranchId) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::RemoveBranchSession,
            queue_name: None,
            payload: encode_payload(&BranchRefDo {
                xid: xid.to_string(),
                branch_id,
            })?,
        })
    }

    pub fn acquire_lock(branch: &BranchSession) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::AcquireLock,
            queue_name: None,
            payload: branch.encode()?,
        })
    }

    pub fn release_global_lock(xid: &str) -> CoordinatorResult<Self> {
        Ok(Self {
            msg_type: SyncMsgType::ReleaseGlobalSessionLock,
            queue_name: None,
            payload: encode_payload(&XidDo {
                xid: xid.to_string(),
            })?,
        })
    }

    pub fn phase_two(
        msg_type: SyncMsgType,
        xid: &str,
        status: GlobalStatus,
        branch_statuses: Vec<(BranchId, BranchStatus)>,
    ) -> CoordinatorResult<Self> {
        debug_assert!(matches!(
            msg_type,
            SyncMsgType::DoCommit | SyncMsgType::DoRollback
        ));
        Ok(Self {
            msg_type,
            queue_name: None,
            payload: encode_payload(&PhaseTwoDo {
                xid: xid.to_string(),
                status,
                branch_statuses,
            })?,
        })
    }
}
