// Branch sessions and their persisted forms.

use serde::{Deserialize, Serialize};

use crate::common::{BranchId, TransactionId};
use crate::error::{CoordinatorError, CoordinatorResult};

use super::types::{BranchStatus, BranchType};

/// One branch enlisted under a global transaction.
///
/// Branches are referred to from outside their global by `(xid, branch_id)`;
/// inside the global they form an owned ordered sequence whose insertion
/// order defines commit order.
#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub struct BranchSession {
    pub xid: String,
    pub branch_id: BranchId,
    pub transaction_id: TransactionId,
    pub branch_type: BranchType,
    pub resource_id: String,
    pub resource_group_id: Option<String>,
    pub client_id: Option<String>,
    pub application_data: Option<String>,
    /// Row-lock keys held by this branch. Runtime state only: the keys are
    /// owned by the lock capability and are not part of the stored value.
    pub lock_key: Option<String>,
    pub status: BranchStatus,
}

impl BranchSession {
    /// Creates a freshly registered branch.
    pub fn new(
        xid: impl Into<String>,
        branch_id: BranchId,
        transaction_id: TransactionId,
        branch_type: BranchType,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            xid: xid.into(),
            branch_id,
            transaction_id,
            branch_type,
            resource_id: resource_id.into(),
            resource_group_id: None,
            client_id: None,
            application_data: None,
            lock_key: None,
            status: BranchStatus::Registered,
        }
    }

    /// Whether phase-two commit of this branch may be deferred.
    #[inline]
    pub fn can_be_committed_async(&self) -> bool {
        self.branch_type.can_be_committed_async()
    }

    /// Binary form used by consensus entries and snapshots.
    pub fn encode(&self) -> CoordinatorResult<Vec<u8>> {
        Ok(bincode::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Inverse of [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> CoordinatorResult<Self> {
        let (branch, _) = bincode::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(branch)
    }
}

/// Stored value of a branch session in the key-value backend.
///
/// Field names and the integer status code are the JSON contract shared with
/// existing deployments. Lock keys are not stored here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchTransactionDo {
    pub xid: String,
    pub branch_id: BranchId,
    pub branch_type: String,
    pub client_id: Option<String>,
    pub resource_group_id: Option<String>,
    pub transaction_id: TransactionId,
    pub application_data: Option<String>,
    pub resource_id: String,
    pub status: i32,
}

impl BranchTransactionDo {
    /// Builds the stored value from a live branch session.
    pub fn from_session(branch: &BranchSession) -> Self {
        Self {
            xid: branch.xid.clone(),
            branch_id: branch.branch_id,
            branch_type: branch.branch_type.as_str().to_string(),
            client_id: branch.client_id.clone(),
            resource_group_id: branch.resource_group_id.clone(),
            transaction_id: branch.transaction_id,
            application_data: branch.application_data.clone(),
            resource_id: branch.resource_id.clone(),
            status: branch.status.code(),
        }
    }

    /// Rebuilds a branch session from the stored value.
    pub fn into_session(self) -> CoordinatorResult<BranchSession> {
        let branch_type = BranchType::from_name(&self.branch_type).ok_or_else(|| {
            CoordinatorError::Serialization(format!("unknown branch type '{}'", self.branch_type))
        })?;
        let status = BranchStatus::from_code(self.status).ok_or_else(|| {
            CoordinatorError::Serialization(format!("unknown branch status code {}", self.status))
        })?;
        Ok(BranchSession {
            xid: self.xid,
            branch_id: self.branch_id,
            transaction_id: self.transaction_id,
            branch_type,
            resource_id: self.resource_id,
            resource_group_id: self.resource_group_id,
            client_id: self.client_id,
            application_data: self.application_data,
            lock_key: None,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_branch() -> BranchSession {
        let mut branch = BranchSession::new("tc-a:1", 2, 1, BranchType::At, "jdbc:order_db");
        branch.client_id = Some("order-svc".to_string());
        branch.lock_key = Some("order:pk_1,pk_2".to_string());
        branch
    }

    #[test]
    fn test_binary_round_trip_keeps_lock_key() {
        let branch = sample_branch();
        let decoded = BranchSession::decode(&branch.encode().unwrap()).unwrap();
        assert_eq!(decoded, branch);
        assert_eq!(decoded.lock_key.as_deref(), Some("order:pk_1,pk_2"));
    }

    #[test]
    fn test_stored_value_field_names() {
        let value = serde_json::to_value(BranchTransactionDo::from_session(&sample_branch())).unwrap();
        assert_eq!(value["branchId"], 2);
        assert_eq!(value["branchType"], "AT");
        assert_eq!(value["resourceId"], "jdbc:order_db");
        assert_eq!(value["status"], 1);
        assert!(value.get("lockKey").is_none());
    }

    #[test]
    fn test_stored_value_round_trip_drops_lock_key() {
        let branch = sample_branch();
        let rebuilt = BranchTransactionDo::from_session(&branch)
            .into_session()
            .unwrap();
        assert_eq!(rebuilt.branch_id, branch.branch_id);
        assert_eq!(rebuilt.status, branch.status);
        assert_eq!(rebuilt.lock_key, None);
    }

    #[test]
    fn test_unknown_status_code_rejected() {
        let mut value = BranchTransactionDo::from_session(&sample_branch());
        value.status = 99;
        assert!(value.into_session().is_err());
    }
}
