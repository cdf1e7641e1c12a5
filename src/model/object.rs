//! Data object: a logical path owning an ordered list of replicas.

use serde::{Deserialize, Serialize};

use crate::model::{DataId, Hierarchy, Replica, ReplicaNumber, ReplicaStatus};
use crate::utils::{ErrorKind, StrataError};

/// Validates a zone-rooted logical path `/zone/coll/.../name` and splits it
/// into (collection, name).
pub fn split_logical_path(path: &str) -> Result<(&str, &str), StrataError> {
    let invalid = || {
        StrataError::new(
            ErrorKind::InvalidInput,
            format!("invalid logical path '{}'", path),
        )
    };
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(invalid());
    }
    let idx = path.rfind('/').ok_or_else(invalid)?;
    if idx == 0 {
        // a bare zone is a collection, not an object
        return Err(invalid());
    }
    Ok((&path[..idx], &path[idx + 1..]))
}

/// Returns true if `path` lies under collection `coll` (at any depth).
pub fn under_collection(path: &str, coll: &str) -> bool {
    let coll = coll.trim_end_matches('/');
    path.len() > coll.len()
        && path.starts_with(coll)
        && path.as_bytes()[coll.len()] == b'/'
}

/// A logical file known to the catalog.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct DataObject {
    pub data_id: DataId,
    pub logical_path: String,

    /// Replicas in catalog order; front-insertion marks the replica a
    /// session is targeting.
    pub replicas: Vec<Replica>,
}

impl DataObject {
    pub fn new(data_id: DataId, logical_path: impl ToString) -> Self {
        DataObject {
            data_id,
            logical_path: logical_path.to_string(),
            replicas: vec![],
        }
    }

    /// Builds an object out of catalog rows that all share a data id.
    pub fn from_replicas(replicas: Vec<Replica>) -> Option<Self> {
        let first = replicas.first()?;
        Some(DataObject {
            data_id: first.data_id,
            logical_path: first.logical_path.clone(),
            replicas,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn find_replica(&self, hierarchy: &Hierarchy) -> Option<&Replica> {
        self.replicas.iter().find(|r| &r.hierarchy == hierarchy)
    }

    pub fn replica(&self, replica_number: ReplicaNumber) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.replica_number == replica_number)
    }

    pub fn replica_mut(
        &mut self,
        replica_number: ReplicaNumber,
    ) -> Option<&mut Replica> {
        self.replicas
            .iter_mut()
            .find(|r| r.replica_number == replica_number)
    }

    /// Puts a replica at the front, replacing any existing entry with the
    /// same replica number.
    pub fn push_front(&mut self, replica: Replica) {
        self.replicas
            .retain(|r| r.replica_number != replica.replica_number);
        self.replicas.insert(0, replica);
    }

    /// First replica whose status is `Good`.
    pub fn first_good(&self) -> Option<&Replica> {
        self.replicas
            .iter()
            .find(|r| r.status == ReplicaStatus::Good)
    }

    /// Returns true if any replica blocks an open of given mode, skipping
    /// `except` (the replica the caller is authorized on).
    pub fn locked_against(
        &self,
        write: bool,
        except: Option<ReplicaNumber>,
    ) -> bool {
        self.replicas
            .iter()
            .filter(|r| Some(r.replica_number) != except)
            .any(|r| r.status.conflicts_with(write))
    }

    pub fn next_replica_number(&self) -> ReplicaNumber {
        self.replicas
            .iter()
            .map(|r| r.replica_number + 1)
            .max()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod object_tests {
    use super::*;

    fn replica(num: ReplicaNumber, leaf: &str, status: ReplicaStatus) -> Replica {
        let mut r = Replica::speculative(
            "/z/home/u/f",
            Hierarchy::single(leaf),
            num as u64 + 10,
            format!("/vault/{}/f", leaf),
            "generic",
            0o600,
        );
        r.data_id = 7;
        r.replica_number = num;
        r.status = status;
        r
    }

    #[test]
    fn logical_path_split() -> Result<(), StrataError> {
        assert_eq!(split_logical_path("/z/home/u/f")?, ("/z/home/u", "f"));
        assert!(split_logical_path("z/home/f").is_err());
        assert!(split_logical_path("/z/home/").is_err());
        assert!(split_logical_path("/z").is_err());
        assert!(split_logical_path("/z//f").is_err());
        Ok(())
    }

    #[test]
    fn collection_membership() {
        assert!(under_collection("/z/home/u/f", "/z/home"));
        assert!(under_collection("/z/home/u/f", "/z/home/"));
        assert!(!under_collection("/z/homework/f", "/z/home"));
        assert!(!under_collection("/z/home", "/z/home"));
    }

    #[test]
    fn lookup_and_front_insert() {
        let mut obj = DataObject::from_replicas(vec![
            replica(0, "ufs0", ReplicaStatus::Good),
            replica(1, "ufs1", ReplicaStatus::Stale),
        ])
        .unwrap();
        assert_eq!(obj.data_id, 7);
        assert_eq!(
            obj.find_replica(&Hierarchy::single("ufs1"))
                .map(|r| r.replica_number),
            Some(1)
        );
        assert!(obj.find_replica(&Hierarchy::single("ufs9")).is_none());
        assert_eq!(obj.next_replica_number(), 2);

        let mut r1 = obj.replica(1).unwrap().clone();
        r1.status = ReplicaStatus::Intermediate;
        obj.push_front(r1);
        assert_eq!(obj.replicas.len(), 2);
        assert_eq!(obj.replicas[0].replica_number, 1);
        assert_eq!(obj.first_good().map(|r| r.replica_number), Some(0));
    }

    #[test]
    fn lock_check_skips_authorized() {
        let obj = DataObject::from_replicas(vec![
            replica(0, "ufs0", ReplicaStatus::Intermediate),
            replica(1, "ufs1", ReplicaStatus::WriteLocked),
        ])
        .unwrap();
        assert!(obj.locked_against(false, None));
        assert!(obj.locked_against(true, Some(0)));
        assert!(!obj.locked_against(true, Some(1)));
    }
}
