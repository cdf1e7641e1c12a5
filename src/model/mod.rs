//! Replica model: data objects and their replicas. Pure data plus the
//! invariant helpers the coordinator relies on.

mod object;
mod replica;

pub use object::{split_logical_path, under_collection, DataObject};
pub use replica::{
    now_secs, DataId, Hierarchy, Replica, ReplicaNumber, ReplicaStatus,
    ResourceId,
};
