//! Customized unified error type, tagged with the failure kind that the
//! coordinator and transfer engine report back to callers.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

use serde::{Deserialize, Serialize};

/// Kind of failure carried by a `StrataError`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// No resource hierarchy could be chosen for the request.
    ResourceResolution,
    /// Requested data object or replica does not exist.
    ReplicaNotFound,
    /// Conflicting lock held on the data object.
    ReplicaLocked,
    /// Replica is intermediate and no valid access token was presented.
    IntermediateReplicaAccess,
    /// Presented access token does not match the replica.
    AccessTokenInvalid,
    /// Catalog rejected a write.
    CatalogWrite,
    /// Storage driver or socket I/O failed.
    PhysicalIo,
    /// Bytes moved do not match the expected total.
    LengthMismatch,
    /// Encrypting or decrypting a record failed.
    Encryption,
    /// Cookie mismatch, malformed header, or unexpected record.
    PortalProtocol,
    /// Data object already staged in the replica state table.
    AlreadyStaged,
    /// Data object not staged in the replica state table.
    NotStaged,
    /// Put onto an existing replica without the force flag.
    OverwriteWithoutForceFlag,
    /// Forced put onto a resource holding none of the object's replicas.
    HierarchyError,
    /// Computed checksum differs from the one supplied by the client.
    ChecksumMismatch,
    /// A policy pre-hook refused the operation.
    HookRejected,
    /// Malformed request or configuration.
    InvalidInput,
    /// Destination resource already holds a good replica.
    AlreadyInResource,
    /// Broken internal invariant (bad handle, missing descriptor, ...).
    Internal,
}

/// Customized error type for Strata.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct StrataError {
    kind: ErrorKind,
    msg: String,
}

impl StrataError {
    /// Error of kind `Internal` with given message.
    pub fn msg(msg: impl ToString) -> Self {
        StrataError {
            kind: ErrorKind::Internal,
            msg: msg.to_string(),
        }
    }

    pub fn new(kind: ErrorKind, msg: impl ToString) -> Self {
        StrataError {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Returns true if this error is of given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for StrataError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `StrataError`, tagging
// each with the kind it stands for.
macro_rules! impl_from_error {
    ($error:ty => $kind:ident) => {
        impl From<$error> for StrataError {
            fn from(e: $error) -> Self {
                StrataError::new(ErrorKind::$kind, e)
            }
        }
    };
}

impl_from_error!(io::Error => PhysicalIo);
impl_from_error!(string::FromUtf8Error => InvalidInput);
impl_from_error!(num::ParseIntError => InvalidInput);
impl_from_error!(net::AddrParseError => InvalidInput);
impl_from_error!(toml::de::Error => InvalidInput);
impl_from_error!(rmp_serde::encode::Error => CatalogWrite);
impl_from_error!(rmp_serde::decode::Error => CatalogWrite);
impl_from_error!(tokio::task::JoinError => Internal);
impl_from_error!(tokio::time::error::Elapsed => PortalProtocol);
