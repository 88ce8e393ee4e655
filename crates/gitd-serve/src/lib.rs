//! Server side of the git fetch negotiation.
//!
//! Everything here runs over a caller-provided byte pair (the transport is
//! external): ref advertisement, want/have/ACK negotiation, shallow
//! exchange, and the final side-band-wrapped pack stream.

pub mod capability;
pub mod negotiate;
pub mod pktline;
pub mod policy;
pub mod request;
pub mod sendpack;
pub mod sideband;
pub mod v2;

use gitd_hash::ObjectId;

/// Errors raised while serving a fetch RPC.
#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("invalid pkt-line: {0}")]
    InvalidPktLine(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("want {0} not valid")]
    PolicyDenied(ObjectId),

    #[error("peer hung up")]
    ClientAbort,

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Walk(#[from] gitd_walk::WalkError),

    #[error(transparent)]
    Object(#[from] gitd_object::ObjectError),

    #[error(transparent)]
    Pack(#[from] gitd_pack::PackError),

    #[error(transparent)]
    Store(#[from] gitd_store::StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ServeError {
    /// The `ERR` text sent to the peer before the connection ends, when the
    /// error is the peer's fault. Internal failures send nothing specific.
    pub fn wire_message(&self) -> Option<String> {
        match self {
            ServeError::PolicyDenied(oid) => Some(format!("want {oid} not valid")),
            ServeError::Protocol(msg) | ServeError::InvalidPktLine(msg) => {
                Some(msg.clone())
            }
            _ => None,
        }
    }
}
