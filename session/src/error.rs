//! Failure taxonomy. Every failure is scoped to a device request, a single connection or a single stage.

use crate::{
    id::PeerId,
    media::TrackKind,
    pipeline::StageKind,
};
use meshcall_config::InvalidConfig;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("device enumeration denied by the platform")]
    EnumerationDenied,
    #[error("permission denied for {0}")]
    PermissionDenied(TrackKind),
    #[error("{kind} device not found: {id}")]
    DeviceNotFound { kind: TrackKind, id: String },
    #[error("{kind} device in use: {id}")]
    DeviceInUse { kind: TrackKind, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("negotiation with {peer} failed: {reason}")]
    NegotiationFailed { peer: PeerId, reason: String },
    #[error("connectivity to {0} lost")]
    ConnectivityLost(PeerId),
    #[error("gave up reconnecting to {peer} after {attempts} ICE restarts")]
    ReconnectExhausted { peer: PeerId, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    #[error("{kind} stage failed to load: {reason}")]
    LoadFailed { kind: StageKind, reason: String },
    #[error("{kind} stage failed while processing: {reason}")]
    RuntimeError { kind: StageKind, reason: String },
    #[error("{0} stage load was cancelled")]
    Cancelled(StageKind),
    #[error("{0} stage is not attached")]
    NotAttached(StageKind),
    #[error("{kind} config does not apply to the {expected} stage")]
    WrongKind { kind: StageKind, expected: StageKind },
    #[error(transparent)]
    InvalidConfig(#[from] InvalidConfig),
}

impl StageError {
    pub fn kind(&self) -> Option<StageKind> {
        match self {
            StageError::LoadFailed { kind, .. } | StageError::RuntimeError { kind, .. } => Some(*kind),
            StageError::Cancelled(kind) | StageError::NotAttached(kind) => Some(*kind),
            StageError::WrongKind { expected, .. } => Some(*expected),
            StageError::InvalidConfig(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    Disconnected,
    #[error("peer {0} is not in the room")]
    UnknownPeer(PeerId),
    #[error("not joined to a room")]
    NotJoined,
    #[error("failed to encode signaling message: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("malformed session description: {0}")]
    InvalidDescription(String),
    #[error("no local description to answer against")]
    MissingLocalDescription,
    #[error("transport is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("no room code available from the roster")]
    NoRoom,
}
