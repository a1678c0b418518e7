//! Media session core of a small-group video room: local capture, effect processing and a full mesh of peer
//! connections, driven by a single [`SessionController`].

#[macro_use]
extern crate tracing;

pub mod controller;
pub mod devices;
pub mod error;
pub mod feeds;
pub mod id;
pub mod media;
pub mod peer;
pub mod pipeline;
pub mod roster;
pub mod signaling;
pub mod transport;

pub use controller::{
    SessionController,
    SessionLifecycle,
};
pub use devices::{
    DeviceManager,
    FakeBackend,
};
pub use error::{
    ConnectionError,
    DeviceError,
    SessionError,
    SignalingError,
    StageError,
};
pub use id::PeerId;
pub use peer::{
    ConnectionState,
    PeerPool,
    PoolEvent,
    QualityTag,
};
pub use pipeline::{
    MediaPipeline,
    StageKind,
};
pub use roster::{
    Participant,
    Role,
    RosterSource,
    StaticRoster,
};
