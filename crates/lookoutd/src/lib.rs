//! lookoutd: peer sessions, connection manager and output sink.

pub mod manager;
pub mod peer;
pub mod sink;

pub use manager::{Manager, ManagerConfig, PeerCounters, PeerIndex};
pub use peer::{Direction, Peer, PeerConfig, PeerError, PeerEvent, PeerState};
pub use sink::{ChannelSink, MessageSink, NullSink, Recorder};
