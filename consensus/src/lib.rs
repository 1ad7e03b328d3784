//! The Reimint consensus core: a height/round/step state machine with
//! prevote/precommit two-phase commit, lock/unlock semantics, duplicate-vote
//! evidence, a monotonic timeout ticker and per-peer gossip.
//!
//! The state machine runs as a single cooperative loop over a bounded event
//! queue; the timeout ticker, the gossip reactor and the block pipeline feed
//! it through typed channels and never share its mutable state.

pub mod config;
pub mod engine;
pub mod evidence_pool;
pub mod height_vote_set;
pub mod pipeline;
pub mod queue;
pub mod reactor;
pub mod round_state;
pub mod state_machine;
pub mod timeout;
pub mod validator_cache;
pub mod vote_set;

pub use config::ConsensusConfig;
pub use engine::ReimintEngine;
pub use evidence_pool::{EvidencePool, EvidencePoolError, StoreError};
pub use height_vote_set::{HeightVoteSet, HeightVoteSetError};
pub use pipeline::BlockPipeline;
pub use queue::MessageQueue;
pub use reactor::{PeerTransport, Reactor};
pub use round_state::RoundState;
pub use state_machine::{
    Event, OutboundEvent, PeerMessage, StateMachine, StateMachineHandle,
};
pub use timeout::{TimeoutInfo, TimeoutTicker};
pub use validator_cache::ValidatorSetCache;
pub use vote_set::{ConflictingVotes, VoteSet, VoteSetError};

/// Opaque network identity of a peer, as handed to us by the gossip layer.
pub type PeerId = String;

/// Milliseconds since the Unix epoch, the timestamp format votes carry.
pub(crate) fn unix_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
