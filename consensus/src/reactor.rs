//! Per-peer gossip: wire decoding, peer round-state tracking and fan-out of
//! the state machine's outbound events.
//!
//! Inbound frames are decoded and split: round-state bookkeeping messages
//! (`NewRoundStep`, `HasVote`, `VoteSetBits`, `ProposalPOL`, `NewValidBlock`)
//! update the per-peer view here; consensus payloads are pushed into the
//! state-machine queue tagged with the sending peer. Outbound events are
//! filtered per peer so a validator is not sent votes it already holds.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use reimint_types::{
    ConsensusMessage, Height, Round, RoundStep, Vote, VoteType, WireError,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::queue::MessageQueue;
use crate::state_machine::{Event, OutboundEvent, PeerMessage};
use crate::PeerId;

/// Outbound half of the gossip layer, provided by the networking stack.
pub trait PeerTransport: Send + Sync + 'static {
    fn send(&self, peer: &PeerId, message: ConsensusMessage);
}

struct PeerState {
    height: Height,
    round: Round,
    step: RoundStep,
    has_proposal: bool,
    has_proposal_block: bool,
    /// Validator indices this peer is known to hold votes from.
    votes: HashMap<(Round, VoteType), HashSet<u32>>,
}

impl PeerState {
    fn new() -> Self {
        Self {
            height: 0,
            round: 0,
            step: RoundStep::NewHeight,
            has_proposal: false,
            has_proposal_block: false,
            votes: HashMap::new(),
        }
    }

    fn apply_round_step(&mut self, height: Height, round: Round, step: RoundStep) {
        if height != self.height {
            self.votes.clear();
            self.has_proposal = false;
            self.has_proposal_block = false;
        } else if round != self.round {
            self.has_proposal = false;
            self.has_proposal_block = false;
        }
        self.height = height;
        self.round = round;
        self.step = step;
    }

    fn mark_vote(&mut self, round: Round, vote_type: VoteType, index: u32) {
        self.votes.entry((round, vote_type)).or_default().insert(index);
    }

    fn has_vote(&self, round: Round, vote_type: VoteType, index: u32) -> bool {
        self.votes
            .get(&(round, vote_type))
            .is_some_and(|set| set.contains(&index))
    }

    /// Whether a message pinned to `height` is worth sending to this peer.
    fn wants_height(&self, height: Height) -> bool {
        self.height == 0 || self.height == height
    }
}

struct ReactorInner {
    queue: Arc<MessageQueue<Event>>,
    transport: Arc<dyn PeerTransport>,
    peers: Mutex<HashMap<PeerId, PeerState>>,
    last_round_step: Mutex<Option<ConsensusMessage>>,
}

/// Demultiplexes inbound wire messages and fans out state-machine events.
pub struct Reactor {
    inner: Arc<ReactorInner>,
    fanout: JoinHandle<()>,
}

impl Reactor {
    pub fn spawn(
        queue: Arc<MessageQueue<Event>>,
        events: broadcast::Receiver<OutboundEvent>,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        let inner = Arc::new(ReactorInner {
            queue,
            transport,
            peers: Mutex::new(HashMap::new()),
            last_round_step: Mutex::new(None),
        });
        let fanout = tokio::spawn(fanout_loop(Arc::clone(&inner), events));
        Self { inner, fanout }
    }

    pub fn add_peer(&self, peer: PeerId) {
        let mut peers = self.inner.peers.lock().expect("reactor lock poisoned");
        peers.entry(peer.clone()).or_insert_with(PeerState::new);
        drop(peers);

        // Bring the newcomer up to speed on where we are.
        let last = self
            .inner
            .last_round_step
            .lock()
            .expect("reactor lock poisoned")
            .clone();
        if let Some(message) = last {
            self.inner.transport.send(&peer, message);
        }
    }

    pub fn remove_peer(&self, peer: &PeerId) {
        self.inner
            .peers
            .lock()
            .expect("reactor lock poisoned")
            .remove(peer);
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().expect("reactor lock poisoned").len()
    }

    /// Last round state advertised by `peer`, for node status reporting.
    pub fn peer_round_step(&self, peer: &PeerId) -> Option<(Height, Round, RoundStep)> {
        self.inner
            .peers
            .lock()
            .expect("reactor lock poisoned")
            .get(peer)
            .map(|state| (state.height, state.round, state.step))
    }

    /// Decode and dispatch a raw frame from `peer`.
    pub fn handle_message(&self, peer: &PeerId, bytes: &[u8]) -> Result<(), WireError> {
        let message = ConsensusMessage::decode(bytes)?;
        self.handle_decoded(peer, message);
        Ok(())
    }

    pub fn handle_decoded(&self, peer: &PeerId, message: ConsensusMessage) {
        match message {
            ConsensusMessage::NewRoundStep {
                height,
                round,
                step,
                ..
            } => self.with_peer(peer, |state| state.apply_round_step(height, round, step)),
            ConsensusMessage::NewValidBlock { .. } => {
                self.with_peer(peer, |state| state.has_proposal_block = true);
            }
            ConsensusMessage::HasVote {
                round,
                vote_type,
                index,
                ..
            } => self.with_peer(peer, |state| state.mark_vote(round, vote_type, index)),
            ConsensusMessage::VoteSetBits {
                round,
                vote_type,
                votes,
                ..
            } => self.with_peer(peer, |state| {
                for index in votes.iter_ones() {
                    state.mark_vote(round, vote_type, index as u32);
                }
            }),
            ConsensusMessage::ProposalPol {
                pol_round, votes, ..
            } => self.with_peer(peer, |state| {
                for index in votes.iter_ones() {
                    state.mark_vote(pol_round, VoteType::Prevote, index as u32);
                }
            }),
            ConsensusMessage::Proposal(proposal) => {
                self.with_peer(peer, |state| state.has_proposal = true);
                self.forward(peer, PeerMessage::Proposal(proposal));
            }
            ConsensusMessage::ProposalBlock(block) => {
                self.with_peer(peer, |state| state.has_proposal_block = true);
                self.forward(peer, PeerMessage::ProposalBlock(block));
            }
            ConsensusMessage::Vote(vote) => {
                self.with_peer(peer, |state| {
                    state.mark_vote(vote.round, vote.vote_type, vote.validator_index);
                });
                self.forward(peer, PeerMessage::Vote(vote));
            }
            ConsensusMessage::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_hash,
            } => self.forward(
                peer,
                PeerMessage::VoteSetMaj23 {
                    height,
                    round,
                    vote_type,
                    block_hash,
                },
            ),
            ConsensusMessage::GetProposalBlock { block_hash } => {
                self.forward(peer, PeerMessage::GetProposalBlock { block_hash });
            }
        }
    }

    fn forward(&self, peer: &PeerId, message: PeerMessage) {
        self.inner.queue.push(Event::Message {
            peer: Some(peer.clone()),
            message,
        });
    }

    fn with_peer(&self, peer: &PeerId, apply: impl FnOnce(&mut PeerState)) {
        let mut peers = self.inner.peers.lock().expect("reactor lock poisoned");
        let state = peers.entry(peer.clone()).or_insert_with(PeerState::new);
        apply(state);
    }

    /// Stop the fan-out task. Inbound handling needs no shutdown.
    pub fn stop(&self) {
        self.fanout.abort();
    }
}

async fn fanout_loop(inner: Arc<ReactorInner>, mut events: broadcast::Receiver<OutboundEvent>) {
    loop {
        match events.recv().await {
            Ok(OutboundEvent::Broadcast(message)) => inner.broadcast(message),
            Ok(OutboundEvent::SendTo { peer, message }) => inner.transport.send(&peer, message),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "gossip fan-out lagged behind the state machine");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("gossip fan-out stopped");
}

impl ReactorInner {
    fn broadcast(&self, message: ConsensusMessage) {
        let mut peers = self.peers.lock().expect("reactor lock poisoned");
        match &message {
            ConsensusMessage::NewRoundStep { .. } => {
                *self
                    .last_round_step
                    .lock()
                    .expect("reactor lock poisoned") = Some(message.clone());
                for peer in peers.keys() {
                    self.transport.send(peer, message.clone());
                }
            }
            ConsensusMessage::Vote(vote) => {
                for (peer, state) in peers.iter_mut() {
                    if self.should_send_vote(state, vote) {
                        state.mark_vote(vote.round, vote.vote_type, vote.validator_index);
                        self.transport.send(peer, message.clone());
                    }
                }
            }
            ConsensusMessage::Proposal(proposal) => {
                for (peer, state) in peers.iter_mut() {
                    if state.wants_height(proposal.height) && !state.has_proposal {
                        state.has_proposal = true;
                        self.transport.send(peer, message.clone());
                    }
                }
            }
            ConsensusMessage::ProposalBlock(block) => {
                for (peer, state) in peers.iter_mut() {
                    if state.wants_height(block.number()) && !state.has_proposal_block {
                        state.has_proposal_block = true;
                        self.transport.send(peer, message.clone());
                    }
                }
            }
            ConsensusMessage::VoteSetMaj23 { height, .. }
            | ConsensusMessage::NewValidBlock { height, .. } => {
                for (peer, state) in peers.iter() {
                    if state.wants_height(*height) {
                        self.transport.send(peer, message.clone());
                    }
                }
            }
            _ => {
                for peer in peers.keys() {
                    self.transport.send(peer, message.clone());
                }
            }
        }
    }

    fn should_send_vote(&self, state: &PeerState, vote: &Vote) -> bool {
        state.wants_height(vote.height)
            && !state.has_vote(vote.round, vote.vote_type, vote.validator_index)
    }
}
