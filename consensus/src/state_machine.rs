//! The height/round/step consensus driver.
//!
//! One cooperative loop consumes events (peer messages, timeouts, new block
//! headers) from a bounded queue and walks the round through
//! `Propose → Prevote → Precommit → Commit`, honoring lock/unlock semantics
//! and valid-block reuse across rounds. All transitions run serially; the
//! only suspension points are the queue itself, pending-block builds and
//! `commit_block`.
//!
//! Self-produced artifacts (our proposal, its block, our votes) are pushed
//! back into the same queue so one code path handles them, ours or a peer's.

use core::time::Duration;
use std::sync::Arc;

use alloy_consensus::Header;
use alloy_primitives::B256;
use color_eyre::eyre::{self, bail, ensure};
use reimint_types::{
    calc_block_hash, is_nil, proposal_sign_hash, vote_sign_hash, Block, ConsensusMessage,
    DuplicateVoteEvidence, ExtraData, Height, PartSetHeader, Proposal, Round, RoundStep,
    ValidatorSet, Vote, VoteType, NIL_HASH,
};
use reimint_types::extra_data::calc_block_hash_with_evidence;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConsensusConfig;
use crate::evidence_pool::EvidencePool;
use crate::height_vote_set::HeightVoteSetError;
use crate::pipeline::BlockPipeline;
use crate::queue::MessageQueue;
use crate::round_state::RoundState;
use crate::timeout::{TimeoutInfo, TimeoutTicker};
use crate::vote_set::VoteSetError;
use crate::{unix_ms, PeerId};

/// Peer payloads the state machine consumes; the reactor keeps the rest.
#[derive(Clone, Debug)]
pub enum PeerMessage {
    Proposal(Proposal),
    ProposalBlock(Block),
    Vote(Vote),
    VoteSetMaj23 {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_hash: B256,
    },
    GetProposalBlock {
        block_hash: B256,
    },
}

/// Everything that can enter the consensus loop.
#[derive(Debug)]
pub enum Event {
    /// A message from a peer, or from ourselves when `peer` is `None`.
    Message {
        peer: Option<PeerId>,
        message: PeerMessage,
    },
    Timeout(TimeoutInfo),
    /// Block `header` was persisted; start deciding the next height with the
    /// given validator set.
    NewBlockHeader {
        header: Header,
        validators: ValidatorSet,
    },
}

/// Notifications for the gossip layer.
#[derive(Clone, Debug)]
pub enum OutboundEvent {
    Broadcast(ConsensusMessage),
    SendTo {
        peer: PeerId,
        message: ConsensusMessage,
    },
}

pub struct StateMachine {
    chain_id: u64,
    config: ConsensusConfig,
    pipeline: Arc<dyn BlockPipeline>,
    evidence: EvidencePool,
    queue: Arc<MessageQueue<Event>>,
    ticker: TimeoutTicker,
    events: broadcast::Sender<OutboundEvent>,
    rs: RoundState,
    /// Consensus hash of the previous block; proposals build on it.
    parent_hash: B256,
    last_commit_round: Option<Round>,
}

/// Control surface handed to the node once the loop is running.
pub struct StateMachineHandle {
    queue: Arc<MessageQueue<Event>>,
    events: broadcast::Sender<OutboundEvent>,
    task: JoinHandle<()>,
}

impl StateMachineHandle {
    pub fn new_message(&self, peer: Option<PeerId>, message: PeerMessage) {
        self.queue.push(Event::Message { peer, message });
    }

    pub fn new_block_header(&self, header: Header, validators: ValidatorSet) {
        self.queue.push(Event::NewBlockHeader { header, validators });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events.subscribe()
    }

    pub(crate) fn queue(&self) -> Arc<MessageQueue<Event>> {
        Arc::clone(&self.queue)
    }

    /// Close the input queue and wait for the loop to drain and stop.
    pub async fn abort(self) {
        self.queue.close();
        let _ = self.task.await;
    }
}

impl StateMachine {
    /// Build the machine for the height following `genesis_header` (which may
    /// be any committed header, not only height 0).
    pub fn new(
        chain_id: u64,
        config: ConsensusConfig,
        pipeline: Arc<dyn BlockPipeline>,
        evidence: EvidencePool,
        genesis_header: &Header,
        validators: ValidatorSet,
    ) -> Self {
        let queue = Arc::new(MessageQueue::new(config.message_queue_size));
        let ticker = {
            let queue = Arc::clone(&queue);
            TimeoutTicker::spawn(move |timeout| queue.push(Event::Timeout(timeout)))
        };
        let (events, _) = broadcast::channel(256);

        let parent_hash = calc_block_hash(genesis_header);
        let mut validators = validators;
        validators.increment_proposer_priority(1);
        let start_time = Instant::now() + config.commit_timeout;
        let rs = RoundState::new(genesis_header.number + 1, Arc::new(validators), start_time);

        Self {
            chain_id,
            config,
            pipeline,
            evidence,
            queue,
            ticker,
            events,
            rs,
            parent_hash,
            last_commit_round: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OutboundEvent> {
        self.events.subscribe()
    }

    /// Spawn the consensus loop.
    pub fn start(self) -> StateMachineHandle {
        self.schedule_new_height_timeout();

        let queue = Arc::clone(&self.queue);
        let events = self.events.clone();
        let task = tokio::spawn(self.run());

        StateMachineHandle { queue, events, task }
    }

    async fn run(mut self) {
        info!(height = self.rs.height, "consensus state machine started");
        while let Some(event) = self.queue.pop().await {
            if let Err(error) = self.handle_event(event).await {
                warn!(%error, "error while handling consensus event");
            }
        }
        self.ticker.stop();
        info!(height = self.rs.height, "consensus state machine stopped");
    }

    pub(crate) async fn handle_event(&mut self, event: Event) -> eyre::Result<()> {
        match event {
            Event::NewBlockHeader { header, validators } => {
                self.new_block_header(&header, validators);
                Ok(())
            }
            Event::Timeout(timeout) => self.handle_timeout(timeout).await,
            Event::Message { peer, message } => match message {
                PeerMessage::Proposal(proposal) => {
                    self.set_proposal(proposal, peer);
                    Ok(())
                }
                PeerMessage::ProposalBlock(block) => self.add_proposal_block(block).await,
                PeerMessage::Vote(vote) => self.try_add_vote(vote, peer).await,
                PeerMessage::VoteSetMaj23 {
                    height,
                    round,
                    vote_type,
                    block_hash,
                } => {
                    self.set_peer_maj23(height, round, vote_type, block_hash, peer);
                    Ok(())
                }
                PeerMessage::GetProposalBlock { block_hash } => {
                    self.respond_proposal_block(block_hash, peer);
                    Ok(())
                }
            },
        }
    }

    // --- height lifecycle -------------------------------------------------

    /// Reset to `header.number + 1` with the validator set the staking
    /// contract reports for the new state root. One proposer-priority
    /// increment seeds the rotation for round 0.
    fn new_block_header(&mut self, header: &Header, validators: ValidatorSet) {
        let height = header.number + 1;
        if height <= self.rs.height {
            debug!(height, current = self.rs.height, "stale block header, ignoring");
            return;
        }

        self.last_commit_round = self.rs.commit_round;
        let commit_time = self.rs.commit_time;
        self.parent_hash = calc_block_hash(header);

        let mut validators = validators;
        validators.increment_proposer_priority(1);

        let start_time = commit_time.unwrap_or_else(Instant::now) + self.config.commit_timeout;
        self.rs = RoundState::new(height, Arc::new(validators), start_time);

        info!(height, parent = %self.parent_hash, "starting new consensus height");
        self.publish_step();
        self.schedule_new_height_timeout();
    }

    /// The `NewHeight` timeout fires `enter_new_round(height, 0)`; with
    /// `skip_timeout_commit` it fires immediately.
    fn schedule_new_height_timeout(&self) {
        let duration = if self.config.skip_timeout_commit {
            Duration::ZERO
        } else {
            self.rs.start_time.duration_since(Instant::now())
        };
        self.ticker.schedule(TimeoutInfo {
            duration,
            height: self.rs.height,
            round: 0,
            step: RoundStep::NewHeight,
        });
    }

    // --- timeouts ---------------------------------------------------------

    async fn handle_timeout(&mut self, timeout: TimeoutInfo) -> eyre::Result<()> {
        if timeout.height != self.rs.height
            || timeout.round < self.rs.round
            || (timeout.round == self.rs.round && timeout.step < self.rs.step)
        {
            debug!(
                height = timeout.height,
                round = timeout.round,
                step = %timeout.step,
                "ignoring stale timeout"
            );
            return Ok(());
        }

        debug!(height = timeout.height, round = timeout.round, step = %timeout.step, "timeout fired");
        match timeout.step {
            RoundStep::NewHeight => self.enter_new_round(timeout.height, 0).await,
            RoundStep::NewRound => self.enter_propose(timeout.height, 0).await,
            RoundStep::Propose => self.enter_prevote(timeout.height, timeout.round).await,
            RoundStep::PrevoteWait => self.enter_precommit(timeout.height, timeout.round).await,
            RoundStep::PrecommitWait => {
                self.enter_precommit(timeout.height, timeout.round).await?;
                self.enter_new_round(timeout.height, timeout.round + 1).await
            }
            _ => Ok(()),
        }
    }

    // --- proposals --------------------------------------------------------

    fn set_proposal(&mut self, proposal: Proposal, peer: Option<PeerId>) {
        if self.rs.proposal.is_some() {
            return;
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(
                height = proposal.height,
                round = proposal.round,
                "proposal is not for the current round, ignoring"
            );
            return;
        }
        if let Err(error) = proposal.check_pol_round() {
            warn!(%error, ?peer, "dropping proposal with invalid POLRound");
            return;
        }
        let proposer = self.rs.validators.proposer().address;
        if let Err(error) = proposal.verify(proposer) {
            warn!(%error, ?peer, "dropping proposal with bad signature");
            return;
        }

        info!(
            height = proposal.height,
            round = proposal.round,
            hash = %proposal.block_hash,
            "received proposal"
        );
        let block_hash = proposal.block_hash;
        self.rs.proposal_block_hash = Some(block_hash);
        self.rs.proposal = Some(proposal);

        if self.rs.proposal_block.is_none() {
            // Ask the sender for the block body; our own block follows in
            // the queue already.
            if let Some(peer) = peer {
                let _ = self.events.send(OutboundEvent::SendTo {
                    peer,
                    message: ConsensusMessage::GetProposalBlock { block_hash },
                });
            }
        }
    }

    async fn add_proposal_block(&mut self, block: Block) -> eyre::Result<()> {
        if self.rs.proposal_block.is_some() {
            return Ok(());
        }
        let Some(expected) = self.rs.proposal_block_hash else {
            debug!("unsolicited proposal block, ignoring");
            return Ok(());
        };
        let hash = block.hash();
        if hash != expected {
            debug!(%hash, %expected, "proposal block hash mismatch, ignoring");
            return Ok(());
        }

        info!(height = self.rs.height, %hash, "received full proposal block");
        self.rs.proposal_block = Some(block);

        let height = self.rs.height;
        let round = self.rs.round;

        // A polka we had already seen may now be backed by an actual block.
        let prevote_maj = self.rs.votes.prevotes(round).and_then(|v| v.maj23());
        if prevote_maj == Some(hash) && self.rs.valid_round < Some(round) {
            self.rs.valid_round = Some(round);
            self.rs.valid_block = self.rs.proposal_block.clone();
        }

        if self.rs.step <= RoundStep::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
            let precommit_maj = self
                .rs
                .votes
                .precommits(round)
                .is_some_and(|v| v.has_two_thirds_majority());
            if precommit_maj {
                self.enter_precommit(height, round).await?;
            }
        } else if self.rs.step == RoundStep::Commit {
            // Scenario: the decided block arrives after we entered Commit.
            self.try_finalize_commit(height).await?;
        }
        Ok(())
    }

    /// Build (or reuse) a block and feed the proposal through our own queue.
    async fn decide_proposal(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        let reuse = self
            .rs
            .valid_block
            .clone()
            .map(|block| (block, self.rs.valid_round));

        let (mut block, evidence, pol_round) = match reuse {
            Some((block, valid_round)) => {
                // Re-propose the already-polka'd block with its evidence.
                let evidence = ExtraData::from_header(&block.header)
                    .map(|extra| extra.evidence)
                    .unwrap_or_default();
                (block, evidence, valid_round)
            }
            None => {
                let block = self.pipeline.build_pending_block(self.parent_hash).await?;
                let evidence = self
                    .evidence
                    .pending_evidence(self.config.evidence_max_bytes)
                    .await;
                (block, evidence, None)
            }
        };

        let block_hash = calc_block_hash_with_evidence(&block.header, &evidence);
        let timestamp = unix_ms();
        let digest =
            proposal_sign_hash(self.chain_id, height, round, pol_round, block_hash, timestamp);
        let proposal = Proposal {
            chain_id: self.chain_id,
            height,
            round,
            pol_round,
            block_hash,
            timestamp,
            signature: self.pipeline.sign(digest),
        };

        let extra = ExtraData {
            round,
            commit_round: round,
            pol_round,
            evidence,
            proposal: proposal.clone(),
            commit: None,
        };
        extra.seal(&mut block.header);

        info!(
            height,
            round,
            hash = %block_hash,
            txs = block.transactions.len(),
            evidence = extra.evidence.len(),
            "proposing block"
        );

        let _ = self.events.send(OutboundEvent::Broadcast(ConsensusMessage::Proposal(
            proposal.clone(),
        )));
        let _ = self.events.send(OutboundEvent::Broadcast(
            ConsensusMessage::ProposalBlock(block.clone()),
        ));

        self.queue.push(Event::Message {
            peer: None,
            message: PeerMessage::Proposal(proposal),
        });
        self.queue.push(Event::Message {
            peer: None,
            message: PeerMessage::ProposalBlock(block),
        });
        Ok(())
    }

    // --- votes ------------------------------------------------------------

    async fn try_add_vote(&mut self, vote: Vote, peer: Option<PeerId>) -> eyre::Result<()> {
        if vote.height != self.rs.height {
            debug!(
                height = vote.height,
                current = self.rs.height,
                "vote for another height, ignoring"
            );
            return Ok(());
        }
        if vote.chain_id != self.chain_id {
            warn!(chain_id = vote.chain_id, ?peer, "vote for another chain, dropping");
            return Ok(());
        }

        let round = vote.round;
        let vote_type = vote.vote_type;
        let index = vote.validator_index;
        let had_maj23 = self.vote_set_maj23(round, vote_type);

        let added = match self.rs.votes.add_vote(vote, peer.as_ref()) {
            Ok(added) => added,
            Err(HeightVoteSetError::VoteSet(VoteSetError::Conflicting(conflict))) => {
                self.handle_conflicting_votes(*conflict).await;
                return Ok(());
            }
            Err(error) => {
                debug!(%error, ?peer, "dropping vote");
                return Ok(());
            }
        };
        if !added {
            return Ok(());
        }

        let _ = self.events.send(OutboundEvent::Broadcast(ConsensusMessage::HasVote {
            height: self.rs.height,
            round,
            vote_type,
            index,
        }));

        let maj23 = self.vote_set_maj23(round, vote_type);
        if had_maj23.is_none() {
            if let Some(block_hash) = maj23 {
                let _ = self.events.send(OutboundEvent::Broadcast(
                    ConsensusMessage::VoteSetMaj23 {
                        height: self.rs.height,
                        round,
                        vote_type,
                        block_hash,
                    },
                ));
            }
        }

        match vote_type {
            VoteType::Prevote => self.on_prevote_added(round, had_maj23).await,
            VoteType::Precommit => self.on_precommit_added(round).await,
        }
    }

    fn vote_set_maj23(&self, round: Round, vote_type: VoteType) -> Option<B256> {
        let set = match vote_type {
            VoteType::Prevote => self.rs.votes.prevotes(round),
            VoteType::Precommit => self.rs.votes.precommits(round),
        };
        set.and_then(|v| v.maj23())
    }

    /// Conflicting votes are not an error to the machine: our own double
    /// sign is suppressed, anyone else's becomes evidence.
    async fn handle_conflicting_votes(&mut self, conflict: crate::vote_set::ConflictingVotes) {
        let index = conflict.conflicting.validator_index as usize;
        let address = self.rs.validators.get(index).map(|v| v.address);

        if address == Some(self.pipeline.address()) {
            error!(index, "conflicting votes signed by our own key, suppressing");
            return;
        }

        warn!(index, "conflicting votes detected, submitting evidence");
        match DuplicateVoteEvidence::new(conflict.existing, conflict.conflicting) {
            Ok(evidence) => {
                let validators = Arc::clone(&self.rs.validators);
                self.evidence
                    .report_conflict(evidence.into(), &validators)
                    .await;
            }
            Err(error) => debug!(%error, "conflicting votes do not form evidence"),
        }
    }

    async fn on_prevote_added(
        &mut self,
        round: Round,
        had_maj23: Option<B256>,
    ) -> eyre::Result<()> {
        let height = self.rs.height;
        let maj23 = self.vote_set_maj23(round, VoteType::Prevote);

        // A polka just formed: lock/unlock and valid-block bookkeeping.
        if let Some(maj) = maj23 {
            if had_maj23.is_none() {
                if let (Some(locked_round), Some(locked_hash)) =
                    (self.rs.locked_round, self.rs.locked_block_hash())
                {
                    if locked_round < round && round <= self.rs.round && maj != locked_hash {
                        info!(round, "unlocking: polka for a different block");
                        self.rs.locked_round = None;
                        self.rs.locked_block = None;
                    }
                }

                if !is_nil(&maj) && self.rs.valid_round < Some(round) && round == self.rs.round {
                    if self.rs.proposal_block_matches(&maj) {
                        info!(round, hash = %maj, "updating valid block");
                        self.rs.valid_round = Some(round);
                        self.rs.valid_block = self.rs.proposal_block.clone();
                    } else {
                        // The polka is for a block we have not seen; re-aim
                        // the proposal slot so it can be fetched.
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_hash = Some(maj);
                    }
                    let _ = self.events.send(OutboundEvent::Broadcast(
                        ConsensusMessage::NewValidBlock {
                            height,
                            round,
                            parts: PartSetHeader { count: 1, hash: maj },
                            block_hash: maj,
                            is_commit: false,
                        },
                    ));
                }
            }
        }

        let current_round = self.rs.round;
        let has_any = self
            .rs
            .votes
            .prevotes(round)
            .is_some_and(|v| v.has_two_thirds_any());

        if current_round < round && has_any {
            self.enter_new_round(height, round).await
        } else if current_round == round && self.rs.step >= RoundStep::Prevote {
            if let Some(maj) = maj23 {
                if self.rs.is_proposal_complete() || is_nil(&maj) {
                    self.enter_precommit(height, round).await
                } else if has_any {
                    self.enter_prevote_wait(height, round)
                } else {
                    Ok(())
                }
            } else if has_any {
                self.enter_prevote_wait(height, round)
            } else {
                Ok(())
            }
        } else if self.rs.proposal.as_ref().and_then(|p| p.pol_round) == Some(round)
            && self.rs.is_proposal_complete()
        {
            // The proposal's POL just completed; re-evaluate the prevote.
            self.enter_prevote(height, current_round).await
        } else {
            Ok(())
        }
    }

    async fn on_precommit_added(&mut self, round: Round) -> eyre::Result<()> {
        let height = self.rs.height;
        let maj23 = self.vote_set_maj23(round, VoteType::Precommit);
        let has_any = self
            .rs
            .votes
            .precommits(round)
            .is_some_and(|v| v.has_two_thirds_any());

        if let Some(maj) = maj23 {
            self.enter_new_round(height, round).await?;
            self.enter_precommit(height, round).await?;
            if is_nil(&maj) {
                self.enter_precommit_wait(height, round)
            } else {
                self.enter_commit(height, round).await
            }
        } else if self.rs.round <= round && has_any {
            self.enter_new_round(height, round).await?;
            self.enter_precommit_wait(height, round)
        } else {
            Ok(())
        }
    }

    fn set_peer_maj23(
        &mut self,
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_hash: B256,
        peer: Option<PeerId>,
    ) {
        if height != self.rs.height {
            return;
        }
        let Some(peer) = peer else { return };

        if !self
            .rs
            .votes
            .set_peer_maj23(round, vote_type, peer.clone(), block_hash)
        {
            return;
        }

        // Answer with the bits we hold for that block so the peer can push
        // exactly the votes we lack.
        let votes = match vote_type {
            VoteType::Prevote => self.rs.votes.prevotes(round),
            VoteType::Precommit => self.rs.votes.precommits(round),
        }
        .map(|set| set.bit_array_by_block(&block_hash));

        if let Some(votes) = votes {
            let _ = self.events.send(OutboundEvent::SendTo {
                peer,
                message: ConsensusMessage::VoteSetBits {
                    height,
                    round,
                    vote_type,
                    block_hash,
                    votes,
                },
            });
        }
    }

    fn respond_proposal_block(&self, block_hash: B256, peer: Option<PeerId>) {
        let Some(peer) = peer else { return };

        let block = [&self.rs.proposal_block, &self.rs.valid_block, &self.rs.locked_block]
            .into_iter()
            .flatten()
            .find(|block| block.hash() == block_hash);

        if let Some(block) = block {
            let _ = self.events.send(OutboundEvent::SendTo {
                peer,
                message: ConsensusMessage::ProposalBlock(block.clone()),
            });
        }
    }

    // --- round transitions ------------------------------------------------

    async fn enter_new_round(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != RoundStep::NewHeight)
        {
            return Ok(());
        }

        if round > self.rs.round {
            let mut validators = (*self.rs.validators).clone();
            validators.increment_proposer_priority(round - self.rs.round);
            self.rs.validators = Arc::new(validators);
        }

        info!(height, round, proposer = %self.rs.validators.proposer().address, "entering new round");
        self.rs.round = round;
        self.rs.step = RoundStep::NewRound;
        if round != 0 {
            // Round 0 keeps the proposal slot; later rounds start clean so a
            // valid block can be re-proposed explicitly.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_hash = None;
        }
        self.rs.votes.set_round(round + 1);
        self.rs.triggered_timeout_precommit = false;
        self.publish_step();

        let wait_for_txs = round == 0
            && self.config.create_empty_blocks_interval > Duration::ZERO
            && !self.pipeline.has_pending_transactions();
        if wait_for_txs {
            self.ticker.schedule(TimeoutInfo {
                duration: self.config.create_empty_blocks_interval,
                height,
                round,
                step: RoundStep::NewRound,
            });
            Ok(())
        } else {
            self.enter_propose(height, round).await
        }
    }

    async fn enter_propose(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Propose)
        {
            return Ok(());
        }

        debug!(height, round, "entering propose step");
        self.update_step(round, RoundStep::Propose);
        self.schedule_step_timeout(self.config.propose(round), height, round, RoundStep::Propose);

        // A valid block carried over from an earlier round may already
        // complete the proposal.
        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, round).await?;
        }

        let our_address = self.pipeline.address();
        if self.rs.validators.index_of(&our_address).is_none() {
            debug!("not in the validator set, waiting for a proposal");
            return Ok(());
        }
        if self.rs.validators.proposer().address == our_address {
            info!(height, round, "we are the proposer");
            self.decide_proposal(height, round).await?;
        }
        Ok(())
    }

    async fn enter_prevote(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Prevote)
        {
            return Ok(());
        }

        debug!(height, round, "entering prevote step");
        self.update_step(round, RoundStep::Prevote);

        if let Some(locked_hash) = self.rs.locked_block_hash() {
            debug!(hash = %locked_hash, "prevoting the locked block");
            self.sign_and_dispatch_vote(VoteType::Prevote, locked_hash);
            return Ok(());
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            debug!("no proposal block, prevoting nil");
            self.sign_and_dispatch_vote(VoteType::Prevote, NIL_HASH);
            return Ok(());
        };

        match self.validate_proposal_block(&block).await {
            Ok(()) => self.sign_and_dispatch_vote(VoteType::Prevote, block.hash()),
            Err(error) => {
                warn!(%error, "invalid proposal block, prevoting nil");
                self.sign_and_dispatch_vote(VoteType::Prevote, NIL_HASH);
            }
        }
        Ok(())
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::PrevoteWait)
        {
            return Ok(());
        }
        if !self
            .rs
            .votes
            .prevotes(round)
            .is_some_and(|v| v.has_two_thirds_any())
        {
            warn!(height, round, "prevote wait without 2/3+ prevotes, ignoring");
            return Ok(());
        }

        debug!(height, round, "entering prevote wait");
        self.update_step(round, RoundStep::PrevoteWait);
        self.schedule_step_timeout(
            self.config.prevote_wait(round),
            height,
            round,
            RoundStep::PrevoteWait,
        );
        Ok(())
    }

    async fn enter_precommit(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= RoundStep::Precommit)
        {
            return Ok(());
        }

        debug!(height, round, "entering precommit step");
        self.update_step(round, RoundStep::Precommit);

        let Some(maj) = self.vote_set_maj23(round, VoteType::Prevote) else {
            debug!("no prevote polka, precommitting nil");
            self.sign_and_dispatch_vote(VoteType::Precommit, NIL_HASH);
            return Ok(());
        };

        if is_nil(&maj) {
            if self.rs.locked_block.is_some() {
                info!(round, "polka on nil, unlocking");
                self.rs.locked_round = None;
                self.rs.locked_block = None;
            }
            self.sign_and_dispatch_vote(VoteType::Precommit, NIL_HASH);
            return Ok(());
        }

        // A non-nil polka at this round must surface as the latest POL; a
        // mismatch means vote bookkeeping went sideways. Recover with nil.
        match self.rs.votes.pol_info() {
            Some((pol_round, _)) if pol_round >= round => {}
            other => {
                error!(?other, round, "POL info lags the polka, precommitting nil");
                self.sign_and_dispatch_vote(VoteType::Precommit, NIL_HASH);
                return Ok(());
            }
        }

        if self.rs.locked_block_hash() == Some(maj) {
            debug!(round, "re-precommitting the locked block");
            self.rs.locked_round = Some(round);
            self.sign_and_dispatch_vote(VoteType::Precommit, maj);
            return Ok(());
        }

        if let Some(block) = self.rs.proposal_block.clone().filter(|b| b.hash() == maj) {
            match self.validate_proposal_block(&block).await {
                Ok(()) => {
                    info!(round, hash = %maj, "locking block");
                    self.rs.locked_round = Some(round);
                    self.rs.locked_block = Some(block);
                    self.sign_and_dispatch_vote(VoteType::Precommit, maj);
                }
                Err(error) => {
                    error!(%error, "polka block fails validation, precommitting nil");
                    self.sign_and_dispatch_vote(VoteType::Precommit, NIL_HASH);
                }
            }
            return Ok(());
        }

        // Polka for a block we have not seen: drop any lock, aim the
        // proposal slot at it and precommit nil.
        info!(round, hash = %maj, "polka for an unseen block");
        self.rs.locked_round = None;
        self.rs.locked_block = None;
        if self.rs.proposal_block_hash != Some(maj) {
            self.rs.proposal_block = None;
            self.rs.proposal_block_hash = Some(maj);
        }
        self.sign_and_dispatch_vote(VoteType::Precommit, NIL_HASH);
        Ok(())
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) -> eyre::Result<()> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            return Ok(());
        }
        if !self
            .rs
            .votes
            .precommits(round)
            .is_some_and(|v| v.has_two_thirds_any())
        {
            warn!(height, round, "precommit wait without 2/3+ precommits, ignoring");
            return Ok(());
        }

        debug!(height, round, "entering precommit wait");
        self.rs.triggered_timeout_precommit = true;
        self.schedule_step_timeout(
            self.config.precommit_wait(round),
            height,
            round,
            RoundStep::PrecommitWait,
        );
        Ok(())
    }

    async fn enter_commit(&mut self, height: Height, commit_round: Round) -> eyre::Result<()> {
        if self.rs.height != height || self.rs.step >= RoundStep::Commit {
            return Ok(());
        }

        info!(height, commit_round, "entering commit step");
        self.rs.commit_round = Some(commit_round);
        self.rs.commit_time = Some(Instant::now());
        let round = self.rs.round;
        self.update_step(round, RoundStep::Commit);

        let Some(maj) = self
            .vote_set_maj23(commit_round, VoteType::Precommit)
            .filter(|hash| !is_nil(hash))
        else {
            error!(height, commit_round, "commit without a non-nil precommit majority");
            return Ok(());
        };

        if self.rs.locked_block_hash() == Some(maj) {
            debug!("adopting the locked block for commit");
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_hash = Some(maj);
        }

        if !self.rs.proposal_block_matches(&maj) {
            if self.rs.proposal_block_hash != Some(maj) {
                info!(hash = %maj, "decided block not here yet, requesting it");
                self.rs.proposal_block = None;
                self.rs.proposal_block_hash = Some(maj);
            }
            let _ = self.events.send(OutboundEvent::Broadcast(
                ConsensusMessage::GetProposalBlock { block_hash: maj },
            ));
            let _ = self.events.send(OutboundEvent::Broadcast(
                ConsensusMessage::NewValidBlock {
                    height,
                    round: commit_round,
                    parts: PartSetHeader { count: 1, hash: maj },
                    block_hash: maj,
                    is_commit: true,
                },
            ));
            // Block arrival re-enters try_finalize_commit.
            return Ok(());
        }

        self.try_finalize_commit(height).await
    }

    async fn try_finalize_commit(&mut self, height: Height) -> eyre::Result<()> {
        if self.rs.height != height || self.rs.step != RoundStep::Commit {
            return Ok(());
        }
        let Some(commit_round) = self.rs.commit_round else {
            return Ok(());
        };
        let Some(maj) = self
            .vote_set_maj23(commit_round, VoteType::Precommit)
            .filter(|hash| !is_nil(hash))
        else {
            return Ok(());
        };
        let Some(block) = self
            .rs
            .proposal_block
            .clone()
            .filter(|block| block.hash() == maj)
        else {
            debug!(hash = %maj, "decided block still missing, waiting");
            return Ok(());
        };

        let commit = match self.rs.votes.precommits(commit_round).map(|v| v.make_commit()) {
            Some(Ok(commit)) => commit,
            Some(Err(error)) => {
                error!(%error, "failed to build the commit aggregate");
                return Ok(());
            }
            None => return Ok(()),
        };

        // Re-seal with the decided round and the precommit aggregate. The
        // block hash is unaffected: it covers only vanity and evidence.
        let mut extra = match ExtraData::from_header(&block.header) {
            Ok(extra) => extra,
            Err(error) => {
                error!(%error, "decided block has an unreadable seal");
                return Ok(());
            }
        };
        extra.commit_round = commit_round;
        extra.commit = Some(commit);
        let mut block = block;
        extra.seal(&mut block.header);

        info!(height, commit_round, hash = %maj, "finalizing block");
        if let Err(error) = self.pipeline.commit_block(block).await {
            // Stay parked at Commit. The timeout machinery re-enters the
            // next height once a majority precommit is seen again.
            error!(%error, height, "commit_block failed");
            return Ok(());
        }

        if !extra.evidence.is_empty() {
            if let Err(error) = self.evidence.update(&extra.evidence, height).await {
                warn!(%error, "failed to update the evidence pool");
            }
        }
        Ok(())
    }

    // --- helpers ----------------------------------------------------------

    async fn validate_proposal_block(&self, block: &Block) -> eyre::Result<()> {
        ensure!(
            block.number() == self.rs.height,
            "block number {} does not match height {}",
            block.number(),
            self.rs.height
        );
        ensure!(
            block.parent_hash() == self.parent_hash,
            "block parent {} does not extend {}",
            block.parent_hash(),
            self.parent_hash
        );

        let extra = ExtraData::from_header(&block.header)?;
        let Some(proposal) = &self.rs.proposal else {
            bail!("no proposal to validate the block against");
        };
        ensure!(
            extra.proposal == *proposal,
            "sealed proposal does not match the gossiped one"
        );
        ensure!(extra.round == proposal.round, "sealed round mismatch");

        self.evidence
            .check_evidence(&extra.evidence, self.rs.height, &self.rs.validators)
            .await?;
        Ok(())
    }

    fn sign_and_dispatch_vote(&mut self, vote_type: VoteType, block_hash: B256) {
        let our_address = self.pipeline.address();
        let Some(index) = self.rs.validators.index_of(&our_address) else {
            debug!("not in the validator set, not voting");
            return;
        };

        let height = self.rs.height;
        let round = self.rs.round;
        let timestamp = unix_ms();
        let digest = vote_sign_hash(self.chain_id, vote_type, height, round, block_hash, timestamp);
        let vote = Vote {
            chain_id: self.chain_id,
            vote_type,
            height,
            round,
            block_hash,
            timestamp,
            validator_index: index as u32,
            signature: self.pipeline.sign(digest),
        };

        debug!(height, round, %vote_type, hash = %block_hash, "signed vote");
        let _ = self
            .events
            .send(OutboundEvent::Broadcast(ConsensusMessage::Vote(vote.clone())));
        self.queue.push(Event::Message {
            peer: None,
            message: PeerMessage::Vote(vote),
        });
    }

    fn update_step(&mut self, round: Round, step: RoundStep) {
        self.rs.round = round;
        self.rs.step = step;
        self.publish_step();
    }

    fn publish_step(&self) {
        let _ = self.events.send(OutboundEvent::Broadcast(
            ConsensusMessage::NewRoundStep {
                height: self.rs.height,
                round: self.rs.round,
                step: self.rs.step,
                seconds_since_start_time: self.rs.start_time.elapsed().as_secs(),
                last_commit_round: self.last_commit_round,
            },
        ));
    }

    fn schedule_step_timeout(
        &self,
        duration: Duration,
        height: Height,
        round: Round,
        step: RoundStep,
    ) {
        self.ticker.schedule(TimeoutInfo {
            duration,
            height,
            round,
            step,
        });
    }

    #[cfg(test)]
    pub(crate) fn round_state(&self) -> &RoundState {
        &self.rs
    }

    #[cfg(test)]
    pub(crate) fn test_queue(&self) -> Arc<MessageQueue<Event>> {
        Arc::clone(&self.queue)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use alloy_primitives::Address;
    use async_trait::async_trait;
    use reimint_types::{Evidence, Signature, Signer, Validator};

    use super::*;

    const CHAIN_ID: u64 = 23;

    struct TestPipeline {
        signer: Signer,
        headers: Mutex<HashMap<B256, Header>>,
        committed: Mutex<Vec<Block>>,
        fail_commit: AtomicBool,
    }

    impl TestPipeline {
        fn new(signer: Signer, genesis: &Header) -> Self {
            let mut headers = HashMap::new();
            headers.insert(calc_block_hash(genesis), genesis.clone());
            Self {
                signer,
                headers: Mutex::new(headers),
                committed: Mutex::new(Vec::new()),
                fail_commit: AtomicBool::new(false),
            }
        }

        fn committed(&self) -> Vec<Block> {
            self.committed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BlockPipeline for TestPipeline {
        async fn build_pending_block(&self, parent_hash: B256) -> eyre::Result<Block> {
            let headers = self.headers.lock().unwrap();
            let parent = headers
                .get(&parent_hash)
                .ok_or_else(|| eyre::eyre!("unknown parent {parent_hash}"))?;
            Ok(Block::new(
                Header {
                    number: parent.number + 1,
                    parent_hash,
                    gas_limit: 30_000_000,
                    ..Default::default()
                },
                Vec::new(),
            ))
        }

        async fn commit_block(&self, block: Block) -> eyre::Result<()> {
            if self.fail_commit.load(Ordering::SeqCst) {
                eyre::bail!("storage failure");
            }
            self.headers
                .lock()
                .unwrap()
                .insert(block.hash(), block.header.clone());
            self.committed.lock().unwrap().push(block);
            Ok(())
        }

        async fn get_validator_set(&self, _state_root: B256) -> eyre::Result<ValidatorSet> {
            eyre::bail!("not used in these tests")
        }

        fn sign(&self, digest: B256) -> Signature {
            self.signer.sign_digest(digest)
        }

        fn address(&self) -> Address {
            self.signer.address()
        }
    }

    struct Harness {
        sm: StateMachine,
        signers: Vec<Signer>,
        vals: ValidatorSet,
        rotation: Vec<Address>,
        pipeline: Arc<TestPipeline>,
        evidence: EvidencePool,
        genesis: Header,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        /// Four equal validators. When `our_is_proposer` the node under test
        /// proposes at round 0; otherwise it does not propose until round 3.
        async fn new(our_is_proposer: bool) -> Self {
            Self::with_config(our_is_proposer, ConsensusConfig::default()).await
        }

        async fn with_config(our_is_proposer: bool, config: ConsensusConfig) -> Self {
            let raw: Vec<Signer> = (0..4).map(|_| Signer::random()).collect();
            let vals =
                ValidatorSet::new(raw.iter().map(|s| Validator::new(s.address(), 10))).unwrap();
            let signers: Vec<Signer> = vals
                .validators()
                .map(|v| raw.iter().find(|s| s.address() == v.address).unwrap().clone())
                .collect();

            let mut probe = vals.clone();
            let mut rotation = Vec::new();
            for _ in 0..4 {
                probe.increment_proposer_priority(1);
                rotation.push(probe.proposer().address);
            }
            let our_address = if our_is_proposer { rotation[0] } else { rotation[3] };
            let our = signers
                .iter()
                .find(|s| s.address() == our_address)
                .unwrap()
                .clone();

            let genesis = Header {
                number: 0,
                gas_limit: 30_000_000,
                ..Default::default()
            };
            let dir = tempfile::tempdir().unwrap();
            let evidence = EvidencePool::open(dir.path().join("evidence.redb"), 10_000)
                .await
                .unwrap();
            let pipeline = Arc::new(TestPipeline::new(our, &genesis));
            let pipeline_clone = Arc::clone(&pipeline);
            let pipeline_dyn: Arc<dyn BlockPipeline> = pipeline_clone;
            let sm = StateMachine::new(
                CHAIN_ID,
                config,
                pipeline_dyn,
                evidence.clone(),
                &genesis,
                vals.clone(),
            );

            Self {
                sm,
                signers,
                vals,
                rotation,
                pipeline,
                evidence,
                genesis,
                _dir: dir,
            }
        }

        fn our_index(&self) -> usize {
            self.vals.index_of(&self.pipeline.address()).unwrap()
        }

        fn index_of(&self, address: Address) -> usize {
            self.vals.index_of(&address).unwrap()
        }

        async fn begin_height(&mut self) {
            self.fire_timeout(0, RoundStep::NewHeight).await;
        }

        async fn fire_timeout(&mut self, round: Round, step: RoundStep) {
            let height = self.sm.round_state().height;
            self.sm
                .handle_event(Event::Timeout(TimeoutInfo {
                    duration: Duration::ZERO,
                    height,
                    round,
                    step,
                }))
                .await
                .unwrap();
            self.drain().await;
        }

        /// Process everything the machine enqueued for itself (its own
        /// proposal, block and votes travel through the queue).
        async fn drain(&mut self) {
            let queue = self.sm.test_queue();
            while let Some(event) = queue.try_pop() {
                self.sm.handle_event(event).await.unwrap();
            }
        }

        fn vote(&self, index: usize, vote_type: VoteType, round: Round, hash: B256) -> Vote {
            Vote::new_signed(
                &self.signers[index],
                CHAIN_ID,
                vote_type,
                self.sm.round_state().height,
                round,
                hash,
                1_000 + index as u64,
                index as u32,
            )
        }

        async fn deliver_vote(&mut self, index: usize, vote_type: VoteType, round: Round, hash: B256) {
            let vote = self.vote(index, vote_type, round, hash);
            self.sm
                .handle_event(Event::Message {
                    peer: Some(format!("peer-{index}")),
                    message: PeerMessage::Vote(vote),
                })
                .await
                .unwrap();
            self.drain().await;
        }

        /// One vote from every validator except the node under test.
        async fn deliver_peer_votes(&mut self, vote_type: VoteType, round: Round, hash: B256) {
            let ours = self.our_index();
            for index in 0..self.signers.len() {
                if index != ours {
                    self.deliver_vote(index, vote_type, round, hash).await;
                }
            }
        }

        async fn deliver_proposal(&mut self, proposal: Proposal) {
            self.sm
                .handle_event(Event::Message {
                    peer: Some("peer-p".into()),
                    message: PeerMessage::Proposal(proposal),
                })
                .await
                .unwrap();
            self.drain().await;
        }

        async fn deliver_block(&mut self, block: Block) {
            self.sm
                .handle_event(Event::Message {
                    peer: Some("peer-p".into()),
                    message: PeerMessage::ProposalBlock(block),
                })
                .await
                .unwrap();
            self.drain().await;
        }

        /// Mirror of `decide_proposal` for a peer proposer at height 1.
        fn make_proposal(&self, proposer: usize, round: Round, salt: u64) -> (Proposal, Block) {
            let height = self.sm.round_state().height;
            let parent_hash = calc_block_hash(&self.genesis);
            let mut block = Block::new(
                Header {
                    number: height,
                    parent_hash,
                    gas_limit: 30_000_000,
                    timestamp: salt,
                    ..Default::default()
                },
                Vec::new(),
            );
            let block_hash = calc_block_hash_with_evidence(&block.header, &[]);
            let proposal = Proposal::new_signed(
                &self.signers[proposer],
                CHAIN_ID,
                height,
                round,
                None,
                block_hash,
                1_000,
            );
            let extra = ExtraData {
                round,
                commit_round: round,
                pol_round: None,
                evidence: Vec::new(),
                proposal: proposal.clone(),
                commit: None,
            };
            extra.seal(&mut block.header);
            (proposal, block)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_commits_in_one_round() {
        let mut h = Harness::new(true).await;
        h.begin_height().await;

        // We proposed, processed our own proposal + block, and prevoted.
        let rs = h.sm.round_state();
        assert_eq!(rs.step, RoundStep::Prevote);
        let hash = rs.proposal_block_hash.unwrap();

        h.deliver_peer_votes(VoteType::Prevote, 0, hash).await;
        let rs = h.sm.round_state();
        assert_eq!(rs.locked_round, Some(0));
        assert_eq!(rs.locked_block_hash(), Some(hash));

        h.deliver_peer_votes(VoteType::Precommit, 0, hash).await;
        let committed = h.pipeline.committed();
        assert_eq!(committed.len(), 1, "commit_block runs exactly once");
        assert_eq!(committed[0].hash(), hash);

        // The sealed commit aggregate is independently verifiable.
        let extra = ExtraData::from_header(&committed[0].header).unwrap();
        extra.verify_commit(&committed[0].header, &h.vals).unwrap();
        assert_eq!(extra.commit_round, 0);

        // Next height resets the round state and clears the lock.
        h.sm
            .handle_event(Event::NewBlockHeader {
                header: committed[0].header.clone(),
                validators: h.vals.clone(),
            })
            .await
            .unwrap();
        let rs = h.sm.round_state();
        assert_eq!(rs.height, 2);
        assert_eq!(rs.step, RoundStep::NewHeight);
        assert!(rs.locked_block.is_none());
        assert!(rs.proposal.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn absent_proposer_rotates_to_the_next_round() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;
        assert_eq!(h.sm.round_state().step, RoundStep::Propose);

        // No proposal arrives; prevote nil after the propose timeout.
        h.fire_timeout(0, RoundStep::Propose).await;
        let ours = h.our_index();
        assert!(h
            .sm
            .round_state()
            .votes
            .prevotes(0)
            .unwrap()
            .get(ours as u32)
            .unwrap()
            .is_nil());

        h.deliver_peer_votes(VoteType::Prevote, 0, NIL_HASH).await;
        h.deliver_peer_votes(VoteType::Precommit, 0, NIL_HASH).await;
        assert!(h.sm.round_state().triggered_timeout_precommit);

        h.fire_timeout(0, RoundStep::PrecommitWait).await;
        let rs = h.sm.round_state();
        assert_eq!(rs.round, 1);
        // Priorities rotated: a different validator proposes round 1.
        assert_eq!(rs.validators.proposer().address, h.rotation[1]);
        assert_ne!(h.rotation[1], h.rotation[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_survives_nil_round_and_commits_later() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;

        let proposer = h.index_of(h.rotation[0]);
        let (proposal, block) = h.make_proposal(proposer, 0, 0);
        let b1 = block.hash();
        h.deliver_proposal(proposal).await;
        h.deliver_block(block).await;
        assert_eq!(h.sm.round_state().step, RoundStep::Prevote);

        // Polka for B1 locks it.
        h.deliver_peer_votes(VoteType::Prevote, 0, b1).await;
        assert_eq!(h.sm.round_state().locked_block_hash(), Some(b1));
        assert_eq!(h.sm.round_state().valid_round, Some(0));

        // Partition: the others precommit nil and the round times out.
        h.deliver_peer_votes(VoteType::Precommit, 0, NIL_HASH).await;
        h.fire_timeout(0, RoundStep::PrecommitWait).await;
        assert_eq!(h.sm.round_state().round, 1);
        // The lock survives the round change.
        assert_eq!(h.sm.round_state().locked_block_hash(), Some(b1));

        // Round 1: no proposal for us; we prevote the locked block.
        h.fire_timeout(1, RoundStep::Propose).await;
        let ours = h.our_index() as u32;
        assert_eq!(
            h.sm.round_state().votes.prevotes(1).unwrap().get(ours).unwrap().block_hash,
            b1
        );

        // The polka on B1 re-forms at round 1 and the height commits B1.
        h.deliver_peer_votes(VoteType::Prevote, 1, b1).await;
        h.fire_timeout(1, RoundStep::PrevoteWait).await;
        let rs = h.sm.round_state();
        assert_eq!(rs.locked_round, Some(1));
        assert_eq!(
            rs.votes.precommits(1).unwrap().get(ours).unwrap().block_hash,
            b1
        );

        h.deliver_peer_votes(VoteType::Precommit, 1, b1).await;
        let committed = h.pipeline.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].hash(), b1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_polka_for_another_block_unlocks() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;

        let proposer = h.index_of(h.rotation[0]);
        let (proposal, block) = h.make_proposal(proposer, 0, 0);
        let b1 = block.hash();
        h.deliver_proposal(proposal).await;
        h.deliver_block(block).await;
        h.deliver_peer_votes(VoteType::Prevote, 0, b1).await;
        assert_eq!(h.sm.round_state().locked_block_hash(), Some(b1));

        h.deliver_peer_votes(VoteType::Precommit, 0, NIL_HASH).await;
        h.fire_timeout(0, RoundStep::PrecommitWait).await;
        h.fire_timeout(1, RoundStep::Propose).await;

        // A polka for a different block B2 at round 1 releases the lock.
        let b2 = B256::repeat_byte(0x77);
        h.deliver_peer_votes(VoteType::Prevote, 1, b2).await;
        let rs = h.sm.round_state();
        assert!(rs.locked_block.is_none());
        assert_eq!(rs.locked_round, None);
        // The proposal slot is re-aimed so B2 can be fetched.
        assert_eq!(rs.proposal_block_hash, Some(b2));
        assert!(rs.proposal_block.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn conflicting_votes_become_evidence_immediately() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;

        let byzantine = h.index_of(h.rotation[1]);
        h.deliver_vote(byzantine, VoteType::Prevote, 0, B256::repeat_byte(0x0a))
            .await;
        h.deliver_vote(byzantine, VoteType::Prevote, 0, B256::repeat_byte(0x0b))
            .await;

        let pending = h.evidence.pending_evidence(usize::MAX).await;
        assert_eq!(pending.len(), 1);
        let Evidence::DuplicateVote(ev) = &pending[0];
        assert_eq!(ev.validator_index(), byzantine as u32);

        // The same conflict again adds nothing new.
        h.deliver_vote(byzantine, VoteType::Prevote, 0, B256::repeat_byte(0x0b))
            .await;
        assert_eq!(h.evidence.pending_evidence(usize::MAX).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evidence_is_sealed_into_the_next_proposal() {
        let mut h = Harness::new(true).await;

        // Plant evidence before the height begins proposing.
        let byzantine_index = (h.our_index() + 1) % 4;
        let signer = &h.signers[byzantine_index];
        let a = Vote::new_signed(signer, CHAIN_ID, VoteType::Prevote, 1, 0, B256::repeat_byte(0x0a), 7, byzantine_index as u32);
        let b = Vote::new_signed(signer, CHAIN_ID, VoteType::Prevote, 1, 0, B256::repeat_byte(0x0b), 8, byzantine_index as u32);
        let ev: Evidence = reimint_types::DuplicateVoteEvidence::new(a, b).unwrap().into();
        h.evidence.add_evidence(ev.clone(), &h.vals).await.unwrap();

        h.begin_height().await;
        let rs = h.sm.round_state();
        let block = rs.proposal_block.as_ref().unwrap();
        let extra = ExtraData::from_header(&block.header).unwrap();
        assert_eq!(extra.evidence, vec![ev.clone()]);

        // Drive the height to commit; the pool marks the evidence committed.
        let hash = rs.proposal_block_hash.unwrap();
        h.deliver_peer_votes(VoteType::Prevote, 0, hash).await;
        h.deliver_peer_votes(VoteType::Precommit, 0, hash).await;
        assert_eq!(h.pipeline.committed().len(), 1);
        assert!(h.evidence.is_committed(&ev).await);
        assert!(h.evidence.pending_evidence(usize::MAX).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn late_block_arrival_finalizes_the_commit() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;

        let proposer = h.index_of(h.rotation[0]);
        let (proposal, block) = h.make_proposal(proposer, 0, 0);
        let hash = block.hash();

        // Proposal without its block: prevote nil after the timeout.
        h.deliver_proposal(proposal).await;
        h.fire_timeout(0, RoundStep::Propose).await;

        h.deliver_peer_votes(VoteType::Prevote, 0, hash).await;
        h.deliver_peer_votes(VoteType::Precommit, 0, hash).await;

        let rs = h.sm.round_state();
        assert_eq!(rs.step, RoundStep::Commit);
        assert_eq!(rs.commit_round, Some(0));
        assert!(h.pipeline.committed().is_empty());

        // The block finally shows up and finalization fires.
        h.deliver_block(block).await;
        let committed = h.pipeline.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].hash(), hash);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_proposal_is_ignored() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;

        let proposer = h.index_of(h.rotation[0]);
        let (first, _) = h.make_proposal(proposer, 0, 0);
        let (second, _) = h.make_proposal(proposer, 0, 99);
        assert_ne!(first.block_hash, second.block_hash);

        h.deliver_proposal(first.clone()).await;
        h.deliver_proposal(second).await;

        assert_eq!(h.sm.round_state().proposal.as_ref(), Some(&first));
        // Proposal conflicts never reach the evidence pool.
        assert!(h.evidence.pending_evidence(usize::MAX).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn proposal_from_the_wrong_signer_is_dropped() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;

        let wrong = h.index_of(h.rotation[2]);
        let (proposal, _) = h.make_proposal(wrong, 0, 0);
        h.deliver_proposal(proposal).await;

        assert!(h.sm.round_state().proposal.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn commit_block_failure_parks_the_height_at_commit() {
        let mut h = Harness::new(true).await;
        h.pipeline.fail_commit.store(true, Ordering::SeqCst);
        h.begin_height().await;

        let hash = h.sm.round_state().proposal_block_hash.unwrap();
        h.deliver_peer_votes(VoteType::Prevote, 0, hash).await;
        h.deliver_peer_votes(VoteType::Precommit, 0, hash).await;

        let rs = h.sm.round_state();
        assert_eq!(rs.step, RoundStep::Commit);
        assert!(h.pipeline.committed().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn future_round_prevotes_skip_the_machine_ahead() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;
        assert_eq!(h.sm.round_state().round, 0);

        h.deliver_peer_votes(VoteType::Prevote, 2, B256::repeat_byte(0x55)).await;

        let rs = h.sm.round_state();
        assert_eq!(rs.round, 2);
        assert_eq!(rs.validators.proposer().address, h.rotation[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn maj23_claims_are_answered_with_vote_set_bits() {
        let mut h = Harness::new(false).await;
        h.begin_height().await;
        let mut events = h.sm.subscribe();

        let hash = B256::repeat_byte(0x11);
        let voter = h.index_of(h.rotation[1]);
        h.deliver_vote(voter, VoteType::Prevote, 0, hash).await;

        h.sm
            .handle_event(Event::Message {
                peer: Some("peer-q".into()),
                message: PeerMessage::VoteSetMaj23 {
                    height: 1,
                    round: 0,
                    vote_type: VoteType::Prevote,
                    block_hash: hash,
                },
            })
            .await
            .unwrap();

        let mut answered = false;
        while let Ok(event) = events.try_recv() {
            if let OutboundEvent::SendTo {
                peer,
                message: ConsensusMessage::VoteSetBits { votes, .. },
            } = event
            {
                assert_eq!(peer, "peer-q");
                assert_eq!(votes.iter_ones().collect::<Vec<_>>(), vec![voter]);
                answered = true;
            }
        }
        assert!(answered, "expected a VoteSetBits answer");
    }

    #[tokio::test(start_paused = true)]
    async fn get_proposal_block_is_served_from_the_current_round() {
        let mut h = Harness::new(true).await;
        h.begin_height().await;
        let mut events = h.sm.subscribe();

        let hash = h.sm.round_state().proposal_block_hash.unwrap();
        h.sm
            .handle_event(Event::Message {
                peer: Some("peer-q".into()),
                message: PeerMessage::GetProposalBlock { block_hash: hash },
            })
            .await
            .unwrap();

        let mut served = false;
        while let Ok(event) = events.try_recv() {
            if let OutboundEvent::SendTo {
                peer,
                message: ConsensusMessage::ProposalBlock(block),
            } = event
            {
                assert_eq!(peer, "peer-q");
                assert_eq!(block.hash(), hash);
                served = true;
            }
        }
        assert!(served, "expected the proposal block to be served");
    }

    #[tokio::test]
    async fn start_and_abort_shut_down_cleanly() {
        let h = Harness::new(false).await;
        let handle = h.sm.start();

        handle.new_message(
            Some("peer-1".into()),
            PeerMessage::GetProposalBlock {
                block_hash: B256::ZERO,
            },
        );
        handle.abort().await;
    }
}
