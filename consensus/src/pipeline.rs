//! The narrow interface the consensus core needs from the rest of the node.
//!
//! The node, engine and state machine otherwise form a cycle; this trait
//! breaks it. The state machine sees exactly four capabilities: building a
//! pending block, committing a finalized one, reading the staking contract's
//! validator set, and signing with the node's key.

use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use color_eyre::eyre;
use reimint_types::{Block, Signature, ValidatorSet};

#[async_trait]
pub trait BlockPipeline: Send + Sync + 'static {
    /// Ask the worker for a pending block built on `parent_hash`. The
    /// returned header is complete except for the consensus seal.
    async fn build_pending_block(&self, parent_hash: B256) -> eyre::Result<Block>;

    /// Execute and persist a finalized block. On success the pipeline will
    /// re-enter the state machine with `new_block_header` for the next
    /// height.
    async fn commit_block(&self, block: Block) -> eyre::Result<()>;

    /// Validator set recorded in the staking contract at `state_root`.
    /// Deterministic and pure with respect to the state root.
    async fn get_validator_set(&self, state_root: B256) -> eyre::Result<ValidatorSet>;

    /// Sign a 32-byte digest with the node's key.
    fn sign(&self, digest: B256) -> Signature;

    /// The address of the node's key.
    fn address(&self) -> Address;

    /// Whether the transaction pool has work. Gates the empty-block wait at
    /// round 0; defaults to "yes" so the wait is skipped.
    fn has_pending_transactions(&self) -> bool {
        true
    }
}
