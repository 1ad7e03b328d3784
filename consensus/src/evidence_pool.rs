//! Detection, persistence and gossip staging of validator misbehavior.
//!
//! Evidence lives in redb under two partitions, pending and committed, keyed
//! by `height ‖ H(ev)` so pruning walks in height order. An in-memory mirror
//! behind a single async mutex serializes writers and keeps reads cheap; the
//! blocking redb work runs off the async threads.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use alloy_primitives::B256;
use alloy_rlp::{Decodable, Encodable};
use redb::ReadableTable;
use reimint_types::{Evidence, EvidenceError, Height, ValidatorSet};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("failed to join on task: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("failed to decode stored evidence: {0}")]
    Rlp(#[from] alloy_rlp::Error),
}

#[derive(Debug, Error)]
pub enum EvidencePoolError {
    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    #[error("evidence at height {evidence_height} is older than {max_age} blocks (now at {height})")]
    Expired {
        evidence_height: Height,
        height: Height,
        max_age: u64,
    },

    #[error("evidence was already committed in a block")]
    AlreadyCommitted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// `height (BE) ‖ H(ev)`, so iteration and pruning follow height order.
#[derive(Debug)]
struct EvidenceKey;

impl redb::Value for EvidenceKey {
    type SelfType<'a> = (u64, [u8; 32]);
    type AsBytes<'a> = [u8; 40];

    fn fixed_width() -> Option<usize> {
        Some(40)
    }

    fn from_bytes<'a>(data: &'a [u8]) -> Self::SelfType<'a>
    where
        Self: 'a,
    {
        let mut height = [0u8; 8];
        height.copy_from_slice(&data[..8]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&data[8..40]);
        (u64::from_be_bytes(height), hash)
    }

    fn as_bytes<'a, 'b: 'a>(value: &'a Self::SelfType<'b>) -> Self::AsBytes<'a>
    where
        Self: 'b,
    {
        let mut out = [0u8; 40];
        out[..8].copy_from_slice(&value.0.to_be_bytes());
        out[8..].copy_from_slice(&value.1);
        out
    }

    fn type_name() -> redb::TypeName {
        redb::TypeName::new("reimint::EvidenceKey")
    }
}

impl redb::Key for EvidenceKey {
    fn compare(data1: &[u8], data2: &[u8]) -> core::cmp::Ordering {
        data1.cmp(data2)
    }
}

const PENDING_EVIDENCE_TABLE: redb::TableDefinition<'_, EvidenceKey, Vec<u8>> =
    redb::TableDefinition::new("pending_evidence");

const COMMITTED_EVIDENCE_TABLE: redb::TableDefinition<'_, EvidenceKey, Vec<u8>> =
    redb::TableDefinition::new("committed_evidence");

struct Db {
    db: redb::Database,
}

impl Db {
    fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = redb::Database::create(path)?;
        let this = Self { db };
        this.create_tables()?;
        Ok(this)
    }

    fn create_tables(&self) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        let _ = tx.open_table(PENDING_EVIDENCE_TABLE)?;
        let _ = tx.open_table(COMMITTED_EVIDENCE_TABLE)?;
        tx.commit()?;
        Ok(())
    }

    fn load(&self) -> Result<(Vec<(u64, [u8; 32], Evidence)>, Vec<(u64, [u8; 32])>), StoreError> {
        let tx = self.db.begin_read()?;

        let mut pending = Vec::new();
        {
            let table = tx.open_table(PENDING_EVIDENCE_TABLE)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                let (height, hash) = key.value();
                let evidence = Evidence::decode(&mut value.value().as_slice())?;
                pending.push((height, hash, evidence));
            }
        }

        let mut committed = Vec::new();
        {
            let table = tx.open_table(COMMITTED_EVIDENCE_TABLE)?;
            for entry in table.iter()? {
                let (key, _) = entry?;
                committed.push(key.value());
            }
        }

        Ok((pending, committed))
    }

    fn insert_pending(&self, key: (u64, [u8; 32]), bytes: Vec<u8>) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(PENDING_EVIDENCE_TABLE)?;
            table.insert(key, bytes)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_committed(&self, key: (u64, [u8; 32]), bytes: Vec<u8>) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut pending = tx.open_table(PENDING_EVIDENCE_TABLE)?;
            pending.remove(key)?;
            let mut committed = tx.open_table(COMMITTED_EVIDENCE_TABLE)?;
            committed.insert(key, bytes)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn prune_below(&self, height: Height) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            let mut pending = tx.open_table(PENDING_EVIDENCE_TABLE)?;
            pending.retain(|key, _| key.0 >= height)?;
            let mut committed = tx.open_table(COMMITTED_EVIDENCE_TABLE)?;
            committed.retain(|key, _| key.0 >= height)?;
        }
        tx.commit()?;
        Ok(())
    }
}

struct PoolState {
    pending: BTreeMap<(Height, B256), Evidence>,
    committed: BTreeSet<(Height, B256)>,
}

struct PoolInner {
    db: Arc<Db>,
    max_age_num_blocks: u64,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct EvidencePool {
    inner: Arc<PoolInner>,
}

impl EvidencePool {
    /// Open (or create) the pool at `path`, reloading both partitions.
    pub async fn open(
        path: impl AsRef<Path>,
        max_age_num_blocks: u64,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_owned();
        let (db, pending_rows, committed_rows) = tokio::task::spawn_blocking(move || {
            let db = Db::new(path)?;
            let (pending, committed) = db.load()?;
            Ok::<_, StoreError>((db, pending, committed))
        })
        .await??;

        let mut pending = BTreeMap::new();
        for (height, hash, evidence) in pending_rows {
            pending.insert((height, B256::from(hash)), evidence);
        }
        let committed = committed_rows
            .into_iter()
            .map(|(height, hash)| (height, B256::from(hash)))
            .collect();

        Ok(Self {
            inner: Arc::new(PoolInner {
                db: Arc::new(db),
                max_age_num_blocks,
                state: Mutex::new(PoolState { pending, committed }),
            }),
        })
    }

    /// Verify and persist new evidence. Returns `false` when the evidence is
    /// already known (pending or committed).
    pub async fn add_evidence(
        &self,
        evidence: Evidence,
        validators: &ValidatorSet,
    ) -> Result<bool, EvidencePoolError> {
        evidence.verify(validators)?;

        let key = (evidence.height(), evidence.hash());
        let mut state = self.inner.state.lock().await;
        if state.pending.contains_key(&key) || state.committed.contains(&key) {
            return Ok(false);
        }

        let bytes = alloy_rlp::encode(&evidence);
        let db = Arc::clone(&self.inner.db);
        let db_key: (u64, [u8; 32]) = (key.0, key.1.into());
        tokio::task::spawn_blocking(move || db.insert_pending(db_key, bytes))
            .await
            .map_err(StoreError::TaskJoin)??;

        info!(
            height = evidence.height(),
            hash = %key.1,
            "new evidence added to the pool"
        );
        state.pending.insert(key, evidence);
        Ok(true)
    }

    /// Validate a block's evidence list: every entry must verify, be inside
    /// the age window ending at `height`, and not be committed already.
    pub async fn check_evidence(
        &self,
        list: &[Evidence],
        height: Height,
        validators: &ValidatorSet,
    ) -> Result<(), EvidencePoolError> {
        let state = self.inner.state.lock().await;
        for evidence in list {
            evidence.verify(validators)?;

            if height.saturating_sub(evidence.height()) > self.inner.max_age_num_blocks {
                return Err(EvidencePoolError::Expired {
                    evidence_height: evidence.height(),
                    height,
                    max_age: self.inner.max_age_num_blocks,
                });
            }
            if state.committed.contains(&(evidence.height(), evidence.hash())) {
                return Err(EvidencePoolError::AlreadyCommitted);
            }
        }
        Ok(())
    }

    /// A size-bounded batch of pending evidence for the next block, oldest
    /// first.
    pub async fn pending_evidence(&self, max_bytes: usize) -> Vec<Evidence> {
        let state = self.inner.state.lock().await;
        let mut out = Vec::new();
        let mut used = 0usize;
        for evidence in state.pending.values() {
            let size = evidence.length();
            if used + size > max_bytes {
                break;
            }
            used += size;
            out.push(evidence.clone());
        }
        out
    }

    /// Mark evidence sealed in a committed block at `height` and prune
    /// everything older than the age window.
    pub async fn update(&self, committed: &[Evidence], height: Height) -> Result<(), StoreError> {
        let mut state = self.inner.state.lock().await;

        for evidence in committed {
            let key = (evidence.height(), evidence.hash());
            state.pending.remove(&key);
            if state.committed.insert(key) {
                let db = Arc::clone(&self.inner.db);
                let bytes = alloy_rlp::encode(evidence);
                let db_key: (u64, [u8; 32]) = (key.0, key.1.into());
                tokio::task::spawn_blocking(move || db.mark_committed(db_key, bytes)).await??;
            }
        }

        let cutoff = height.saturating_sub(self.inner.max_age_num_blocks);
        if cutoff > 0 {
            state.pending.retain(|key, _| key.0 >= cutoff);
            state.committed.retain(|key| key.0 >= cutoff);
            let db = Arc::clone(&self.inner.db);
            tokio::task::spawn_blocking(move || db.prune_below(cutoff)).await??;
        }
        Ok(())
    }

    pub async fn is_pending(&self, evidence: &Evidence) -> bool {
        let state = self.inner.state.lock().await;
        state
            .pending
            .contains_key(&(evidence.height(), evidence.hash()))
    }

    pub async fn is_committed(&self, evidence: &Evidence) -> bool {
        let state = self.inner.state.lock().await;
        state
            .committed
            .contains(&(evidence.height(), evidence.hash()))
    }

    /// Verify-and-add used by the state machine when a conflict is detected
    /// locally; failures are logged, never fatal to the consensus loop.
    pub async fn report_conflict(&self, evidence: Evidence, validators: &ValidatorSet) {
        match self.add_evidence(evidence, validators).await {
            Ok(true) => {}
            Ok(false) => {}
            Err(error) => warn!(%error, "failed to record conflicting-vote evidence"),
        }
    }
}
