//! Simulated collaborators for demos and tests.
//!
//! [`SimSource`] hands out zero-filled payloads of configurable size and can
//! pretend some items were submitted by an earlier run. [`SimTarget`] models
//! a chain: submissions wait in a mempool until [`SimTarget::mine_block`]
//! moves them into a block, confirmations are the number of blocks on top,
//! and [`SimTarget::orphan_blocks`] drops the newest blocks together with
//! their transactions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::environment::{
    BoxError, Deduplicator, Payload, RemoteId, SourceEnvironment, TargetEnvironment, TargetStatus,
};

/// Tag carrying the item key on simulated payloads.
pub const ITEM_KEY_TAG: &str = "Item-Key";

/// How [`SimSource`] sizes the payloads it returns.
#[derive(Debug, Clone)]
pub enum SizeProfile {
    Fixed(u64),
    /// Uniformly random in `min..=max`.
    Random { min: u64, max: u64 },
    /// The n-th fetch gets `sizes[n % sizes.len()]`.
    Cycle(Vec<u64>),
}

/// Known submissions from an earlier run, by item key.
#[derive(Debug, Default)]
pub struct DedupTable {
    known: Mutex<HashMap<String, RemoteId>>,
}

#[async_trait]
impl Deduplicator for DedupTable {
    async fn existing_id(&self, key: &str, _payload: &Payload) -> Result<Option<RemoteId>, BoxError> {
        Ok(self.known.lock().await.get(key).cloned())
    }
}

#[derive(Debug)]
pub struct SimSource {
    sizes: SizeProfile,
    dedup: Option<DedupTable>,
    failing: Mutex<HashSet<String>>,
    fetched: AtomicUsize,
    fetched_bytes: AtomicU64,
}

impl SimSource {
    pub fn new(sizes: SizeProfile) -> Self {
        Self {
            sizes,
            dedup: None,
            failing: Mutex::new(HashSet::new()),
            fetched: AtomicUsize::new(0),
            fetched_bytes: AtomicU64::new(0),
        }
    }

    /// Enable the dedup hook, initially knowing no items.
    pub fn with_dedup(mut self) -> Self {
        self.dedup = Some(DedupTable::default());
        self
    }

    /// Mark `key` as already submitted under `remote_id`. No-op without dedup.
    pub async fn remember(&self, key: &str, remote_id: &str) {
        if let Some(table) = &self.dedup {
            table
                .known
                .lock()
                .await
                .insert(key.to_string(), remote_id.to_string());
        }
    }

    /// Make every fetch of `key` fail.
    pub async fn fail_fetch(&self, key: &str) {
        self.failing.lock().await.insert(key.to_string());
    }

    pub fn fetched(&self) -> usize {
        self.fetched.load(Ordering::Relaxed)
    }

    pub fn fetched_bytes(&self) -> u64 {
        self.fetched_bytes.load(Ordering::Relaxed)
    }

    fn next_size(&self, n: usize) -> u64 {
        match &self.sizes {
            SizeProfile::Fixed(size) => *size,
            SizeProfile::Random { min, max } => rand::thread_rng().gen_range(*min..=*max),
            SizeProfile::Cycle(sizes) if sizes.is_empty() => 0,
            SizeProfile::Cycle(sizes) => sizes[n % sizes.len()],
        }
    }
}

#[async_trait]
impl SourceEnvironment for SimSource {
    async fn fetch(&self, key: &str) -> Result<Payload, BoxError> {
        if self.failing.lock().await.contains(key) {
            return Err(format!("simulated fetch failure for {}", key).into());
        }
        let n = self.fetched.fetch_add(1, Ordering::Relaxed);
        let size = self.next_size(n);
        self.fetched_bytes.fetch_add(size, Ordering::Relaxed);

        Ok(Payload::new(vec![0u8; size as usize])
            .with_tag("Content-Type", "application/octet-stream")
            .with_tag(ITEM_KEY_TAG, key))
    }

    fn deduplicator(&self) -> Option<&dyn Deduplicator> {
        self.dedup.as_ref().map(|d| d as &dyn Deduplicator)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimTx {
    id: RemoteId,
    key: Option<String>,
    byte_size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Block {
    hash: String,
    txs: Vec<SimTx>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Chain {
    mempool: Vec<SimTx>,
    blocks: Vec<Block>,
    orphaned_txs: usize,
    orphaned_bytes: u64,
}

impl Chain {
    fn status(&self, id: &str) -> TargetStatus {
        let height = self.blocks.len();
        if let Some(idx) = self
            .blocks
            .iter()
            .position(|b| b.txs.iter().any(|tx| tx.id == id))
        {
            return TargetStatus::Confirmed {
                confirmations: (height - 1 - idx) as u64,
            };
        }
        if self.mempool.iter().any(|tx| tx.id == id) {
            TargetStatus::Accepted
        } else {
            TargetStatus::NotFound
        }
    }

    fn push_block(&mut self, txs: Vec<SimTx>) {
        let hash = format!("block_{}", Uuid::new_v4().simple());
        tracing::debug!(block = %hash, txs = txs.len(), height = self.blocks.len() + 1, "Mined block");
        self.blocks.push(Block { hash, txs });
    }
}

/// Background miner settings for [`SimTarget::run_miner`].
#[derive(Debug, Clone)]
pub struct MinerConfig {
    /// Longest time between blocks; each gap is random up to this.
    pub block_time: Duration,
    /// Chance of orphaning blocks before each new one.
    pub orphan_chance: f64,
    pub max_orphan_blocks: usize,
    pub max_txs_per_block: usize,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            block_time: Duration::from_secs(120),
            orphan_chance: 0.1,
            max_orphan_blocks: 2,
            max_txs_per_block: 1000,
        }
    }
}

#[derive(Debug, Default)]
pub struct SimTarget {
    chain: Mutex<Chain>,
    posted: AtomicUsize,
    posted_bytes: AtomicU64,
    fail_submit: AtomicBool,
    fail_status: AtomicBool,
}

impl SimTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mempool and blocks as JSON, so a resumed demo sees the same chain.
    pub async fn chain_to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&*self.chain.lock().await)
    }

    /// A target whose chain is restored from [`SimTarget::chain_to_json`].
    /// Submission counters start from zero.
    pub fn from_chain_json(json: &str) -> serde_json::Result<Self> {
        Ok(Self {
            chain: Mutex::new(serde_json::from_str(json)?),
            ..Self::default()
        })
    }

    /// Move up to `max_txs` transactions from the mempool into a new block.
    /// Returns how many were mined.
    pub async fn mine_block(&self, max_txs: usize) -> usize {
        let mut chain = self.chain.lock().await;
        let count = max_txs.min(chain.mempool.len());
        let txs: Vec<SimTx> = chain.mempool.drain(..count).collect();
        chain.push_block(txs);
        count
    }

    /// Drop the newest `count` blocks. Their transactions are forgotten.
    /// Returns how many transactions were orphaned.
    pub async fn orphan_blocks(&self, count: usize) -> usize {
        let mut chain = self.chain.lock().await;
        let keep = chain.blocks.len().saturating_sub(count);
        let dropped = chain.blocks.split_off(keep);
        let txs: usize = dropped.iter().map(|b| b.txs.len()).sum();
        let bytes: u64 = dropped
            .iter()
            .flat_map(|b| b.txs.iter())
            .map(|tx| tx.byte_size)
            .sum();
        chain.orphaned_txs += txs;
        chain.orphaned_bytes += bytes;
        tracing::info!(
            blocks = dropped.len(),
            txs,
            total_orphaned_txs = chain.orphaned_txs,
            total_orphaned_bytes = chain.orphaned_bytes,
            "Orphaned blocks"
        );
        txs
    }

    /// Put an already-known transaction in its own block, as if an earlier
    /// run had submitted it.
    pub async fn preload(&self, id: &str) {
        let mut chain = self.chain.lock().await;
        chain.push_block(vec![SimTx {
            id: id.to_string(),
            key: None,
            byte_size: 0,
        }]);
    }

    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::Relaxed);
    }

    pub fn fail_status(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::Relaxed);
    }

    pub fn posted(&self) -> usize {
        self.posted.load(Ordering::Relaxed)
    }

    pub fn posted_bytes(&self) -> u64 {
        self.posted_bytes.load(Ordering::Relaxed)
    }

    pub async fn height(&self) -> usize {
        self.chain.lock().await.blocks.len()
    }

    pub async fn mempool_len(&self) -> usize {
        self.chain.lock().await.mempool.len()
    }

    /// Item keys of every transaction currently in the mempool or a block,
    /// in submission order within each.
    pub async fn known_keys(&self) -> Vec<String> {
        let chain = self.chain.lock().await;
        chain
            .blocks
            .iter()
            .flat_map(|b| b.txs.iter())
            .chain(chain.mempool.iter())
            .filter_map(|tx| tx.key.clone())
            .collect()
    }

    /// Hash of the block holding `id`, if mined.
    pub async fn block_of(&self, id: &str) -> Option<String> {
        let chain = self.chain.lock().await;
        chain
            .blocks
            .iter()
            .find(|b| b.txs.iter().any(|tx| tx.id == id))
            .map(|b| b.hash.clone())
    }

    /// Mine blocks at random intervals until `token` is cancelled, orphaning
    /// recent blocks now and then.
    pub async fn run_miner(self: Arc<Self>, config: MinerConfig, token: CancellationToken) {
        loop {
            let (delay, orphan, orphan_count) = {
                let mut rng = rand::thread_rng();
                let max = config.block_time.as_secs_f64();
                (
                    Duration::from_secs_f64(rng.gen_range(max * 0.05..=max.max(f64::EPSILON))),
                    rng.gen_bool(config.orphan_chance.clamp(0.0, 1.0)),
                    rng.gen_range(1..=config.max_orphan_blocks.max(1)),
                )
            };

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::debug!("Miner stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if orphan {
                self.orphan_blocks(orphan_count).await;
            }

            let mempool = self.mempool_len().await;
            let txs = {
                let upper = mempool.saturating_mul(3);
                rand::thread_rng().gen_range(0..=upper)
            };
            self.mine_block(txs.min(config.max_txs_per_block)).await;
        }
    }
}

#[async_trait]
impl TargetEnvironment for SimTarget {
    async fn submit(&self, payload: &Payload) -> Result<RemoteId, BoxError> {
        if self.fail_submit.load(Ordering::Relaxed) {
            return Err("simulated submission failure".into());
        }
        let id = format!("tx_{}", Uuid::new_v4().simple());
        let key = payload
            .tags
            .iter()
            .find(|t| t.name == ITEM_KEY_TAG)
            .map(|t| t.value.clone());

        self.chain.lock().await.mempool.push(SimTx {
            id: id.clone(),
            key,
            byte_size: payload.byte_size(),
        });
        self.posted.fetch_add(1, Ordering::Relaxed);
        self.posted_bytes
            .fetch_add(payload.byte_size(), Ordering::Relaxed);
        Ok(id)
    }

    async fn status(&self, remote_id: &str) -> Result<TargetStatus, BoxError> {
        if self.fail_status.load(Ordering::Relaxed) {
            return Err("simulated status failure".into());
        }
        Ok(self.chain.lock().await.status(remote_id))
    }
}
