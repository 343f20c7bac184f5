// Abstract blockchain backend consumed by the query dispatcher and the
// notification worker. The real block store, UTXO index and mempool live
// behind this trait; lookup failures surface as wire error codes so
// handlers can forward them to clients verbatim.
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::block::Header;
use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use tokio::sync::broadcast;

use spire_wire::payload::{HistoryRow, StealthRow};
use spire_wire::{BitPrefix, ErrorCode};

pub mod memory;

pub use memory::MemoryChain;

/// Chain calls either produce a value or the reply code to send back.
pub type ChainResult<T> = std::result::Result<T, ErrorCode>;

/// Block selector for header and transaction-hash queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Hash(BlockHash),
    Height(u32),
}

/// A chain reorganization: `old_blocks` rolled back, `new_blocks` applied
/// starting just past the fork point.
#[derive(Debug, Clone)]
pub struct ReorgEvent {
    /// Height of the last common block; `None` when the applied side starts
    /// at the genesis height, which has no block below it.
    pub fork_height: Option<u32>,
    pub new_blocks: Vec<Arc<Block>>,
    pub old_blocks: Vec<Arc<Block>>,
}

impl ReorgEvent {
    /// Height of the first applied block.
    pub fn first_height(&self) -> u32 {
        self.fork_height.map_or(0, |fork| fork.saturating_add(1))
    }
}

/// A transaction accepted into the mempool.
///
/// Heights on this interface are 32-bit by construction; a backend whose
/// internal heights exceed that range violates the wire contract.
pub type MempoolEvent = Arc<Transaction>;

/// Blockchain backend capability.
///
/// Implementations are externally thread safe; completion may happen on any
/// thread. Event receivers follow a pull model: the notification worker owns
/// a receiver per stream and drains it on its own schedule.
#[async_trait]
pub trait Chain: Send + Sync + 'static {
    /// Confirmed history rows for an address, oldest first. The version
    /// byte and hash together identify the address; hashes can collide
    /// across versions.
    async fn fetch_history(
        &self,
        address_version: u8,
        address_hash: [u8; 20],
        limit: usize,
        from_height: u32,
    ) -> ChainResult<Vec<HistoryRow>>;

    async fn fetch_transaction(
        &self,
        hash: Txid,
        require_confirmed: bool,
    ) -> ChainResult<Arc<Transaction>>;

    async fn fetch_last_height(&self) -> ChainResult<u32>;

    async fn fetch_block_header(&self, block: BlockRef) -> ChainResult<Header>;

    /// Transaction hashes of a block, in block order.
    async fn fetch_merkle_block(&self, block: BlockRef) -> ChainResult<Vec<Txid>>;

    /// `(block_height, tx_position)` of a transaction.
    async fn fetch_transaction_position(
        &self,
        hash: Txid,
        require_confirmed: bool,
    ) -> ChainResult<(u32, u32)>;

    /// The input point spending the given output point.
    async fn fetch_spend(&self, outpoint: OutPoint) -> ChainResult<OutPoint>;

    async fn fetch_block_height(&self, hash: BlockHash) -> ChainResult<u32>;

    async fn fetch_stealth(
        &self,
        prefix: &BitPrefix,
        from_height: u32,
    ) -> ChainResult<Vec<StealthRow>>;

    /// Organize a block into the chain; `simulate` validates without
    /// committing. Validation failures come back as codes.
    async fn organize(&self, block: Block, simulate: bool) -> ChainResult<()>;

    fn reorg_events(&self) -> broadcast::Receiver<ReorgEvent>;

    fn mempool_events(&self) -> broadcast::Receiver<MempoolEvent>;
}
