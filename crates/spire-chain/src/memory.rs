// In-memory chain backend used by the dev binary and the test suites.
use std::collections::HashMap;
use std::sync::Arc;

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, OutPoint, Transaction, Txid};
use tokio::sync::{broadcast, RwLock};

use spire_wire::payload::{HistoryRow, StealthRow};
use spire_wire::{BitPrefix, ErrorCode};

use async_trait::async_trait;

use crate::{BlockRef, Chain, ChainResult, MempoolEvent, ReorgEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct TxEntry {
    tx: Arc<Transaction>,
    height: u32,
    position: u32,
}

struct StealthEntry {
    height: u32,
    field: Vec<u8>,
    row: StealthRow,
}

#[derive(Default)]
struct State {
    tip: Option<u32>,
    headers: HashMap<u32, Header>,
    heights: HashMap<BlockHash, u32>,
    block_txids: HashMap<u32, Vec<Txid>>,
    confirmed: HashMap<Txid, TxEntry>,
    unconfirmed: HashMap<Txid, Arc<Transaction>>,
    spends: HashMap<OutPoint, OutPoint>,
    history: HashMap<(u8, [u8; 20]), Vec<HistoryRow>>,
    stealth: Vec<StealthEntry>,
}

/// Chain backend backed by plain maps.
///
/// Blocks are inserted at explicit heights via [`MemoryChain::push_block`],
/// which also emits the matching reorg event, so tests can drive the
/// notification pipeline without a real block store.
pub struct MemoryChain {
    state: RwLock<State>,
    reorg_tx: broadcast::Sender<ReorgEvent>,
    mempool_tx: broadcast::Sender<MempoolEvent>,
}

impl Default for MemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChain {
    pub fn new() -> Self {
        let (reorg_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (mempool_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            reorg_tx,
            mempool_tx,
        }
    }

    /// Append a block at the given height and announce the single-block
    /// reorg that applied it.
    pub async fn push_block(&self, height: u32, block: Block) {
        let block = Arc::new(block);
        self.index_block(height, &block).await;
        // A block at height 0 has no fork point below it.
        // Nobody listening is fine; the send result only reports that.
        let _ = self.reorg_tx.send(ReorgEvent {
            fork_height: height.checked_sub(1),
            new_blocks: vec![block],
            old_blocks: Vec::new(),
        });
    }

    /// Announce an arbitrary reorganization without touching stored state.
    pub fn announce_reorg(&self, event: ReorgEvent) {
        let _ = self.reorg_tx.send(event);
    }

    /// Record a mempool transaction and announce it.
    pub async fn announce_mempool(&self, tx: Transaction) {
        let tx = Arc::new(tx);
        self.state
            .write()
            .await
            .unconfirmed
            .insert(tx.compute_txid(), Arc::clone(&tx));
        let _ = self.mempool_tx.send(tx);
    }

    pub async fn insert_history_row(
        &self,
        address_version: u8,
        address_hash: [u8; 20],
        row: HistoryRow,
    ) {
        self.state
            .write()
            .await
            .history
            .entry((address_version, address_hash))
            .or_default()
            .push(row);
    }

    /// Store a stealth row matched against `field` from `height` onward.
    pub async fn insert_stealth_row(&self, height: u32, field: Vec<u8>, row: StealthRow) {
        self.state.write().await.stealth.push(StealthEntry {
            height,
            field,
            row,
        });
    }

    async fn index_block(&self, height: u32, block: &Arc<Block>) {
        let mut state = self.state.write().await;
        let hash = block.block_hash();
        state.headers.insert(height, block.header);
        state.heights.insert(hash, height);
        let mut txids = Vec::with_capacity(block.txdata.len());
        for (position, tx) in block.txdata.iter().enumerate() {
            let txid = tx.compute_txid();
            txids.push(txid);
            for (vin, input) in tx.input.iter().enumerate() {
                state
                    .spends
                    .insert(input.previous_output, OutPoint::new(txid, vin as u32));
            }
            state.unconfirmed.remove(&txid);
            state.confirmed.insert(
                txid,
                TxEntry {
                    tx: Arc::new(tx.clone()),
                    height,
                    position: position as u32,
                },
            );
        }
        state.block_txids.insert(height, txids);
        state.tip = Some(state.tip.map_or(height, |tip| tip.max(height)));
    }

    async fn resolve_height(&self, block: BlockRef) -> ChainResult<u32> {
        let state = self.state.read().await;
        match block {
            BlockRef::Height(height) => Ok(height),
            BlockRef::Hash(hash) => state.heights.get(&hash).copied().ok_or(ErrorCode::NotFound),
        }
    }
}

#[async_trait]
impl Chain for MemoryChain {
    async fn fetch_history(
        &self,
        address_version: u8,
        address_hash: [u8; 20],
        limit: usize,
        from_height: u32,
    ) -> ChainResult<Vec<HistoryRow>> {
        let state = self.state.read().await;
        let mut rows: Vec<HistoryRow> = state
            .history
            .get(&(address_version, address_hash))
            .map(|rows| {
                rows.iter()
                    .filter(|row| row.height >= from_height)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        if limit > 0 {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    async fn fetch_transaction(
        &self,
        hash: Txid,
        require_confirmed: bool,
    ) -> ChainResult<Arc<Transaction>> {
        let state = self.state.read().await;
        if let Some(entry) = state.confirmed.get(&hash) {
            return Ok(Arc::clone(&entry.tx));
        }
        if !require_confirmed {
            if let Some(tx) = state.unconfirmed.get(&hash) {
                return Ok(Arc::clone(tx));
            }
        }
        Err(ErrorCode::NotFound)
    }

    async fn fetch_last_height(&self) -> ChainResult<u32> {
        self.state.read().await.tip.ok_or(ErrorCode::NotFound)
    }

    async fn fetch_block_header(&self, block: BlockRef) -> ChainResult<Header> {
        let height = self.resolve_height(block).await?;
        self.state
            .read()
            .await
            .headers
            .get(&height)
            .copied()
            .ok_or(ErrorCode::NotFound)
    }

    async fn fetch_merkle_block(&self, block: BlockRef) -> ChainResult<Vec<Txid>> {
        let height = self.resolve_height(block).await?;
        self.state
            .read()
            .await
            .block_txids
            .get(&height)
            .cloned()
            .ok_or(ErrorCode::NotFound)
    }

    async fn fetch_transaction_position(
        &self,
        hash: Txid,
        _require_confirmed: bool,
    ) -> ChainResult<(u32, u32)> {
        let state = self.state.read().await;
        state
            .confirmed
            .get(&hash)
            .map(|entry| (entry.height, entry.position))
            .ok_or(ErrorCode::NotFound)
    }

    async fn fetch_spend(&self, outpoint: OutPoint) -> ChainResult<OutPoint> {
        let state = self.state.read().await;
        state
            .spends
            .get(&outpoint)
            .copied()
            .ok_or(ErrorCode::NotFound)
    }

    async fn fetch_block_height(&self, hash: BlockHash) -> ChainResult<u32> {
        let state = self.state.read().await;
        state.heights.get(&hash).copied().ok_or(ErrorCode::NotFound)
    }

    async fn fetch_stealth(
        &self,
        prefix: &BitPrefix,
        from_height: u32,
    ) -> ChainResult<Vec<StealthRow>> {
        let state = self.state.read().await;
        Ok(state
            .stealth
            .iter()
            .filter(|entry| entry.height >= from_height && prefix.matches(&entry.field))
            .map(|entry| entry.row)
            .collect())
    }

    async fn organize(&self, block: Block, simulate: bool) -> ChainResult<()> {
        if block.txdata.is_empty() {
            return Err(ErrorCode::ValidationError);
        }
        if simulate {
            return Ok(());
        }
        let height = self
            .state
            .read()
            .await
            .tip
            .map_or(0, |tip| tip.saturating_add(1));
        self.push_block(height, block).await;
        Ok(())
    }

    fn reorg_events(&self) -> broadcast::Receiver<ReorgEvent> {
        self.reorg_tx.subscribe()
    }

    fn mempool_events(&self) -> broadcast::Receiver<MempoolEvent> {
        self.mempool_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::block::Version;
    use bitcoin::hashes::Hash;
    use bitcoin::transaction;
    use bitcoin::{Amount, CompactTarget, ScriptBuf, TxMerkleNode, TxOut};

    fn sample_tx(value: u64) -> Transaction {
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: Vec::new(),
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: ScriptBuf::new(),
            }],
        }
    }

    fn sample_block(txs: Vec<Transaction>) -> Block {
        Block {
            header: Header {
                version: Version::TWO,
                prev_blockhash: BlockHash::all_zeros(),
                merkle_root: TxMerkleNode::all_zeros(),
                time: 0,
                bits: CompactTarget::from_consensus(0x1d00_ffff),
                nonce: 0,
            },
            txdata: txs,
        }
    }

    #[tokio::test]
    async fn empty_chain_reports_not_found() {
        let chain = MemoryChain::new();
        assert_eq!(chain.fetch_last_height().await, Err(ErrorCode::NotFound));
        assert_eq!(
            chain.fetch_block_header(BlockRef::Height(1)).await,
            Err(ErrorCode::NotFound)
        );
    }

    #[tokio::test]
    async fn push_block_indexes_and_announces() {
        let chain = MemoryChain::new();
        let mut reorgs = chain.reorg_events();
        let block = sample_block(vec![sample_tx(50_000)]);
        let hash = block.block_hash();
        let txid = block.txdata[0].compute_txid();

        chain.push_block(650_000, block).await;

        assert_eq!(chain.fetch_last_height().await, Ok(650_000));
        assert_eq!(chain.fetch_block_height(hash).await, Ok(650_000));
        assert_eq!(
            chain.fetch_merkle_block(BlockRef::Hash(hash)).await,
            Ok(vec![txid])
        );
        assert_eq!(
            chain.fetch_transaction_position(txid, true).await,
            Ok((650_000, 0))
        );

        let event = reorgs.recv().await.expect("reorg event");
        assert_eq!(event.fork_height, Some(649_999));
        assert_eq!(event.first_height(), 650_000);
        assert_eq!(event.new_blocks.len(), 1);
        assert!(event.old_blocks.is_empty());
    }

    #[tokio::test]
    async fn first_block_announces_a_pre_genesis_fork() {
        let chain = MemoryChain::new();
        let mut reorgs = chain.reorg_events();
        chain.push_block(0, sample_block(vec![sample_tx(1)])).await;

        assert_eq!(chain.fetch_last_height().await, Ok(0));
        let event = reorgs.recv().await.expect("reorg event");
        assert_eq!(event.fork_height, None);
        assert_eq!(event.first_height(), 0);
    }

    #[tokio::test]
    async fn history_is_keyed_by_version_and_hash() {
        let chain = MemoryChain::new();
        let row = HistoryRow {
            point_kind: 0,
            tx_hash: [0x11; 32],
            index: 0,
            height: 10,
            value: 5,
        };
        chain.insert_history_row(0x05, [0xAA; 20], row).await;

        assert_eq!(chain.fetch_history(0x05, [0xAA; 20], 0, 0).await, Ok(vec![row]));
        // Same hash under another version is a different address.
        assert_eq!(chain.fetch_history(0x00, [0xAA; 20], 0, 0).await, Ok(vec![]));
        assert_eq!(chain.fetch_history(0x05, [0xAA; 20], 0, 11).await, Ok(vec![]));
    }

    #[tokio::test]
    async fn mempool_transactions_need_unconfirmed_lookup() {
        let chain = MemoryChain::new();
        let tx = sample_tx(7);
        let txid = tx.compute_txid();
        chain.announce_mempool(tx).await;

        assert_eq!(
            chain.fetch_transaction(txid, true).await,
            Err(ErrorCode::NotFound)
        );
        assert!(chain.fetch_transaction(txid, false).await.is_ok());
    }

    #[tokio::test]
    async fn organize_simulate_does_not_commit() {
        let chain = MemoryChain::new();
        let block = sample_block(vec![sample_tx(1)]);
        chain.organize(block.clone(), true).await.expect("simulate");
        assert_eq!(chain.fetch_last_height().await, Err(ErrorCode::NotFound));

        chain.organize(block, false).await.expect("organize");
        assert_eq!(chain.fetch_last_height().await, Ok(0));
    }

    #[tokio::test]
    async fn empty_block_fails_validation() {
        let chain = MemoryChain::new();
        let block = sample_block(Vec::new());
        assert_eq!(
            chain.organize(block, true).await,
            Err(ErrorCode::ValidationError)
        );
    }

    #[tokio::test]
    async fn stealth_rows_filter_by_prefix_and_height() {
        let chain = MemoryChain::new();
        let row = StealthRow {
            ephemeral_key_hash: [0x11; 32],
            address_hash: [0x22; 20],
            tx_hash: [0x33; 32],
        };
        chain
            .insert_stealth_row(100, vec![0xAB, 0xCD, 0x00, 0x00], row)
            .await;

        let prefix = BitPrefix::new(8, vec![0xAB]).expect("prefix");
        assert_eq!(chain.fetch_stealth(&prefix, 0).await, Ok(vec![row]));
        assert_eq!(chain.fetch_stealth(&prefix, 101).await, Ok(vec![]));

        let other = BitPrefix::new(8, vec![0xAC]).expect("prefix");
        assert_eq!(chain.fetch_stealth(&other, 0).await, Ok(vec![]));
    }
}
