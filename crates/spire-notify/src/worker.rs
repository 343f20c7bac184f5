// Chain-event consumer that fans matching transactions out to subscribers.
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bitcoin::consensus;
use bitcoin::hashes::{hash160, sha256, sha256d, Hash};
use bitcoin::script::Instruction;
use bitcoin::{Block, Script, Transaction};
use bytes::Bytes;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;

use spire_chain::{Chain, MempoolEvent, ReorgEvent};
use spire_wire::{payload, Route};

use crate::index::{AddressKey, Matched, SubscriberIndex};

/// Command name of v3 address notifications.
pub const ADDRESS_UPDATE_COMMAND: &str = "address.update2";

// Backoff before re-subscribing after an event stream closes.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

const ZERO_BLOCK_HASH: [u8; 32] = [0u8; 32];

/// Outbound capability the worker emits notifications through. The service
/// implements this over the router socket.
#[async_trait]
pub trait NotifySink: Send + Sync {
    async fn send(&self, route: &Route, command: &str, payload: Bytes)
        -> Result<(), SinkError>;
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SinkError {
    #[error("peer gone")]
    PeerGone,
    #[error("transport closed")]
    Closed,
}

/// Purge cadence: a fraction of the TTL, clamped to a sane window.
pub fn purge_interval(ttl: Duration) -> Duration {
    (ttl / 10).clamp(Duration::from_secs(1), Duration::from_secs(60))
}

/// Long-running task joining chain events with the subscriber index.
///
/// Event receivers are taken at construction time so nothing published after
/// `new` is missed, even if `run` is scheduled later.
pub struct NotificationWorker {
    chain: Arc<dyn Chain>,
    index: Arc<SubscriberIndex>,
    sink: Arc<dyn NotifySink>,
    ttl: Duration,
    reorgs: Option<broadcast::Receiver<ReorgEvent>>,
    mempool: Option<broadcast::Receiver<MempoolEvent>>,
}

impl NotificationWorker {
    pub fn new(
        chain: Arc<dyn Chain>,
        index: Arc<SubscriberIndex>,
        sink: Arc<dyn NotifySink>,
        ttl: Duration,
    ) -> Self {
        let reorgs = Some(chain.reorg_events());
        let mempool = Some(chain.mempool_events());
        Self {
            chain,
            index,
            sink,
            ttl,
            reorgs,
            mempool,
        }
    }

    /// Drive the worker until shutdown is signalled. Event stream errors are
    /// logged and the streams re-subscribed; only shutdown ends the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut reorgs = self
            .reorgs
            .take()
            .unwrap_or_else(|| self.chain.reorg_events());
        let mut mempool = self
            .mempool
            .take()
            .unwrap_or_else(|| self.chain.mempool_events());
        let mut purge_tick = tokio::time::interval(purge_interval(self.ttl));
        purge_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = reorgs.recv() => match event {
                    Ok(reorg) => self.handle_reorganization(reorg).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "reorg event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("reorg event stream closed, resubscribing");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        reorgs = self.chain.reorg_events();
                    }
                },
                event = mempool.recv() => match event {
                    Ok(tx) => self.notify_transaction(0, ZERO_BLOCK_HASH, &tx).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "mempool event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::warn!("mempool event stream closed, resubscribing");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        mempool = self.chain.mempool_events();
                    }
                },
                _ = purge_tick.tick() => {
                    let purged = self.index.purge(Instant::now());
                    if purged > 0 {
                        metrics::counter!("spire_subscriptions_purged_total")
                            .increment(purged as u64);
                        tracing::debug!(purged, "purged expired subscriptions");
                    }
                }
            }
        }
        tracing::debug!("notification worker stopped");
    }

    // Only the applied side notifies; clients infer rollback from
    // re-delivery at the same or lower height.
    async fn handle_reorganization(&self, event: ReorgEvent) {
        let first_height = event.first_height();
        for (offset, block) in event.new_blocks.iter().enumerate() {
            let height = first_height.saturating_add(offset as u32);
            self.notify_block(height, block).await;
        }
    }

    async fn notify_block(&self, height: u32, block: &Block) {
        let block_hash = block.block_hash().to_byte_array();
        for tx in &block.txdata {
            self.notify_transaction(height, block_hash, tx).await;
        }
    }

    async fn notify_transaction(&self, height: u32, block_hash: [u8; 32], tx: &Transaction) {
        let fields = candidate_fields(tx);
        if fields.is_empty() {
            return;
        }

        // One notification per subscriber per transaction, however many
        // fields matched.
        let mut seen: HashSet<AddressKey> = HashSet::new();
        let mut matched: Vec<Matched> = Vec::new();
        for field in &fields {
            for entry in self.index.matches(field) {
                if seen.insert(entry.key.key) {
                    matched.push(entry);
                }
            }
        }
        if matched.is_empty() {
            return;
        }

        let tx_bytes = consensus::serialize(tx);
        for entry in matched {
            let Some(sequence) = self.index.take_sequence(&entry.key) else {
                continue;
            };
            let update = payload::encode_update(sequence, height, &block_hash, &tx_bytes);
            match self
                .sink
                .send(&entry.route, ADDRESS_UPDATE_COMMAND, update)
                .await
            {
                Ok(()) => {
                    metrics::counter!("spire_notifications_total").increment(1);
                }
                Err(err) => {
                    metrics::counter!("spire_notify_send_failures_total").increment(1);
                    tracing::info!(error = %err, "dropping subscriber after send failure");
                    self.index.remove_peer(&entry.key.key);
                }
            }
        }
    }
}

/// Candidate match fields of a transaction: per output the p2kh-compatible
/// 20-byte payment hash, the 32-byte script hash and any stealth field; per
/// input the payment hash recoverable from the spend script.
pub fn candidate_fields(tx: &Transaction) -> Vec<Vec<u8>> {
    let mut fields = Vec::new();
    for output in &tx.output {
        let script = &output.script_pubkey;
        if let Some(hash) = payment_hash(script) {
            fields.push(hash.to_vec());
        }
        fields.push(
            sha256::Hash::hash(script.as_bytes())
                .to_byte_array()
                .to_vec(),
        );
        if let Some(stealth) = stealth_field(script) {
            fields.push(stealth.to_vec());
        }
    }
    for input in &tx.input {
        if let Some(hash) = spend_payment_hash(input) {
            fields.push(hash.to_vec());
        }
    }
    fields
}

// The 20-byte hash a payment-style output commits to.
fn payment_hash(script: &Script) -> Option<[u8; 20]> {
    let bytes = script.as_bytes();
    if script.is_p2pkh() {
        return bytes[3..23].try_into().ok();
    }
    if script.is_p2sh() {
        return bytes[2..22].try_into().ok();
    }
    if script.is_p2wpkh() {
        return bytes[2..22].try_into().ok();
    }
    if script.is_p2pk() {
        if let Some(Ok(Instruction::PushBytes(push))) = script.instructions().next() {
            return Some(hash160::Hash::hash(push.as_bytes()).to_byte_array());
        }
    }
    None
}

// Stealth convention: a nulldata output carrying at least 32 bytes; the
// match field is the leading four bytes of sha256d over the script.
fn stealth_field(script: &Script) -> Option<[u8; 4]> {
    if !script.is_op_return() {
        return None;
    }
    let mut instructions = script.instructions();
    // Skip OP_RETURN itself.
    instructions.next()?;
    let payload = match instructions.next()? {
        Ok(Instruction::PushBytes(push)) => push,
        _ => return None,
    };
    if payload.len() < 32 {
        return None;
    }
    let digest = sha256d::Hash::hash(script.as_bytes()).to_byte_array();
    digest[..4].try_into().ok()
}

// Recover the spent output's payment hash from a p2kh-style input: the
// trailing pubkey push in the script, or the witness pubkey for p2wpkh.
fn spend_payment_hash(input: &bitcoin::TxIn) -> Option<[u8; 20]> {
    let mut last_push: Option<Vec<u8>> = None;
    for instruction in input.script_sig.instructions() {
        match instruction {
            Ok(Instruction::PushBytes(push)) => last_push = Some(push.as_bytes().to_vec()),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    if let Some(push) = last_push {
        if push.len() == 33 || push.len() == 65 {
            return Some(hash160::Hash::hash(&push).to_byte_array());
        }
    }
    if input.witness.len() == 2 {
        let pubkey = input.witness.last()?;
        if pubkey.len() == 33 {
            return Some(hash160::Hash::hash(pubkey).to_byte_array());
        }
    }
    None
}
