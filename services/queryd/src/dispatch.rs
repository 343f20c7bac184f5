// Command table and the worker pool draining the inbound queue.
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use spire_chain::Chain;
use spire_notify::SubscriberIndex;
use spire_wire::{payload, Envelope, ErrorCode};

use crate::interface::{address, blockchain};
use crate::transport::{RouterHandle, RouterSocket};

const WORKER_QUEUE_DEPTH: usize = 1024;

/// Shared state handlers operate on. Handlers are pure functions of the
/// chain and the request; only `address.subscribe` mutates the index.
pub struct ServerContext {
    pub chain: Arc<dyn Chain>,
    pub index: Arc<SubscriberIndex>,
    pub subscription_ttl: Duration,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Bytes> + Send>>;
pub type Handler = fn(Arc<ServerContext>, Envelope) -> HandlerFuture;

/// Static command table mapping wire command names to handlers.
pub struct Dispatcher {
    table: HashMap<&'static str, Handler>,
    ctx: Arc<ServerContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        let mut table: HashMap<&'static str, Handler> = HashMap::new();
        table.insert("blockchain.fetch_history2", blockchain::fetch_history2);
        table.insert("blockchain.fetch_transaction", blockchain::fetch_transaction);
        table.insert("blockchain.fetch_last_height", blockchain::fetch_last_height);
        table.insert("blockchain.fetch_block_header", blockchain::fetch_block_header);
        table.insert(
            "blockchain.fetch_block_transaction_hashes",
            blockchain::fetch_block_transaction_hashes,
        );
        table.insert(
            "blockchain.fetch_transaction_index",
            blockchain::fetch_transaction_index,
        );
        table.insert("blockchain.fetch_spend", blockchain::fetch_spend);
        table.insert("blockchain.fetch_block_height", blockchain::fetch_block_height);
        table.insert("blockchain.fetch_stealth2", blockchain::fetch_stealth2);
        table.insert(
            "blockchain.fetch_stealth_transaction",
            blockchain::fetch_stealth_transaction,
        );
        table.insert("blockchain.broadcast", blockchain::broadcast);
        table.insert("blockchain.validate", blockchain::validate);
        table.insert("address.subscribe", address::subscribe);
        Self { table, ctx }
    }

    /// Route a decoded request to its handler. Unknown commands answer with
    /// `not_found` so the client can correlate the failure.
    pub fn dispatch(&self, request: Envelope) -> HandlerFuture {
        match self.table.get(request.command.as_str()) {
            Some(handler) => handler(Arc::clone(&self.ctx), request),
            None => {
                tracing::debug!(command = %request.command, "unknown command");
                Box::pin(std::future::ready(payload::encode_code(
                    ErrorCode::NotFound,
                )))
            }
        }
    }
}

/// Drain the socket through a pool of query workers until shutdown.
///
/// Messages are distributed round-robin; handlers run concurrently and may
/// complete out of order, which is fine because replies carry the request
/// id. After shutdown flips, in-flight work is drained before returning.
pub async fn serve(
    mut socket: RouterSocket,
    dispatcher: Arc<Dispatcher>,
    worker_count: usize,
    query_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let handle = socket.handle();
    let worker_count = worker_count.max(1);
    let mut worker_txs = Vec::with_capacity(worker_count);
    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count {
        let (tx, mut rx) = mpsc::channel::<Vec<Bytes>>(WORKER_QUEUE_DEPTH);
        let dispatcher = Arc::clone(&dispatcher);
        let handle = handle.clone();
        workers.push(tokio::spawn(async move {
            while let Some(parts) = rx.recv().await {
                handle_message(&dispatcher, &handle, parts, query_timeout).await;
            }
        }));
        worker_txs.push(tx);
    }

    let mut next = 0usize;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = socket.recv() => match message {
                Some(parts) => {
                    let worker = &worker_txs[next % worker_count];
                    next = next.wrapping_add(1);
                    if worker.send(parts).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    // Closing the queues lets workers finish queued requests and exit.
    drop(worker_txs);
    for worker in workers {
        let _ = worker.await;
    }
    tracing::debug!("query service stopped");
}

async fn handle_message(
    dispatcher: &Dispatcher,
    handle: &RouterHandle,
    parts: Vec<Bytes>,
    query_timeout: Duration,
) {
    let request = match Envelope::decode(&parts) {
        Ok(envelope) => envelope,
        Err(err) => {
            // The id may be unrecoverable, so a malformed frame gets no
            // reply at all.
            metrics::counter!("spire_frames_dropped_total").increment(1);
            tracing::debug!(error = %err, "dropping undecodable frame");
            return;
        }
    };
    if request.is_signal() {
        tracing::debug!(command = %request.command, "ignoring signal frame");
        return;
    }

    let reply_data = match tokio::time::timeout(query_timeout, dispatcher.dispatch(request.clone()))
        .await
    {
        Ok(data) => data,
        Err(_) => {
            metrics::counter!("spire_replies_dropped_total").increment(1);
            tracing::warn!(command = %request.command, "query timed out, dropping reply");
            return;
        }
    };

    let reply = Envelope::reply(&request, reply_data);
    if let Err(err) = handle.send(reply.encode()) {
        // The client disconnected while the handler ran; late replies are
        // dropped silently.
        tracing::debug!(error = %err, "late reply dropped");
    }
}
