// Handlers for the blockchain.* query commands.
//
// Each handler decodes its byte-exact request, calls the chain and encodes
// the reply; a lookup failure becomes a code-only reply. The reply route is
// filled in by the dispatcher.
use std::sync::Arc;

use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::{Block, BlockHash, OutPoint, Txid};
use bytes::Bytes;

use spire_chain::BlockRef;
use spire_wire::payload::{self, Locator, PointRef};
use spire_wire::{Envelope, ErrorCode};

use crate::dispatch::{HandlerFuture, ServerContext};

pub fn fetch_history2(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let query = match payload::decode_history_request(&request.data) {
            Ok(query) => query,
            Err(code) => return payload::encode_code(code),
        };
        tracing::debug!(
            address_version = query.address_version,
            from_height = query.from_height,
            "blockchain.fetch_history2"
        );
        match ctx
            .chain
            .fetch_history(query.address_version, query.address_hash, 0, query.from_height)
            .await
        {
            Ok(rows) => payload::encode_history_reply(&rows),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_transaction(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let hash = match payload::decode_hash(&request.data) {
            Ok(hash) => Txid::from_byte_array(hash),
            Err(code) => return payload::encode_code(code),
        };
        tracing::debug!(%hash, "blockchain.fetch_transaction");
        // Confirmed transactions only on this command.
        match ctx.chain.fetch_transaction(hash, true).await {
            Ok(tx) => payload::encode_code_with(ErrorCode::Success, &consensus::serialize(&*tx)),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_last_height(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        if !request.data.is_empty() {
            return payload::encode_code(ErrorCode::BadStream);
        }
        match ctx.chain.fetch_last_height().await {
            Ok(height) => payload::encode_height_reply(height),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_block_header(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let block = match payload::decode_locator(&request.data) {
            Ok(locator) => block_ref(locator),
            Err(code) => return payload::encode_code(code),
        };
        match ctx.chain.fetch_block_header(block).await {
            Ok(header) => {
                payload::encode_code_with(ErrorCode::Success, &consensus::serialize(&header))
            }
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_block_transaction_hashes(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let block = match payload::decode_locator(&request.data) {
            Ok(locator) => block_ref(locator),
            Err(code) => return payload::encode_code(code),
        };
        match ctx.chain.fetch_merkle_block(block).await {
            Ok(txids) => {
                let hashes: Vec<[u8; 32]> =
                    txids.iter().map(|txid| txid.to_byte_array()).collect();
                payload::encode_hashes_reply(&hashes)
            }
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_transaction_index(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let hash = match payload::decode_hash(&request.data) {
            Ok(hash) => Txid::from_byte_array(hash),
            Err(code) => return payload::encode_code(code),
        };
        match ctx.chain.fetch_transaction_position(hash, false).await {
            Ok((height, position)) => payload::encode_position_reply(height, position),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_spend(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let outpoint = match payload::decode_point(&request.data) {
            Ok(point) => OutPoint::new(Txid::from_byte_array(point.hash), point.index),
            Err(code) => return payload::encode_code(code),
        };
        match ctx.chain.fetch_spend(outpoint).await {
            Ok(inpoint) => payload::encode_point_reply(&PointRef {
                hash: inpoint.txid.to_byte_array(),
                index: inpoint.vout,
            }),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_block_height(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let hash = match payload::decode_hash(&request.data) {
            Ok(hash) => BlockHash::from_byte_array(hash),
            Err(code) => return payload::encode_code(code),
        };
        match ctx.chain.fetch_block_height(hash).await {
            Ok(height) => payload::encode_height_reply(height),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_stealth2(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let query = match payload::decode_prefix_request(&request.data) {
            Ok(query) => query,
            Err(code) => return payload::encode_code(code),
        };
        match ctx
            .chain
            .fetch_stealth(&query.prefix, query.from_height)
            .await
        {
            Ok(rows) => payload::encode_stealth_reply(&rows),
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn fetch_stealth_transaction(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let query = match payload::decode_prefix_request(&request.data) {
            Ok(query) => query,
            Err(code) => return payload::encode_code(code),
        };
        match ctx
            .chain
            .fetch_stealth(&query.prefix, query.from_height)
            .await
        {
            Ok(rows) => {
                let hashes: Vec<[u8; 32]> = rows.iter().map(|row| row.tx_hash).collect();
                payload::encode_hashes_reply(&hashes)
            }
            Err(code) => payload::encode_code(code),
        }
    })
}

pub fn broadcast(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move { organize(ctx, request, false).await })
}

pub fn validate(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move { organize(ctx, request, true).await })
}

// Organize a canonical block into the chain, simulated or for real; the
// reply is the validation code verbatim.
async fn organize(ctx: Arc<ServerContext>, request: Envelope, simulate: bool) -> Bytes {
    let block: Block = match consensus::deserialize(&request.data) {
        Ok(block) => block,
        Err(_) => return payload::encode_code(ErrorCode::BadStream),
    };
    match ctx.chain.organize(block, simulate).await {
        Ok(()) => payload::encode_code(ErrorCode::Success),
        Err(code) => payload::encode_code(code),
    }
}

fn block_ref(locator: Locator) -> BlockRef {
    match locator {
        Locator::Hash(hash) => BlockRef::Hash(BlockHash::from_byte_array(hash)),
        Locator::Height(height) => BlockRef::Height(height),
    }
}
