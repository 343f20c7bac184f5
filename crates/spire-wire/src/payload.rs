// Per-command request decoders and reply encoders.
//
// Every reply starts with the little-endian error code; request decoders
// reject anything that is not byte-exact so the dispatcher can answer with
// `bad_stream` without touching the chain.
use bytes::{BufMut, Bytes, BytesMut};

use crate::{BitPrefix, ErrorCode};

/// Decoders report failures as the reply code to send back.
pub type Decode<T> = std::result::Result<T, ErrorCode>;

pub const HASH_SIZE: usize = 32;
pub const SHORT_HASH_SIZE: usize = 20;
const CODE_SIZE: usize = 4;
const POINT_SIZE: usize = HASH_SIZE + 4;

// ---------------------------------------------------------------------------
// Requests

/// `blockchain.fetch_history2`: `version:1 | address_hash:20 | from_height:4`.
///
/// The version byte is part of the address identity, not metadata: two
/// addresses may share a hash across versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRequest {
    pub address_version: u8,
    pub address_hash: [u8; SHORT_HASH_SIZE],
    pub from_height: u32,
}

pub fn decode_history_request(data: &[u8]) -> Decode<HistoryRequest> {
    if data.len() != 1 + SHORT_HASH_SIZE + 4 {
        return Err(ErrorCode::BadStream);
    }
    let mut address_hash = [0u8; SHORT_HASH_SIZE];
    address_hash.copy_from_slice(&data[1..1 + SHORT_HASH_SIZE]);
    Ok(HistoryRequest {
        address_version: data[0],
        address_hash,
        from_height: read_u32(&data[1 + SHORT_HASH_SIZE..]),
    })
}

/// A 32-byte hash request (`fetch_transaction`, `fetch_transaction_index`,
/// `fetch_block_height`).
pub fn decode_hash(data: &[u8]) -> Decode<[u8; HASH_SIZE]> {
    if data.len() != HASH_SIZE {
        return Err(ErrorCode::BadStream);
    }
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(data);
    Ok(hash)
}

/// Block locator, disambiguated by payload length alone: 32 bytes selects
/// by-hash, 4 bytes selects by-height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Locator {
    Hash([u8; HASH_SIZE]),
    Height(u32),
}

pub fn decode_locator(data: &[u8]) -> Decode<Locator> {
    match data.len() {
        HASH_SIZE => decode_hash(data).map(Locator::Hash),
        4 => Ok(Locator::Height(read_u32(data))),
        _ => Err(ErrorCode::BadStream),
    }
}

/// Transaction point: `hash:32 | index:4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointRef {
    pub hash: [u8; HASH_SIZE],
    pub index: u32,
}

pub fn decode_point(data: &[u8]) -> Decode<PointRef> {
    if data.len() != POINT_SIZE {
        return Err(ErrorCode::BadStream);
    }
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(&data[..HASH_SIZE]);
    Ok(PointRef {
        hash,
        index: read_u32(&data[HASH_SIZE..]),
    })
}

/// `fetch_stealth2` / `fetch_stealth_transaction`:
/// `bit_len:1 | blocks | from_height:4`, length checked exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrefixRequest {
    pub prefix: BitPrefix,
    pub from_height: u32,
}

pub fn decode_prefix_request(data: &[u8]) -> Decode<PrefixRequest> {
    if data.is_empty() {
        return Err(ErrorCode::BadStream);
    }
    let bit_len = data[0];
    let blocks = BitPrefix::blocks_len(bit_len);
    if data.len() != 1 + blocks + 4 {
        return Err(ErrorCode::BadStream);
    }
    let prefix =
        BitPrefix::new(bit_len, data[1..1 + blocks].to_vec()).ok_or(ErrorCode::BadStream)?;
    Ok(PrefixRequest {
        prefix,
        from_height: read_u32(&data[1 + blocks..]),
    })
}

/// `address.subscribe`: `bit_len:1 | blocks | unsubscribe:1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub prefix: BitPrefix,
    pub unsubscribe: bool,
}

pub fn decode_subscribe_request(data: &[u8]) -> Decode<SubscribeRequest> {
    if data.is_empty() {
        return Err(ErrorCode::BadStream);
    }
    let bit_len = data[0];
    let blocks = BitPrefix::blocks_len(bit_len);
    if data.len() != 1 + blocks + 1 {
        return Err(ErrorCode::BadStream);
    }
    let prefix =
        BitPrefix::new(bit_len, data[1..1 + blocks].to_vec()).ok_or(ErrorCode::BadStream)?;
    Ok(SubscribeRequest {
        prefix,
        unsubscribe: data[1 + blocks] != 0,
    })
}

// ---------------------------------------------------------------------------
// Replies

/// History row: `point_kind:1 | tx_hash:32 | index:4 | height:4 | value:8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRow {
    pub point_kind: u8,
    pub tx_hash: [u8; HASH_SIZE],
    pub index: u32,
    pub height: u32,
    pub value: u64,
}

/// Stealth row: `ephemeral_key_hash:32 | address_hash:20 | tx_hash:32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StealthRow {
    pub ephemeral_key_hash: [u8; HASH_SIZE],
    pub address_hash: [u8; SHORT_HASH_SIZE],
    pub tx_hash: [u8; HASH_SIZE],
}

/// Code-only reply; the minimal header used for lookup failures and acks.
pub fn encode_code(code: ErrorCode) -> Bytes {
    Bytes::copy_from_slice(&code.to_bytes())
}

pub fn encode_code_with(code: ErrorCode, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CODE_SIZE + body.len());
    buf.put_slice(&code.to_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// `code:4 | height:4` (`fetch_last_height`, `fetch_block_height`).
pub fn encode_height_reply(height: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(CODE_SIZE + 4);
    buf.put_slice(&ErrorCode::Success.to_bytes());
    buf.put_u32_le(height);
    buf.freeze()
}

/// `code:4 | block_height:4 | tx_position:4` (`fetch_transaction_index`).
pub fn encode_position_reply(block_height: u32, tx_position: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(CODE_SIZE + 8);
    buf.put_slice(&ErrorCode::Success.to_bytes());
    buf.put_u32_le(block_height);
    buf.put_u32_le(tx_position);
    buf.freeze()
}

/// `code:4 | hash:32 | index:4` (`fetch_spend`).
pub fn encode_point_reply(point: &PointRef) -> Bytes {
    let mut buf = BytesMut::with_capacity(CODE_SIZE + POINT_SIZE);
    buf.put_slice(&ErrorCode::Success.to_bytes());
    buf.put_slice(&point.hash);
    buf.put_u32_le(point.index);
    buf.freeze()
}

/// `code:4 | [hash:32]*` (`fetch_block_transaction_hashes`,
/// `fetch_stealth_transaction`).
pub fn encode_hashes_reply(hashes: &[[u8; HASH_SIZE]]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CODE_SIZE + HASH_SIZE * hashes.len());
    buf.put_slice(&ErrorCode::Success.to_bytes());
    for hash in hashes {
        buf.put_slice(hash);
    }
    buf.freeze()
}

pub fn encode_history_reply(rows: &[HistoryRow]) -> Bytes {
    let row_size = 1 + HASH_SIZE + 4 + 4 + 8;
    let mut buf = BytesMut::with_capacity(CODE_SIZE + row_size * rows.len());
    buf.put_slice(&ErrorCode::Success.to_bytes());
    for row in rows {
        buf.put_u8(row.point_kind);
        buf.put_slice(&row.tx_hash);
        buf.put_u32_le(row.index);
        buf.put_u32_le(row.height);
        buf.put_u64_le(row.value);
    }
    buf.freeze()
}

pub fn encode_stealth_reply(rows: &[StealthRow]) -> Bytes {
    let row_size = HASH_SIZE + SHORT_HASH_SIZE + HASH_SIZE;
    let mut buf = BytesMut::with_capacity(CODE_SIZE + row_size * rows.len());
    buf.put_slice(&ErrorCode::Success.to_bytes());
    for row in rows {
        buf.put_slice(&row.ephemeral_key_hash);
        buf.put_slice(&row.address_hash);
        buf.put_slice(&row.tx_hash);
    }
    buf.freeze()
}

/// `address.update2` push payload:
/// `code:4 | sequence:1 | height:4 | block_hash:32 | tx_bytes`.
pub fn encode_update(sequence: u8, height: u32, block_hash: &[u8; HASH_SIZE], tx: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CODE_SIZE + 1 + 4 + HASH_SIZE + tx.len());
    buf.put_slice(&ErrorCode::Success.to_bytes());
    buf.put_u8(sequence);
    buf.put_u32_le(height);
    buf.put_slice(block_hash);
    buf.put_slice(tx);
    buf.freeze()
}

fn read_u32(data: &[u8]) -> u32 {
    u32::from_le_bytes([data[0], data[1], data[2], data[3]])
}
