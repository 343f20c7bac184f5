// Full-stack scenarios: dealer client against a served memory chain.
use std::sync::Arc;
use std::time::Duration;

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version};
use bitcoin::consensus;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::transaction;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, PubkeyHash, ScriptBuf, Transaction, TxMerkleNode,
    TxOut,
};
use bytes::Bytes;

use queryd::config::ServerConfig;
use queryd::server::Server;
use queryd::transport::DealerSocket;
use spire_chain::{Chain, MemoryChain};
use spire_wire::payload::HistoryRow;
use spire_wire::{Envelope, ErrorCode};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const SILENCE_TIMEOUT: Duration = Duration::from_millis(300);

fn test_config() -> ServerConfig {
    ServerConfig {
        public_bind: "127.0.0.1:0".parse().expect("addr"),
        ..ServerConfig::default()
    }
}

fn payment_script(first_byte: u8) -> ScriptBuf {
    let mut hash = [0x44u8; 20];
    hash[0] = first_byte;
    ScriptBuf::new_p2pkh(&PubkeyHash::from_raw_hash(
        hash160::Hash::from_byte_array(hash),
    ))
}

fn payment_tx(first_byte: u8, value: u64) -> Transaction {
    Transaction {
        version: transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: payment_script(first_byte),
        }],
    }
}

fn block_with(txs: Vec<Transaction>) -> Block {
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

async fn start_server(chain: Arc<MemoryChain>) -> Server {
    Server::start(test_config(), chain as Arc<dyn Chain>)
        .await
        .expect("start server")
}

async fn roundtrip(client: &mut DealerSocket, request: &Envelope) -> Envelope {
    client.send(&request.encode()).await.expect("send");
    let parts = tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("reply within timeout")
        .expect("recv")
        .expect("connection open");
    Envelope::decode(&parts).expect("decode reply")
}

#[tokio::test]
async fn fetch_last_height_round_trip() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(650_000, block_with(vec![payment_tx(0x01, 1)])).await;
    let server = start_server(Arc::clone(&chain)).await;

    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");
    let request = Envelope::request("blockchain.fetch_last_height", 0x0000_0001, Bytes::new());
    let reply = roundtrip(&mut client, &request).await;

    assert_eq!(reply.command, request.command);
    assert_eq!(reply.id, request.id);
    assert_eq!(
        reply.data.as_ref(),
        &[0x00, 0x00, 0x00, 0x00, 0x50, 0xEC, 0x09, 0x00]
    );

    server.stop().await;
}

#[tokio::test]
async fn unknown_block_header_answers_not_found() {
    let server = start_server(Arc::new(MemoryChain::new())).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    // Height 0x00100000, absent from the chain.
    let request = Envelope::request(
        "blockchain.fetch_block_header",
        2,
        Bytes::from_static(&[0x00, 0x00, 0x10, 0x00]),
    );
    let reply = roundtrip(&mut client, &request).await;
    assert_eq!(reply.data.as_ref(), &[0x02, 0x00, 0x00, 0x00]);

    server.stop().await;
}

#[tokio::test]
async fn bad_length_header_request_answers_bad_stream() {
    let server = start_server(Arc::new(MemoryChain::new())).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    let request = Envelope::request(
        "blockchain.fetch_block_header",
        3,
        Bytes::from_static(&[0x11, 0x22, 0x33]),
    );
    let reply = roundtrip(&mut client, &request).await;
    assert_eq!(reply.data.as_ref(), &ErrorCode::BadStream.to_bytes());

    server.stop().await;
}

#[tokio::test]
async fn tampered_checksum_is_dropped_silently() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(1, block_with(vec![payment_tx(0x01, 1)])).await;
    let server = start_server(chain).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    let mut parts = Envelope::request("blockchain.fetch_last_height", 4, Bytes::new()).encode();
    let mut checksum = parts[4].to_vec();
    *checksum.last_mut().expect("checksum byte") ^= 0x01;
    parts[4] = Bytes::from(checksum);
    client.send(&parts).await.expect("send");

    let silence = tokio::time::timeout(SILENCE_TIMEOUT, client.recv()).await;
    assert!(silence.is_err(), "tampered frame must get no reply");

    // The connection itself stays usable.
    let request = Envelope::request("blockchain.fetch_last_height", 5, Bytes::new());
    let reply = roundtrip(&mut client, &request).await;
    assert_eq!(reply.id, 5);

    server.stop().await;
}

#[tokio::test]
async fn unknown_command_answers_not_found() {
    let server = start_server(Arc::new(MemoryChain::new())).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    let request = Envelope::request("blockchain.fetch_everything", 6, Bytes::new());
    let reply = roundtrip(&mut client, &request).await;
    assert_eq!(reply.data.as_ref(), &ErrorCode::NotFound.to_bytes());
    assert_eq!(reply.command, "blockchain.fetch_everything");

    server.stop().await;
}

#[tokio::test]
async fn fetch_transaction_round_trip() {
    let chain = Arc::new(MemoryChain::new());
    let tx = payment_tx(0x33, 9);
    let txid = tx.compute_txid();
    let tx_bytes = consensus::serialize(&tx);
    chain.push_block(10, block_with(vec![tx])).await;
    let server = start_server(chain).await;

    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");
    let request = Envelope::request(
        "blockchain.fetch_transaction",
        8,
        Bytes::copy_from_slice(&txid.to_byte_array()),
    );
    let reply = roundtrip(&mut client, &request).await;
    assert_eq!(&reply.data[..4], &ErrorCode::Success.to_bytes());
    assert_eq!(&reply.data[4..], &tx_bytes[..]);

    server.stop().await;
}

#[tokio::test]
async fn fetch_history_keys_on_version_and_hash() {
    let chain = Arc::new(MemoryChain::new());
    let row = HistoryRow {
        point_kind: 1,
        tx_hash: [0x22; 32],
        index: 3,
        height: 7,
        value: 1_000,
    };
    chain.insert_history_row(0x05, [0xAA; 20], row).await;
    let server = start_server(Arc::clone(&chain)).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    let history_request = |version: u8| {
        let mut data = vec![version];
        data.extend_from_slice(&[0xAA; 20]);
        data.extend_from_slice(&0u32.to_le_bytes());
        Envelope::request("blockchain.fetch_history2", 11, Bytes::from(data))
    };

    let reply = roundtrip(&mut client, &history_request(0x05)).await;
    assert_eq!(&reply.data[..4], &ErrorCode::Success.to_bytes());
    assert_eq!(reply.data.len(), 4 + 49, "one history row");
    assert_eq!(reply.data[4], 1, "point kind");
    assert_eq!(&reply.data[5..37], &[0x22; 32]);

    // The same hash under another version is a different address.
    let reply = roundtrip(&mut client, &history_request(0x00)).await;
    assert_eq!(&reply.data[..4], &ErrorCode::Success.to_bytes());
    assert_eq!(reply.data.len(), 4, "no rows for the other version");

    server.stop().await;
}

#[tokio::test]
async fn subscribe_then_receive_sequenced_notifications() {
    let chain = Arc::new(MemoryChain::new());
    let server = start_server(Arc::clone(&chain)).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    // Subscribe to the 8-bit prefix 0xAB.
    let request = Envelope::request(
        "address.subscribe",
        99,
        Bytes::from_static(&[0x08, 0xAB, 0x00]),
    );
    let ack = roundtrip(&mut client, &request).await;
    assert_eq!(ack.data.as_ref(), &ErrorCode::Success.to_bytes());

    // A matching transaction lands in a new block.
    let block = block_with(vec![payment_tx(0xAB, 1)]);
    let block_hash = block.block_hash().to_byte_array();
    let tx_bytes = consensus::serialize(&block.txdata[0]);
    chain.push_block(100, block).await;

    let parts = tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("notification within timeout")
        .expect("recv")
        .expect("connection open");
    let update = Envelope::decode(&parts).expect("decode update");
    assert_eq!(update.command, "address.update2");
    assert_eq!(update.id, 99, "notification echoes the subscription id");
    assert_eq!(&update.data[..4], &ErrorCode::Success.to_bytes());
    assert_eq!(update.data[4], 0, "first sequence");
    assert_eq!(&update.data[5..9], &100u32.to_le_bytes());
    assert_eq!(&update.data[9..41], &block_hash);
    assert_eq!(&update.data[41..], &tx_bytes[..]);

    // A second matching transaction bumps the sequence.
    chain
        .push_block(101, block_with(vec![payment_tx(0xAB, 2)]))
        .await;
    let parts = tokio::time::timeout(RECV_TIMEOUT, client.recv())
        .await
        .expect("second notification")
        .expect("recv")
        .expect("connection open");
    let update = Envelope::decode(&parts).expect("decode update");
    assert_eq!(update.data[4], 1);

    // A non-matching transaction is silent.
    chain
        .push_block(102, block_with(vec![payment_tx(0xCD, 3)]))
        .await;
    let silence = tokio::time::timeout(SILENCE_TIMEOUT, client.recv()).await;
    assert!(silence.is_err(), "non-matching tx must not notify");

    server.stop().await;
}

#[tokio::test]
async fn unsubscribe_stops_notifications() {
    let chain = Arc::new(MemoryChain::new());
    let server = start_server(Arc::clone(&chain)).await;
    let mut client = DealerSocket::connect(server.public_addr())
        .await
        .expect("connect");

    let subscribe = Envelope::request(
        "address.subscribe",
        1,
        Bytes::from_static(&[0x08, 0xAB, 0x00]),
    );
    roundtrip(&mut client, &subscribe).await;

    let unsubscribe = Envelope::request(
        "address.subscribe",
        2,
        Bytes::from_static(&[0x08, 0xAB, 0x01]),
    );
    let ack = roundtrip(&mut client, &unsubscribe).await;
    assert_eq!(ack.data.as_ref(), &ErrorCode::Success.to_bytes());

    chain
        .push_block(50, block_with(vec![payment_tx(0xAB, 1)]))
        .await;
    let silence = tokio::time::timeout(SILENCE_TIMEOUT, client.recv()).await;
    assert!(silence.is_err(), "unsubscribed client must not notify");

    server.stop().await;
}

#[tokio::test]
async fn secure_endpoint_accepts_listed_keys_only() {
    let chain = Arc::new(MemoryChain::new());
    chain.push_block(7, block_with(vec![payment_tx(0x01, 1)])).await;

    let config = ServerConfig {
        public_bind: "127.0.0.1:0".parse().expect("addr"),
        secure_bind: Some("127.0.0.1:0".parse().expect("addr")),
        server_key: Some("server-key".to_string()),
        client_keys: vec!["good-key".to_string()],
        ..ServerConfig::default()
    };
    let server = Server::start(config, chain as Arc<dyn Chain>)
        .await
        .expect("start server");
    let secure_addr = server.secure_addr().expect("secure endpoint");

    let mut good = DealerSocket::connect_secure(secure_addr, b"good-key")
        .await
        .expect("connect");
    let request = Envelope::request("blockchain.fetch_last_height", 1, Bytes::new());
    let reply = roundtrip(&mut good, &request).await;
    assert_eq!(&reply.data[..4], &ErrorCode::Success.to_bytes());

    let mut bad = DealerSocket::connect_secure(secure_addr, b"bad-key")
        .await
        .expect("connect");
    let _ = bad.send(&request.encode()).await;
    let silence = tokio::time::timeout(SILENCE_TIMEOUT, bad.recv()).await;
    match silence {
        Err(_) => {}
        Ok(Ok(None)) | Ok(Err(_)) => {}
        Ok(Ok(Some(_))) => panic!("unauthorized client must get no reply"),
    }

    server.stop().await;
}

#[tokio::test]
async fn secure_endpoint_without_key_refuses_to_start() {
    let config = ServerConfig {
        public_bind: "127.0.0.1:0".parse().expect("addr"),
        secure_bind: Some("127.0.0.1:0".parse().expect("addr")),
        server_key: None,
        ..ServerConfig::default()
    };
    let chain = Arc::new(MemoryChain::new());
    assert!(Server::start(config, chain as Arc<dyn Chain>).await.is_err());
}
