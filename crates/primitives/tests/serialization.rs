use cashd_consensus::{consensus_params, hash256_to_hex, Hash256, Network};
use cashd_primitives::block::{Block, BlockHeader};
use cashd_primitives::encoding::DecodeError;
use cashd_primitives::genesis_block;
use cashd_primitives::outpoint::OutPoint;
use cashd_primitives::transaction::{Transaction, TxIn, TxOut};

fn seq_hash(start: u8) -> Hash256 {
    std::array::from_fn(|i| start.wrapping_add(i as u8))
}

fn push_hash_le(buffer: &mut Vec<u8>, start: u8) {
    for byte in 0u8..=0x1f {
        buffer.push(start.wrapping_add(byte));
    }
}

#[test]
fn serialize_block_header() {
    let header = BlockHeader {
        version: 4,
        prev_block: seq_hash(0x00),
        merkle_root: seq_hash(0x20),
        time: 0x01020304,
        bits: 0x0a0b0c0d,
        nonce: 0x11223344,
    };

    let encoded = header.to_bytes();
    let mut expected = Vec::new();
    expected.extend_from_slice(&4i32.to_le_bytes());
    push_hash_le(&mut expected, 0x00);
    push_hash_le(&mut expected, 0x20);
    expected.extend_from_slice(&0x01020304u32.to_le_bytes());
    expected.extend_from_slice(&0x0a0b0c0du32.to_le_bytes());
    expected.extend_from_slice(&0x11223344u32.to_le_bytes());

    assert_eq!(encoded.as_slice(), expected.as_slice());
    assert_eq!(BlockHeader::from_bytes(&encoded).expect("decode header"), header);
}

#[test]
fn serialize_transaction() {
    let tx = Transaction {
        version: 2,
        vin: vec![TxIn {
            prevout: OutPoint::new(seq_hash(0x40), 7),
            script_sig: vec![0xaa, 0xbb],
            sequence: 0xffff_fffe,
        }],
        vout: vec![TxOut {
            value: 5_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 99,
    };

    let encoded = tx.to_bytes();
    let mut expected = Vec::new();
    expected.extend_from_slice(&2i32.to_le_bytes());
    expected.push(1);
    push_hash_le(&mut expected, 0x40);
    expected.extend_from_slice(&7u32.to_le_bytes());
    expected.push(2);
    expected.extend_from_slice(&[0xaa, 0xbb]);
    expected.extend_from_slice(&0xffff_fffeu32.to_le_bytes());
    expected.push(1);
    expected.extend_from_slice(&5_000i64.to_le_bytes());
    expected.push(1);
    expected.push(0x51);
    expected.extend_from_slice(&99u32.to_le_bytes());

    assert_eq!(encoded, expected);
    assert_eq!(tx.serialized_size(), expected.len());
    assert_eq!(Transaction::from_bytes(&encoded).expect("decode tx"), tx);
}

#[test]
fn mainnet_genesis_block_bytes() {
    let params = consensus_params(Network::Mainnet);
    let genesis = genesis_block(&params);
    let bytes = genesis.to_bytes();
    assert_eq!(bytes.len(), 285);
    assert_eq!(genesis.serialized_size(), 285);
    assert_eq!(
        hash256_to_hex(&genesis.hash()),
        "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
    );
    assert_eq!(Block::from_bytes(&bytes).expect("decode genesis"), genesis);
}

#[test]
fn truncated_and_padded_blocks_are_rejected() {
    let genesis = genesis_block(&consensus_params(Network::Regtest));
    let bytes = genesis.to_bytes();
    for len in 0..bytes.len() {
        assert!(
            Block::from_bytes(&bytes[..len]).is_err(),
            "prefix of {len} bytes decoded"
        );
    }

    let mut padded = bytes.clone();
    padded.push(0);
    assert_eq!(Block::from_bytes(&padded), Err(DecodeError::TrailingBytes));
}
