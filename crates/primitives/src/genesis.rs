//! Genesis block construction.

use cashd_consensus::money::COIN;
use cashd_consensus::ConsensusParams;

use crate::block::{Block, BlockHeader};
use crate::merkle::block_merkle_root;
use crate::outpoint::OutPoint;
use crate::script::{push_data, OP_CHECKSIG};
use crate::transaction::{Transaction, TxIn, TxOut};

const GENESIS_MESSAGE: &[u8] =
    b"The Times 03/Jan/2009 Chancellor on brink of second bailout for banks";

const GENESIS_OUTPUT_KEY: [u8; 65] = [
    0x04, 0x67, 0x8a, 0xfd, 0xb0, 0xfe, 0x55, 0x48, 0x27, 0x19, 0x67, 0xf1, 0xa6, 0x71, 0x30,
    0xb7, 0x10, 0x5c, 0xd6, 0xa8, 0x28, 0xe0, 0x39, 0x09, 0xa6, 0x79, 0x62, 0xe0, 0xea, 0x1f,
    0x61, 0xde, 0xb6, 0x49, 0xf6, 0xbc, 0x3f, 0x4c, 0xef, 0x38, 0xc4, 0xf3, 0x55, 0x04, 0xe5,
    0x1e, 0xc1, 0x12, 0xde, 0x5c, 0x38, 0x4d, 0xf7, 0xba, 0x0b, 0x8d, 0x57, 0x8a, 0x4c, 0x70,
    0x2b, 0x6b, 0xf1, 0x1d, 0x5f,
];

pub fn genesis_block(params: &ConsensusParams) -> Block {
    let mut script_sig = Vec::with_capacity(77);
    push_data(&mut script_sig, &0x1d00_ffffu32.to_le_bytes());
    push_data(&mut script_sig, &[4]);
    push_data(&mut script_sig, GENESIS_MESSAGE);

    let mut script_pubkey = Vec::with_capacity(67);
    push_data(&mut script_pubkey, &GENESIS_OUTPUT_KEY);
    script_pubkey.push(OP_CHECKSIG);

    let coinbase = Transaction {
        version: 1,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value: 50 * COIN,
            script_pubkey,
        }],
        lock_time: 0,
    };

    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        },
        transactions: vec![coinbase],
    };
    block.header.merkle_root = block_merkle_root(&block).0;
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashd_consensus::{consensus_params, hash256_to_hex, Network};

    #[test]
    fn genesis_hashes_match_network_params() {
        for network in [Network::Mainnet, Network::Testnet, Network::Regtest] {
            let params = consensus_params(network);
            let block = genesis_block(&params);
            assert_eq!(block.hash(), params.hash_genesis_block, "{network:?}");
        }
    }

    #[test]
    fn genesis_merkle_root_is_coinbase_txid() {
        let block = genesis_block(&consensus_params(Network::Mainnet));
        assert_eq!(
            hash256_to_hex(&block.header.merkle_root),
            "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b"
        );
        assert_eq!(block.serialized_size(), 285);
    }
}
