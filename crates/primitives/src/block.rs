//! Block header and block types.

use cashd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::Transaction;

pub const HEADER_SIZE: usize = 80;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut encoder = Encoder::with_capacity(HEADER_SIZE);
        self.consensus_encode(&mut encoder);
        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&encoder.into_inner());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash_le(&self.prev_block);
        encoder.write_hash_le(&self.merkle_root);
        encoder.write_u32_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash_le()?,
            merkle_root: decoder.read_hash_le()?,
            time: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size());
        self.consensus_encode(&mut encoder);
        encoder.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE
            + encoding::varint_len(self.transactions.len() as u64)
            + self
                .transactions
                .iter()
                .map(Transaction::serialized_size)
                .sum::<usize>()
    }
}

impl Encodable for Block {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.header.consensus_encode(encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode(encoder);
        }
    }
}

impl Decodable for Block {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let header = BlockHeader::consensus_decode(decoder)?;
        let count = decoder.read_len()?;
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(decoder)?);
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_encodes_to_eighty_bytes() {
        let header = BlockHeader {
            version: 4,
            prev_block: [1u8; 32],
            merkle_root: [2u8; 32],
            time: 1_600_000_000,
            bits: 0x1d00_ffff,
            nonce: 99,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &4i32.to_le_bytes());
        assert_eq!(&bytes[76..80], &99u32.to_le_bytes());
        assert_eq!(BlockHeader::from_bytes(&bytes).expect("decode"), header);
        assert!(BlockHeader::from_bytes(&bytes[..79]).is_err());
    }
}
