//! Transaction types and serialization.

use cashd_consensus::Hash256;

use crate::encoding::{self, Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(self.serialized_size());
        Encodable::consensus_encode(self, &mut encoder);
        encoder.into_inner()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        encoding::decode(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        let inputs: usize = self
            .vin
            .iter()
            .map(|input| {
                OutPoint::SIZE
                    + encoding::varint_len(input.script_sig.len() as u64)
                    + input.script_sig.len()
                    + 4
            })
            .sum();
        let outputs: usize = self
            .vout
            .iter()
            .map(|output| {
                8 + encoding::varint_len(output.script_pubkey.len() as u64)
                    + output.script_pubkey.len()
            })
            .sum();
        4 + encoding::varint_len(self.vin.len() as u64)
            + inputs
            + encoding::varint_len(self.vout.len() as u64)
            + outputs
            + 4
    }

    /// Sum of output values, or `None` on overflow.
    pub fn value_out(&self) -> Option<i64> {
        self.vout
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            output.consensus_encode(encoder);
        }
        encoder.write_u32_le(self.lock_time);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_len()?;
        let mut vin = Vec::with_capacity(input_count.min(1024));
        for _ in 0..input_count {
            vin.push(TxIn::consensus_decode(decoder)?);
        }
        let output_count = decoder.read_len()?;
        let mut vout = Vec::with_capacity(output_count.min(1024));
        for _ in 0..output_count {
            vout.push(TxOut::consensus_decode(decoder)?);
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            vin: vec![TxIn {
                prevout: OutPoint::new([7u8; 32], 1),
                script_sig: vec![0x51; 300],
                sequence: 0xffff_fffe,
            }],
            vout: vec![
                TxOut {
                    value: 1_000,
                    script_pubkey: vec![0x76, 0xa9],
                },
                TxOut {
                    value: 2_000,
                    script_pubkey: Vec::new(),
                },
            ],
            lock_time: 42,
        }
    }

    #[test]
    fn serialized_size_matches_encoding() {
        let tx = sample_tx();
        assert_eq!(tx.serialized_size(), tx.to_bytes().len());
        let decoded = Transaction::from_bytes(&tx.to_bytes()).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn coinbase_detection_requires_single_null_input() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
        tx.vin.push(tx.vin[0].clone());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn value_out_detects_overflow() {
        let mut tx = sample_tx();
        assert_eq!(tx.value_out(), Some(3_000));
        tx.vout[0].value = i64::MAX;
        assert_eq!(tx.value_out(), None);
    }
}
