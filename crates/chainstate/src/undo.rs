use cashd_consensus::Hash256;
use cashd_primitives::encoding::{DecodeError, Decoder, Encoder};
use cashd_primitives::hash::sha256d;

use crate::utxo::Coin;

const BLOCK_UNDO_VERSION: u8 = 1;
const CHECKSUM_LEN: usize = 32;

/// Coins consumed by one transaction, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Undo data for a block: one [`TxUndo`] per non-coinbase transaction, in
/// block order. Disconnecting walks it back to front.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn spent_count(&self) -> usize {
        self.txs.iter().map(|tx| tx.spent.len()).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u8(BLOCK_UNDO_VERSION);
        encoder.write_varint(self.txs.len() as u64);
        for tx in &self.txs {
            encoder.write_varint(tx.spent.len() as u64);
            for coin in &tx.spent {
                encoder.write_var_bytes(&coin.encode());
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let version = decoder.read_u8()?;
        if version != BLOCK_UNDO_VERSION {
            return Err(DecodeError::InvalidData("unsupported block undo version"));
        }
        let tx_count = decoder.read_len()?;
        let mut txs = Vec::with_capacity(tx_count.min(decoder.remaining()));
        for _ in 0..tx_count {
            let spent_count = decoder.read_len()?;
            let mut spent = Vec::with_capacity(spent_count.min(decoder.remaining()));
            for _ in 0..spent_count {
                let coin_bytes = decoder.read_var_bytes()?;
                let coin = Coin::decode(&coin_bytes)
                    .map_err(|_| DecodeError::InvalidData("invalid coin in undo"))?;
                spent.push(coin);
            }
            txs.push(TxUndo { spent });
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { txs })
    }

    /// Undo bytes followed by a checksum binding them to the parent block.
    pub fn to_record(&self, prev_hash: &Hash256) -> Vec<u8> {
        let mut record = self.encode();
        let checksum = undo_checksum(prev_hash, &record);
        record.extend_from_slice(&checksum);
        record
    }

    pub fn from_record(record: &[u8], prev_hash: &Hash256) -> Result<Self, UndoRecordError> {
        if record.len() < CHECKSUM_LEN {
            return Err(UndoRecordError::Truncated);
        }
        let (body, checksum) = record.split_at(record.len() - CHECKSUM_LEN);
        if undo_checksum(prev_hash, body).as_slice() != checksum {
            return Err(UndoRecordError::ChecksumMismatch);
        }
        Self::decode(body).map_err(UndoRecordError::Decode)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoRecordError {
    Truncated,
    ChecksumMismatch,
    Decode(DecodeError),
}

impl std::fmt::Display for UndoRecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UndoRecordError::Truncated => write!(f, "undo record truncated"),
            UndoRecordError::ChecksumMismatch => write!(f, "undo checksum mismatch"),
            UndoRecordError::Decode(err) => write!(f, "undo decode failed: {err}"),
        }
    }
}

impl std::error::Error for UndoRecordError {}

fn undo_checksum(prev_hash: &Hash256, body: &[u8]) -> Hash256 {
    let mut buffer = Vec::with_capacity(32 + body.len());
    buffer.extend_from_slice(prev_hash);
    buffer.extend_from_slice(body);
    sha256d(&buffer)
}
