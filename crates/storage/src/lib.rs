//! Key-value persistence used by the chain state.
//!
//! Every mutation that must be crash-consistent goes through a [`WriteBatch`],
//! which backends commit atomically.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    Io(std::io::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
            StoreError::Io(err) => write!(f, "store io: {err}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    /// Block index records keyed by block hash.
    BlockIndex,
    /// Unspent coins keyed by serialized outpoint.
    Utxo,
    /// Best-block pointer, flat-file bookkeeping and other singletons.
    Meta,
}

impl Column {
    pub const ALL: [Column; 3] = [Column::BlockIndex, Column::Utxo, Column::Meta];

    pub const fn index(self) -> usize {
        match self {
            Column::BlockIndex => 0,
            Column::Utxo => 1,
            Column::Meta => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "block_index",
            Column::Utxo => "utxo",
            Column::Meta => "meta",
        }
    }
}

macro_rules! inline_bytes {
    ($name:ident, $inline:literal) => {
        #[derive(Clone, Debug, Eq, PartialEq)]
        pub struct $name(SmallVec<[u8; $inline]>);

        impl $name {
            pub fn as_slice(&self) -> &[u8] {
                self.0.as_slice()
            }

            pub fn into_vec(self) -> Vec<u8> {
                self.0.into_vec()
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                self.as_slice()
            }
        }

        impl From<Vec<u8>> for $name {
            fn from(value: Vec<u8>) -> Self {
                Self(SmallVec::from_vec(value))
            }
        }

        impl From<&[u8]> for $name {
            fn from(value: &[u8]) -> Self {
                Self(SmallVec::from_slice(value))
            }
        }

        impl<const N: usize> From<[u8; N]> for $name {
            fn from(value: [u8; N]) -> Self {
                Self(SmallVec::from_slice(&value))
            }
        }

        impl<const N: usize> From<&[u8; N]> for $name {
            fn from(value: &[u8; N]) -> Self {
                Self(SmallVec::from_slice(value))
            }
        }
    };
}

// Outpoint keys are 36 bytes, block hashes 32.
inline_bytes!(WriteKey, 40);
// Most coins encode to well under 64 bytes.
inline_bytes!(WriteValue, 64);

#[derive(Clone, Debug)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

impl WriteOp {
    pub fn column(&self) -> Column {
        match self {
            WriteOp::Put { column, .. } | WriteOp::Delete { column, .. } => *column,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.ops.reserve(additional);
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        self.ops.push(WriteOp::Put {
            column,
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        self.ops.push(WriteOp::Delete {
            column,
            key: key.into(),
        });
    }

    /// Appends all operations of `other`, preserving their order after ours.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;
    /// Applies every operation in `batch` or none of them.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        batch.put(column, key, value);
        self.write_batch(&batch)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        self.as_ref().for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}
