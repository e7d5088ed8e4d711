//! Block index, active chain selection and the coin ledger.

pub mod blockindex;
pub mod blockstore;
pub mod chain;
pub mod error;
pub mod filemeta;
pub mod flatfiles;
pub mod index;
pub mod ledger;
pub mod mempool;
pub mod metrics;
pub mod policy;
pub mod script;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;

pub use error::ChainStateError;
pub use state::{ChainState, ChainStateSettings, FlushMode};
