//! Caller-owned transactions spanning one or more delivery states.

mod error;
mod manager;
mod transaction;

pub use error::TransactionError;
pub use manager::TransactionManager;
pub use transaction::{Transaction, TxId, TxOperation, TxStatus};
