use std::fmt;

use serde::{Deserialize, Serialize};

use super::JournalError;
use crate::transaction::TxId;

/// Identity of one add record in a journal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(u64);

impl RecordId {
    pub fn new(id: u64) -> Self {
        RecordId(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record-{}", self.0)
    }
}

/// One replayed journal operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    Add {
        id: RecordId,
        reliable: bool,
        #[serde(with = "payload_serde")]
        payload: Vec<u8>,
        tx: Option<TxId>,
    },
    Remove {
        id: RecordId,
        tx: Option<TxId>,
    },
    Commit {
        tx: TxId,
    },
    Rollback {
        tx: TxId,
    },
}

impl JournalEntry {
    pub fn tx(&self) -> Option<TxId> {
        match self {
            JournalEntry::Add { tx, .. } | JournalEntry::Remove { tx, .. } => *tx,
            JournalEntry::Commit { tx } | JournalEntry::Rollback { tx } => Some(*tx),
        }
    }
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Durable log of reliable references.
///
/// Records tagged with a transaction only count once `commit` has returned
/// for that transaction. Implementations report failures and never retry
/// them. A journal belongs to exactly one recoverable delivery state, since
/// record ids are allocated by that state.
pub trait Journal: Send + Sync {
    fn append_add(
        &self,
        id: RecordId,
        reliable: bool,
        payload: &[u8],
        tx: Option<TxId>,
    ) -> Result<(), JournalError>;

    fn append_remove(&self, id: RecordId, tx: Option<TxId>) -> Result<(), JournalError>;

    fn commit(&self, tx: TxId) -> Result<(), JournalError>;

    fn rollback(&self, tx: TxId) -> Result<(), JournalError>;

    /// Every operation appended so far, in append order.
    fn replay(&self) -> Result<Vec<JournalEntry>, JournalError>;
}
