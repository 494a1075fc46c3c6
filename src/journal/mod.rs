//! The durable journal consumed by recoverable delivery states.

mod error;
mod in_memory;
mod journal;

pub use error::JournalError;
pub use in_memory::InMemoryJournal;
pub use journal::{Journal, JournalEntry, RecordId};
