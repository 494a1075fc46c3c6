//! Messages, per-queue message references and the message store that
//! hands references out.

mod error;
mod message;
mod reference;
mod store;

pub use error::StoreError;
pub use message::Message;
pub use reference::{MessageReference, ReferenceId};
pub use store::{InMemoryMessageStore, MessageStore, Routable};
