mod channel;
mod config;
mod delivery;
mod distributor;
mod error;
mod journal;
mod message;
mod observer;
mod queue;
mod state;
mod timer;
mod transaction;

pub use channel::{Channel, ChannelError, Handled, Redelivery, SweepResult};
pub use config::{ChannelConfig, QueueConfig};
pub use delivery::{CompositeDelivery, Delivery, DeliveryId, ObserverId};
pub use distributor::{DistributionPolicy, Distributor, DistributorError, Receiver, Reply};
pub use error::ConfigError;
pub use journal::{InMemoryJournal, Journal, JournalEntry, JournalError, RecordId};
pub use message::{
    InMemoryMessageStore, Message, MessageReference, MessageStore, ReferenceId, Routable,
    StoreError,
};
#[cfg(feature = "emitter")]
pub use observer::EmitterObserver;
pub use observer::{DeliveryEvent, LogObserver, Observer, TracingObserver};
pub use queue::{Queue, QueueError};
pub use state::{DeliveryState, Filter, NonRecoverableState, RecoverableState, StateError};
pub use timer::{
    ManualTimer, ThreadTimer, Timer, TimerCallback, TimerError, TimerId, TimerStats,
};
pub use transaction::{
    Transaction, TransactionError, TransactionManager, TxId, TxOperation, TxStatus,
};

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
