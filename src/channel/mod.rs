//! The channel: the public handle / acknowledge / cancel / redeliver
//! protocol over a distributor and a delivery state.

mod channel;
mod error;

pub use channel::{Channel, Handled, Redelivery, SweepResult};
pub use error::ChannelError;
