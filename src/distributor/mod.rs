//! Receivers and the distributor that offers references to them.

mod distributor;
mod error;
mod receiver;

pub use distributor::{DistributionPolicy, Distributor};
pub use error::DistributorError;
pub use receiver::{Receiver, Reply};
