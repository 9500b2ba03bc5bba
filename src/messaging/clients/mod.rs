//! Broker client implementations
//!
//! - [`BrokerClient`]: the seam the dispatch runtime and the connection supervisor use
//! - [`InMemoryClient`]: in-process implementation backed by an [`InMemoryBroker`]

pub mod in_memory_client;
pub mod traits;

pub use in_memory_client::{BrokerStats, InMemoryBroker, InMemoryClient};
pub use traits::{BrokerClient, Subscription};
