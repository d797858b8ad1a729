pub mod factory;
pub mod traits;

pub use factory::{build_broker, build_brokers};
pub use traits::{parse_broker_kind, BrokerClient, BrokerKind};

#[cfg(test)]
pub use traits::MockBrokerClient;
