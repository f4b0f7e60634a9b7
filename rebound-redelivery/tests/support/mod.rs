//! Test support utilities for redelivery integration tests

pub mod mock_broker;

pub use mock_broker::MockBroker;
