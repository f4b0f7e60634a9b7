pub mod broker;
pub mod controller;

pub use broker::{Broker, Session};
pub use controller::{Rebound, Service};
