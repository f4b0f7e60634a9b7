//! Backend storage implementations for scheduled jobs
//!
//! - `memory`: In-memory storage for tests and non-durable brokers
//! - `test`: Memory storage with failure injection and synchronisation
//! - `file`: One file per job, for production use

pub mod file;
pub mod memory;

pub use file::{FileJobStore, FileJobStoreBuilder};
pub use memory::MemoryJobStore;
pub use test::TestJobStore;
