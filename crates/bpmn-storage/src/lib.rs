pub mod error;
pub mod gateway;
pub mod kv;

pub use error::StorageError;
pub use gateway::StorageGateway;
pub use kv::{InMemoryKvStore, KvStore};
