//! Persistence: artifact containers and transaction records.

pub mod containers;
pub mod database;
pub mod memory;
pub mod repository;
pub mod schema;

pub use containers::{ArtifactStore, ContainerKey, StoreUsage};
pub use database::Database;
pub use memory::MemoryRepository;
pub use repository::{Change, Repository};
