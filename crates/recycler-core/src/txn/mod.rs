//! Write-side coordination: id issuance, per-transaction locks, units of
//! work, and the transaction lifecycle built on them.

pub mod allocator;
pub mod builder;
pub mod locks;
pub mod unit;

pub use allocator::TxIdAllocator;
pub use builder::{StartRequest, TransactionBuilder, UploadOutcome, UploadTarget};
pub use locks::{TxLockHandle, TxLockRegistry};
pub use unit::UnitOfWork;
