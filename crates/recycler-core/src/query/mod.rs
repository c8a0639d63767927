//! Read-side queries over transactions.

pub mod predecessors;
pub mod selection;

pub use predecessors::{find_predecessors, PathHistory, TouchRef, TransactionHistory};
pub use selection::Strategy;
