//! Identity types and the build transaction aggregate.

pub mod action;
pub mod codes;
pub mod command;
pub mod moment;
pub mod path;
pub mod project;
pub mod transaction;
pub mod wire;

pub use action::{AuditRecord, Op, PathTouch};
pub use command::{Command, CommandKey};
pub use moment::{Elapsed, Moment};
pub use path::{PathName, PathState};
pub use project::Project;
pub use transaction::{BuildTransaction, HostInfo, TxId, TxResult};
