//! Recycler core library: the server side of a build-avoidance cache.
//!
//! Clients audit each build command and upload what it read and wrote. This
//! crate ingests those audits into build transactions, keeps the produced
//! files as gzip containers, and serves each project a compact roadmap that
//! tells a client which commands it can skip by recycling earlier results.

pub mod config;
pub mod errors;
pub mod indexer;
pub mod models;
pub mod query;
pub mod store;
pub mod txn;

pub use config::RecyclerConfig;
pub use errors::{RecyclerError, RecyclerResult};
