//! Audit ingestion and roadmap generation.

pub mod audit;
pub mod cdb;
pub mod roadmap;

pub use audit::{parse_audit, parse_audit_batch, ParsedAudit};
pub use roadmap::{RoadmapCache, RoadmapIndex};
