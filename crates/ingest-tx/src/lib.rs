//! # Ingest TX - record mapping and load validation
//!
//! - [`mapper`]: converts raw source records into typed rows for the destination
//!   schema, isolating records that fail.
//! - [`validator`]: compares source and destination counts after a load and runs
//!   range checks against the destination table.

pub mod mapper;
pub mod validator;

pub use mapper::{map_record, MapError, RecordMapper};
pub use validator::{LoadCounts, ValidationReport, Validator};
