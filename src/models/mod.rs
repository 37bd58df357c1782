//! Core data types for collected catalog records.

mod record;

pub use record::{Record, RecordError, RecordSet};
