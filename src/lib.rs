//! pdfacquire - incremental catalog PDF acquisition and research system.
//!
//! Crawls a paginated, gate-protected public document catalog through a
//! browser session, deduplicates discovered records into a durable snapshot,
//! downloads the documents idempotently, and tracks which downloaded files
//! the downstream research index has seen.

pub mod cli;
pub mod config;
pub mod models;
pub mod scrapers;
pub mod services;
pub mod store;
