//! Disk-backed cache keyed by upstream configuration fingerprints
//!
//! A [`Cache`] wraps any sequence source. Its output is persisted in one
//! storage unit per distinct upstream fingerprint under the configured cache
//! directory, and served from there whenever the same configuration is seen
//! again, in this session or a later one.

#![warn(missing_docs)]

pub mod cache;
pub mod manifest;

pub use cache::Cache;
pub use manifest::Manifest;
