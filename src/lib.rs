//! tablepack is a versioned, content-addressed table storage engine:
//! tabular data lives in repositories whose commits (images) reference
//! immutable, delta-compressed fragments. Repositories can be checked out,
//! committed as snapshots or patches, diffed, imported across and
//! synchronized between stores.
pub mod config;
pub mod core;
pub mod errors;
pub mod handlers;
pub mod hash;
