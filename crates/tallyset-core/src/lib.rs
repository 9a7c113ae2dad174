//! tallyset-core: Submission model, cross-source merge, adaptive fetch and
//! set aggregation.
//!
//! This crate defines the data model, the trait seams for remote sources,
//! rule engines and cache storage, and the reconciliation pipeline the rest
//! of tallyset builds on.

pub mod aggregate;
pub mod cache;
pub mod catalogue;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod flight;
pub mod merge;
pub mod model;
pub mod progress;
pub mod results;
pub mod service;
pub mod traits;
