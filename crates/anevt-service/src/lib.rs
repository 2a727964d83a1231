//! Core service layer for anevt, an analytics-module registration service.
//!
//! Analytics modules register *views* (HTML endpoints), *queries* (JSON SOA
//! endpoints), *event handlers* (consumers of the ingested event stream) and
//! *event properties* into an explicit [`Registry`](registry::Registry).
//! Expensive, side-effect-free queries are wrapped in the memoization engine
//! in [`caching`], which deduplicates concurrent computations through a
//! shared cache store.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod cron;
pub mod events;
pub mod logging;
pub mod query;
pub mod registry;
