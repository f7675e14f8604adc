//! threadflow: engagement metrics collection for many platform accounts
//!
//! See [`pipeline`] for the run shape and [`config`] for the
//! environment variables the runtime reads.

pub mod config;
pub mod pipeline;
