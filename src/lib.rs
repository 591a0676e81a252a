#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod reconcile;
pub mod scheduler;
