//! taskpilot: an autonomous task controller.
//!
//! Picks the next task from a prioritized, dependency-aware pool, runs it
//! through an external execution agent, holds risky results for operator
//! approval and throttles itself against an hourly and daily token budget.

pub mod activity;
pub mod cli;
pub mod clock;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod format;
pub mod logging;
pub mod risk;
pub mod scheduler;
pub mod types;
pub mod usage;
