//! FxSentry Library
//!
//! Leveraged forex trading bot core: durable state, admission control,
//! exit-rule evaluation and the lifecycle orchestrator.

pub mod admission;
pub mod broker;
pub mod commands;
pub mod config;
pub mod engine;
pub mod exits;
pub mod journal;
pub mod select;
pub mod sizing;
pub mod state;
pub mod strategy;
pub mod types;
