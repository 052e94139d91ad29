//! ARBITER: opportunity detection and execution engine.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod control;
pub mod data;
pub mod engine;
pub mod providers;
pub mod settings;
pub mod storage;
pub mod strategy;
pub mod types;
