//! # Digit Cracker
//!
//! Tick ingestion and last-digit strategy engine for a binary-options
//! quote service.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Wire protocol, connection manager and paper quote service
//! - `subscription`: Per-symbol stream multiplexing
//! - `stats`: Last-digit statistics, window analysis and prediction
//! - `strategy`: Trigger policies, stake sizing, execution and journals
//! - `state`: Observable state containers
//! - `app`: Composition root driving everything from one event loop
//! - `export`: JSON / CSV statistics export
//! - `replay`: Offline strategy replay over recorded ticks
//! - `utils`: Shared utilities and decimal arithmetic

pub mod app;
pub mod config;
pub mod exchange;
pub mod export;
pub mod replay;
pub mod state;
pub mod stats;
pub mod strategy;
pub mod subscription;
pub mod utils;

pub use app::{DashboardSnapshot, DigitCracker};
pub use config::Config;
