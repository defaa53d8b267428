//! # Core Runtime Module
//!
//! Provides foundational runtime infrastructure for the transfer core:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Event bus system
//!
//! ## Overview
//!
//! This crate contains the runtime utilities that the other crates depend on.
//! It establishes the configuration contract, logging conventions, and event
//! broadcasting mechanisms used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{StoreDescriptor, TransferConfig, TransferConfigBuilder};
pub use error::{Error, Result};
