//! # devnet-common
//!
//! Shared types for the devnet orchestrator.
//!
//! This crate provides functionality used across the devnet crates:
//! - The error taxonomy every orchestration step reports through
//! - Validated names for clusters, services and their child resources
//! - Human-readable duration parsing for configuration files

#![warn(missing_docs)]

pub mod duration;
pub mod error;
pub mod name;

pub use error::{DevnetError, DevnetResult};
pub use name::ResourceName;
