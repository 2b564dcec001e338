//! PolyStore Common - Shared types and utilities
//!
//! This crate provides the node geometry, identifiers, placement tags,
//! error definitions and configuration used across all PolyStore
//! components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, Config, LimitsConfig, MountConfig, PlacementConfig};
pub use error::{Error, Result};
pub use types::*;
