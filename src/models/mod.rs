//! Data models for tablekeeper.
//!
//! This module re-exports the connection model types used throughout the application.

pub mod connection;

pub use connection::{DatabaseType, ServerTarget, ServerTargetError, mask_password};
