//! hawkBit DDI (Direct Device Integration) client
//!
//! This module handles:
//! - Resource requests against the controller API (poll, deployment, cancel, config data)
//! - Feedback reporting
//! - Resumable artifact downloads with MD5 computation
//! - Mapping of HTTP failures to typed errors

mod client;
mod error;

pub use client::{timestamp, DdiClient};
pub use error::{status_reason, DdiError};
