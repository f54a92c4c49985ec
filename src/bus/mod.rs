//! Local interprocess bus plumbing
//!
//! This module handles:
//! - Decoded bus notifications (signals and property changes)
//! - The event bridge turning push-style delivery into ordered async dispatch

mod bridge;
mod event;

pub use bridge::{EventBridge, EventPusher, Handler, SubscriptionKey, SubscriptionKind};
pub use event::{BusEvent, BusValue, PROPERTIES_CHANGED, PROPERTIES_INTERFACE};
