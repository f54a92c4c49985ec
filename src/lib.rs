//! RAUC hawkBit Agent
//!
//! Keeps the RAUC update service of a device in sync with a hawkBit server
//! through the DDI polling API.

pub mod agent;
pub mod bus;
pub mod config;
pub mod ddi;
pub mod installer;
