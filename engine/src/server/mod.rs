//! Trigger and read HTTP surface

pub mod handlers;
pub mod serve;
pub mod state;
