//! Wire models shared by the fleetops trigger API and its clients.

pub mod models;

pub use models::*;
