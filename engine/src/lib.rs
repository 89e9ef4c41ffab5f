//! fleetops engine library
//!
//! Remote operations over SSH, WinRM and SMB, staged release rollouts and
//! per-host updates with health-gated rollback.

pub mod app;
pub mod artifact;
pub mod engine;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod inventory;
pub mod logs;
pub mod models;
pub mod ops;
pub mod rollout;
pub mod server;
pub mod storage;
pub mod store;
pub mod transport;
pub mod utils;
pub mod workers;
