//! Shipyard
//!
//! Single-host application platform: builds apps from git, supervises their
//! processes and keeps the reverse proxy and database replication in step.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod logs;
pub mod models;
pub mod reconcile;
pub mod server;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod workers;
