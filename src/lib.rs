//! DriftSync Server Library
//!
//! Incremental sync for intermittently connected clients. The main server
//! binary is in main.rs.
//!
//! # Modules
//!
//! - `sync`: cursors, change-set selection, fingerprints, conflict arbitration
//! - `db`: SQLite-backed record store
//! - `routes`: HTTP surface under `/api/v1/sync`
//! - `config`: environment configuration

pub mod config;
pub mod db;
pub mod error;
pub mod routes;
pub mod state;
pub mod sync;
