//! Scheduled backup, restore and disaster-recovery verification for a
//! SQLite primary store.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod services;
pub mod state;
pub mod utils;
