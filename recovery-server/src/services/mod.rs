pub mod backup_pipeline;
pub mod catalog;
pub mod extract;
pub mod failover;
pub mod health_monitor;
pub mod restore_pipeline;
pub mod retention;
pub mod scheduler;
pub mod source;
pub mod storage;
