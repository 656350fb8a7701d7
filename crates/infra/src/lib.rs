//! Infrastructure layer: task queue, product persistence, external services,
//! configuration.

pub mod config;
pub mod coordinator;
pub mod db;
pub mod external;
pub mod tasks;
