//! Persistence for channel configurations and their validation history.

pub mod db;
pub mod history;
