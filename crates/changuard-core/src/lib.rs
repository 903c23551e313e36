//! Shared domain types for channel validation: errors, permissions, time.

pub mod channel;
pub mod clock;
pub mod error;
pub mod permissions;
pub mod text;
