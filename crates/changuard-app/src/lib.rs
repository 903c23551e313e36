//! Process-level plumbing shared by the changuard binary.

pub mod logging;
