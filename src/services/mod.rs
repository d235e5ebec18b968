pub mod activity;
pub mod auth;
pub mod autosave;
pub mod memory;
pub mod proactive;
pub mod rate_limit;
