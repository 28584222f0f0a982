//! HTTP route handlers

pub mod health;
pub mod hosts;

pub use health::{health_check, version_info};
pub use hosts::host_ping;
