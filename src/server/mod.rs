//! The components that keep certificates issued, installed and renewed.

pub mod audit;
pub mod backend;
pub mod distribution;
pub mod hierarchy;
pub mod keys;
pub mod locks;
pub mod manager;
pub mod pipeline;
pub mod renewal;
pub mod secrets;
pub mod targets;
pub mod templates;
