//! The _Custodian_ library crate.
//!
//! Custodian drives X.509 certificates from "needed" to "installed on a
//! target": it keeps a CA hierarchy, enrolls keys with local or remote
//! signing backends, verifies the resulting chains, distributes the
//! certificates to network appliances, directory hosts and Unix hosts,
//! and renews them before they expire.

pub mod api;
pub mod commons;
pub mod config;
pub mod constants;
pub mod server;
pub mod test;
