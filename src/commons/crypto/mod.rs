//! Cryptographic building blocks: keys, CSRs, certificates, chains.
//!
//! All primitives come from `openssl`; certificate inspection uses
//! `x509-parser`.

mod cert;
mod csr;
mod keys;
mod verify;

pub use self::cert::*;
pub use self::csr::*;
pub use self::keys::*;
pub use self::verify::*;
