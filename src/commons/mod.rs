//! Common types used by the various Custodian components.
pub mod actor;
pub mod crypto;
pub mod error;
pub mod storage;
pub mod util;

//------------ Response Aliases ----------------------------------------------

pub type CustodyEmptyResult = std::result::Result<(), self::error::Error>;
pub type CustodyResult<T> = std::result::Result<T, self::error::Error>;
