//! Data structures shared by all components and by callers of the
//! library.

pub mod audit;
pub mod ca;
pub mod request;
pub mod target;
pub mod template;
