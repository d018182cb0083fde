//! Who did something.
//!
//! Every request, transition and installation is attributed to an actor
//! in the audit log.

use std::borrow::Cow;
use std::fmt;


//------------ Actor ---------------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Actor {
    name: Cow<'static, str>,
    is_user: bool,
}

impl Actor {
    /// Creates a built-in actor, e.g. the renewal scheduler.
    pub const fn system(name: &'static str) -> Self {
        Actor { name: Cow::Borrowed(name), is_user: false }
    }

    /// Creates an actor for an operator or calling application.
    pub fn user(name: impl Into<String>) -> Self {
        Actor { name: Cow::Owned(name.into()), is_user: true }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_user(&self) -> bool {
        self.is_user
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_user {
            write!(f, "user:{}", self.name)
        } else {
            write!(f, "system:{}", self.name)
        }
    }
}
