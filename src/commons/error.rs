//! Defines all Custodian errors.

use std::{error, fmt, io};

use serde::{Deserialize, Serialize};

use crate::api::ca::CaId;
use crate::api::request::{RequestId, RequestState};
use crate::api::target::TargetId;
use crate::api::template::TemplateName;
use crate::commons::storage;
use crate::server::backend::BackendError;
use crate::server::distribution::DistributionError;


//------------ ErrorKind -----------------------------------------------------

/// The category of an error.
///
/// Callers branch on the kind, never on the message text.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed subject or SAN, weak key, bad input. Never retried.
    Validation,

    /// The signing service was unreachable or answered with a server error.
    Backend,

    /// The signing service refused to issue.
    Rejected,

    /// A pending request did not resolve in time.
    ApprovalTimeout,

    /// A target was unreachable, refused authentication or the install
    /// did not take.
    Distribution,

    /// A chain did not verify. Fatal and alerted on.
    ChainValidation,

    /// The CA hierarchy does not allow the operation.
    Hierarchy,

    NotFound,
    Conflict,
    Cancelled,
    Storage,
    Crypto,
    Config,
    Internal,
}

impl ErrorKind {
    /// Whether an operation failing with this kind may be attempted again.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Backend | ErrorKind::Distribution)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Backend => "backend",
            ErrorKind::Rejected => "rejected",
            ErrorKind::ApprovalTimeout => "approval_timeout",
            ErrorKind::Distribution => "distribution",
            ErrorKind::ChainValidation => "chain_validation",
            ErrorKind::Hierarchy => "hierarchy",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}


//------------ CustodyIoError ------------------------------------------------

/// An IO error with a description of what was being attempted.
#[derive(Debug)]
pub struct CustodyIoError {
    context: String,
    cause: io::Error,
}

impl CustodyIoError {
    pub fn new(context: String, cause: io::Error) -> Self {
        CustodyIoError { context, cause }
    }
}

impl fmt::Display for CustodyIoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "context: {}, underlying io::Error: {}", self.context, self.cause)
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------
    IoError(CustodyIoError),
    StorageError(storage::Error),
    SignerError(String),
    JsonError(serde_json::Error),
    ConfigError(String),
    Custom(String),

    //-----------------------------------------------------------------
    // CA Hierarchy Issues
    //-----------------------------------------------------------------
    CaUnknown(CaId),
    CaNameUnknown(String),
    CaDuplicate(String),
    HierarchyViolation {
        parent: CaId,
        requested: Option<u32>,
        remaining: u32,
    },
    ParentRevoked(CaId),
    BrokenChain(String),
    CaCertificateInvalid(String),

    //-----------------------------------------------------------------
    // Template Issues
    //-----------------------------------------------------------------
    TemplateUnknown(TemplateName),
    TemplateVersionExists(TemplateName, u32),
    TemplateInvalid(String),

    //-----------------------------------------------------------------
    // Enrollment Issues
    //-----------------------------------------------------------------
    RequestUnknown(RequestId),
    RequestInvalid(String),
    KeyTooWeak { required: u32, actual: u32 },
    InvalidTransition {
        request: RequestId,
        from: RequestState,
        to: RequestState,
    },
    RequestNotCompleted(RequestId),
    BackendUnknown(String),
    Backend(BackendError),
    Rejected(String),
    ApprovalTimeout(RequestId),
    ChainValidation(String),
    Cancelled(RequestId),

    //-----------------------------------------------------------------
    // Distribution Issues
    //-----------------------------------------------------------------
    TargetUnknown(TargetId),
    Distribution {
        target: TargetId,
        err: DistributionError,
    },
    CredentialNotFound(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => e.fmt(f),
            Error::StorageError(e) => write!(f, "Storage error: {}", e),
            Error::SignerError(e) => write!(f, "Signing issue: {}", e),
            Error::JsonError(e) => write!(f, "Invalid JSON: {}", e),
            Error::ConfigError(e) => write!(f, "Configuration error: {}", e),
            Error::Custom(s) => s.fmt(f),

            Error::CaUnknown(id) => write!(f, "Unknown CA '{}'", id),
            Error::CaNameUnknown(name) => write!(f, "No CA with common name '{}'", name),
            Error::CaDuplicate(name) => write!(f, "CA '{}' already exists", name),
            Error::HierarchyViolation { parent, requested, remaining } => {
                match requested {
                    Some(requested) => write!(
                        f,
                        "Path length {} exceeds the budget left under CA '{}' ({} more levels allowed)",
                        requested, parent, remaining
                    ),
                    None => write!(f, "CA '{}' may not have subordinate CAs", parent),
                }
            }
            Error::ParentRevoked(id) => write!(f, "Parent CA '{}' is revoked", id),
            Error::BrokenChain(msg) => write!(f, "Broken chain: {}", msg),
            Error::CaCertificateInvalid(msg) => write!(f, "Cannot use CA certificate: {}", msg),

            Error::TemplateUnknown(name) => write!(f, "Unknown template '{}'", name),
            Error::TemplateVersionExists(name, version) => {
                write!(f, "Template '{}' version {} is already published", name, version)
            }
            Error::TemplateInvalid(msg) => write!(f, "Invalid template: {}", msg),

            Error::RequestUnknown(id) => write!(f, "Unknown enrollment request '{}'", id),
            Error::RequestInvalid(msg) => write!(f, "Invalid enrollment request: {}", msg),
            Error::KeyTooWeak { required, actual } => write!(
                f,
                "Key strength {} bits is below the template minimum of {} bits",
                actual, required
            ),
            Error::InvalidTransition { request, from, to } => write!(
                f,
                "Request '{}' cannot move from {} to {}",
                request, from, to
            ),
            Error::RequestNotCompleted(id) => {
                write!(f, "Request '{}' is not completed", id)
            }
            Error::BackendUnknown(name) => write!(f, "Unknown signing backend '{}'", name),
            Error::Backend(e) => write!(f, "Signing backend error: {}", e),
            Error::Rejected(reason) => write!(f, "Rejected by signing backend: {}", reason),
            Error::ApprovalTimeout(id) => {
                write!(f, "Request '{}' was not approved in time", id)
            }
            Error::ChainValidation(msg) => write!(f, "Chain validation failed: {}", msg),
            Error::Cancelled(id) => write!(f, "Request '{}' was cancelled", id),

            Error::TargetUnknown(id) => write!(f, "Unknown distribution target '{}'", id),
            Error::Distribution { target, err } => {
                write!(f, "Distribution to '{}' failed: {}", target, err)
            }
            Error::CredentialNotFound(reference) => {
                write!(f, "No credential found for '{}'", reference)
            }
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IoError(_) | Error::StorageError(_) | Error::JsonError(_) => ErrorKind::Storage,
            Error::SignerError(_) => ErrorKind::Crypto,
            Error::ConfigError(_) => ErrorKind::Config,
            Error::Custom(_) => ErrorKind::Internal,

            Error::CaUnknown(_)
            | Error::CaNameUnknown(_)
            | Error::TemplateUnknown(_)
            | Error::RequestUnknown(_)
            | Error::BackendUnknown(_)
            | Error::TargetUnknown(_)
            | Error::CredentialNotFound(_) => ErrorKind::NotFound,

            Error::CaDuplicate(_)
            | Error::TemplateVersionExists(_, _)
            | Error::InvalidTransition { .. } => ErrorKind::Conflict,

            Error::HierarchyViolation { .. }
            | Error::ParentRevoked(_)
            | Error::BrokenChain(_)
            | Error::CaCertificateInvalid(_) => ErrorKind::Hierarchy,

            Error::TemplateInvalid(_)
            | Error::RequestInvalid(_)
            | Error::KeyTooWeak { .. }
            | Error::RequestNotCompleted(_) => ErrorKind::Validation,

            Error::Backend(_) => ErrorKind::Backend,
            Error::Rejected(_) => ErrorKind::Rejected,
            Error::ApprovalTimeout(_) => ErrorKind::ApprovalTimeout,
            Error::ChainValidation(_) => ErrorKind::ChainValidation,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Distribution { .. } => ErrorKind::Distribution,
        }
    }

    /// Whether this particular failure is transient.
    ///
    /// Narrower than [`ErrorKind::is_retryable`]: a backend that answered
    /// with a protocol violation is a backend error, but asking again will
    /// not help.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Backend(e) => e.is_transient(),
            Error::Distribution { err, .. } => err.is_transient(),
            _ => false,
        }
    }

    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn invalid_request(msg: impl fmt::Display) -> Self {
        Error::RequestInvalid(msg.to_string())
    }

    pub fn signer(msg: impl fmt::Display) -> Self {
        Error::SignerError(msg.to_string())
    }

    pub fn io_error_with_context(context: String, cause: io::Error) -> Self {
        Error::IoError(CustodyIoError::new(context, cause))
    }

    pub fn distribution(target: &TargetId, err: DistributionError) -> Self {
        Error::Distribution { target: target.clone(), err }
    }
}

impl error::Error for Error {}

impl From<CustodyIoError> for Error {
    fn from(e: CustodyIoError) -> Self {
        Error::IoError(e)
    }
}

impl From<storage::Error> for Error {
    fn from(e: storage::Error) -> Self {
        Error::StorageError(e)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::SignerError(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}


//------------ Tests ---------------------------------------------------------
