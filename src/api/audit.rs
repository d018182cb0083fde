//! Audit events.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::ca::CaId;
use crate::api::request::{PendingToken, RequestId, RequestState};
use crate::api::target::{SkipReason, TargetId};
use crate::api::template::TemplateRef;
use crate::commons::actor::Actor;
use crate::commons::crypto::Thumbprint;
use crate::commons::error::{Error, ErrorKind};


//------------ AuditAction ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditAction {
    RequestCreated {
        subject: String,
        template: TemplateRef,
    },
    Transition {
        from: RequestState,
        to: RequestState,
    },
    BackendSubmitted {
        backend: String,
        attempt: u32,
    },
    BackendResponse {
        backend: String,
        response: String,
    },
    SubmissionAbandoned {
        backend: String,
        token: PendingToken,
    },

    /// A backend issued after the request was given up on.
    OrphanedIssuance {
        backend: String,
        thumbprint: Option<Thumbprint>,
    },
    ChainValidationAlert {
        reason: String,
    },
    CaRegistered {
        ca: CaId,
        common_name: String,
    },
    CaRevoked {
        ca: CaId,
    },
    TemplatePublished {
        template: TemplateRef,
    },
    Installed {
        target: TargetId,
        thumbprint: Thumbprint,
    },
    Skipped {
        target: TargetId,
        reason: SkipReason,
    },
    RolledBack {
        target: TargetId,
        backup: String,
    },
    DistributionFailed {
        target: TargetId,
    },
    RenewalScheduled {
        superseded: RequestId,
    },
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AuditAction::RequestCreated { subject, template } => {
                write!(f, "request for '{}' with template {}", subject, template)
            }
            AuditAction::Transition { from, to } => write!(f, "{} -> {}", from, to),
            AuditAction::BackendSubmitted { backend, attempt } => {
                write!(f, "submitted to '{}' (attempt {})", backend, attempt)
            }
            AuditAction::BackendResponse { backend, response } => {
                write!(f, "'{}' answered: {}", backend, response)
            }
            AuditAction::SubmissionAbandoned { backend, token } => {
                write!(f, "abandoned submission {} at '{}'", token, backend)
            }
            AuditAction::OrphanedIssuance { backend, thumbprint } => match thumbprint {
                Some(thumbprint) => write!(f, "'{}' issued {} for an abandoned request", backend, thumbprint),
                None => write!(f, "'{}' issued for an abandoned request", backend),
            },
            AuditAction::ChainValidationAlert { reason } => write!(f, "ALERT chain validation: {}", reason),
            AuditAction::CaRegistered { ca, common_name } => write!(f, "registered CA '{}' ({})", common_name, ca),
            AuditAction::CaRevoked { ca } => write!(f, "revoked CA {}", ca),
            AuditAction::TemplatePublished { template } => write!(f, "published template {}", template),
            AuditAction::Installed { target, thumbprint } => write!(f, "installed {} on '{}'", thumbprint, target),
            AuditAction::Skipped { target, reason } => write!(f, "skipped '{}' ({:?})", target, reason),
            AuditAction::RolledBack { target, backup } => write!(f, "restored '{}' from backup {}", target, backup),
            AuditAction::DistributionFailed { target } => write!(f, "distribution to '{}' failed", target),
            AuditAction::RenewalScheduled { superseded } => write!(f, "renewal of {}", superseded),
        }
    }
}


//------------ AuditResult ---------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    Failure { kind: ErrorKind, message: String },
}


//------------ AuditEvent ----------------------------------------------------

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub actor: String,

    #[serde(flatten)]
    pub action: AuditAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestId>,
    pub result: AuditResult,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl AuditEvent {
    pub fn new(actor: &Actor, action: AuditAction, request: Option<RequestId>) -> Self {
        AuditEvent {
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action,
            request,
            result: AuditResult::Success,
            detail: String::new(),
        }
    }

    pub fn with_failure(mut self, err: &Error) -> Self {
        self.result = AuditResult::Failure { kind: err.kind(), message: err.to_string() };
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.result, AuditResult::Failure { .. })
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{}] {}", self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"), self.actor, self.action)?;
        if let Some(request) = &self.request {
            write!(f, " (request {})", request)?;
        }
        if let AuditResult::Failure { kind, message } = &self.result {
            write!(f, " FAILED {}: {}", kind, message)?;
        }
        if !self.detail.is_empty() {
            write!(f, " - {}", self.detail)?;
        }
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::request::FailureReason;
    use crate::constants::ACTOR_DEF_TEST;

    #[test]
    fn json_line_round_trip() {
        let event = AuditEvent::new(
            &ACTOR_DEF_TEST,
            AuditAction::Transition {
                from: RequestState::PendingApproval,
                to: RequestState::Failed(FailureReason::ApprovalTimeout),
            },
            Some(RequestId::generate()),
        )
        .with_failure(&Error::Custom("gave up".into()))
        .with_detail("waited 24h");

        let line = serde_json::to_string(&event).unwrap();
        assert!(!line.contains('\n'));
        assert!(line.contains(r#""action":"transition""#));
        assert_eq!(serde_json::from_str::<AuditEvent>(&line).unwrap(), event);
        assert!(event.is_failure());
    }
}
