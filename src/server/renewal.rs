//! Re-entering certificates that are about to expire into the pipeline.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, watch};
use tokio::time::{MissedTickBehavior, interval};

use crate::api::audit::AuditAction;
use crate::api::request::{EnrollmentRequest, IdentityKey, NewEnrollment, RequestId, RequestState};
use crate::api::target::{DistributionOutcome, TargetId};
use crate::commons::actor::Actor;
use crate::commons::CustodyResult;
use crate::config::RenewalConfig;
use crate::server::audit::AuditLog;
use crate::server::distribution::DistributionEngine;
use crate::server::pipeline::CertificateRequestPipeline;


//------------ RenewalReport -------------------------------------------------

/// What one sweep did.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RenewalReport {
    /// Pairs of (superseded request, renewal request).
    pub scheduled: Vec<(RequestId, RequestId)>,

    /// Renewal requests that did not complete, with the state they
    /// rested in.
    pub unfinished: Vec<(RequestId, RequestState)>,
    pub distributed: Vec<(RequestId, TargetId, DistributionOutcome)>,

    /// Late issuances of abandoned submissions that were looked at.
    pub reconciled: usize,
}

impl fmt::Display for RenewalReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let installed = self.distributed.iter().filter(|(_, _, outcome)| outcome.is_installed()).count();
        write!(
            f,
            "{} renewal(s) scheduled, {} unfinished, {} install(s)",
            self.scheduled.len(),
            self.unfinished.len(),
            installed
        )
    }
}


//------------ RenewalScheduler ----------------------------------------------

/// Sweeps completed requests on an interval and renews those whose
/// certificate entered the renewal window of its template.
pub struct RenewalScheduler {
    config: RenewalConfig,
    pipeline: Arc<CertificateRequestPipeline>,
    distribution: Arc<DistributionEngine>,
    audit: AuditLog,

    /// Sweeps never overlap.
    sweeping: Mutex<()>,
}

impl RenewalScheduler {
    pub fn new(
        config: RenewalConfig,
        pipeline: Arc<CertificateRequestPipeline>,
        distribution: Arc<DistributionEngine>,
        audit: AuditLog,
    ) -> Self {
        RenewalScheduler { config, pipeline, distribution, audit, sweeping: Mutex::new(()) }
    }

    /// Completed requests that need a renewal at `now`.
    ///
    /// Only the newest completed request of an identity counts, and only
    /// if no renewal of it exists yet that has not failed.
    pub fn due(&self, now: DateTime<Utc>) -> CustodyResult<Vec<EnrollmentRequest>> {
        let requests = self.pipeline.list()?;

        let superseded: HashSet<RequestId> = requests
            .iter()
            .filter(|request| !matches!(request.state, RequestState::Failed(_)))
            .filter_map(|request| request.supersedes)
            .collect();

        // The list is ordered by creation, so a later request replaces an
        // earlier one unless it expires sooner.
        let mut latest: HashMap<IdentityKey, &EnrollmentRequest> = HashMap::new();
        for request in requests.iter().filter(|request| request.is_completed()) {
            let replace = match latest.get(&request.identity()) {
                Some(current) => request.not_after > current.not_after,
                None => true,
            };
            if replace {
                latest.insert(request.identity(), request);
            }
        }

        let mut res = vec![];
        for request in latest.into_values() {
            if superseded.contains(&request.id) {
                continue;
            }
            let Some(not_after) = request.not_after else { continue };
            let template = match self.pipeline.templates().get_version(&request.template) {
                Ok(template) => template,
                Err(e) => {
                    warn!("Cannot check request {} for renewal: {}", request.id, e);
                    continue;
                }
            };
            if template.is_due_for_renewal(not_after, now) {
                res.push(request.clone());
            }
        }
        res.sort_by_key(|request| request.created);
        Ok(res)
    }

    /// Runs one sweep.
    ///
    /// Renewals are driven concurrently. Those that complete are
    /// distributed to their targets if so configured.
    pub async fn sweep(&self, actor: &Actor) -> CustodyResult<RenewalReport> {
        self.sweep_at(Utc::now(), actor).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>, actor: &Actor) -> CustodyResult<RenewalReport> {
        let _sweeping = self.sweeping.lock().await;
        let mut report = RenewalReport {
            reconciled: self.pipeline.reconcile_abandoned(actor).await?,
            ..Default::default()
        };

        for old in self.due(now)? {
            match self.schedule(&old, actor) {
                Ok(id) => report.scheduled.push((old.id, id)),
                Err(e) => error!("Could not schedule renewal of request {}: {}", old.id, e),
            }
        }

        let states = join_all(report.scheduled.iter().map(|(_, id)| self.pipeline.process(*id, actor))).await;
        let mut completed = vec![];
        for ((_, id), state) in report.scheduled.iter().zip(states) {
            match state {
                Ok(RequestState::Completed) => completed.push(*id),
                Ok(state) => {
                    debug!("Renewal {} rests in state {}", id, state);
                    report.unfinished.push((*id, state));
                }
                Err(e) => error!("Renewal {} could not be driven: {}", id, e),
            }
        }

        if self.config.auto_distribute {
            for id in &completed {
                match self.distribution.distribute_all(*id, actor).await {
                    Ok(outcomes) => report
                        .distributed
                        .extend(outcomes.into_iter().map(|(target, outcome)| (*id, target, outcome))),
                    Err(e) => error!("Could not distribute renewal {}: {}", id, e),
                }
            }

            for (id, target) in self.undelivered(&completed)? {
                info!("Renewal {} completed after its sweep, distributing to '{}'", id, target);
                match self.distribution.distribute(id, &target, actor).await {
                    Ok(outcome) => report.distributed.push((id, target, outcome)),
                    Err(e) => error!("Could not distribute renewal {} to '{}': {}", id, target, e),
                }
            }
        }

        if !report.scheduled.is_empty() || !report.distributed.is_empty() {
            info!("Renewal sweep: {}", report);
        }
        Ok(report)
    }

    /// Runs sweeps on the configured interval until `shutdown` turns
    /// true.
    pub async fn run(self: Arc<Self>, actor: Actor, mut shutdown: watch::Receiver<bool>) {
        let mut ticks = interval(self.config.interval());
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Renewal scheduler sweeping every {}s", self.config.interval().as_secs());

        loop {
            tokio::select! {
                _ = ticks.tick() => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            if let Err(e) = self.sweep(&actor).await {
                error!("Renewal sweep failed: {}", e);
            }
        }
        debug!("Renewal scheduler stopped");
    }

    /// Completed renewals that a target of theirs does not have yet.
    ///
    /// A renewal that waited for approval completes outside any sweep.
    /// Renewals that were renewed themselves are left out, and so are
    /// targets that got a certificate of a later request in the meantime.
    fn undelivered(&self, skip: &[RequestId]) -> CustodyResult<Vec<(RequestId, TargetId)>> {
        let requests = self.pipeline.list()?;
        let created: HashMap<RequestId, DateTime<Utc>> =
            requests.iter().map(|request| (request.id, request.created)).collect();
        let superseded: HashSet<RequestId> = requests
            .iter()
            .filter(|request| !matches!(request.state, RequestState::Failed(_)))
            .filter_map(|request| request.supersedes)
            .collect();

        let mut res = vec![];
        let renewals = requests.iter().filter(|request| {
            request.is_completed()
                && request.supersedes.is_some()
                && !superseded.contains(&request.id)
                && !skip.contains(&request.id)
        });
        for renewal in renewals {
            for target_id in &renewal.targets {
                let target = match self.distribution.targets().get(target_id) {
                    Ok(target) => target,
                    Err(e) => {
                        warn!("Cannot check target '{}' of renewal {}: {}", target_id, renewal.id, e);
                        continue;
                    }
                };
                if target.last_thumbprint.is_some() && target.last_thumbprint == renewal.thumbprint {
                    continue;
                }
                let newer = target
                    .installed_request
                    .and_then(|installed| created.get(&installed))
                    .is_some_and(|installed| *installed > renewal.created);
                if !newer {
                    res.push((renewal.id, target_id.clone()));
                }
            }
        }
        Ok(res)
    }

    fn schedule(&self, old: &EnrollmentRequest, actor: &Actor) -> CustodyResult<RequestId> {
        let new = NewEnrollment {
            subject: old.subject.clone(),
            sans: old.sans.clone(),
            template: old.template.name.clone(),
            targets: old.targets.clone(),
            supersedes: Some(old.id),
        };
        let id = self.pipeline.submit(new, actor)?;
        self.audit.record(actor, AuditAction::RenewalScheduled { superseded: old.id }, Some(id));
        info!(
            "Renewing '{}' ({}): request {} supersedes {}",
            old.subject.common_name,
            old.not_after.map(|t| t.to_rfc3339()).unwrap_or_default(),
            id,
            old.id
        );
        Ok(id)
    }
}

impl fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RenewalScheduler({:?})", self.config)
    }
}


//------------ Tests ---------------------------------------------------------
