//! The append-only audit log.
//!
//! Appending never blocks: events are pushed onto an in-memory list and
//! handed to a background thread that writes them to
//! `<storage root>/audit/audit.log`, one JSON object per line. On start,
//! the existing file is read back so history survives restarts.

use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, RwLock};
use std::thread;

use log::{debug, error, warn};
use url::Url;

use crate::api::audit::{AuditAction, AuditEvent};
use crate::api::request::{RequestId, RequestState};
use crate::commons::actor::Actor;
use crate::commons::error::Error;
use crate::commons::storage::StorageUri;
use crate::commons::util::file;
use crate::commons::{CustodyEmptyResult, CustodyResult};
use crate::constants::{AUDIT_DIR, AUDIT_FILE};


//------------ AuditLog ------------------------------------------------------

#[derive(Clone, Debug)]
pub struct AuditLog {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    events: RwLock<Vec<AuditEvent>>,
    writer: Option<Sender<WriterMsg>>,
}

#[derive(Debug)]
enum WriterMsg {
    Event(Box<AuditEvent>),
    Flush(Sender<()>),
}

impl AuditLog {
    /// An audit log that is not persisted.
    pub fn in_memory() -> Self {
        AuditLog {
            inner: Arc::new(Inner { events: RwLock::new(vec![]), writer: None }),
        }
    }

    /// Opens the audit log under the storage location.
    ///
    /// For memory storage the log is kept in memory only.
    pub fn create(storage_uri: &Url) -> CustodyResult<Self> {
        let root = match StorageUri::parse(storage_uri)? {
            StorageUri::Disk(root) => root,
            StorageUri::Memory(_) => return Ok(Self::in_memory()),
        };
        let path = root.join(AUDIT_DIR).join(AUDIT_FILE);
        let events = Self::load(&path)?;
        let writer = Self::spawn_writer(path)?;

        Ok(AuditLog {
            inner: Arc::new(Inner { events: RwLock::new(events), writer: Some(writer) }),
        })
    }

    fn load(path: &PathBuf) -> CustodyResult<Vec<AuditEvent>> {
        let Some(bytes) = file::read_optional(path)? else {
            return Ok(vec![]);
        };
        let mut events = vec![];
        for (nr, line) in String::from_utf8_lossy(&bytes).lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!("Skipping unreadable audit log line {} in '{}': {}", nr + 1, path.display(), e),
            }
        }
        Ok(events)
    }

    fn spawn_writer(path: PathBuf) -> CustodyResult<Sender<WriterMsg>> {
        let mut out = file::open_append(&path)?;
        let (tx, rx) = mpsc::channel::<WriterMsg>();

        thread::Builder::new()
            .name("audit-writer".into())
            .spawn(move || {
                for msg in rx {
                    match msg {
                        WriterMsg::Event(event) => {
                            let res = serde_json::to_string(&event)
                                .map_err(|e| e.to_string())
                                .and_then(|line| writeln!(out, "{}", line).map_err(|e| e.to_string()))
                                .and_then(|_| out.flush().map_err(|e| e.to_string()));
                            if let Err(e) = res {
                                error!("Could not write audit event to '{}': {}", path.display(), e);
                            }
                        }
                        WriterMsg::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })
            .map_err(|e| Error::io_error_with_context("cannot start audit writer".into(), e))?;

        Ok(tx)
    }

    /// Records an event. Never blocks on IO.
    pub fn append(&self, event: AuditEvent) {
        match &event.action {
            AuditAction::ChainValidationAlert { reason } => {
                error!("ALERT: chain validation failed: {} ({})", reason, event.detail)
            }
            AuditAction::OrphanedIssuance { .. } => warn!("Audit: {}", event),
            _ => debug!("Audit: {}", event),
        }

        if let Some(writer) = &self.inner.writer {
            if writer.send(WriterMsg::Event(Box::new(event.clone()))).is_err() {
                error!("Audit writer is gone, event only kept in memory");
            }
        }
        self.inner.events.write().expect("poisoned lock").push(event);
    }

    /// Convenience for a successful event.
    pub fn record(&self, actor: &Actor, action: AuditAction, request: Option<RequestId>) {
        self.append(AuditEvent::new(actor, action, request));
    }

    /// Waits until everything appended so far is on disk.
    pub fn flush(&self) {
        if let Some(writer) = &self.inner.writer {
            let (tx, rx) = mpsc::channel();
            if writer.send(WriterMsg::Flush(tx)).is_ok() {
                let _ = rx.recv();
            }
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.inner.events.read().expect("poisoned lock").clone()
    }

    pub fn for_request(&self, id: RequestId) -> Vec<AuditEvent> {
        self.inner
            .events
            .read()
            .expect("poisoned lock")
            .iter()
            .filter(|event| event.request == Some(id))
            .cloned()
            .collect()
    }

    /// The recorded state transitions of a request, in order.
    pub fn transitions(&self, id: RequestId) -> Vec<(RequestState, RequestState)> {
        self.for_request(id)
            .into_iter()
            .filter_map(|event| match event.action {
                AuditAction::Transition { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }

    /// Replays the recorded transitions of a request through the state
    /// machine, starting at `Drafted`.
    pub fn verify_transitions(&self, id: RequestId) -> CustodyEmptyResult {
        let mut current = RequestState::Drafted;
        for (from, to) in self.transitions(id) {
            if from != current {
                return Err(Error::custom(format!(
                    "request {} recorded {} -> {} while in {}",
                    id, from, to, current
                )));
            }
            if !from.can_transition_to(&to) {
                return Err(Error::custom(format!("request {} made illegal transition {} -> {}", id, from, to)));
            }
            current = to;
        }
        Ok(())
    }
}


//------------ Tests ---------------------------------------------------------
