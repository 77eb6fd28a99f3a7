//! Actor-based session runtime.
//!
//! Provides a `Send + Sync` [`SessionHandle`] in front of a single actor task
//! that owns the [`ReconcileDriver`]. Every inbound event (handle command,
//! push event, fetch result, mutation response) is processed to completion
//! by that one task, so the store is never mutated concurrently.
//!
//! ```text
//!   SessionHandle            mpsc          SessionActor (one task)
//!   ┌──────────────────┐  ─────────▶  ┌─────────────────────────────┐
//!   │ .request_rename()│              │ ReconcileDriver             │
//!   │ .companies()     │  ◀─────────  │   store / ledger / merger   │
//!   │ .subscribe()     │   oneshot    └──────┬───────────▲──────────┘
//!   └──────────────────┘                     │ spawn     │ internal mpsc
//!                                            ▼           │
//!                              round trips, fetches, push forwarder
//! ```
//!
//! A mutation returns as soon as its optimistic delta is applied. The round
//! trip runs in its own task and posts the outcome back to the actor, so
//! pushes and other requests keep flowing meanwhile and see the speculative
//! state.

use std::sync::Arc;
use std::time::Duration;

use kaisha_cache::{
    CacheError, Dispatch, EntryState, FailureReason, Mutation, Outcome, ReconcileDriver,
};
use kaisha_types::{Company, CompanyId, OperationId, PushEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::SessionConfig;
use crate::events::{SessionEvent, SessionStatus};
use crate::transport::{CompanyTransport, TransportError};

// ============================================================================
// Error Type
// ============================================================================

/// Errors from the session runtime.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("session shut down")]
    Shutdown,
}

// ============================================================================
// Commands (internal)
// ============================================================================

/// Sent from SessionHandle → SessionActor.
enum SessionCommand {
    Mutate {
        mutation: Mutation,
        reply: oneshot::Sender<Result<OperationId, SessionError>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<usize, SessionError>>,
    },
    Companies {
        reply: oneshot::Sender<Vec<Company>>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Produced by tasks the actor spawned.
enum Inbound {
    Push(PushEvent),
    PushLagged(u64),
    Fetched(Result<Vec<Company>, TransportError>),
    Resolved {
        operation_id: OperationId,
        outcome: Outcome,
    },
}

// ============================================================================
// SessionHandle (Send + Sync public API)
// ============================================================================

/// Cloneable handle to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionHandle {
    // ── Mutations ────────────────────────────────────────────────────────

    /// Add a company. Returns once the placeholder is in the view.
    pub async fn request_add(&self, name: &str) -> Result<OperationId, SessionError> {
        self.mutate(Mutation::Add { name: name.to_string() }).await
    }

    /// Rename a company. Returns once the new name is in the view (or, if
    /// another mutation on the same company is in flight, once queued).
    pub async fn request_rename(&self, id: CompanyId, name: &str) -> Result<OperationId, SessionError> {
        self.mutate(Mutation::Rename { id, name: name.to_string() }).await
    }

    /// Delete a company. Returns once it is gone from the view.
    pub async fn request_delete(&self, id: CompanyId) -> Result<OperationId, SessionError> {
        self.mutate(Mutation::Delete { id }).await
    }

    async fn mutate(&self, mutation: Mutation) -> Result<OperationId, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Mutate { mutation, reply }).await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    // ── Reads ────────────────────────────────────────────────────────────

    /// Refetch the full collection and merge it. Resolves with the number of
    /// companies in the view afterwards.
    pub async fn refresh(&self) -> Result<usize, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Refresh { reply }).await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)?
    }

    /// Current reconciled view. No network.
    pub async fn companies(&self) -> Result<Vec<Company>, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Companies { reply }).await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Status { reply }).await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Change notifications. Subscribe before issuing the requests you want
    /// to observe.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Stop the session. In-flight round trips finish in the background and
    /// their results are discarded.
    pub async fn close(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(SessionCommand::Close { reply }).await
            .map_err(|_| SessionError::Shutdown)?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ============================================================================
// SessionActor (internal, one task)
// ============================================================================

struct SessionActor {
    driver: ReconcileDriver,
    transport: Arc<dyn CompanyTransport>,
    round_trip_timeout: Option<Duration>,
    internal_tx: mpsc::UnboundedSender<Inbound>,
    events: broadcast::Sender<SessionEvent>,
    waiting_refresh: Vec<oneshot::Sender<Result<usize, SessionError>>>,
    fetch_in_flight: bool,
    last_version: u64,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut internal: mpsc::UnboundedReceiver<Inbound>,
    ) {
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        if !self.handle_command(cmd) {
                            break;
                        }
                    }
                    None => {
                        debug!("session: all handles dropped");
                        self.shutdown();
                        break;
                    }
                },
                // The actor holds a sender, so this never yields None.
                Some(inbound) = internal.recv() => self.handle_inbound(inbound),
            }
        }
        debug!("session: actor stopped");
    }

    /// Returns false once the session should stop.
    fn handle_command(&mut self, cmd: SessionCommand) -> bool {
        match cmd {
            SessionCommand::Mutate { mutation, reply } => {
                let result = match &mutation {
                    Mutation::Add { name } => self.driver.request_add(name),
                    Mutation::Rename { id, name } => self.driver.request_rename(*id, name),
                    Mutation::Delete { id } => self.driver.request_delete(*id),
                };
                match result {
                    Ok(requested) => {
                        if let Some(dispatch) = requested.dispatch {
                            self.dispatch(dispatch);
                        } else {
                            debug!("session: {} queued", requested.operation_id);
                        }
                        self.notify_if_changed();
                        let _ = reply.send(Ok(requested.operation_id));
                    }
                    Err(e) => {
                        debug!("session: {} {:?} refused: {}", mutation.kind(), mutation.target(), e);
                        let _ = reply.send(Err(e.into()));
                    }
                }
            }
            SessionCommand::Refresh { reply } => {
                self.waiting_refresh.push(reply);
                self.start_fetch();
            }
            SessionCommand::Companies { reply } => {
                let _ = reply.send(self.driver.companies());
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SessionCommand::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Push(event) => {
                let outcome = self.driver.apply_push(&event);
                trace!("session: push {:?} -> {:?}", event, outcome);
                self.notify_if_changed();
            }
            Inbound::PushLagged(missed) => {
                warn!("session: push channel lagged by {missed} events, refetching");
                let _ = self.events.send(SessionEvent::PushLagged { missed });
                self.start_fetch();
            }
            Inbound::Fetched(result) => {
                self.fetch_in_flight = false;
                match result {
                    Ok(companies) => {
                        let was_live = self.driver.is_live();
                        let report = self.driver.apply_fetch(companies);
                        let count = self.driver.store().len();
                        if !was_live && self.driver.is_live() {
                            let _ = self.events.send(SessionEvent::Live { companies: count });
                        }
                        debug!("session: fetch applied ({:?})", report);
                        self.notify_if_changed();
                        for reply in self.waiting_refresh.drain(..) {
                            let _ = reply.send(Ok(count));
                        }
                    }
                    Err(e) => {
                        warn!("session: fetch failed: {e}");
                        let _ = self.events.send(SessionEvent::FetchFailed { error: e.to_string() });
                        for reply in self.waiting_refresh.drain(..) {
                            let _ = reply.send(Err(e.clone().into()));
                        }
                    }
                }
            }
            Inbound::Resolved { operation_id, outcome } => {
                self.handle_resolved(operation_id, outcome);
            }
        }
    }

    fn handle_resolved(&mut self, operation_id: OperationId, outcome: Outcome) {
        let report = match self.driver.resolve(operation_id, outcome) {
            Ok(report) => report,
            Err(e) => {
                warn!("session: dropping response for {operation_id}: {e}");
                return;
            }
        };

        let settled = report.entry.as_ref().and_then(|entry| match &entry.state {
            EntryState::Confirmed => Some(SessionEvent::MutationConfirmed {
                operation_id,
                kind: entry.kind(),
            }),
            EntryState::Failed(reason) => Some(SessionEvent::MutationFailed {
                operation_id,
                reason: reason.clone(),
            }),
            EntryState::Open => None,
        });
        if let Some(event) = settled {
            // View first, then the outcome, so observers re-read a settled view.
            self.notify_if_changed();
            let _ = self.events.send(event);
        }
        for (failed, reason) in report.failures {
            let _ = self.events.send(SessionEvent::MutationFailed { operation_id: failed, reason });
        }
        for dispatch in report.dispatches {
            self.dispatch(dispatch);
        }
        self.notify_if_changed();
    }

    // =========================================================================
    // Spawned work
    // =========================================================================

    fn dispatch(&self, dispatch: Dispatch) {
        let transport = Arc::clone(&self.transport);
        let tx = self.internal_tx.clone();
        let timeout = self.round_trip_timeout;
        debug!("session: dispatch {} {:?}", dispatch.operation_id, dispatch.mutation);
        tokio::spawn(async move {
            let outcome = round_trip(transport.as_ref(), &dispatch.mutation, timeout).await;
            // Receiver gone means the session closed; the result is moot.
            let _ = tx.send(Inbound::Resolved { operation_id: dispatch.operation_id, outcome });
        });
    }

    fn start_fetch(&mut self) {
        if self.fetch_in_flight {
            return;
        }
        self.fetch_in_flight = true;
        let transport = Arc::clone(&self.transport);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = transport.fetch_all().await;
            let _ = tx.send(Inbound::Fetched(result));
        });
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    fn notify_if_changed(&mut self) {
        let version = self.driver.version();
        if version != self.last_version {
            self.last_version = version;
            let _ = self.events.send(SessionEvent::CollectionChanged { version });
        }
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.driver.state(),
            version: self.driver.version(),
            companies: self.driver.store().len(),
            open_mutations: self.driver.ledger().open_count(),
            queued_mutations: self.driver.ledger().queued_count(),
            pushes_applied: self.driver.merger().applied_count(),
            pushes_suppressed: self.driver.merger().suppressed_count(),
        }
    }

    fn shutdown(&mut self) {
        let abandoned = self.driver.close();
        if !abandoned.is_empty() {
            info!("session: closing with {} mutations unresolved", abandoned.len());
        }
        for reply in self.waiting_refresh.drain(..) {
            let _ = reply.send(Err(SessionError::Shutdown));
        }
        let _ = self.events.send(SessionEvent::Closed);
    }
}

/// Run one mutation against the transport and translate the answer.
async fn round_trip(
    transport: &dyn CompanyTransport,
    mutation: &Mutation,
    timeout: Option<Duration>,
) -> Outcome {
    let call = async {
        match mutation {
            Mutation::Add { name } => transport.add_company(name).await.map(Some),
            Mutation::Rename { id, name } => transport.change_company_name(*id, name).await.map(Some),
            Mutation::Delete { id } => transport.delete_company(*id).await.map(|()| None),
        }
    };
    let result = match timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                return Outcome::Failed(FailureReason::Transport(format!(
                    "no response after {}ms",
                    limit.as_millis()
                )));
            }
        },
        None => call.await,
    };
    match result {
        Ok(server_value) => Outcome::Confirmed(server_value),
        Err(e) => Outcome::Failed(e.failure_reason()),
    }
}

/// Relay the transport's push channel into the actor, in receipt order.
fn spawn_push_forwarder(mut rx: broadcast::Receiver<PushEvent>, tx: mpsc::UnboundedSender<Inbound>) {
    tokio::spawn(async move {
        loop {
            let inbound = tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => Inbound::Push(event),
                    Err(RecvError::Lagged(missed)) => Inbound::PushLagged(missed),
                    Err(RecvError::Closed) => {
                        debug!("session: push channel closed");
                        break;
                    }
                },
                _ = tx.closed() => break,
            };
            if tx.send(inbound).is_err() {
                break;
            }
        }
    });
}

// ============================================================================
// Public spawn function
// ============================================================================

/// Start a session over `transport`.
///
/// Subscribes to the push channel before the initial fetch so no change
/// between the two is missed. Must be called from within a tokio runtime.
pub fn spawn_session(transport: Arc<dyn CompanyTransport>, config: SessionConfig) -> SessionHandle {
    let (tx, commands) = mpsc::channel(config.command_capacity());
    let (internal_tx, internal) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(config.event_capacity());

    spawn_push_forwarder(transport.subscribe(), internal_tx.clone());

    let mut actor = SessionActor {
        driver: ReconcileDriver::new(config.conflict_policy),
        transport,
        round_trip_timeout: config.round_trip_timeout(),
        internal_tx,
        events: events.clone(),
        waiting_refresh: Vec::new(),
        fetch_in_flight: false,
        last_version: 0,
    };
    if config.fetch_on_start {
        actor.start_fetch();
    }
    info!("session: started (policy={:?})", config.conflict_policy);
    tokio::spawn(actor.run(commands, internal));

    SessionHandle { tx, events }
}
