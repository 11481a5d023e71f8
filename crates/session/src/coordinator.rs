//! Session stream coordination.
//!
//! One session has at most one message in flight. `process_message` spawns
//! the streaming run as a background task, tracks it in the active-execution
//! registry, and forwards every event to the transport sink in order.
//! `cancel_message` signals the run's cancellation token, interrupts the
//! forwarder, emits exactly one terminal `cancelled` event through the same
//! sink, and cleans the registry and the external session store's streaming
//! flag.
//!
//! The registry lock is never held across an await; all updates are single
//! atomic operations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use windlass_agent::{ChatRequest, Orchestrator, RunEvent};
use windlass_core::Error;

/// Callback receiving every event of one session's run, in order.
pub type EventSink = Arc<dyn Fn(RunEvent) + Send + Sync>;

/// The external session store (owned by the transport layer). The
/// coordinator only needs to flip the per-session "streaming" flag.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn set_streaming(&self, session_id: &str, streaming: bool);
}

/// Store for embedders without an external session store.
pub struct NullSessionStore;

#[async_trait]
impl SessionStore for NullSessionStore {
    async fn set_streaming(&self, _session_id: &str, _streaming: bool) {}
}

/// The live handle for one in-flight message.
struct ActiveExecution {
    cancel: CancellationToken,
    message_id: String,
    sink: EventSink,
    forwarder: JoinHandle<()>,
}

/// Runs one cancellable streaming execution per session id.
pub struct StreamCoordinator {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn SessionStore>,
    executions: Arc<RwLock<HashMap<String, ActiveExecution>>>,
}

impl StreamCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            orchestrator,
            store,
            executions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Whether the session currently has a message in flight.
    pub async fn is_active(&self, session_id: &str) -> bool {
        self.executions.read().await.contains_key(session_id)
    }

    pub async fn active_count(&self) -> usize {
        self.executions.read().await.len()
    }

    /// The in-flight message id for a session, if any.
    pub async fn current_message_id(&self, session_id: &str) -> Option<String> {
        self.executions
            .read()
            .await
            .get(session_id)
            .map(|e| e.message_id.clone())
    }

    /// Begin processing one message. Events flow to `sink` until a terminal
    /// event; the registry entry and the store's streaming flag are cleared
    /// on completion. Returns the new message id.
    ///
    /// A session with a message already in flight is rejected with
    /// [`Error::SessionBusy`]; whether to surface that or cancel-then-retry
    /// is the caller's policy.
    pub async fn process_message(
        &self,
        session_id: &str,
        request: ChatRequest,
        sink: EventSink,
    ) -> Result<String, Error> {
        let cancel = CancellationToken::new();
        let message_id = Uuid::new_v4().to_string();

        {
            let mut executions = self.executions.write().await;
            if executions.contains_key(session_id) {
                warn!(session_id = %session_id, "Rejecting message: session already streaming");
                return Err(Error::SessionBusy(session_id.to_string()));
            }

            let events = self.orchestrator.run_stream(request, cancel.clone());
            let forwarder = tokio::spawn(forward_events(
                session_id.to_string(),
                events,
                sink.clone(),
                cancel.clone(),
                self.executions.clone(),
                self.store.clone(),
            ));

            executions.insert(
                session_id.to_string(),
                ActiveExecution {
                    cancel,
                    message_id: message_id.clone(),
                    sink,
                    forwarder,
                },
            );
        }

        info!(session_id = %session_id, message_id = %message_id, "Message processing started");
        Ok(message_id)
    }

    /// Cancel the session's in-flight message. Emits exactly one terminal
    /// `cancelled` event through the sink the message was started with.
    pub async fn cancel_message(&self, session_id: &str) -> Result<(), Error> {
        let Some(execution) = self.executions.write().await.remove(session_id) else {
            return Err(Error::SessionNotFound(session_id.to_string()));
        };

        info!(
            session_id = %session_id,
            message_id = %execution.message_id,
            "Cancelling in-flight message"
        );

        // Cooperative: the run observes the token at its loop boundaries.
        // The forwarder is stopped hard so no queued event leaks out after
        // the terminal `cancelled`.
        execution.cancel.cancel();
        execution.forwarder.abort();
        (execution.sink)(RunEvent::Cancelled);

        self.store.set_streaming(session_id, false).await;
        Ok(())
    }
}

/// Forward run events to the sink until a terminal event or cancellation,
/// then clean up the registry entry and the store flag.
async fn forward_events(
    session_id: String,
    mut events: tokio::sync::mpsc::Receiver<RunEvent>,
    sink: EventSink,
    cancel: CancellationToken,
    executions: Arc<RwLock<HashMap<String, ActiveExecution>>>,
    store: Arc<dyn SessionStore>,
) {
    // The flag flips on and off from inside this task so the two writes
    // cannot race each other even for a run that completes instantly.
    store.set_streaming(&session_id, true).await;

    loop {
        let event = tokio::select! {
            // Cancellation wins: `cancel_message` owns cleanup and the
            // terminal event for that path.
            _ = cancel.cancelled() => return,
            event = events.recv() => event,
        };

        let Some(event) = event else {
            // The run ended without a terminal event (cancelled upstream);
            // nothing more to forward.
            break;
        };

        let terminal = event.is_terminal();
        debug!(session_id = %session_id, event = event.event_type(), "Forwarding event");
        sink(event);
        if terminal {
            break;
        }
    }

    executions.write().await.remove(&session_id);
    store.set_streaming(&session_id, false).await;
    debug!(session_id = %session_id, "Session stream closed");
}
