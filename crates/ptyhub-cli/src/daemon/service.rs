//! The terminal service: one task owning every session, sink and timer.
//!
//! [`TerminalService`] is a cheap, cloneable handle. Each call becomes a
//! message to the service task, which applies it to the session registry,
//! client table and disposal scheduler in arrival order. PTY events and timer
//! expiries come through the same task, so the maps have a single writer and
//! need no locks.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use ptyhub_core::error::ApiError;
use ptyhub_core::protocol::{SessionInfo, TerminalOptions};
use ptyhub_core::session_id::SessionId;
use ptyhub_core::shell::shell_name;

use crate::daemon::clients::{ClientTable, TerminalClient};
use crate::daemon::config::ServiceConfig;
use crate::daemon::forwarder;
use crate::daemon::pty::{PtyEvent, TermSize};
use crate::daemon::registry::SessionRegistry;
use crate::daemon::scheduler::{DisposalScheduler, GraceExpired};

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedSession {
    pub session_id: SessionId,
    pub pid: Option<u32>,
    pub shell: String,
}

enum Message {
    Create {
        id: SessionId,
        size: TermSize,
        options: TerminalOptions,
        reply: oneshot::Sender<Result<CreatedSession, ApiError>>,
    },
    OnMessage {
        id: SessionId,
        data: Vec<u8>,
    },
    Resize {
        id: SessionId,
        size: TermSize,
    },
    ShellName {
        id: SessionId,
        reply: oneshot::Sender<String>,
    },
    ProcessId {
        id: SessionId,
        reply: oneshot::Sender<i64>,
    },
    DisposeById {
        id: SessionId,
        reply: oneshot::Sender<Result<(), ApiError>>,
    },
    SetClient {
        client_id: String,
        sink: Arc<dyn TerminalClient>,
        reply: oneshot::Sender<()>,
    },
    EnsureClientTerminal {
        client_id: String,
        session_ids: Vec<SessionId>,
        reply: oneshot::Sender<bool>,
    },
    CloseClient {
        client_id: String,
    },
    DisposeClient {
        client_id: String,
        reply: oneshot::Sender<usize>,
    },
    ListSessions {
        reply: oneshot::Sender<Vec<SessionInfo>>,
    },
    Dispose {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
    Pty {
        id: SessionId,
        generation: u64,
        event: PtyEvent,
    },
}

/// Handle to the terminal service task.
///
/// The task stops, killing every session, once all handles are dropped.
#[derive(Clone)]
pub struct TerminalService {
    tx: mpsc::UnboundedSender<Message>,
}

impl TerminalService {
    /// Start the service task on the current tokio runtime.
    pub fn spawn(config: ServiceConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (scheduler, expired_rx) = DisposalScheduler::new();
        let state = ServiceState {
            config,
            registry: SessionRegistry::new(),
            clients: ClientTable::new(),
            scheduler,
            next_generation: 0,
            events_tx: tx.downgrade(),
        };
        tokio::spawn(state.run(rx, expired_rx));
        Self { tx }
    }

    async fn call<T>(&self, message: impl FnOnce(oneshot::Sender<T>) -> Message) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(message(reply)).ok()?;
        rx.await.ok()
    }

    fn send(&self, message: Message) {
        if self.tx.send(message).is_err() {
            debug!("Terminal service stopped, dropping request");
        }
    }

    /// Spawn a PTY for `id` and register it under the client named by its prefix.
    pub async fn create(
        &self,
        id: SessionId,
        rows: u16,
        cols: u16,
        options: TerminalOptions,
    ) -> Result<CreatedSession, ApiError> {
        let size = TermSize { cols, rows };
        self.call(|reply| Message::Create {
            id,
            size,
            options,
            reply,
        })
        .await
        .unwrap_or_else(|| Err(ApiError::service_stopped()))
    }

    /// Write input to a session. Unknown ids are ignored.
    pub fn on_message(&self, id: SessionId, data: Vec<u8>) {
        self.send(Message::OnMessage { id, data });
    }

    /// Resize a session. Unknown ids are ignored.
    pub fn resize(&self, id: SessionId, rows: u16, cols: u16) {
        self.send(Message::Resize {
            id,
            size: TermSize { cols, rows },
        });
    }

    /// Shell name of a session, `""` when unknown.
    pub async fn get_shell_name(&self, id: SessionId) -> String {
        self.call(|reply| Message::ShellName { id, reply })
            .await
            .unwrap_or_default()
    }

    /// OS process id of a session, `-1` when unknown.
    pub async fn get_process_id(&self, id: SessionId) -> i64 {
        self.call(|reply| Message::ProcessId { id, reply })
            .await
            .unwrap_or(-1)
    }

    /// Kill a session and remove it from the registry.
    pub async fn dispose_by_id(&self, id: SessionId) -> Result<(), ApiError> {
        self.call(|reply| Message::DisposeById { id, reply })
            .await
            .unwrap_or_else(|| Err(ApiError::service_stopped()))
    }

    /// Make `sink` the callback sink for `client_id`.
    ///
    /// The service keeps only a weak reference; the caller owns the sink.
    pub async fn set_client(&self, client_id: String, sink: Arc<dyn TerminalClient>) {
        self.call(|reply| Message::SetClient {
            client_id,
            sink,
            reply,
        })
        .await;
    }

    /// Cancel a pending disposal of `client_id` and report whether it still
    /// has registered sessions.
    pub async fn ensure_client_terminal(
        &self,
        client_id: String,
        session_ids: Vec<SessionId>,
    ) -> bool {
        self.call(|reply| Message::EnsureClientTerminal {
            client_id,
            session_ids,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Start the grace period after which `client_id`'s sessions are killed.
    pub fn close_client(&self, client_id: String) {
        self.send(Message::CloseClient { client_id });
    }

    /// Kill every session of `client_id` now. Returns how many were removed.
    pub async fn dispose_client(&self, client_id: String) -> usize {
        self.call(|reply| Message::DisposeClient { client_id, reply })
            .await
            .unwrap_or_default()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        self.call(|reply| Message::ListSessions { reply })
            .await
            .unwrap_or_default()
    }

    /// Release every client callback sink. Returns how many were notified.
    pub async fn dispose(&self) -> usize {
        self.call(|reply| Message::Dispose { reply })
            .await
            .unwrap_or_default()
    }

    /// Release sinks, cancel timers and kill every session.
    ///
    /// Returns the number of sessions killed.
    pub async fn shutdown(&self) -> usize {
        self.call(|reply| Message::Shutdown { reply })
            .await
            .unwrap_or_default()
    }

    pub async fn is_idle(&self) -> bool {
        self.list_sessions().await.is_empty()
    }
}

struct ServiceState {
    config: ServiceConfig,
    registry: SessionRegistry,
    clients: ClientTable,
    scheduler: DisposalScheduler,
    next_generation: u64,
    /// Weak so PTY listeners do not keep the service alive.
    events_tx: mpsc::WeakUnboundedSender<Message>,
}

impl ServiceState {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Message>,
        mut expired_rx: mpsc::UnboundedReceiver<GraceExpired>,
    ) {
        debug!("Terminal service started with {:?}", self.config);
        loop {
            tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                Some(expired) = expired_rx.recv() => self.on_grace_expired(expired),
            }
        }

        self.scheduler.cancel_all();
        let killed = self.registry.dispose_all();
        debug!("Terminal service stopped, killed {} session(s)", killed);
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Create {
                id,
                size,
                options,
                reply,
            } => {
                let _ = reply.send(self.create(id, size, options));
            }
            Message::OnMessage { id, data } => self.registry.on_message(&id, &data),
            Message::Resize { id, size } => self.registry.resize(&id, size),
            Message::ShellName { id, reply } => {
                let _ = reply.send(self.registry.shell_name(&id));
            }
            Message::ProcessId { id, reply } => {
                let _ = reply.send(self.registry.process_id(&id));
            }
            Message::DisposeById { id, reply } => {
                let result = self
                    .registry
                    .dispose_by_id(&id)
                    .map_err(|e| ApiError::kill_failed(id.as_str(), &e.to_string()));
                let _ = reply.send(result);
            }
            Message::SetClient {
                client_id,
                sink,
                reply,
            } => {
                self.set_client(&client_id, &sink);
                let _ = reply.send(());
            }
            Message::EnsureClientTerminal {
                client_id,
                session_ids,
                reply,
            } => {
                let _ = reply.send(self.ensure_client_terminal(&client_id, &session_ids));
            }
            Message::CloseClient { client_id } => self.close_client(&client_id),
            Message::DisposeClient { client_id, reply } => {
                let _ = reply.send(self.registry.dispose_client(&client_id));
            }
            Message::ListSessions { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Message::Dispose { reply } => {
                let released = self.clients.dispose_all();
                info!("Released {} client callback sink(s)", released);
                let _ = reply.send(released);
            }
            Message::Shutdown { reply } => {
                self.clients.dispose_all();
                self.scheduler.cancel_all();
                let killed = self.registry.dispose_all();
                info!("Terminal service shut down, killed {} session(s)", killed);
                let _ = reply.send(killed);
            }
            Message::Pty {
                id,
                generation,
                event,
            } => {
                if self.registry.is_stale(&id, generation) {
                    debug!("Dropping event of replaced session {}", id);
                    return;
                }
                // Detached clients are logged by the forwarder.
                let _ = forwarder::forward(&self.clients, &id, &event);
                if let PtyEvent::Exit { exit_code } = event {
                    debug!("Session {} exited with {:?}", id, exit_code);
                }
            }
        }
    }

    fn create(
        &mut self,
        id: SessionId,
        size: TermSize,
        options: TerminalOptions,
    ) -> Result<CreatedSession, ApiError> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let events_tx = self.events_tx.clone();
        let event_id = id.clone();
        let listener = move |event: PtyEvent| {
            if let Some(tx) = events_tx.upgrade() {
                let _ = tx.send(Message::Pty {
                    id: event_id.clone(),
                    generation,
                    event,
                });
            }
        };

        let requested_shell = options.shell.clone().unwrap_or_default();
        let session = self
            .registry
            .create(id, generation, size, options, listener)
            .map_err(|e| {
                warn!("Failed to create session: {}", e);
                ApiError::spawn_failed(&requested_shell, &e.to_string())
            })?;

        Ok(CreatedSession {
            session_id: session.id.clone(),
            pid: session.process.pid(),
            shell: shell_name(session.process.bin()),
        })
    }

    fn set_client(&mut self, client_id: &str, sink: &Arc<dyn TerminalClient>) {
        self.clients.set_client(client_id, sink);
        if self.config.reconnect_cancels_disposal && self.scheduler.cancel(client_id) {
            info!("Client {} reconnected, pending disposal cancelled", client_id);
        }
    }

    fn ensure_client_terminal(&mut self, client_id: &str, session_ids: &[SessionId]) -> bool {
        if self.scheduler.cancel(client_id) {
            info!("Client {} reconnected, pending disposal cancelled", client_id);
        }
        let alive = self.registry.has_client(client_id);
        debug!(
            "Client {} ensured {} terminal(s), has sessions: {}",
            client_id,
            session_ids.len(),
            alive
        );
        alive
    }

    fn close_client(&mut self, client_id: &str) {
        let delay = self.config.close_threshold();
        if delay.is_zero() {
            self.scheduler.cancel(client_id);
            self.registry.dispose_client(client_id);
            return;
        }
        info!(
            "Client {} closed, disposing its {} session(s) in {}ms",
            client_id,
            self.registry.client_sessions(client_id).len(),
            delay.as_millis()
        );
        self.scheduler.arm(client_id, delay);
    }

    fn on_grace_expired(&mut self, expired: GraceExpired) {
        if self.scheduler.take_expired(&expired) {
            let disposed = self.registry.dispose_client(&expired.client_id);
            info!(
                "Grace period of client {} expired, disposed {} session(s)",
                expired.client_id, disposed
            );
        }
    }
}
