//! Session registry: session id to PTY process, and client to owned sessions.
//!
//! Both maps change together. Every path that removes a session removes it
//! from the global lookup and from its owner's set, and a client whose set
//! becomes empty is forgotten.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use ptyhub_core::protocol::{SessionInfo, TerminalOptions};
use ptyhub_core::session_id::SessionId;
use ptyhub_core::shell::shell_name;

use crate::daemon::pty::{KillError, PtyEvent, PtyProcess, SpawnError, TermSize};

/// A live terminal session.
pub struct Session {
    pub id: SessionId,
    /// Distinguishes this spawn from earlier sessions created under the same id.
    pub generation: u64,
    pub process: PtyProcess,
    /// Launch configuration, fixed at creation.
    pub options: TerminalOptions,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Get session info for protocol responses.
    pub fn info(&self) -> SessionInfo {
        let size = self.process.size();
        SessionInfo {
            id: self.id.to_string(),
            client_id: self.id.client_id().to_string(),
            pid: self.process.pid(),
            shell: shell_name(self.process.bin()),
            rows: size.rows,
            cols: size.cols,
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<SessionId, Session>,
    by_client: HashMap<String, HashSet<SessionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a PTY for `id` and register it under its owning client.
    ///
    /// `listener` receives the process's events. A session already registered
    /// under the same id is killed and replaced.
    pub fn create<F>(
        &mut self,
        id: SessionId,
        generation: u64,
        size: TermSize,
        options: TerminalOptions,
        listener: F,
    ) -> Result<&Session, SpawnError>
    where
        F: FnMut(PtyEvent) + Send + 'static,
    {
        let process = PtyProcess::spawn(size, &options, listener)?;

        if let Some(mut displaced) = self.remove(&id) {
            warn!("Session {} created twice, killing the previous process", id);
            if let Err(e) = displaced.process.kill() {
                warn!("Failed to kill displaced session {}: {}", id, e);
            }
        }

        info!(
            "Created session {} (pid {:?}, {}x{})",
            id,
            process.pid(),
            size.cols,
            size.rows
        );

        self.by_client
            .entry(id.client_id().to_string())
            .or_default()
            .insert(id.clone());
        let session = Session {
            id: id.clone(),
            generation,
            process,
            options,
            created_at: Utc::now(),
        };
        self.sessions.insert(id.clone(), session);
        Ok(&self.sessions[&id])
    }

    pub fn get(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Whether events from spawn `generation` of `id` belong to a session that
    /// has since been replaced. Events for unregistered ids are never stale.
    pub fn is_stale(&self, id: &SessionId, generation: u64) -> bool {
        self.sessions
            .get(id)
            .is_some_and(|session| session.generation != generation)
    }

    /// Write input to a session; unknown ids are ignored.
    pub fn on_message(&self, id: &SessionId, data: &[u8]) {
        let Some(session) = self.sessions.get(id) else {
            warn!("Session {} not found, dropping {} bytes of input", id, data.len());
            return;
        };
        if let Err(e) = session.process.write(data) {
            warn!("Failed to write to session {}: {}", id, e);
        }
    }

    /// Resize a session; unknown ids are ignored.
    pub fn resize(&mut self, id: &SessionId, size: TermSize) {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!("Session {} not found, ignoring resize", id);
            return;
        };
        match session.process.resize(size) {
            Ok(()) => debug!("Resized session {} to {}x{}", id, size.cols, size.rows),
            Err(e) => warn!("Failed to resize session {}: {:#}", id, e),
        }
    }

    /// Shell name of a session, or an empty string when it does not exist.
    pub fn shell_name(&self, id: &SessionId) -> String {
        self.sessions
            .get(id)
            .map(|s| shell_name(s.process.bin()))
            .unwrap_or_default()
    }

    /// OS process id of a session, or `-1` when it does not exist.
    pub fn process_id(&self, id: &SessionId) -> i64 {
        self.sessions
            .get(id)
            .and_then(|s| s.process.pid())
            .map_or(-1, i64::from)
    }

    /// Kill one session and forget it. Unknown ids are a no-op.
    pub fn dispose_by_id(&mut self, id: &SessionId) -> Result<(), KillError> {
        match self.remove(id) {
            Some(mut session) => {
                info!("Disposing session {}", id);
                session.process.kill()
            }
            None => {
                debug!("Session {} not found, nothing to dispose", id);
                Ok(())
            }
        }
    }

    /// Kill every session owned by `client_id` and forget the client.
    ///
    /// Kill failures are logged; the remaining sessions are still torn down.
    /// Returns the number of sessions removed.
    pub fn dispose_client(&mut self, client_id: &str) -> usize {
        let Some(ids) = self.by_client.remove(client_id) else {
            return 0;
        };
        let mut disposed = 0;
        for id in ids {
            if let Some(mut session) = self.sessions.remove(&id) {
                if let Err(e) = session.process.kill() {
                    warn!("Failed to kill session {}: {}", id, e);
                }
                disposed += 1;
            }
        }
        info!("Disposed {} session(s) of client {}", disposed, client_id);
        disposed
    }

    /// Kill every session.
    pub fn dispose_all(&mut self) -> usize {
        let clients: Vec<String> = self.by_client.keys().cloned().collect();
        clients
            .iter()
            .map(|client_id| self.dispose_client(client_id))
            .sum()
    }

    /// Whether `client_id` owns at least one registered session.
    pub fn has_client(&self, client_id: &str) -> bool {
        self.by_client.contains_key(client_id)
    }

    /// Session ids owned by `client_id`, sorted.
    pub fn client_sessions(&self, client_id: &str) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .by_client
            .get(client_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// List all registered sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<&Session> = self.sessions.values().collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        sessions.into_iter().map(Session::info).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove a session from both maps without killing it.
    fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        let client_id = id.client_id();
        if let Some(ids) = self.by_client.get_mut(client_id) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_client.remove(client_id);
            }
        }
        Some(session)
    }
}
