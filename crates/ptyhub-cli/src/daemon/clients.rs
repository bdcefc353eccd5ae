//! Client connection table: client id to its callback sink.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::debug;

use ptyhub_core::session_id::SessionId;

/// The push side of a connected client.
///
/// Implementations must not block: they are called from the service task.
pub trait TerminalClient: Send + Sync {
    /// Deliver process output for `session_id`.
    fn client_message(&self, session_id: &SessionId, data: &[u8]);

    /// Tell the client the process behind `session_id` exited.
    fn close_client(&self, session_id: &SessionId);

    /// The daemon is releasing this sink.
    fn dispose(&self);
}

/// Sinks are held weakly: a dropped connection reads as a detached client.
#[derive(Default)]
pub struct ClientTable {
    sinks: HashMap<String, Weak<dyn TerminalClient>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or overwrite the sink for `client_id`.
    ///
    /// Entries whose sink has been dropped are pruned here.
    pub fn set_client(&mut self, client_id: &str, sink: &Arc<dyn TerminalClient>) {
        self.sinks.retain(|_, existing| existing.strong_count() > 0);
        if self
            .sinks
            .insert(client_id.to_string(), Arc::downgrade(sink))
            .is_some()
        {
            debug!("Replaced callback sink of client {}", client_id);
        } else {
            debug!("Registered callback sink of client {}", client_id);
        }
    }

    /// The live sink for `client_id`, if the client is attached.
    pub fn sink(&self, client_id: &str) -> Option<Arc<dyn TerminalClient>> {
        self.sinks.get(client_id).and_then(Weak::upgrade)
    }

    /// Notify and forget every registered sink.
    pub fn dispose_all(&mut self) -> usize {
        let mut released = 0;
        for (client_id, sink) in self.sinks.drain() {
            if let Some(sink) = sink.upgrade() {
                sink.dispose();
                released += 1;
            } else {
                debug!("Sink of client {} already gone", client_id);
            }
        }
        released
    }
}
