//! Routes PTY events to the owning client's callback sink.
//!
//! The sink is looked up when the event is forwarded, not when the session was
//! created, so output follows a client across reconnects. Events for detached
//! clients are dropped; nothing is buffered or replayed.

use thiserror::Error;
use tracing::warn;

use ptyhub_core::session_id::SessionId;

use crate::daemon::clients::ClientTable;
use crate::daemon::pty::PtyEvent;

/// No sink is registered (or alive) for the session's client.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("client '{client_id}' is detached")]
pub struct DetachedClient {
    pub client_id: String,
}

/// Push `event` for `session_id` to its client.
pub fn forward(
    clients: &ClientTable,
    session_id: &SessionId,
    event: &PtyEvent,
) -> Result<(), DetachedClient> {
    let client_id = session_id.client_id();
    let Some(sink) = clients.sink(client_id) else {
        let kind = match event {
            PtyEvent::Data(_) => "data",
            PtyEvent::Exit { .. } => "exit",
        };
        warn!(
            "Dropping {} event of session {}: client {} is detached",
            kind, session_id, client_id
        );
        return Err(DetachedClient {
            client_id: client_id.to_string(),
        });
    };

    match event {
        PtyEvent::Data(data) => sink.client_message(session_id, data),
        PtyEvent::Exit { .. } => sink.close_client(session_id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::daemon::clients::testing::RecordingClient;
    use crate::daemon::clients::TerminalClient;
    use ptyhub_core::protocol::ClientEvent;

    #[test]
    fn test_data_reaches_owning_client() {
        let mut clients = ClientTable::new();
        let c1 = RecordingClient::new();
        let c2 = RecordingClient::new();
        let c1_dyn: Arc<dyn TerminalClient> = c1.clone();
        let c2_dyn: Arc<dyn TerminalClient> = c2.clone();
        clients.set_client("c1", &c1_dyn);
        clients.set_client("c2", &c2_dyn);

        let id = SessionId::from("c1|t1");
        forward(&clients, &id, &PtyEvent::Data(b"hi".to_vec())).expect("delivered");

        assert_eq!(c1.output("c1|t1"), "hi");
        assert!(c2.events().is_empty());
    }

    #[test]
    fn test_exit_becomes_close_notification() {
        let mut clients = ClientTable::new();
        let c1 = RecordingClient::new();
        let c1_dyn: Arc<dyn TerminalClient> = c1.clone();
        clients.set_client("c1", &c1_dyn);

        let id = SessionId::from("c1|t1");
        forward(&clients, &id, &PtyEvent::Exit { exit_code: Some(0) }).expect("delivered");

        assert_eq!(
            c1.events(),
            vec![ClientEvent::CloseClient {
                session_id: "c1|t1".to_string()
            }]
        );
    }

    // The warning is logged alongside this `Err`; the return value is what
    // callers and tests observe.
    #[test]
    fn test_never_registered_client_drops_event() {
        let clients = ClientTable::new();
        let result = forward(
            &clients,
            &SessionId::from("c1|t1"),
            &PtyEvent::Data(b"lost".to_vec()),
        );
        assert_eq!(
            result,
            Err(DetachedClient {
                client_id: "c1".to_string()
            })
        );
    }

    #[test]
    fn test_dropped_sink_drops_event() {
        let mut clients = ClientTable::new();
        let c1: Arc<dyn TerminalClient> = RecordingClient::new();
        clients.set_client("c1", &c1);
        drop(c1);

        let result = forward(
            &clients,
            &SessionId::from("c1|t1"),
            &PtyEvent::Exit { exit_code: None },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_sink_resolved_at_emission_time() {
        let mut clients = ClientTable::new();
        let old = RecordingClient::new();
        let old_dyn: Arc<dyn TerminalClient> = old.clone();
        clients.set_client("c1", &old_dyn);

        let id = SessionId::from("c1|t1");
        forward(&clients, &id, &PtyEvent::Data(b"a".to_vec())).expect("delivered");

        // Client reconnects with a new sink.
        let new = RecordingClient::new();
        let new_dyn: Arc<dyn TerminalClient> = new.clone();
        clients.set_client("c1", &new_dyn);
        forward(&clients, &id, &PtyEvent::Data(b"b".to_vec())).expect("delivered");

        assert_eq!(old.output("c1|t1"), "a");
        assert_eq!(new.output("c1|t1"), "b");
    }
}
