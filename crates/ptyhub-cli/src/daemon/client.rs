//! Client for connecting to the daemon process.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use ptyhub_core::protocol::{ClientEvent, Command, Request, Response, ServerMessage};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};
use uuid::Uuid;

use crate::daemon::paths;

/// Maximum time to wait for daemon to start up.
const DAEMON_STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between socket connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for communicating with the daemon.
///
/// One connection carries both responses and, once a client id is attached
/// with `set_client`, pushed terminal events. Events that arrive while a
/// request is waiting for its response are queued for [`next_event`].
///
/// [`next_event`]: DaemonClient::next_event
pub struct DaemonClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    pending_events: VecDeque<ClientEvent>,
}

impl DaemonClient {
    /// Connect to the daemon, starting it if necessary.
    pub async fn connect() -> Result<Self> {
        let socket_path = paths::get_socket_path(None);

        if let Ok(stream) = UnixStream::connect(&socket_path).await {
            debug!("Connected to existing daemon");
            return Ok(Self::from_stream(stream));
        }

        info!("Daemon not running, starting...");
        let child = Self::start_daemon()?;

        let stream = Self::wait_for_daemon(&socket_path, child).await?;
        Ok(Self::from_stream(stream))
    }

    /// Connect to a daemon on a specific socket without auto-starting one.
    pub async fn connect_to(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to {:?}", socket_path))?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            pending_events: VecDeque::new(),
        }
    }

    /// Start the daemon as a background process.
    ///
    /// Returns the child process handle so we can detect early crashes.
    fn start_daemon() -> Result<std::process::Child> {
        use std::os::unix::process::CommandExt;

        let exe = std::env::current_exe().context("Failed to get current executable path")?;

        // A new process group keeps the daemon (and its shells) alive when the
        // CLI's terminal hangs up.
        let child = std::process::Command::new(exe)
            .arg("daemon")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("Failed to spawn daemon process")?;

        Ok(child)
    }

    /// Wait for the daemon socket to become available.
    ///
    /// Fails fast if the daemon process exits before the socket shows up.
    async fn wait_for_daemon(
        socket_path: &Path,
        mut child: std::process::Child,
    ) -> Result<UnixStream> {
        let start = std::time::Instant::now();

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    bail!(
                        "Daemon exited immediately with status: {} (run 'ptyhub daemon' directly to diagnose)",
                        status
                    );
                }
                Ok(None) => {}
                Err(e) => debug!("Error checking daemon status: {}", e),
            }

            match UnixStream::connect(socket_path).await {
                Ok(stream) => {
                    info!("Connected to daemon after {:?}", start.elapsed());
                    return Ok(stream);
                }
                Err(_) => {
                    if start.elapsed() > DAEMON_STARTUP_TIMEOUT {
                        bail!("Daemon failed to start within {:?}", DAEMON_STARTUP_TIMEOUT);
                    }
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Wrap `command` in a request with a fresh id and send it.
    pub async fn send(&mut self, command: Command) -> Result<Response> {
        self.request(Request {
            id: Uuid::new_v4().to_string(),
            command,
        })
        .await
    }

    /// Send a request and wait for a response.
    pub async fn request(&mut self, request: Request) -> Result<Response> {
        self.request_with_timeout(request, REQUEST_TIMEOUT).await
    }

    /// Send a request and wait for a response with a custom timeout.
    pub async fn request_with_timeout(
        &mut self,
        request: Request,
        timeout_duration: Duration,
    ) -> Result<Response> {
        let request_json =
            serde_json::to_string(&request).context("Failed to serialize request")?;
        debug!("Sending: {}", request_json);

        self.writer
            .write_all(request_json.as_bytes())
            .await
            .context("Failed to write request")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        self.writer.flush().await.context("Failed to flush")?;

        timeout(timeout_duration, async {
            loop {
                match self.read_message().await? {
                    ServerMessage::Response { response } => {
                        if response.id != request.id {
                            debug!("Skipping response to request {}", response.id);
                            continue;
                        }
                        return Ok::<_, anyhow::Error>(response);
                    }
                    ServerMessage::Event { event } => self.pending_events.push_back(event),
                }
            }
        })
        .await
        .context("Request timed out")?
    }

    /// Wait for the next pushed terminal event.
    ///
    /// Returns `None` once the daemon closes the connection.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>> {
        if let Some(event) = self.pending_events.pop_front() {
            return Ok(Some(event));
        }
        loop {
            match self.read_message_or_eof().await? {
                None => return Ok(None),
                Some(ServerMessage::Event { event }) => return Ok(Some(event)),
                Some(ServerMessage::Response { response }) => {
                    debug!("Ignoring unsolicited response {}", response.id);
                }
            }
        }
    }

    async fn read_message(&mut self) -> Result<ServerMessage> {
        match self.read_message_or_eof().await? {
            Some(message) => Ok(message),
            None => bail!("Daemon closed connection unexpectedly"),
        }
    }

    async fn read_message_or_eof(&mut self) -> Result<Option<ServerMessage>> {
        let mut line = String::new();
        let bytes_read = self
            .reader
            .read_line(&mut line)
            .await
            .context("Failed to read from daemon")?;
        if bytes_read == 0 {
            return Ok(None);
        }
        debug!("Received: {}", line.trim());
        let message = serde_json::from_str(&line).context("Failed to parse daemon message")?;
        Ok(Some(message))
    }
}
