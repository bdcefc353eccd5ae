//! Unix socket server for the daemon process.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use ptyhub_core::error::ApiError;
use ptyhub_core::protocol::{
    ClientEvent, Command, Request, Response, ResponseData, ServerMessage,
};
use ptyhub_core::session_id::{is_valid_client_id, SessionId};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::daemon::clients::TerminalClient;
use crate::daemon::config::ServiceConfig;
use crate::daemon::paths;
use crate::daemon::service::TerminalService;

/// Maximum number of concurrent client connections to prevent resource exhaustion.
const MAX_CONNECTIONS: usize = 100;

/// How long the daemon waits with no sessions before auto-shutdown (5 minutes).
const IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How often to check for idle shutdown condition.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for in-flight connections to complete during shutdown.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Messages queued for one connection before pushed events are dropped.
/// Output chunks are at most 4 KiB, so this caps a stalled reader at a few MiB.
const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// The daemon server that listens for client connections.
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_path: PathBuf,
    service: TerminalService,
    /// Semaphore to limit concurrent connections and prevent resource exhaustion.
    connection_semaphore: Arc<Semaphore>,
    /// Shutdown signal for graceful termination (allows Drop to run and clean up files).
    shutdown: Arc<Notify>,
}

impl DaemonServer {
    /// Create a new daemon server bound to the default socket path.
    pub async fn bind(config: ServiceConfig) -> Result<Self> {
        let socket_path = paths::get_socket_path(None);
        let pid_path = paths::get_pid_path(None);
        Self::bind_to(socket_path, pid_path, config).await
    }

    /// Create a new daemon server bound to a specific socket path.
    ///
    /// Binds first and only then inspects a conflicting socket:
    /// 1. Try to bind directly
    /// 2. If socket in use, check PID file to see if daemon is alive
    /// 3. If daemon dead, remove stale socket and retry
    /// 4. If daemon alive, return error
    pub async fn bind_to(
        socket_path: PathBuf,
        pid_path: PathBuf,
        config: ServiceConfig,
    ) -> Result<Self> {
        paths::ensure_socket_dir().context("Failed to create socket directory")?;

        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory for {:?}", socket_path)
            })?;
        }

        // The PID file must exist as soon as the socket does, or a concurrent
        // start would treat us as dead.
        let write_pid = |pid_path: &PathBuf| -> Result<()> {
            std::fs::write(pid_path, std::process::id().to_string())
                .with_context(|| format!("Failed to write PID file: {:?}", pid_path))
        };

        let listener = match UnixListener::bind(&socket_path) {
            Ok(l) => {
                write_pid(&pid_path)?;
                l
            }
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                if is_daemon_alive(&pid_path) {
                    anyhow::bail!(
                        "Daemon already running (socket {:?} in use, PID file valid)",
                        socket_path
                    );
                }
                remove_stale_socket(&socket_path)?;

                let l = UnixListener::bind(&socket_path)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path))?;
                write_pid(&pid_path)?;
                l
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to bind to socket: {:?}", socket_path));
            }
        };

        info!("Daemon listening on {:?}", socket_path);

        Ok(Self {
            listener,
            socket_path,
            pid_path,
            service: TerminalService::spawn(config),
            connection_semaphore: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Run the server, accepting connections and handling requests.
    ///
    /// Also starts the idle monitor, which signals shutdown after
    /// [`IDLE_TIMEOUT`] with no sessions and no connections.
    ///
    /// On shutdown, waits for in-flight connections to complete (with timeout).
    /// Returns when shutdown is signaled, allowing Drop to clean up socket/PID files.
    pub async fn run(&self) -> Result<()> {
        self.spawn_idle_shutdown_task();

        let mut connection_tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let permit = match self.connection_semaphore.clone().try_acquire_owned() {
                                Ok(permit) => permit,
                                Err(_) => {
                                    warn!(
                                        "Connection limit ({}) reached, rejecting new connection",
                                        MAX_CONNECTIONS
                                    );
                                    drop(stream);
                                    continue;
                                }
                            };

                            debug!("Accepted new connection");
                            let service = self.service.clone();
                            let shutdown = self.shutdown.clone();
                            connection_tasks.spawn(async move {
                                // Held for the lifetime of the connection
                                let _permit = permit;
                                if let Err(e) = handle_connection(stream, service, shutdown).await {
                                    error!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connection_tasks.join_next(), if !connection_tasks.is_empty() => {}
                _ = self.shutdown.notified() => {
                    info!("Shutdown signal received, waiting for in-flight connections");
                    break;
                }
            }
        }

        if !connection_tasks.is_empty() {
            info!(
                "Waiting for {} in-flight connection(s) to complete",
                connection_tasks.len()
            );

            let drained = tokio::time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, async {
                while connection_tasks.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    "Graceful shutdown timed out after {:?}, aborting {} connection(s)",
                    GRACEFUL_SHUTDOWN_TIMEOUT,
                    connection_tasks.len()
                );
                connection_tasks.abort_all();
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Release client sinks and kill every session.
    pub async fn stop(&self) {
        let killed = self.service.shutdown().await;
        info!("Daemon stopped, killed {} session(s)", killed);
    }

    /// Spawn a background task that monitors for idle shutdown.
    ///
    /// The daemon exits after [`IDLE_TIMEOUT`] with no sessions AND no client
    /// connections, so a connected client that has not created a session yet
    /// keeps it alive.
    fn spawn_idle_shutdown_task(&self) {
        let service = self.service.clone();
        let shutdown = self.shutdown.clone();
        let semaphore = self.connection_semaphore.clone();

        tokio::spawn(async move {
            let mut idle_since: Option<Instant> = None;

            loop {
                tokio::time::sleep(IDLE_CHECK_INTERVAL).await;

                let has_sessions = !service.is_idle().await;
                let has_connections = semaphore.available_permits() < MAX_CONNECTIONS;

                if has_sessions || has_connections {
                    if idle_since.is_some() {
                        debug!("Activity detected, resetting idle timer");
                    }
                    idle_since = None;
                    continue;
                }

                let idle_start = *idle_since.get_or_insert_with(Instant::now);

                if idle_start.elapsed() >= IDLE_TIMEOUT {
                    info!(
                        "No activity for {} seconds, shutting down",
                        IDLE_TIMEOUT.as_secs()
                    );
                    service.shutdown().await;
                    shutdown.notify_waiters();
                    break;
                }

                debug!(
                    "Idle for {} seconds (shutdown in {} seconds)",
                    idle_start.elapsed().as_secs(),
                    IDLE_TIMEOUT.saturating_sub(idle_start.elapsed()).as_secs()
                );
            }
        });
    }
}

impl Drop for DaemonServer {
    fn drop(&mut self) {
        if self.socket_path.exists() && std::fs::remove_file(&self.socket_path).is_err() {
            warn!("Failed to remove socket on shutdown");
        }
        if self.pid_path.exists() && std::fs::remove_file(&self.pid_path).is_err() {
            warn!("Failed to remove PID file on shutdown");
        }
    }
}

/// Remove a socket left behind by a dead daemon.
///
/// Refuses symlinks and anything that is not a socket.
fn remove_stale_socket(socket_path: &Path) -> Result<()> {
    let metadata = std::fs::symlink_metadata(socket_path)
        .with_context(|| format!("Failed to stat socket path: {:?}", socket_path))?;

    if metadata.file_type().is_symlink() {
        anyhow::bail!(
            "Socket path {:?} is a symlink, refusing to delete it",
            socket_path
        );
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            anyhow::bail!(
                "Path {:?} exists but is not a socket file (type: {:?})",
                socket_path,
                metadata.file_type()
            );
        }
    }

    info!("Removing stale socket from dead daemon");
    std::fs::remove_file(socket_path)
        .with_context(|| format!("Failed to remove stale socket: {:?}", socket_path))
}

/// Check if a daemon process is still alive by reading its PID file.
fn is_daemon_alive(pid_path: &Path) -> bool {
    let pid: i32 = match std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
    {
        Some(p) => p,
        None => return false,
    };

    // SAFETY: signal 0 delivers nothing; it only checks that the process exists.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Maximum request size in bytes. Input payloads are base64, so this bounds
/// a single `on_message` to roughly 768 KiB of raw bytes.
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Read a line with a maximum size limit to prevent memory DoS.
///
/// Returns the number of bytes read (0 means EOF).
/// Returns an error if the line exceeds max_size before finding a newline.
async fn read_line_bounded<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut String,
    max_size: usize,
) -> Result<usize> {
    use tokio::io::AsyncBufReadExt;

    let mut total = 0;
    let mut bytes = Vec::new();

    loop {
        let available = reader
            .fill_buf()
            .await
            .context("Failed to read from client")?;

        if available.is_empty() {
            // EOF
            if !bytes.is_empty() {
                let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
                buf.push_str(line);
            }
            return Ok(total);
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let bytes_to_consume = newline_pos.map(|p| p + 1).unwrap_or(available.len());

        if total + bytes_to_consume > max_size {
            anyhow::bail!("Request too large: exceeded {} byte limit", max_size);
        }

        // UTF-8 is validated once the whole line is in
        bytes.extend_from_slice(&available[..bytes_to_consume]);
        total += bytes_to_consume;

        reader.consume(bytes_to_consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let line = std::str::from_utf8(&bytes).context("Invalid UTF-8 in request")?;
    buf.push_str(line);
    Ok(total)
}

/// Callback sink backed by one socket connection.
///
/// Events are queued on the connection's outbound channel, which also carries
/// responses, so a client sees them in the order the service produced them.
/// The queue is bounded: when a client stops reading, further events are
/// dropped rather than buffered.
struct ConnectionSink {
    outbound: mpsc::Sender<ServerMessage>,
    /// Set while events are being dropped, so each stall is logged once.
    lagging: AtomicBool,
}

impl ConnectionSink {
    fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            outbound,
            lagging: AtomicBool::new(false),
        }
    }

    fn push(&self, event: ClientEvent) {
        match self.outbound.try_send(ServerMessage::Event { event }) {
            Ok(()) => {
                if self.lagging.swap(false, Ordering::Relaxed) {
                    info!("Connection caught up, delivering events again");
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.lagging.swap(true, Ordering::Relaxed) {
                    warn!(
                        "Connection is not reading, dropping events until its queue of {} drains",
                        OUTBOUND_QUEUE_CAPACITY
                    );
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Connection writer gone, dropping event");
            }
        }
    }
}

impl TerminalClient for ConnectionSink {
    fn client_message(&self, session_id: &SessionId, data: &[u8]) {
        self.push(ClientEvent::ClientMessage {
            session_id: session_id.to_string(),
            data: data.to_vec(),
        });
    }

    fn close_client(&self, session_id: &SessionId) {
        self.push(ClientEvent::CloseClient {
            session_id: session_id.to_string(),
        });
    }

    fn dispose(&self) {
        self.push(ClientEvent::Dispose);
    }
}

/// Per-connection state shared by the request handlers.
struct Connection {
    service: TerminalService,
    shutdown: Arc<Notify>,
    sink: Arc<ConnectionSink>,
    /// Client ids this connection registered with `set_client`.
    attached: BTreeSet<String>,
}

/// Drain `rx` onto the socket, one JSON document per line.
async fn write_messages<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::Receiver<ServerMessage>,
) -> Result<()> {
    while let Some(message) = rx.recv().await {
        let json = serde_json::to_string(&message).context("Failed to serialize message")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write message")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline")?;
        writer.flush().await.context("Failed to flush")?;
    }
    Ok(())
}

/// Handle a single client connection.
///
/// When the connection ends, every client id it attached is closed, which
/// starts that client's grace period.
async fn handle_connection(
    stream: UnixStream,
    service: TerminalService,
    shutdown: Arc<Notify>,
) -> Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let writer_task = tokio::spawn(write_messages(writer, outbound_rx));

    let mut conn = Connection {
        service,
        shutdown,
        sink: Arc::new(ConnectionSink::new(outbound.clone())),
        attached: BTreeSet::new(),
    };

    let read_result = read_requests(&mut reader, &mut conn, &outbound).await;

    for client_id in std::mem::take(&mut conn.attached) {
        debug!("Connection of client {} closed", client_id);
        conn.service.close_client(client_id);
    }

    // Closing the channel lets the writer flush what is queued and stop.
    drop(conn);
    drop(outbound);
    match writer_task.await {
        Ok(Err(e)) => debug!("Writer stopped: {}", e),
        Err(e) => warn!("Writer task failed: {}", e),
        Ok(Ok(())) => {}
    }

    read_result
}

async fn read_requests<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
    conn: &mut Connection,
    outbound: &mpsc::Sender<ServerMessage>,
) -> Result<()> {
    let mut line = String::new();

    loop {
        line.clear();

        let bytes_read = read_line_bounded(reader, &mut line, MAX_REQUEST_SIZE).await?;
        if bytes_read == 0 {
            debug!("Client disconnected");
            return Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        debug!("Received: {} bytes", trimmed.len());

        let response = match serde_json::from_str::<Request>(trimmed) {
            Ok(request) => handle_request(request, conn).await,
            Err(e) => Response::error(
                "unknown",
                ApiError::invalid_input_with_suggestion(
                    format!("Invalid JSON request: {}", e),
                    "Ensure the request is valid JSON with 'id' and 'command' fields. Example: {\"id\":\"1\",\"command\":{\"action\":\"list_sessions\"}}",
                ),
            ),
        };

        // Responses wait for room; only pushed events are dropped.
        if outbound
            .send(ServerMessage::Response { response })
            .await
            .is_err()
        {
            anyhow::bail!("Connection writer stopped");
        }
    }
}

/// Handle a single request and return a response.
async fn handle_request(request: Request, conn: &mut Connection) -> Response {
    debug!("Handling command: {:?}", request.command);
    let id = request.id.as_str();

    match request.command {
        Command::Create {
            session_id,
            rows,
            cols,
            options,
        } => {
            if let Err(e) = validate_session_id(&session_id).and(validate_size(rows, cols)) {
                return Response::error(id, e);
            }
            match conn
                .service
                .create(SessionId::from(session_id), rows, cols, options)
                .await
            {
                Ok(created) => Response::success(
                    id,
                    ResponseData::SessionCreated {
                        session_id: created.session_id.to_string(),
                        pid: created.pid,
                        shell: created.shell,
                    },
                ),
                Err(e) => Response::error(id, e),
            }
        }

        Command::OnMessage { session_id, data } => {
            let len = data.len();
            conn.service.on_message(SessionId::from(session_id), data);
            Response::ok(id, format!("Queued {} byte(s)", len))
        }

        Command::Resize {
            session_id,
            rows,
            cols,
        } => {
            if let Err(e) = validate_size(rows, cols) {
                return Response::error(id, e);
            }
            conn.service.resize(SessionId::from(session_id), rows, cols);
            Response::ok(id, format!("Resized to {}x{}", cols, rows))
        }

        Command::GetShellName { session_id } => {
            let name = conn
                .service
                .get_shell_name(SessionId::from(session_id))
                .await;
            Response::success(id, ResponseData::ShellName { name })
        }

        Command::GetProcessId { session_id } => {
            let pid = conn
                .service
                .get_process_id(SessionId::from(session_id))
                .await;
            Response::success(id, ResponseData::ProcessId { pid })
        }

        Command::DisposeById { session_id } => {
            match conn
                .service
                .dispose_by_id(SessionId::from(session_id.clone()))
                .await
            {
                Ok(()) => Response::ok(id, format!("Session {} disposed", session_id)),
                Err(e) => Response::error(id, e),
            }
        }

        Command::SetClient { client_id } => {
            if !is_valid_client_id(&client_id) {
                return Response::error(id, ApiError::invalid_client_id(&client_id));
            }
            let sink: Arc<dyn TerminalClient> = conn.sink.clone();
            conn.service.set_client(client_id.clone(), sink).await;
            conn.attached.insert(client_id.clone());
            Response::ok(id, format!("Client {} attached", client_id))
        }

        Command::EnsureClientTerminal {
            client_id,
            session_ids,
        } => {
            if !is_valid_client_id(&client_id) {
                return Response::error(id, ApiError::invalid_client_id(&client_id));
            }
            let session_ids = session_ids.into_iter().map(SessionId::from).collect();
            let alive = conn
                .service
                .ensure_client_terminal(client_id, session_ids)
                .await;
            Response::success(id, ResponseData::ClientTerminal { alive })
        }

        Command::CloseClient { client_id } => {
            if !is_valid_client_id(&client_id) {
                return Response::error(id, ApiError::invalid_client_id(&client_id));
            }
            // Explicitly closed; do not close it again on disconnect.
            conn.attached.remove(&client_id);
            conn.service.close_client(client_id.clone());
            Response::ok(id, format!("Client {} closed", client_id))
        }

        Command::DisposeClient { client_id } => {
            if !is_valid_client_id(&client_id) {
                return Response::error(id, ApiError::invalid_client_id(&client_id));
            }
            let count = conn.service.dispose_client(client_id).await;
            Response::success(id, ResponseData::Disposed { count })
        }

        Command::ListSessions => {
            let sessions = conn.service.list_sessions().await;
            Response::success(id, ResponseData::Sessions { sessions })
        }

        Command::Dispose => {
            let count = conn.service.dispose().await;
            Response::success(id, ResponseData::Disposed { count })
        }

        Command::Shutdown => handle_shutdown(id, conn),
    }
}

fn validate_session_id(session_id: &str) -> Result<(), ApiError> {
    if session_id.is_empty() {
        return Err(ApiError::invalid_input("Session id must not be empty"));
    }
    let client_id = SessionId::from(session_id).client_id().to_string();
    if client_id.is_empty() {
        return Err(ApiError::invalid_input_with_suggestion(
            format!("Session id '{}' has an empty client prefix", session_id),
            "Session ids look like '<client id>|<terminal id>'",
        ));
    }
    Ok(())
}

fn validate_size(rows: u16, cols: u16) -> Result<(), ApiError> {
    if rows == 0 || cols == 0 {
        return Err(ApiError::invalid_input_with_suggestion(
            format!("Invalid terminal size {}x{}", cols, rows),
            "Rows and cols must both be at least 1",
        ));
    }
    Ok(())
}

/// Handle shutdown command - gracefully stop the daemon.
///
/// Kills all sessions and signals the main run loop to exit.
/// The DaemonServer's Drop impl cleans up the socket and PID files.
fn handle_shutdown(request_id: &str, conn: &Connection) -> Response {
    info!("Received shutdown command, stopping daemon");

    let service = conn.service.clone();
    let shutdown = conn.shutdown.clone();
    tokio::spawn(async move {
        service.shutdown().await;

        // Let the response flush before the run loop exits
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_waiters();
    });

    Response::ok(request_id, "Daemon shutting down")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptyhub_core::error::ErrorCode;
    use ptyhub_core::protocol::TerminalOptions;
    use std::collections::VecDeque;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::UnixStream;
    use tokio::time::timeout;
    use uuid::Uuid;

    struct TestServer {
        socket_path: PathBuf,
        pid_path: PathBuf,
        handle: tokio::task::JoinHandle<()>,
    }

    impl TestServer {
        async fn start(config: ServiceConfig) -> Self {
            let short_id = Uuid::new_v4().simple().to_string();
            let socket_path =
                PathBuf::from("/tmp").join(format!("ptyhub-test-{}.sock", &short_id[..8]));
            let pid_path = socket_path.with_extension("pid");

            let server = DaemonServer::bind_to(socket_path.clone(), pid_path.clone(), config)
                .await
                .expect("Failed to bind server");
            let handle = tokio::spawn(async move {
                let _ = timeout(Duration::from_secs(10), server.run()).await;
            });
            tokio::time::sleep(Duration::from_millis(50)).await;

            Self {
                socket_path,
                pid_path,
                handle,
            }
        }

        async fn connect(&self) -> TestConn {
            let stream = UnixStream::connect(&self.socket_path)
                .await
                .expect("Failed to connect");
            let (reader, writer) = stream.into_split();
            TestConn {
                reader: BufReader::new(reader),
                writer,
                events: VecDeque::new(),
                next_id: 0,
            }
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.handle.abort();
            let _ = std::fs::remove_file(&self.socket_path);
            let _ = std::fs::remove_file(&self.pid_path);
        }
    }

    struct TestConn {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        events: VecDeque<ClientEvent>,
        next_id: u32,
    }

    impl TestConn {
        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.expect("write");
            self.writer.write_all(b"\n").await.expect("newline");
            self.writer.flush().await.expect("flush");
        }

        async fn read_message(&mut self) -> ServerMessage {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(2), self.reader.read_line(&mut line))
                .await
                .expect("timeout")
                .expect("read");
            assert!(n > 0, "connection closed");
            serde_json::from_str(&line).expect("parse message")
        }

        async fn read_response(&mut self) -> Response {
            loop {
                match self.read_message().await {
                    ServerMessage::Response { response } => return response,
                    ServerMessage::Event { event } => self.events.push_back(event),
                }
            }
        }

        async fn request(&mut self, command: Command) -> Response {
            self.next_id += 1;
            let request = Request {
                id: format!("req-{}", self.next_id),
                command,
            };
            self.send_raw(&serde_json::to_string(&request).unwrap()).await;
            let response = self.read_response().await;
            assert_eq!(response.id, request.id);
            response
        }

        async fn next_event(&mut self) -> ClientEvent {
            if let Some(event) = self.events.pop_front() {
                return event;
            }
            loop {
                if let ServerMessage::Event { event } = self.read_message().await {
                    return event;
                }
            }
        }

        /// Collect output for `session_id` until it contains `needle`.
        async fn wait_for_output(&mut self, session_id: &str, needle: &str) -> String {
            let mut output = Vec::new();
            loop {
                if let ClientEvent::ClientMessage {
                    session_id: id,
                    data,
                } = self.next_event().await
                {
                    if id == session_id {
                        output.extend(data);
                    }
                }
                let text = String::from_utf8_lossy(&output).into_owned();
                if text.contains(needle) {
                    return text;
                }
            }
        }
    }

    fn create(session_id: &str, shell: &str) -> Command {
        Command::Create {
            session_id: session_id.to_string(),
            rows: 24,
            cols: 80,
            options: TerminalOptions {
                shell: Some(shell.to_string()),
                ..Default::default()
            },
        }
    }

    fn pid_of(response: &Response) -> i64 {
        match response.data {
            Some(ResponseData::ProcessId { pid }) => pid,
            ref other => panic!("Expected process id, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stalled_connection_queue_stays_bounded() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ConnectionSink::new(tx);
        let id = SessionId::from("c1|t1");

        for _ in 0..100 {
            sink.client_message(&id, b"y\n");
        }
        assert!(sink.lagging.load(Ordering::Relaxed));

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 4);

        // Once drained, delivery resumes.
        sink.close_client(&id);
        assert!(!sink.lagging.load(Ordering::Relaxed));
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::Event {
                event: ClientEvent::CloseClient { .. }
            })
        ));
    }

    #[tokio::test]
    async fn test_daemon_accepts_and_responds() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        let response = conn.request(Command::ListSessions).await;
        assert!(response.success);
        assert_eq!(
            response.data,
            Some(ResponseData::Sessions { sessions: vec![] })
        );
    }

    #[tokio::test]
    async fn test_invalid_json_is_invalid_input() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        conn.send_raw("{not json").await;
        let response = conn.read_response().await;
        assert!(!response.success);
        assert_eq!(response.id, "unknown");
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_read_line_bounded_handles_utf8_chunks() {
        let data = "hello 你好\n".as_bytes().to_vec();
        let cursor = std::io::Cursor::new(data);
        let mut reader = BufReader::with_capacity(1, cursor);
        let mut buf = String::new();

        let bytes = read_line_bounded(&mut reader, &mut buf, 1024)
            .await
            .expect("read line");

        assert!(bytes > 0);
        assert_eq!(buf, "hello 你好\n");
    }

    #[tokio::test]
    async fn test_read_line_bounded_rejects_oversized_line() {
        let data = vec![b'a'; 64];
        let mut reader = BufReader::new(std::io::Cursor::new(data));
        let mut buf = String::new();

        let err = read_line_bounded(&mut reader, &mut buf, 16)
            .await
            .expect_err("line over limit");
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_bind_to_creates_socket_parent_dir() {
        let short_id = Uuid::new_v4().simple().to_string();
        let base_dir =
            std::path::PathBuf::from("/tmp").join(format!("ptyhub-custom-{}", &short_id[..8]));
        let socket_dir = base_dir.join("nested");
        let socket_path = socket_dir.join("ptyhub.sock");
        let pid_path = socket_path.with_extension("pid");

        let _ = std::fs::remove_dir_all(&base_dir);

        let server =
            DaemonServer::bind_to(socket_path.clone(), pid_path.clone(), ServiceConfig::default())
                .await
                .expect("Failed to bind server");

        assert!(socket_dir.exists());
        assert!(pid_path.exists());

        drop(server);
        assert!(!socket_path.exists());
        assert!(!pid_path.exists());
        let _ = std::fs::remove_dir_all(&base_dir);
    }

    #[tokio::test]
    async fn test_create_rejects_zero_size() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        let response = conn
            .request(Command::Create {
                session_id: "c1|t1".to_string(),
                rows: 0,
                cols: 80,
                options: TerminalOptions::default(),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_set_client_rejects_delimiter() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        let response = conn
            .request(Command::SetClient {
                client_id: "a|b".to_string(),
            })
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::InvalidInput);
    }

    #[tokio::test]
    async fn test_output_is_pushed_to_attached_connection() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        let response = conn
            .request(Command::SetClient {
                client_id: "c1".to_string(),
            })
            .await;
        assert!(response.success);

        let response = conn.request(create("c1|t1", "cat")).await;
        match response.data {
            Some(ResponseData::SessionCreated {
                session_id, shell, ..
            }) => {
                assert_eq!(session_id, "c1|t1");
                assert_eq!(shell, "cat");
            }
            other => panic!("Expected session_created, got {:?}", other),
        }

        let response = conn
            .request(Command::OnMessage {
                session_id: "c1|t1".to_string(),
                data: b"hello pty\n".to_vec(),
            })
            .await;
        assert!(response.success);

        let output = timeout(
            Duration::from_secs(5),
            conn.wait_for_output("c1|t1", "hello pty"),
        )
        .await
        .expect("output in time");
        assert!(output.contains("hello pty"));

        let response = conn
            .request(Command::GetShellName {
                session_id: "c1|t1".to_string(),
            })
            .await;
        assert_eq!(
            response.data,
            Some(ResponseData::ShellName {
                name: "cat".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        let response = conn
            .request(create("c1|t1", "/definitely/not/a/shell"))
            .await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().code, ErrorCode::SpawnFailed);
    }

    #[tokio::test]
    async fn test_disconnect_closes_attached_clients() {
        let server = TestServer::start(ServiceConfig {
            development: true,
            ..Default::default()
        })
        .await;

        let mut first = server.connect().await;
        first
            .request(Command::SetClient {
                client_id: "c1".to_string(),
            })
            .await;
        first.request(create("c1|t1", "cat")).await;
        drop(first);

        let mut second = server.connect().await;
        let mut alive = true;
        for _ in 0..50 {
            let response = second
                .request(Command::EnsureClientTerminal {
                    client_id: "c1".to_string(),
                    session_ids: vec!["c1|t1".to_string()],
                })
                .await;
            alive = response.data == Some(ResponseData::ClientTerminal { alive: true });
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "client sessions should be disposed on disconnect");

        let response = second
            .request(Command::GetProcessId {
                session_id: "c1|t1".to_string(),
            })
            .await;
        assert_eq!(pid_of(&response), -1);
    }

    #[tokio::test]
    async fn test_reconnect_keeps_sessions_within_grace_period() {
        let server = TestServer::start(ServiceConfig::default()).await;

        let mut first = server.connect().await;
        first
            .request(Command::SetClient {
                client_id: "c1".to_string(),
            })
            .await;
        first.request(create("c1|t1", "cat")).await;
        drop(first);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut second = server.connect().await;
        second
            .request(Command::SetClient {
                client_id: "c1".to_string(),
            })
            .await;
        let response = second
            .request(Command::EnsureClientTerminal {
                client_id: "c1".to_string(),
                session_ids: vec!["c1|t1".to_string()],
            })
            .await;
        assert_eq!(
            response.data,
            Some(ResponseData::ClientTerminal { alive: true })
        );

        second
            .request(Command::OnMessage {
                session_id: "c1|t1".to_string(),
                data: b"back again\n".to_vec(),
            })
            .await;
        timeout(
            Duration::from_secs(5),
            second.wait_for_output("c1|t1", "back again"),
        )
        .await
        .expect("output reaches the new connection");
    }

    #[tokio::test]
    async fn test_dispose_client_and_dispose_by_id() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        conn.request(create("c1|t1", "cat")).await;
        conn.request(create("c1|t2", "cat")).await;
        conn.request(create("c2|t1", "cat")).await;

        let response = conn
            .request(Command::DisposeClient {
                client_id: "c1".to_string(),
            })
            .await;
        assert_eq!(response.data, Some(ResponseData::Disposed { count: 2 }));

        let response = conn
            .request(Command::DisposeById {
                session_id: "c2|t1".to_string(),
            })
            .await;
        assert!(response.success);

        let response = conn.request(Command::ListSessions).await;
        assert_eq!(
            response.data,
            Some(ResponseData::Sessions { sessions: vec![] })
        );
    }

    #[tokio::test]
    async fn test_dispose_sends_dispose_event() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        conn.request(Command::SetClient {
            client_id: "c1".to_string(),
        })
        .await;
        let response = conn.request(Command::Dispose).await;
        assert_eq!(response.data, Some(ResponseData::Disposed { count: 1 }));

        let event = timeout(Duration::from_secs(2), conn.next_event())
            .await
            .expect("dispose event");
        assert_eq!(event, ClientEvent::Dispose);
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_server() {
        let server = TestServer::start(ServiceConfig::default()).await;
        let mut conn = server.connect().await;

        conn.request(create("c1|t1", "cat")).await;
        let response = conn.request(Command::Shutdown).await;
        assert!(response.success);
        drop(conn);

        let mut stopped = false;
        for _ in 0..100 {
            if server.handle.is_finished() {
                stopped = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(stopped, "server should stop after shutdown");
    }
}
