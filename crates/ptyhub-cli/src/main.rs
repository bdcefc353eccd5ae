//! ptyhub CLI and daemon entry point.

mod args;
mod daemon;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ptyhub_core::protocol::{ClientEvent, Command, ResponseData, TerminalOptions};
use ptyhub_core::session_id::SessionId;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use uuid::Uuid;

use crate::args::{Cli, Commands, CreateArgs, DaemonArgs};
use crate::daemon::config::ServiceConfig;
use crate::daemon::{DaemonClient, DaemonServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Daemon(args) = &cli.command {
        run_daemon(args);
        return;
    }

    if let Err(e) = run_client_command(cli) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn create_command(args: &CreateArgs) -> Command {
    let suffix = args
        .name
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());
    let mut command = args.command.iter();
    Command::Create {
        session_id: SessionId::new(&args.client, &suffix).to_string(),
        rows: args.rows,
        cols: args.cols,
        options: TerminalOptions {
            shell: command.next().cloned(),
            args: command.cloned().collect(),
            env: args.env.iter().cloned().collect(),
            cwd: args.cwd.clone(),
        },
    }
}

/// Convert CLI args to a protocol Command.
///
/// Returns None for commands that need more than one request.
fn cli_to_command(cli: &Cli) -> Option<Command> {
    match &cli.command {
        Commands::Create(args) => Some(create_command(args)),
        Commands::Send(args) => {
            let mut data = args.text.clone().into_bytes();
            if args.enter {
                data.push(b'\r');
            }
            Some(Command::OnMessage {
                session_id: args.session.clone(),
                data,
            })
        }
        Commands::Resize(args) => Some(Command::Resize {
            session_id: args.session.clone(),
            rows: args.rows,
            cols: args.cols,
        }),
        Commands::ShellName(args) => Some(Command::GetShellName {
            session_id: args.session.clone(),
        }),
        Commands::Pid(args) => Some(Command::GetProcessId {
            session_id: args.session.clone(),
        }),
        Commands::Kill(args) => Some(Command::DisposeById {
            session_id: args.session.clone(),
        }),
        Commands::ListSessions => Some(Command::ListSessions),
        Commands::CloseClient(args) => Some(Command::CloseClient {
            client_id: args.client.clone(),
        }),
        Commands::DisposeClient(args) => Some(Command::DisposeClient {
            client_id: args.client.clone(),
        }),
        Commands::Stop => Some(Command::Shutdown),
        Commands::Attach(_) => None,
        Commands::Daemon(_) => unreachable!("Daemon command handled separately"),
    }
}

/// Run a client command by connecting to the daemon.
fn run_client_command(cli: Cli) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    runtime.block_on(async {
        let mut client = DaemonClient::connect().await?;

        let Some(command) = cli_to_command(&cli) else {
            if let Commands::Attach(args) = &cli.command {
                return attach(&mut client, &args.client).await;
            }
            return Ok(());
        };

        let response = client.send(command).await?;

        if response.success {
            match response.data {
                Some(ResponseData::ShellName { name }) => println!("{}", name),
                Some(ResponseData::ProcessId { pid }) => println!("{}", pid),
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => {}
            }
        } else if let Some(err) = response.error {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }

        Ok(())
    })
}

/// Attach as `client_id` and copy pushed output to stdout until the daemon
/// releases the client or the user interrupts.
async fn attach(client: &mut DaemonClient, client_id: &str) -> anyhow::Result<()> {
    let response = client
        .send(Command::SetClient {
            client_id: client_id.to_string(),
        })
        .await?;
    if let Some(err) = response.error {
        anyhow::bail!("{}", err);
    }

    let response = client
        .send(Command::EnsureClientTerminal {
            client_id: client_id.to_string(),
            session_ids: Vec::new(),
        })
        .await?;
    if let Some(ResponseData::ClientTerminal { alive }) = response.data {
        let state = if alive { "has live sessions" } else { "has no sessions" };
        eprintln!("Attached as '{}' ({})", client_id, state);
    }

    let mut stdout = tokio::io::stdout();
    loop {
        let event = tokio::select! {
            event = client.next_event() => event?,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            Some(ClientEvent::ClientMessage { data, .. }) => {
                stdout
                    .write_all(&data)
                    .await
                    .context("Failed to write output")?;
                stdout.flush().await.context("Failed to flush output")?;
            }
            Some(ClientEvent::CloseClient { session_id }) => {
                eprintln!("\r\n[session {} exited]", session_id);
            }
            Some(ClientEvent::Dispose) | None => break,
        }
    }
    Ok(())
}

fn daemon_config(args: &DaemonArgs) -> ServiceConfig {
    let mut config = ServiceConfig::from_env();
    if let Some(ms) = args.close_threshold_ms {
        config.pty_close_threshold = Duration::from_millis(ms);
    }
    config.development |= args.dev;
    config.reconnect_cancels_disposal |= args.reconnect_cancels_disposal;
    config
}

/// Run the daemon server with graceful signal handling.
///
/// Handles SIGINT (Ctrl+C) and SIGTERM for clean shutdown.
/// The DaemonServer's Drop impl cleans up socket and PID files.
fn run_daemon(args: &DaemonArgs) {
    let config = daemon_config(args);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let server = match DaemonServer::bind(config).await {
            Ok(s) => s,
            Err(e) => {
                error!("Failed to start daemon: {:#}", e);
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = server.run() => {
                if let Err(e) = result {
                    error!("Daemon error: {}", e);
                    std::process::exit(1);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully");
                server.stop().await;
            }
            _ = sigterm() => {
                info!("Received SIGTERM, shutting down gracefully");
                server.stop().await;
            }
        }
        // Server is dropped here, triggering cleanup of socket and PID files
    });
}

/// Wait for SIGTERM signal (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(
                "Failed to register SIGTERM handler: {}, daemon will only respond to SIGINT",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
