//! CLI argument parsing with clap derive macros.

use clap::{Parser, Subcommand};

const SESSION_HELP: &str = "Session id, as '<client>|<terminal>'";

/// Terminal sessions that outlive their clients.
///
/// A background daemon owns PTY sessions on behalf of clients. When a client
/// goes away its sessions survive a grace period, so a reconnecting client
/// finds its shells still running.
#[derive(Debug, Parser)]
#[command(name = "ptyhub", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the daemon process (usually auto-started)
    Daemon(DaemonArgs),

    /// Stop the daemon, killing every session
    Stop,

    /// Create a terminal session
    #[command(after_help = "\
Examples:
  ptyhub create                              # Default shell for client 'cli'
  ptyhub create --name build -- bash -l      # Session 'cli|build' running bash -l
  ptyhub create --client ide --cwd /tmp zsh  # Session owned by client 'ide'
  ptyhub create --env FOO=bar sh             # Extra environment")]
    Create(CreateArgs),

    /// Write input to a session
    #[command(after_help = "\
Examples:
  ptyhub send 'cli|build' 'make test' --enter
  ptyhub send 'cli|build' $'\\x03'             # Ctrl+C")]
    Send(SendArgs),

    /// Resize a session
    Resize(ResizeArgs),

    /// Print the shell name of a session
    ShellName(SessionArgs),

    /// Print the process id of a session (-1 if unknown)
    Pid(SessionArgs),

    /// Kill a session
    Kill(SessionArgs),

    /// List all live sessions
    ListSessions,

    /// Attach as a client and stream its terminal output
    #[command(after_help = "\
Registers this connection as the client's sink, cancels any pending disposal,
then prints pushed output until interrupted. Disconnecting starts the client's
grace period.")]
    Attach(ClientArgs),

    /// Start a client's grace period now
    CloseClient(ClientArgs),

    /// Kill every session of a client immediately
    DisposeClient(ClientArgs),
}

#[derive(Debug, clap::Args)]
pub struct DaemonArgs {
    /// Grace period before a closed client's sessions are killed
    #[arg(long, value_name = "MS")]
    pub close_threshold_ms: Option<u64>,

    /// Development mode: kill a closed client's sessions immediately
    #[arg(long)]
    pub dev: bool,

    /// Let set_client cancel a pending disposal, not only ensure_client_terminal
    #[arg(long)]
    pub reconnect_cancels_disposal: bool,
}

#[derive(Debug, clap::Args)]
pub struct CreateArgs {
    /// Client that owns the session
    #[arg(short, long, default_value = "cli")]
    pub client: String,

    /// Terminal part of the session id [default: random]
    #[arg(short, long)]
    pub name: Option<String>,

    #[arg(long, default_value_t = 24)]
    pub rows: u16,

    #[arg(long, default_value_t = 80)]
    pub cols: u16,

    /// Working directory; inherits the daemon's when omitted
    #[arg(long, value_name = "DIR")]
    pub cwd: Option<String>,

    /// Extra environment variable, repeatable
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Shell and its arguments [default: $SHELL]
    #[arg(num_args = 0.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

#[derive(Debug, clap::Args)]
pub struct SendArgs {
    #[arg(help = SESSION_HELP)]
    pub session: String,

    /// Text to write
    pub text: String,

    /// Append a carriage return
    #[arg(short, long)]
    pub enter: bool,
}

#[derive(Debug, clap::Args)]
pub struct ResizeArgs {
    #[arg(help = SESSION_HELP)]
    pub session: String,

    /// Number of columns
    pub cols: u16,

    /// Number of rows
    pub rows: u16,
}

#[derive(Debug, clap::Args)]
pub struct SessionArgs {
    #[arg(help = SESSION_HELP)]
    pub session: String,
}

#[derive(Debug, clap::Args)]
pub struct ClientArgs {
    /// Client id
    pub client: String,
}

#[cfg(test)]
mod tests {
    use super::{Cli, Commands};
    use clap::Parser;

    #[test]
    fn test_create_parses_hyphenated_args() {
        let cli = Cli::parse_from(["ptyhub", "create", "--name", "t1", "bash", "-c", "echo hi"]);

        match cli.command {
            Commands::Create(args) => {
                assert_eq!(args.client, "cli");
                assert_eq!(args.name.as_deref(), Some("t1"));
                assert_eq!(args.command, vec!["bash", "-c", "echo hi"]);
                assert_eq!((args.rows, args.cols), (24, 80));
            }
            _ => panic!("Expected create command"),
        }
    }

    #[test]
    fn test_create_without_shell() {
        let cli = Cli::parse_from(["ptyhub", "create", "-e", "A=1", "--env", "B=x=y"]);

        match cli.command {
            Commands::Create(args) => {
                assert!(args.command.is_empty());
                assert_eq!(
                    args.env,
                    vec![
                        ("A".to_string(), "1".to_string()),
                        ("B".to_string(), "x=y".to_string())
                    ]
                );
            }
            _ => panic!("Expected create command"),
        }
    }

    #[test]
    fn test_create_rejects_bad_env() {
        assert!(Cli::try_parse_from(["ptyhub", "create", "--env", "NOEQUALS"]).is_err());
        assert!(Cli::try_parse_from(["ptyhub", "create", "--env", "=v"]).is_err());
    }

    #[test]
    fn test_daemon_flags() {
        let cli = Cli::parse_from(["ptyhub", "daemon", "--close-threshold-ms", "500", "--dev"]);

        match cli.command {
            Commands::Daemon(args) => {
                assert_eq!(args.close_threshold_ms, Some(500));
                assert!(args.dev);
                assert!(!args.reconnect_cancels_disposal);
            }
            _ => panic!("Expected daemon command"),
        }
    }
}
