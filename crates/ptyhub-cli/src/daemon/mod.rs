//! Daemon process: PTY sessions, their clients, and the socket they talk over.

pub mod client;
pub mod clients;
pub mod config;
pub mod forwarder;
pub mod paths;
pub mod pty;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod service;

pub use client::DaemonClient;
pub use server::DaemonServer;
