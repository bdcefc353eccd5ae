//! Core types for ptyhub.
//!
//! ptyhub runs pseudo-terminal processes on behalf of remote UI clients. This
//! crate holds everything the daemon and its clients share; it does no I/O.
//!
//! # Modules
//!
//! - [`error`]: API error types with actionable suggestions
//! - [`protocol`]: JSON-line request/response/event protocol
//! - [`session_id`]: `"<clientId>|<suffix>"` session identifiers
//! - [`shell`]: shell name extraction

pub mod error;
pub mod protocol;
pub mod session_id;
pub mod shell;
