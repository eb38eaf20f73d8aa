#![forbid(unsafe_code)]

//! pidnote-lib: shared functionality for the pidnote utility.
//!
//! This library provides the two pieces of pidnote with real semantics:
//! - Process liveness monitoring: probe whether a pid currently denotes a
//!   running process, and block (poll-sleep) until it no longer does.
//! - Notification dispatch: build a completion message and hand it to a mail
//!   relay (local or authenticated remote) or the system mail agent.
//!
//! Credential acquisition for the authenticated relay lives alongside the
//! dispatcher so that pre-flight verification can run before a potentially
//! long wait begins.

pub mod credentials;
pub mod notify;
pub mod process;
