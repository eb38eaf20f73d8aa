//! Relay credential acquisition.
//!
//! Credentials arrive either preconfigured or from an interactive prompt
//! run immediately before the wait begins; they live in memory for one
//! invocation and are discarded at process exit.

use dialoguer::{Input, Password};

use crate::notify::{NotifyError, SmtpCredentials, DEFAULT_SMTP_PORT};

/// Well-known host prefilled by the Gmail shorthand.
pub const GMAIL_SMTP_HOST: &str = "smtp.gmail.com";

/// Where relay credentials come from. A tagged variant selected by CLI
/// flags, not a chain of conditionals inside send logic.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// No credentials: the local relay or the system agent will be used.
    NonInteractive,
    /// Prompt on the terminal, optionally with a prefilled host.
    Interactive { host_hint: Option<String> },
    /// Credentials supplied by the caller.
    Preconfigured(SmtpCredentials),
}

impl CredentialSource {
    /// Acquire credentials, prompting if this source is interactive.
    ///
    /// Returns `None` when the invocation needs no credentials. Malformed
    /// or aborted interactive input fails with `CredentialPrompt`.
    pub fn acquire(self) -> Result<Option<SmtpCredentials>, NotifyError> {
        match self {
            Self::NonInteractive => Ok(None),
            Self::Preconfigured(creds) => Ok(Some(creds)),
            Self::Interactive { host_hint } => prompt(host_hint).map(Some),
        }
    }
}

fn prompt(host_hint: Option<String>) -> Result<SmtpCredentials, NotifyError> {
    let prompt_err = |e: dialoguer::Error| NotifyError::CredentialPrompt(e.to_string());

    let username: String = Input::new()
        .with_prompt("Username (or email)")
        .interact_text()
        .map_err(prompt_err)?;
    let username = username.trim().to_owned();
    if username.is_empty() {
        return Err(NotifyError::CredentialPrompt(
            "username must not be empty".to_owned(),
        ));
    }

    let secret = Password::new()
        .with_prompt("Password")
        .interact()
        .map_err(prompt_err)?;

    // Guess the relay from the account's mail domain, as in "smtp.example.com".
    let default_host = host_hint.or_else(|| {
        username
            .split_once('@')
            .map(|(_, domain)| format!("smtp.{domain}"))
    });

    let mut host_input = Input::new().with_prompt("SMTP host name");
    if let Some(default) = default_host {
        host_input = host_input.default(default);
    }
    let host: String = host_input.interact_text().map_err(prompt_err)?;
    let host = host.trim().to_owned();
    if host.is_empty() {
        return Err(NotifyError::CredentialPrompt(
            "SMTP host must not be empty".to_owned(),
        ));
    }

    Ok(SmtpCredentials::new(
        host,
        DEFAULT_SMTP_PORT,
        username,
        secret,
    ))
}
