#![forbid(unsafe_code)]

//! pidnote: wait for a process to finish, then send an email notification.

use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use pidnote_lib::credentials::{CredentialSource, GMAIL_SMTP_HOST};
use pidnote_lib::notify::{
    self, EmailMessage, MailTransport, SmtpRelayTransport, SystemSenderDefaults, TransportStrategy,
};
use pidnote_lib::process::{self, WaitOutcome};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Transport failure, including failed pre-flight verification.
const EXIT_TRANSPORT: u8 = 1;
/// Invalid input: recipients, sender, or an aborted credential prompt.
const EXIT_USAGE: u8 = 2;
/// The pid did not refer to a live process at startup.
const EXIT_NOT_RUNNING: u8 = 3;
/// Interrupted during the wait; no notification was sent.
const EXIT_CANCELED: u8 = 130;

/// Terminal states of one invocation, each mapped to a distinct status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    NotificationSent,
    TransportFailed,
    InvalidInput,
    NotRunning,
    Canceled,
}

impl Termination {
    /// Numeric process status reported for this terminal state.
    const fn status(self) -> u8 {
        match self {
            Self::NotificationSent => 0,
            Self::TransportFailed => EXIT_TRANSPORT,
            Self::InvalidInput => EXIT_USAGE,
            Self::NotRunning => EXIT_NOT_RUNNING,
            Self::Canceled => EXIT_CANCELED,
        }
    }

    fn exit_code(self) -> ExitCode {
        ExitCode::from(self.status())
    }
}

/// Validate the poll interval argument.
fn parse_poll_interval(s: &str) -> Result<u64, String> {
    let seconds: u64 = s
        .parse()
        .map_err(|_parse_err| format!("Invalid poll interval '{s}': must be a number"))?;
    if seconds == 0 {
        Err("Poll interval must be at least 1 second".to_owned())
    } else if seconds > 3600 {
        Err(format!(
            "Poll interval too large: {seconds} seconds. Maximum allowed is 3600 seconds (1 hour)"
        ))
    } else {
        Ok(seconds)
    }
}

/// Validate the relay endpoint argument as `host:port`.
fn parse_relay_endpoint(s: &str) -> Result<(String, u16), String> {
    let Some((host, port)) = s.rsplit_once(':') else {
        return Err(format!("Invalid relay endpoint '{s}': expected host:port"));
    };
    if host.is_empty() {
        return Err(format!("Invalid relay endpoint '{s}': host must not be empty"));
    }
    let port: u16 = port
        .parse()
        .map_err(|_parse_err| format!("Invalid relay endpoint '{s}': bad port"))?;
    Ok((host.to_owned(), port))
}

#[derive(Parser)]
#[command(name = "pidnote")]
#[command(about = "Notify by email when a process finishes running")]
#[command(
    long_about = "Given a process specified by its ID number (e.g., as found by \"ps -fe\" or \
                  \"top\"), wait for the process to finish, then send an email notification to \
                  one or more people. Requires an SMTP relay on localhost, credentials to a \
                  remote relay (--prompt / --gmail), or a local sendmail agent (--sendmail)."
)]
#[command(version)]
struct Cli {
    /// Process id number to watch
    pid: u32,

    /// Recipient email addresses (comma-separated if more than one)
    #[arg(short, long)]
    email: String,

    /// Human-readable name to give the process
    #[arg(short, long)]
    name: Option<String>,

    /// Email address to send the notification from
    #[arg(short, long)]
    sender: Option<String>,

    /// Prompt for SMTP credentials and send through that relay
    #[arg(short, long)]
    prompt: bool,

    /// Send through Gmail (implies --prompt with smtp.gmail.com prefilled)
    #[arg(short, long)]
    gmail: bool,

    /// Hand the message to the local sendmail agent instead of an SMTP relay
    #[arg(long, conflicts_with_all = ["prompt", "gmail"])]
    sendmail: bool,

    /// Local relay endpoint to hand the message to
    #[arg(
        long,
        default_value = "127.0.0.1:25",
        value_name = "HOST:PORT",
        value_parser = parse_relay_endpoint,
        conflicts_with_all = ["prompt", "gmail", "sendmail"]
    )]
    relay: (String, u16),

    /// Seconds between liveness checks (minimum: 1, maximum: 3600)
    #[arg(long, default_value = "1", value_parser = parse_poll_interval)]
    poll_interval: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Diagnostics go to stderr; stdout carries the user-facing progress line.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    run(cli).await.exit_code()
}

async fn run(cli: Cli) -> Termination {
    let recipient_args: Vec<String> = cli
        .email
        .split(',')
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .collect();

    // Addresses are validated upfront so a mistake is caught before any
    // waiting; the message itself is not composed until exit is observed.
    let recipients = match notify::parse_recipients(&recipient_args) {
        Ok(recipients) => recipients,
        Err(e) => {
            eprintln!("{e}");
            return Termination::InvalidInput;
        }
    };
    let sender = match notify::resolve_sender(cli.sender.as_deref(), &SystemSenderDefaults) {
        Ok(sender) => sender,
        Err(e) => {
            eprintln!("{e}");
            return Termination::InvalidInput;
        }
    };

    if !process::is_alive(cli.pid) {
        println!("Process id {} does not appear to be running.", cli.pid);
        return Termination::NotRunning;
    }

    let display_name = cli
        .name
        .clone()
        .or_else(|| process::process_name(cli.pid))
        .unwrap_or_else(|| "process".to_owned());
    println!("Watching {display_name} (pid {}).", cli.pid);

    let source = if cli.gmail {
        CredentialSource::Interactive {
            host_hint: Some(GMAIL_SMTP_HOST.to_owned()),
        }
    } else if cli.prompt {
        CredentialSource::Interactive { host_hint: None }
    } else {
        CredentialSource::NonInteractive
    };

    let credentials = match source.acquire() {
        Ok(credentials) => credentials,
        Err(e) => {
            eprintln!("{e}");
            return Termination::InvalidInput;
        }
    };

    let strategy = if cli.sendmail {
        TransportStrategy::SystemAgent
    } else {
        match credentials {
            Some(creds) => TransportStrategy::AuthenticatedRelay(creds),
            None => TransportStrategy::LocalRelay,
        }
    };

    let (relay_host, relay_port) = cli.relay.clone();
    let transport: Box<dyn MailTransport> = match &strategy {
        TransportStrategy::LocalRelay => {
            Box::new(SmtpRelayTransport::local_at(relay_host, relay_port))
        }
        other => notify::transport_for(other),
    };

    // Pre-flight: catch a relay or credential mistake now, not after a
    // potentially hours-long wait.
    if let Err(e) = transport.verify().await {
        eprintln!("Pre-flight check failed: {e}");
        return Termination::TransportFailed;
    }
    if matches!(strategy, TransportStrategy::AuthenticatedRelay(_)) {
        println!("Credentials accepted.");
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let outcome = process::await_exit(
        cli.pid,
        Duration::from_secs(cli.poll_interval),
        &cancel,
        |elapsed| {
            print!("\rWaiting for pid {} to complete. ({elapsed} s)...", cli.pid);
            let _ = std::io::stdout().flush();
        },
    )
    .await;

    match outcome {
        WaitOutcome::Canceled => {
            println!("\nInterrupted before pid {} finished; no notification sent.", cli.pid);
            Termination::Canceled
        }
        WaitOutcome::ExitObserved { waited } => {
            println!("\nDone!");
            info!(
                pid = cli.pid,
                waited_secs = waited.as_secs(),
                transport = transport.name(),
                "process exited, dispatching notification"
            );
            // Composed only now, immediately before transmission.
            let message =
                EmailMessage::compose(cli.name.as_deref(), cli.pid, sender, recipients);
            match transport.send(&message).await {
                Ok(()) => {
                    println!("Sent email notification to {}.", message.recipient_list());
                    Termination::NotificationSent
                }
                Err(e) => {
                    eprintln!("Failed to send notification: {e}");
                    Termination::TransportFailed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_termination_maps_to_its_own_status() {
        assert_eq!(Termination::NotificationSent.status(), 0);
        assert_eq!(Termination::TransportFailed.status(), 1);
        assert_eq!(Termination::InvalidInput.status(), 2);
        assert_eq!(Termination::NotRunning.status(), 3);
        assert_eq!(Termination::Canceled.status(), 130);

        let all = [
            Termination::NotificationSent,
            Termination::TransportFailed,
            Termination::InvalidInput,
            Termination::NotRunning,
            Termination::Canceled,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.status(), b.status());
            }
        }
    }

    #[test]
    fn relay_endpoint_parsing() {
        assert_eq!(
            parse_relay_endpoint("127.0.0.1:25").expect("valid endpoint"),
            ("127.0.0.1".to_owned(), 25)
        );
        assert!(parse_relay_endpoint("no-port").is_err());
        assert!(parse_relay_endpoint(":25").is_err());
        assert!(parse_relay_endpoint("host:notaport").is_err());
    }
}
