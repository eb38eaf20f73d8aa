//! Notification dispatch.
//!
//! Builds the one-shot completion message and hands it to a mail transport.
//! Three transport strategies exist: the local loopback relay, an
//! authenticated remote relay (STARTTLS + AUTH), and the system mail agent.
//! Exactly one strategy is active per invocation, selected at startup; a
//! send is a single attempt with no retry and no fallback substitution.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::AsyncSmtpTransport;
use lettre::transport::sendmail::AsyncSendmailTransport;
use lettre::{AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::{debug, info};

/// Default port for authenticated TLS mail submission.
pub const DEFAULT_SMTP_PORT: u16 = 587;

/// Label used in the notification when the caller names no process.
pub const DEFAULT_PROCESS_LABEL: &str = "Your process";

/// Bounded connect/handshake timeout for relay transports. The wait itself
/// has no timeout, but a dead relay must not hang the final send forever.
const RELAY_TIMEOUT: Duration = Duration::from_secs(30);

/// Notification dispatch errors.
///
/// Transport sub-kinds are distinguished for diagnostics only; all of them
/// terminate the invocation identically.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no valid recipients: {reason}")]
    InvalidRecipients { reason: String },

    #[error("invalid sender address: {reason}")]
    InvalidSender { reason: String },

    #[error("credential prompt failed: {0}")]
    CredentialPrompt(String),

    #[error("could not connect to mail relay: {0}")]
    ConnectFailed(String),

    #[error("secure channel negotiation with mail relay failed: {0}")]
    HandshakeFailed(String),

    #[error("mail relay rejected credentials: {0}")]
    AuthFailed(String),

    #[error("mail relay rejected the message: {0}")]
    Rejected(String),

    #[error("mail agent rejected the message: {0}")]
    AgentFailed(String),

    #[error("message construction failed: {0}")]
    Construction(#[from] lettre::error::Error),
}

/// Credentials for an authenticated remote relay.
///
/// Held in memory for one invocation only. The secret is never persisted
/// and is redacted from `Debug` output.
#[derive(Clone)]
pub struct SmtpCredentials {
    host: String,
    port: u16,
    username: String,
    secret: String,
}

impl SmtpCredentials {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret: secret.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for SmtpCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// How a notification is handed off. Selected once at startup from parsed
/// flags, never negotiated at runtime.
#[derive(Debug, Clone)]
pub enum TransportStrategy {
    /// Plaintext handoff to a relay on the local loopback interface.
    LocalRelay,
    /// STARTTLS + AUTH handoff to a remote relay.
    AuthenticatedRelay(SmtpCredentials),
    /// Asynchronous delivery through the locally installed mail agent.
    SystemAgent,
}

/// The completion notification. Constructed once, immediately before use.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub subject: String,
    pub body: String,
    pub sender: Mailbox,
    pub recipients: Vec<Mailbox>,
}

impl EmailMessage {
    /// Compose the notification from already-validated parts. Pure and
    /// infallible; called immediately before transmission, never before
    /// process exit has been observed.
    pub fn compose(
        label: Option<&str>,
        pid: u32,
        sender: Mailbox,
        recipients: Vec<Mailbox>,
    ) -> Self {
        let label = label.unwrap_or(DEFAULT_PROCESS_LABEL);
        let text = format!("{label} (pid {pid}), finished running.");
        Self {
            subject: text.clone(),
            body: text,
            sender,
            recipients,
        }
    }

    /// Recipient addresses joined for display, preserving order.
    pub fn recipient_list(&self) -> String {
        self.recipients
            .iter()
            .map(|m| m.email.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn to_lettre(&self) -> Result<Message, NotifyError> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(self.subject.clone());
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        Ok(builder
            .header(ContentType::TEXT_PLAIN)
            .body(self.body.clone())?)
    }
}

/// Source of the fallback sender identity.
///
/// Injected into message construction so that `build_message` stays pure and
/// deterministic under test with fixed defaults.
pub trait SenderDefaults {
    fn username(&self) -> String;
    fn hostname(&self) -> String;
}

/// Sender defaults read from the running system: `<user>@<hostname>`.
pub struct SystemSenderDefaults;

impl SenderDefaults for SystemSenderDefaults {
    fn username(&self) -> String {
        whoami::username()
    }

    fn hostname(&self) -> String {
        whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned())
    }
}

/// Validate and parse the recipient list. No I/O.
///
/// Run before any waiting begins so an empty list or a malformed address is
/// caught upfront. Parsed order is the caller's order.
pub fn parse_recipients(recipients: &[String]) -> Result<Vec<Mailbox>, NotifyError> {
    if recipients.is_empty() {
        return Err(NotifyError::InvalidRecipients {
            reason: "recipient list is empty".to_owned(),
        });
    }

    recipients
        .iter()
        .map(|addr| {
            addr.parse::<Mailbox>()
                .map_err(|e| NotifyError::InvalidRecipients {
                    reason: format!("{addr}: {e}"),
                })
        })
        .collect()
}

/// Resolve the sender address, falling back to `<user>@<hostname>` from the
/// injected defaults. No I/O; also run before any waiting begins.
pub fn resolve_sender(
    sender: Option<&str>,
    defaults: &dyn SenderDefaults,
) -> Result<Mailbox, NotifyError> {
    let sender_addr = match sender {
        Some(addr) => addr.to_owned(),
        None => format!("{}@{}", defaults.username(), defaults.hostname()),
    };
    sender_addr
        .parse::<Mailbox>()
        .map_err(|e| NotifyError::InvalidSender {
            reason: format!("{sender_addr}: {e}"),
        })
}

/// Build the completion notification. Pure construction, no I/O.
///
/// `label` falls back to [`DEFAULT_PROCESS_LABEL`]; `sender` falls back to
/// `<user>@<hostname>` from the injected defaults. Fails if the recipient
/// list is empty or any address fails to parse.
pub fn build_message(
    label: Option<&str>,
    pid: u32,
    sender: Option<&str>,
    recipients: &[String],
    defaults: &dyn SenderDefaults,
) -> Result<EmailMessage, NotifyError> {
    let recipients = parse_recipients(recipients)?;
    let sender = resolve_sender(sender, defaults)?;
    Ok(EmailMessage::compose(label, pid, sender, recipients))
}

/// A mail transport: one handoff attempt per call, plus a pre-flight check.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Attempt exactly one transmission. No retry loop.
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;

    /// Pre-flight check, run before a potentially long wait so that a
    /// relay or credential mistake is caught upfront. Opens the same
    /// connection/handshake/auth sequence as `send` without transmitting.
    async fn verify(&self) -> Result<(), NotifyError>;

    /// Transport name for diagnostics.
    fn name(&self) -> &str;
}

/// SMTP relay transport, local or authenticated.
pub struct SmtpRelayTransport {
    host: String,
    port: u16,
    credentials: Option<SmtpCredentials>,
    timeout: Duration,
}

impl SmtpRelayTransport {
    /// Plaintext transport to a relay on the local loopback interface.
    pub fn local() -> Self {
        Self::local_at("127.0.0.1", 25)
    }

    /// Plaintext transport to a relay at a specific host and port.
    pub fn local_at(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            timeout: RELAY_TIMEOUT,
        }
    }

    /// STARTTLS + AUTH transport to the relay named by the credentials.
    pub fn authenticated(credentials: SmtpCredentials) -> Self {
        Self {
            host: credentials.host().to_owned(),
            port: credentials.port(),
            credentials: Some(credentials),
            timeout: RELAY_TIMEOUT,
        }
    }

    fn mailer(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        match &self.credentials {
            None => Ok(
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(self.host.as_str())
                    .port(self.port)
                    .timeout(Some(self.timeout))
                    .build(),
            ),
            Some(creds) => {
                let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
                    .map_err(classify_smtp_error)?;
                Ok(builder
                    .port(self.port)
                    .credentials(Credentials::new(
                        creds.username().to_owned(),
                        creds.secret().to_owned(),
                    ))
                    .timeout(Some(self.timeout))
                    .build())
            }
        }
    }
}

#[async_trait]
impl MailTransport for SmtpRelayTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        let mailer = self.mailer()?;
        let email = message.to_lettre()?;
        mailer.send(email).await.map_err(classify_smtp_error)?;
        info!(
            relay = %self.host,
            port = self.port,
            recipients = %message.recipient_list(),
            "message handed off to relay"
        );
        Ok(())
    }

    async fn verify(&self) -> Result<(), NotifyError> {
        let mailer = self.mailer()?;
        let reachable = mailer
            .test_connection()
            .await
            .map_err(classify_smtp_error)?;
        if reachable {
            debug!(relay = %self.host, port = self.port, "relay pre-flight check passed");
            Ok(())
        } else {
            Err(NotifyError::ConnectFailed(format!(
                "relay at {}:{} did not accept the connection check",
                self.host, self.port
            )))
        }
    }

    fn name(&self) -> &str {
        if self.credentials.is_some() {
            "authenticated-relay"
        } else {
            "local-relay"
        }
    }
}

/// Conventional sendmail path checked by the system-agent pre-flight.
const SENDMAIL_PATH: &str = "/usr/sbin/sendmail";

/// Transport that hands the message to the local mail agent. "Sent" means
/// accepted by the agent for asynchronous delivery, not delivered.
pub struct SystemAgentTransport;

#[async_trait]
impl MailTransport for SystemAgentTransport {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        let mailer: AsyncSendmailTransport<Tokio1Executor> = AsyncSendmailTransport::new();
        let email = message.to_lettre()?;
        mailer
            .send(email)
            .await
            .map_err(|e| NotifyError::AgentFailed(e.to_string()))?;
        info!(
            recipients = %message.recipient_list(),
            "message accepted by local mail agent"
        );
        Ok(())
    }

    async fn verify(&self) -> Result<(), NotifyError> {
        if std::path::Path::new(SENDMAIL_PATH).exists() {
            Ok(())
        } else {
            Err(NotifyError::AgentFailed(format!(
                "no mail agent found at {SENDMAIL_PATH}"
            )))
        }
    }

    fn name(&self) -> &str {
        "system-agent"
    }
}

/// Build the transport for a strategy. One strategy per invocation.
pub fn transport_for(strategy: &TransportStrategy) -> Box<dyn MailTransport> {
    match strategy {
        TransportStrategy::LocalRelay => Box::new(SmtpRelayTransport::local()),
        TransportStrategy::AuthenticatedRelay(creds) => {
            Box::new(SmtpRelayTransport::authenticated(creds.clone()))
        }
        TransportStrategy::SystemAgent => Box::new(SystemAgentTransport),
    }
}

/// Map a lettre SMTP error onto the dispatch error taxonomy.
fn classify_smtp_error(e: lettre::transport::smtp::Error) -> NotifyError {
    let detail = e.to_string();
    if e.is_tls() {
        return NotifyError::HandshakeFailed(detail);
    }
    if e.is_timeout() {
        return NotifyError::ConnectFailed(detail);
    }
    match e.status() {
        Some(code) => {
            // AUTH rejections answer 530/534/535.
            let code = code.to_string();
            if code.starts_with("530") || code.starts_with("534") || code.starts_with("535") {
                NotifyError::AuthFailed(detail)
            } else {
                NotifyError::Rejected(detail)
            }
        }
        None => NotifyError::ConnectFailed(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Fixed defaults so message construction is deterministic under test.
    struct FixedDefaults;

    impl SenderDefaults for FixedDefaults {
        fn username(&self) -> String {
            "alice".to_owned()
        }

        fn hostname(&self) -> String {
            "workstation".to_owned()
        }
    }

    fn recipients(addrs: &[&str]) -> Vec<String> {
        addrs.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn empty_recipient_list_is_rejected() {
        let err = build_message(None, 1234, None, &[], &FixedDefaults).unwrap_err();
        assert!(matches!(err, NotifyError::InvalidRecipients { .. }));
    }

    #[test]
    fn malformed_recipient_is_rejected() {
        let err = build_message(
            None,
            1234,
            None,
            &recipients(&["not an address"]),
            &FixedDefaults,
        )
        .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidRecipients { .. }));
    }

    #[test]
    fn defaults_produce_user_at_host_and_generic_label() {
        let msg = build_message(None, 42, None, &recipients(&["a@x.com"]), &FixedDefaults)
            .expect("message should build");
        assert_eq!(msg.sender.email.to_string(), "alice@workstation");
        assert_eq!(msg.subject, "Your process (pid 42), finished running.");
        assert_eq!(msg.body, msg.subject);
    }

    #[test]
    fn explicit_label_and_sender_are_used() {
        let msg = build_message(
            Some("training run"),
            7,
            Some("bot@example.com"),
            &recipients(&["a@x.com"]),
            &FixedDefaults,
        )
        .expect("message should build");
        assert_eq!(msg.sender.email.to_string(), "bot@example.com");
        assert_eq!(msg.subject, "training run (pid 7), finished running.");
    }

    #[test]
    fn recipient_order_is_preserved() {
        let msg = build_message(
            None,
            1,
            None,
            &recipients(&["a@x.com", "b@y.com", "c@z.com"]),
            &FixedDefaults,
        )
        .expect("message should build");
        assert_eq!(msg.recipient_list(), "a@x.com, b@y.com, c@z.com");
    }

    #[test]
    fn invalid_sender_is_its_own_error() {
        let err = build_message(
            None,
            1,
            Some("also not an address"),
            &recipients(&["a@x.com"]),
            &FixedDefaults,
        )
        .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidSender { .. }));
    }

    #[test]
    fn validation_is_separable_from_composition() {
        // Addresses can be validated long before the message exists; the
        // message itself is composed from the parsed parts only after the
        // watched process has been observed gone.
        let parsed =
            parse_recipients(&recipients(&["a@x.com", "b@y.com"])).expect("valid recipients");
        let sender = resolve_sender(None, &FixedDefaults).expect("valid sender");

        let msg = EmailMessage::compose(None, 42, sender, parsed);
        assert_eq!(msg.sender.email.to_string(), "alice@workstation");
        assert_eq!(msg.subject, "Your process (pid 42), finished running.");
        assert_eq!(msg.recipient_list(), "a@x.com, b@y.com");
    }

    #[test]
    fn parse_recipients_rejects_empty_and_malformed_input() {
        assert!(matches!(
            parse_recipients(&[]).unwrap_err(),
            NotifyError::InvalidRecipients { .. }
        ));
        assert!(matches!(
            parse_recipients(&recipients(&["a@x.com", "nope"])).unwrap_err(),
            NotifyError::InvalidRecipients { .. }
        ));
    }

    #[test]
    fn credentials_debug_redacts_the_secret() {
        let creds = SmtpCredentials::new("smtp.example.com", 587, "alice", "hunter2");
        let debug = format!("{creds:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains("hunter2"));
    }

    /// Transport that records what it was handed instead of doing I/O.
    struct RecordingTransport {
        seen: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
            self.seen
                .lock()
                .expect("recording lock")
                .push(message.clone());
            Ok(())
        }

        async fn verify(&self) -> Result<(), NotifyError> {
            Ok(())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn transport_observes_the_message_unchanged() {
        let msg = build_message(
            None,
            99,
            None,
            &recipients(&["a@x.com", "b@y.com"]),
            &FixedDefaults,
        )
        .expect("message should build");

        let transport = RecordingTransport {
            seen: Mutex::new(Vec::new()),
        };
        transport.send(&msg).await.expect("mock send");

        let seen = transport.seen.lock().expect("recording lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].subject, msg.subject);
        assert_eq!(seen[0].recipient_list(), "a@x.com, b@y.com");
    }

    #[test]
    fn transport_for_picks_the_matching_transport() {
        assert_eq!(
            transport_for(&TransportStrategy::LocalRelay).name(),
            "local-relay"
        );
        let creds = SmtpCredentials::new("smtp.example.com", 587, "alice", "pw");
        assert_eq!(
            transport_for(&TransportStrategy::AuthenticatedRelay(creds)).name(),
            "authenticated-relay"
        );
        assert_eq!(
            transport_for(&TransportStrategy::SystemAgent).name(),
            "system-agent"
        );
    }

    #[test]
    fn message_converts_to_wire_form() {
        let msg = build_message(
            Some("job"),
            5,
            Some("me@example.com"),
            &recipients(&["a@x.com"]),
            &FixedDefaults,
        )
        .expect("message should build");
        let wire = msg.to_lettre().expect("lettre conversion");
        let rendered = String::from_utf8(wire.formatted()).expect("utf8 message");
        assert!(rendered.contains("Subject: job (pid 5), finished running."));
        assert!(rendered.contains("To: a@x.com"));
    }
}
