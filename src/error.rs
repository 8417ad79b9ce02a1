use std::time::Duration;

/// Failures building or sending a webhook request.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid webhook url: {0}")]
    InvalidUrl(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Session-level mailbox failures. Their `Display` text is what lands in
/// an account's `last_error`, so it never contains credentials.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("could not connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed: {source}")]
    Tls {
        host: String,
        source: tokio_native_tls::native_tls::Error,
    },

    #[error("login failed for {user}: {reason}")]
    Login { user: String, reason: String },

    #[error("mailbox session timed out after {0:?}")]
    Timeout(Duration),

    #[error("IMAP error: {0}")]
    Protocol(#[from] async_imap::error::Error),
}
