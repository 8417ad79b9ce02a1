use crate::error::MailboxError;
use crate::models::MailAccount;
use async_imap::types::Flag;
use async_trait::async_trait;
use futures::TryStreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_native_tls::native_tls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, warn};

/// One message as fetched from the server, not yet parsed.
#[derive(Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub uid: u32,
    pub seen: bool,
    pub flagged: bool,
    pub body: Vec<u8>,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("uid", &self.uid)
            .field("seen", &self.seen)
            .field("flagged", &self.flagged)
            .field("len", &self.body.len())
            .finish()
    }
}

/// An open, authenticated mailbox with one folder selected.
#[async_trait]
pub trait MailboxSession: Send {
    /// UIDs of unseen messages, ascending.
    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError>;

    /// Full raw messages for `uids`. Never marks them as seen.
    async fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, MailboxError>;

    /// Ends the session. Errors are logged, not returned.
    async fn close(&mut self);
}

#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn open(
        &self,
        account: &MailAccount,
        folder: &str,
    ) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// Connects to real IMAP servers, over TLS when the account asks for it.
#[derive(Debug, Clone)]
pub struct ImapConnector {
    connect_timeout: Duration,
}

impl ImapConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(
        &self,
        account: &MailAccount,
        folder: &str,
    ) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let host = account.imap_host.as_str();
        let port = account.imap_port;
        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|source| MailboxError::Connect {
                host: host.to_string(),
                port,
                source,
            })?;

        if account.imap_secure {
            let tls = TlsConnector::builder()
                .danger_accept_invalid_certs(account.accept_invalid_certs)
                .build()
                .map_err(|source| MailboxError::Tls {
                    host: host.to_string(),
                    source,
                })?;
            let tls = tokio_native_tls::TlsConnector::from(tls);
            let stream = tls
                .connect(host, tcp)
                .await
                .map_err(|source| MailboxError::Tls {
                    host: host.to_string(),
                    source,
                })?;
            let session = ImapSession::login(stream.compat(), account, folder).await?;
            Ok(Box::new(session))
        } else {
            let session = ImapSession::login(tcp.compat(), account, folder).await?;
            Ok(Box::new(session))
        }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn open(
        &self,
        account: &MailAccount,
        folder: &str,
    ) -> Result<Box<dyn MailboxSession>, MailboxError> {
        tokio::time::timeout(self.connect_timeout, self.connect(account, folder))
            .await
            .map_err(|_| MailboxError::Timeout(self.connect_timeout))?
    }
}

struct ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    session: async_imap::Session<T>,
}

impl<T> ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    async fn login(stream: T, account: &MailAccount, folder: &str) -> Result<Self, MailboxError> {
        let client = async_imap::Client::new(stream);
        let mut session = client
            .login(&account.username, account.password.expose())
            .await
            .map_err(|(e, _)| MailboxError::Login {
                user: account.username.clone(),
                reason: e.to_string(),
            })?;

        let mailbox = session.select(folder).await?;
        debug!(
            account = %account.email,
            folder,
            exists = mailbox.exists,
            "mailbox selected"
        );
        Ok(Self { session })
    }
}

#[async_trait]
impl<T> MailboxSession for ImapSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin + fmt::Debug + Send,
{
    async fn search_unseen(&mut self) -> Result<Vec<u32>, MailboxError> {
        let mut uids: Vec<u32> = self.session.uid_search("UNSEEN").await?.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch(&mut self, uids: &[u32]) -> Result<Vec<RawMessage>, MailboxError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let fetches: Vec<_> = self
            .session
            .uid_fetch(&set, "(UID FLAGS BODY.PEEK[])")
            .await?
            .try_collect()
            .await?;

        let mut messages = Vec::with_capacity(fetches.len());
        for fetch in &fetches {
            let Some(uid) = fetch.uid else {
                continue;
            };
            let Some(body) = fetch.body() else {
                warn!(uid, "fetched message has no body");
                continue;
            };
            let mut seen = false;
            let mut flagged = false;
            for flag in fetch.flags() {
                match flag {
                    Flag::Seen => seen = true,
                    Flag::Flagged => flagged = true,
                    _ => {}
                }
            }
            messages.push(RawMessage {
                uid,
                seen,
                flagged,
                body: body.to_vec(),
            });
        }
        Ok(messages)
    }

    async fn close(&mut self) {
        if let Err(e) = self.session.logout().await {
            debug!(error = %e, "logout failed");
        }
    }
}
