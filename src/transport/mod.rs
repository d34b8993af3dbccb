//! Mailbox transport: one account's retrieval session plus re-delivery.

pub mod imap;
pub mod normalize;
pub mod outbound;
pub mod response;
pub mod submission;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use secrecy::SecretString;

use crate::error::{DeliveryError, TransportError};
use crate::model::{Account, NormalizedMessage};
use crate::retry::{self, RetryPolicy, Sleeper, TokioSleeper};

pub use imap::TlsImapConnector;
pub use outbound::Outbound;
pub use response::FetchedItem;
pub use submission::{LettreSubmitter, SmtpLogin, SubmissionRoute, Submitter};

/// Retrieval port used when the account's server string has none.
pub const DEFAULT_IMAP_PORT: u16 = 993;

/// Only unread mail received within this many days is fetched.
pub const RECENCY_WINDOW_DAYS: i64 = 7;

/// A retrieval server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host` or `host:port`, defaulting the port to 993.
    pub fn parse(server: &str) -> Result<Self, TransportError> {
        let server = server.trim();
        let invalid = |reason: &str| TransportError::Connection {
            endpoint: server.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = match server.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            ),
            None => (server, DEFAULT_IMAP_PORT),
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An open retrieval-protocol session.
#[async_trait]
pub trait MailboxSession: Send + Sync {
    async fn login(&mut self, username: &str, password: &SecretString) -> Result<(), TransportError>;
    async fn noop(&mut self) -> Result<(), TransportError>;
    async fn select_inbox(&mut self) -> Result<(), TransportError>;
    async fn search_unseen_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, TransportError>;
    async fn fetch(&mut self, uids: &[u32]) -> Result<Vec<FetchedItem>, TransportError>;
    async fn logout(&mut self) -> Result<(), TransportError>;
}

/// Opens unauthenticated sessions to a retrieval endpoint.
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn MailboxSession>, TransportError>;
}

/// Re-delivers a message to an address.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, outbound: Outbound<'_>, to: &str) -> Result<(), DeliveryError>;
}

/// Shared collaborators handed to every [`Transport`].
#[derive(Clone)]
pub struct TransportDeps {
    pub connector: Arc<dyn MailboxConnector>,
    pub submitter: Arc<dyn Submitter>,
    pub retry: RetryPolicy,
    pub sleeper: Arc<dyn Sleeper>,
}

impl TransportDeps {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        submitter: Arc<dyn Submitter>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connector,
            submitter,
            retry,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }
}

/// One account's mailbox session, owned by a single poll task.
pub struct Transport {
    account_id: i64,
    endpoint: Endpoint,
    login: SmtpLogin,
    route: SubmissionRoute,
    deps: TransportDeps,
    session: Option<Box<dyn MailboxSession>>,
}

impl Transport {
    /// Prepare a transport for `account`. No connection is made yet.
    pub fn new(account: &Account, deps: TransportDeps) -> Result<Self, TransportError> {
        Ok(Self {
            account_id: account.id,
            endpoint: Endpoint::parse(&account.server)?,
            login: SmtpLogin {
                username: account.username.clone(),
                password: account.password.clone(),
            },
            route: submission::route_for(&account.server),
            deps,
            session: None,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn submission_route(&self) -> &SubmissionRoute {
        &self.route
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Open and authenticate once, replacing any existing session.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.session = None;
        let mut session = self.deps.connector.open(&self.endpoint).await?;
        session
            .login(&self.login.username, &self.login.password)
            .await?;
        self.session = Some(session);
        Ok(())
    }

    /// Check the current session with NOOP, reconnecting under the retry policy if
    /// it is missing or dead. Connect and login are retried independently.
    pub async fn ensure_connection(&mut self) -> Result<(), TransportError> {
        if let Some(mut session) = self.session.take() {
            match session.noop().await {
                Ok(()) => {
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        account_id = self.account_id,
                        endpoint = %self.endpoint,
                        error = %e,
                        "Mailbox health check failed, reconnecting"
                    );
                    // Best effort; the old connection is usually already gone.
                    if let Err(e) = session.logout().await {
                        tracing::debug!(
                            account_id = self.account_id,
                            error = %e,
                            "Logout of stale session failed"
                        );
                    }
                }
            }
        }

        let policy = self.deps.retry;
        let sleeper = self.deps.sleeper.as_ref();
        let connector = self.deps.connector.as_ref();
        let endpoint = &self.endpoint;

        let mut session = retry::retry(&policy, sleeper, "mailbox connect", move |_| {
            connector.open(endpoint)
        })
        .await?;

        let username = self.login.username.clone();
        let password = self.login.password.clone();
        retry::retry_on(&policy, sleeper, "mailbox login", &mut *session, |s, _| {
            let username = username.clone();
            let password = password.clone();
            Box::pin(async move { s.login(&username, &password).await })
        })
        .await?;

        tracing::info!(
            account_id = self.account_id,
            endpoint = %self.endpoint,
            "Mailbox connected"
        );
        self.session = Some(session);
        Ok(())
    }

    /// Fetch unread messages from the recency window.
    ///
    /// Items that cannot be normalized are logged and skipped.
    pub async fn fetch_new(&mut self) -> Result<Vec<NormalizedMessage>, TransportError> {
        self.ensure_connection().await?;
        let session = self.session.as_mut().ok_or(TransportError::Closed)?;

        session.select_inbox().await?;
        let since = (Utc::now() - chrono::Duration::days(RECENCY_WINDOW_DAYS)).date_naive();
        let uids = session.search_unseen_since(since).await?;
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let items = session.fetch(&uids).await?;
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            let uid = item.uid;
            match normalize::normalize(self.account_id, item) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(
                    account_id = self.account_id,
                    uid,
                    error = %e,
                    "Skipping message that could not be read"
                ),
            }
        }
        Ok(messages)
    }

    /// Log out and release the session. Consumes the transport.
    pub async fn close(mut self) -> Result<(), TransportError> {
        match self.session.take() {
            Some(mut session) => session.logout().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Deliverer for Transport {
    async fn deliver(&self, outbound: Outbound<'_>, to: &str) -> Result<(), DeliveryError> {
        let payload = outbound::compose(&outbound, &self.login.username, to)?;
        let used = submission::submit_with_fallback(
            self.deps.submitter.as_ref(),
            &self.route,
            &self.login,
            to,
            &payload,
        )
        .await?;
        tracing::info!(
            account_id = self.account_id,
            message_id = %outbound.message.message_id,
            to,
            method = %used.security,
            "Message forwarded"
        );
        Ok(())
    }
}
