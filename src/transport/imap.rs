//! Async IMAP4rev1 client over TLS.
//!
//! Only the commands the dispatcher needs are implemented: LOGIN, NOOP,
//! SELECT, UID SEARCH, UID FETCH and LOGOUT. The session is generic over
//! its stream so it can run against an in-memory peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use rustls_pki_types::ServerName;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::response::{self, FetchedItem, MAX_LITERAL, Status};
use super::{Endpoint, MailboxConnector, MailboxSession};
use crate::error::TransportError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Opens IMAP sessions over implicit TLS, verifying against the webpki roots.
pub struct TlsImapConnector {
    tls: TlsConnector,
}

impl TlsImapConnector {
    pub fn new() -> Result<Self, TransportError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Protocol(format!("TLS setup: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();

        Ok(Self {
            tls: TlsConnector::from(Arc::new(config)),
        })
    }
}

#[async_trait]
impl MailboxConnector for TlsImapConnector {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn MailboxSession>, TransportError> {
        let label = endpoint.to_string();
        let connection_error = |reason: String| TransportError::Connection {
            endpoint: label.clone(),
            reason,
        };

        let tcp = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
        )
        .await
        .map_err(|_| connection_error("connect timed out".into()))?
        .map_err(|e| connection_error(e.to_string()))?;

        let server_name = ServerName::try_from(endpoint.host.clone())
            .map_err(|e| connection_error(format!("invalid server name: {e}")))?;

        let tls = tokio::time::timeout(CONNECT_TIMEOUT, self.tls.connect(server_name, tcp))
            .await
            .map_err(|_| connection_error("TLS handshake timed out".into()))?
            .map_err(|e| connection_error(format!("TLS handshake: {e}")))?;

        let session = ImapSession::handshake(tls, label).await?;
        Ok(Box::new(session))
    }
}

/// One authenticated-or-not IMAP conversation.
pub struct ImapSession<S> {
    stream: BufReader<S>,
    endpoint: String,
    next_tag: u32,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Wrap a connected stream and consume the server greeting.
    pub async fn handshake(stream: S, endpoint: String) -> Result<Self, TransportError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            endpoint,
            next_tag: 1,
        };

        let greeting = tokio::time::timeout(CONNECT_TIMEOUT, session.read_response()).await;
        let greeting = greeting.map_err(|_| session.connection_error("no greeting from server"))??;
        let text = String::from_utf8_lossy(&greeting);
        if text.starts_with("* OK") || text.starts_with("* PREAUTH") {
            tracing::debug!(endpoint = %session.endpoint, "IMAP greeting received");
            Ok(session)
        } else {
            Err(session.connection_error(&format!("unexpected greeting: {}", text.trim_end())))
        }
    }

    fn connection_error(&self, reason: &str) -> TransportError {
        TransportError::Connection {
            endpoint: self.endpoint.clone(),
            reason: reason.to_string(),
        }
    }

    fn io_error(&self, e: std::io::Error) -> TransportError {
        self.connection_error(&e.to_string())
    }

    /// Read one response, inlining any `{n}` literals it announces.
    async fn read_response(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut response = Vec::new();
        loop {
            let start = response.len();
            let read = self
                .stream
                .read_until(b'\n', &mut response)
                .await
                .map_err(|e| self.io_error(e))?;
            if read == 0 {
                return Err(self.connection_error("connection closed by server"));
            }

            match literal_length(&response[start..]) {
                Some(len) if len > MAX_LITERAL => {
                    return Err(TransportError::Protocol(format!(
                        "server announced a {len}-byte literal, limit is {MAX_LITERAL}"
                    )));
                }
                Some(len) => {
                    let from = response.len();
                    response.resize(from + len, 0);
                    self.stream
                        .read_exact(&mut response[from..])
                        .await
                        .map_err(|e| self.io_error(e))?;
                }
                None => return Ok(response),
            }
        }
    }

    /// Send a tagged command and collect untagged responses until completion.
    async fn command(
        &mut self,
        command: &str,
    ) -> Result<(Vec<Vec<u8>>, Status, String), TransportError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let result = tokio::time::timeout(COMMAND_TIMEOUT, self.exchange(&tag, command)).await;
        match result {
            Ok(result) => result,
            Err(_) => Err(self.connection_error("command timed out")),
        }
    }

    async fn exchange(
        &mut self,
        tag: &str,
        command: &str,
    ) -> Result<(Vec<Vec<u8>>, Status, String), TransportError> {
        let line = format!("{tag} {command}\r\n");
        self.stream
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        self.stream
            .get_mut()
            .flush()
            .await
            .map_err(|e| self.io_error(e))?;

        let mut untagged = Vec::new();
        loop {
            let response = self.read_response().await?;
            if let Some((status, text)) = response::tagged_status(&response, tag) {
                return Ok((untagged, status, text));
            }
            untagged.push(response);
        }
    }
}

#[async_trait]
impl<S> MailboxSession for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    async fn login(&mut self, username: &str, password: &SecretString) -> Result<(), TransportError> {
        let auth_error = |reason: String| TransportError::Auth {
            user: username.to_string(),
            reason,
        };
        let user = quote(username).ok_or_else(|| auth_error("username contains a line break".into()))?;
        let pass = quote(password.expose_secret())
            .ok_or_else(|| auth_error("password contains a line break".into()))?;

        let (_, status, text) = self.command(&format!("LOGIN {user} {pass}")).await?;
        match status {
            Status::Ok => {
                tracing::debug!(endpoint = %self.endpoint, user = username, "IMAP login ok");
                Ok(())
            }
            _ => Err(auth_error(text)),
        }
    }

    async fn noop(&mut self) -> Result<(), TransportError> {
        let (_, status, text) = self.command("NOOP").await?;
        match status {
            Status::Ok => Ok(()),
            _ => Err(TransportError::Protocol(format!("NOOP rejected: {text}"))),
        }
    }

    async fn select_inbox(&mut self) -> Result<(), TransportError> {
        let (_, status, text) = self.command("SELECT INBOX").await?;
        match status {
            Status::Ok => Ok(()),
            _ => Err(TransportError::Fetch(format!("SELECT INBOX rejected: {text}"))),
        }
    }

    async fn search_unseen_since(&mut self, since: NaiveDate) -> Result<Vec<u32>, TransportError> {
        let command = format!("UID SEARCH UNSEEN SINCE {}", since.format("%d-%b-%Y"));
        let (untagged, status, text) = self.command(&command).await?;
        match status {
            Status::Ok => Ok(response::parse_search(&untagged)),
            _ => Err(TransportError::Fetch(format!("SEARCH rejected: {text}"))),
        }
    }

    async fn fetch(&mut self, uids: &[u32]) -> Result<Vec<FetchedItem>, TransportError> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let command = format!("UID FETCH {set} (UID INTERNALDATE ENVELOPE BODY[])");
        let (untagged, status, text) = self.command(&command).await?;
        match status {
            Status::Ok => Ok(response::parse_fetch_responses(&untagged)),
            _ => Err(TransportError::Fetch(format!("FETCH rejected: {text}"))),
        }
    }

    async fn logout(&mut self) -> Result<(), TransportError> {
        let result = self.command("LOGOUT").await;
        // The peer may drop the socket right after BYE.
        let _ = self.stream.get_mut().shutdown().await;
        match result {
            Ok((_, Status::Ok, _)) => Ok(()),
            Ok((_, _, text)) => Err(TransportError::Protocol(format!("LOGOUT rejected: {text}"))),
            Err(e) => Err(e),
        }
    }
}

/// `{n}\r\n` at the end of a line announces an n-byte literal.
fn literal_length(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n"))?;
    let line = line.strip_suffix(b"}")?;
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..];
    let digits = digits.strip_suffix(b"+").unwrap_or(digits);
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// IMAP quoted string. `None` if the value cannot be quoted.
fn quote(value: &str) -> Option<String> {
    if value.contains(['\r', '\n']) {
        return None;
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    Some(out)
}
