//! Outbound submission: endpoint lookup, the fallback chain, and the
//! lettre-backed submitter.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lettre::address::Envelope;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{Address, AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use secrecy::{ExposeSecret, SecretString};

use crate::error::DeliveryError;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Port that gets a STARTTLS attempt.
pub const STARTTLS_PORT: u16 = 587;
/// Implicit-TLS submission port.
pub const IMPLICIT_TLS_PORT: u16 = 465;
/// Unencrypted last-resort port.
pub const PLAIN_PORT: u16 = 25;

/// Known providers whose submission host can't be derived from the
/// retrieval host. Matched against the end of the retrieval host.
const PROVIDERS: &[(&str, &str, u16)] = &[
    ("qq.com", "smtp.qq.com", 587),
    ("gmail.com", "smtp.gmail.com", 587),
    ("163.com", "smtp.163.com", 25),
    ("126.com", "smtp.126.com", 25),
];

/// Where a forwarding account submits outbound mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRoute {
    pub host: String,
    pub port: u16,
}

/// Derive the submission route from a retrieval server string
/// (`host` or `host:port`).
pub fn route_for(server: &str) -> SubmissionRoute {
    let host = strip_port(server.trim()).to_ascii_lowercase();

    for (suffix, smtp_host, port) in PROVIDERS {
        if host == *suffix || host.ends_with(&format!(".{suffix}")) {
            return SubmissionRoute {
                host: (*smtp_host).to_string(),
                port: *port,
            };
        }
    }

    let host = match host.strip_prefix("imap.") {
        Some(rest) => format!("smtp.{rest}"),
        None => host,
    };
    SubmissionRoute {
        host,
        port: STARTTLS_PORT,
    }
}

fn strip_port(server: &str) -> &str {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => host,
        _ => server,
    }
}

/// Channel security for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    StartTls,
    ImplicitTls,
    Plain,
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::StartTls => "STARTTLS",
            Self::ImplicitTls => "TLS",
            Self::Plain => "plain",
        })
    }
}

/// One step of the fallback chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionAttempt {
    pub host: String,
    pub port: u16,
    pub security: Security,
}

impl SubmissionAttempt {
    /// The plaintext fallback never authenticates.
    pub fn authenticates(&self) -> bool {
        self.security != Security::Plain
    }
}

/// The ordered fallback chain for a route.
pub fn plan_attempts(route: &SubmissionRoute) -> Vec<SubmissionAttempt> {
    let mut attempts = Vec::with_capacity(3);
    if route.port == STARTTLS_PORT {
        attempts.push(SubmissionAttempt {
            host: route.host.clone(),
            port: STARTTLS_PORT,
            security: Security::StartTls,
        });
    }
    attempts.push(SubmissionAttempt {
        host: route.host.clone(),
        port: IMPLICIT_TLS_PORT,
        security: Security::ImplicitTls,
    });
    attempts.push(SubmissionAttempt {
        host: route.host.clone(),
        port: PLAIN_PORT,
        security: Security::Plain,
    });
    attempts
}

/// Credentials for authenticated submission.
#[derive(Clone)]
pub struct SmtpLogin {
    pub username: String,
    pub password: SecretString,
}

impl fmt::Debug for SmtpLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpLogin")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Performs a single submission attempt.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn submit(
        &self,
        attempt: &SubmissionAttempt,
        login: Option<&SmtpLogin>,
        from: &str,
        to: &str,
        payload: &[u8],
    ) -> Result<(), DeliveryError>;
}

/// Walk the fallback chain until one attempt succeeds.
///
/// Returns the attempt that delivered.
pub async fn submit_with_fallback(
    submitter: &dyn Submitter,
    route: &SubmissionRoute,
    login: &SmtpLogin,
    to: &str,
    payload: &[u8],
) -> Result<SubmissionAttempt, DeliveryError> {
    let mut failures = Vec::new();

    for attempt in plan_attempts(route) {
        let credentials = attempt.authenticates().then_some(login);
        match submitter
            .submit(&attempt, credentials, &login.username, to, payload)
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    host = %attempt.host,
                    port = attempt.port,
                    method = %attempt.security,
                    to,
                    "Submission accepted"
                );
                return Ok(attempt);
            }
            Err(e) => {
                tracing::warn!(
                    host = %attempt.host,
                    port = attempt.port,
                    method = %attempt.security,
                    error = %e,
                    "Submission attempt failed"
                );
                failures.push(format!("{}: {e}", attempt.security));
            }
        }
    }

    Err(DeliveryError::AllMethodsFailed { attempts: failures })
}

/// Submits through lettre's async SMTP transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct LettreSubmitter;

impl LettreSubmitter {
    fn transport(
        attempt: &SubmissionAttempt,
        login: Option<&SmtpLogin>,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let build_error = |e: lettre::transport::smtp::Error| DeliveryError::Attempt {
            method: attempt.security.to_string(),
            host: attempt.host.clone(),
            port: attempt.port,
            reason: e.to_string(),
        };

        let builder = match attempt.security {
            Security::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&attempt.host).map_err(build_error)?
            }
            Security::ImplicitTls => {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&attempt.host).map_err(build_error)?
            }
            Security::Plain => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&attempt.host),
        };

        let mut builder = builder.port(attempt.port).timeout(Some(SUBMIT_TIMEOUT));
        if let Some(login) = login {
            builder = builder
                .credentials(Credentials::new(
                    login.username.clone(),
                    login.password.expose_secret().to_string(),
                ))
                .authentication(vec![Mechanism::Plain]);
        }
        Ok(builder.build())
    }
}

#[async_trait]
impl Submitter for LettreSubmitter {
    async fn submit(
        &self,
        attempt: &SubmissionAttempt,
        login: Option<&SmtpLogin>,
        from: &str,
        to: &str,
        payload: &[u8],
    ) -> Result<(), DeliveryError> {
        let from_addr: Address = from.parse().map_err(|e| DeliveryError::InvalidAddress {
            address: from.to_string(),
            reason: format!("{e}"),
        })?;
        let to_addr: Address = to.parse().map_err(|e| DeliveryError::InvalidAddress {
            address: to.to_string(),
            reason: format!("{e}"),
        })?;
        let envelope = Envelope::new(Some(from_addr), vec![to_addr])
            .map_err(|e| DeliveryError::Build(format!("Failed to build transport: {e}")))?;

        let transport = Self::transport(attempt, login)?;
        transport
            .send_raw(&envelope, payload)
            .await
            .map_err(|e| DeliveryError::Attempt {
                method: attempt.security.to_string(),
                host: attempt.host.clone(),
                port: attempt.port,
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn known_providers() {
        assert_eq!(
            route_for("imap.qq.com:993"),
            SubmissionRoute { host: "smtp.qq.com".into(), port: 587 }
        );
        assert_eq!(route_for("imap.gmail.com").host, "smtp.gmail.com");
        assert_eq!(
            route_for("imap.163.com"),
            SubmissionRoute { host: "smtp.163.com".into(), port: 25 }
        );
        assert_eq!(route_for("IMAP.126.COM:993").port, 25);
    }

    #[test]
    fn suffix_must_match_on_label_boundary() {
        // "notqq.com" is not qq.com
        assert_eq!(
            route_for("imap.notqq.com"),
            SubmissionRoute { host: "smtp.notqq.com".into(), port: 587 }
        );
    }

    #[test]
    fn generic_fallback_strips_port_and_swaps_prefix() {
        assert_eq!(
            route_for("imap.example.org:993"),
            SubmissionRoute { host: "smtp.example.org".into(), port: 587 }
        );
        assert_eq!(route_for("mail.example.org").host, "mail.example.org");
    }

    #[test]
    fn chain_for_starttls_port() {
        let plan = plan_attempts(&SubmissionRoute { host: "smtp.x.com".into(), port: 587 });
        let steps: Vec<(u16, Security)> = plan.iter().map(|a| (a.port, a.security)).collect();
        assert_eq!(
            steps,
            vec![
                (587, Security::StartTls),
                (465, Security::ImplicitTls),
                (25, Security::Plain),
            ]
        );
        assert!(!plan[2].authenticates());
    }

    #[test]
    fn chain_skips_starttls_for_other_ports() {
        let plan = plan_attempts(&SubmissionRoute { host: "smtp.163.com".into(), port: 25 });
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].security, Security::ImplicitTls);
    }

    /// Fails the listed methods, records every call.
    struct ScriptedSubmitter {
        fail: Vec<Security>,
        calls: Mutex<Vec<(Security, bool)>>,
    }

    #[async_trait]
    impl Submitter for ScriptedSubmitter {
        async fn submit(
            &self,
            attempt: &SubmissionAttempt,
            login: Option<&SmtpLogin>,
            _from: &str,
            _to: &str,
            _payload: &[u8],
        ) -> Result<(), DeliveryError> {
            self.calls.lock().unwrap().push((attempt.security, login.is_some()));
            if self.fail.contains(&attempt.security) {
                Err(DeliveryError::Attempt {
                    method: attempt.security.to_string(),
                    host: attempt.host.clone(),
                    port: attempt.port,
                    reason: "refused".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn login() -> SmtpLogin {
        SmtpLogin {
            username: "bot@x.com".into(),
            password: SecretString::from("pw".to_string()),
        }
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let submitter = ScriptedSubmitter {
            fail: vec![Security::StartTls],
            calls: Mutex::new(Vec::new()),
        };
        let route = SubmissionRoute { host: "smtp.x.com".into(), port: 587 };
        let used = submit_with_fallback(&submitter, &route, &login(), "t@x.com", b"hi")
            .await
            .unwrap();
        assert_eq!(used.security, Security::ImplicitTls);
        assert_eq!(
            *submitter.calls.lock().unwrap(),
            vec![(Security::StartTls, true), (Security::ImplicitTls, true)]
        );
    }

    #[tokio::test]
    async fn plaintext_fallback_skips_auth() {
        let submitter = ScriptedSubmitter {
            fail: vec![Security::StartTls, Security::ImplicitTls],
            calls: Mutex::new(Vec::new()),
        };
        let route = SubmissionRoute { host: "smtp.x.com".into(), port: 587 };
        submit_with_fallback(&submitter, &route, &login(), "t@x.com", b"hi")
            .await
            .unwrap();
        assert_eq!(submitter.calls.lock().unwrap().last(), Some(&(Security::Plain, false)));
    }

    #[tokio::test]
    async fn exhausted_chain_reports_every_attempt() {
        let submitter = ScriptedSubmitter {
            fail: vec![Security::StartTls, Security::ImplicitTls, Security::Plain],
            calls: Mutex::new(Vec::new()),
        };
        let route = SubmissionRoute { host: "smtp.x.com".into(), port: 587 };
        let err = submit_with_fallback(&submitter, &route, &login(), "t@x.com", b"hi")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "all delivery methods failed");
        let DeliveryError::AllMethodsFailed { attempts } = err else {
            panic!("expected AllMethodsFailed");
        };
        assert_eq!(attempts.len(), 3);
        assert!(attempts[0].starts_with("STARTTLS: "));
    }

    #[tokio::test]
    async fn invalid_recipient_fails_before_connecting() {
        let attempt = SubmissionAttempt {
            host: "127.0.0.1".into(),
            port: 1,
            security: Security::Plain,
        };
        let err = LettreSubmitter
            .submit(&attempt, None, "bot@x.com", "not an address", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidAddress { .. }));
    }
}
