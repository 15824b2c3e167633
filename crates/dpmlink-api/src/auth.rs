// Settings authentication.
//
// Enabling settings takes two exchanges on a connected session: an identity
// exchange that yields the service name and a challenge, and an
// enable-settings request carrying a token signed by the injected
// credential provider. A session that fails either step is poisoned and
// must be discarded.

use std::fmt;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretSlice};
use tokio::time::Instant;

use crate::error::Error;
use crate::message::{LIST_INDEX, Message};
use crate::session::{AuthState, Session, Stray};

/// Opaque signed token produced by a [`CredentialProvider`].
pub struct SignedToken(SecretSlice<u8>);

impl SignedToken {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(SecretSlice::from(bytes))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.expose_secret()
    }
}

impl fmt::Debug for SignedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignedToken([REDACTED])")
    }
}

/// Source of credential material for the settings handshake.
///
/// Implementations may block (e.g. a ticket cache lookup); `sign` always
/// runs on the blocking thread pool.
pub trait CredentialProvider: Send + Sync + fmt::Debug {
    /// Principal the credentials belong to.
    fn principal(&self) -> &str;

    /// Produce the token answering `challenge` from `service`.
    fn sign(&self, service: &str, challenge: &[u8]) -> Result<SignedToken, Error>;
}

/// Credentials backed by a pre-provisioned token that is sent as-is
/// regardless of the challenge.
pub struct StaticCredentials {
    principal: String,
    token: SecretSlice<u8>,
}

impl StaticCredentials {
    pub fn new(principal: impl Into<String>, token: impl Into<Vec<u8>>) -> Self {
        Self {
            principal: principal.into(),
            token: SecretSlice::from(token.into()),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

impl CredentialProvider for StaticCredentials {
    fn principal(&self) -> &str {
        &self.principal
    }

    fn sign(&self, _service: &str, _challenge: &[u8]) -> Result<SignedToken, Error> {
        let token = self.token.expose_secret();
        if token.is_empty() {
            return Err(Error::Authentication {
                message: format!("no token provisioned for {}", self.principal),
            });
        }
        Ok(SignedToken::new(token.to_vec()))
    }
}

/// Run the settings handshake on `session`, leaving it `SettingsEnabled`.
///
/// Valid only on a fresh (`Idle`) session; the handshake runs at most once
/// per session lifetime.
pub async fn authenticate(
    session: &mut Session,
    credentials: Arc<dyn CredentialProvider>,
    deadline: Instant,
) -> Result<(), Error> {
    session.advance_auth(AuthState::Authenticating)?;
    let principal = credentials.principal().to_owned();
    match handshake(session, credentials, deadline).await {
        Ok(()) => {
            tracing::info!(session = session.id(), %principal, "settings enabled");
            Ok(())
        }
        Err(e) => {
            tracing::debug!(
                session = session.id(),
                %principal,
                error = %e,
                "authentication failed"
            );
            session.poison();
            // Transport failures and timeouts keep their own kind.
            Err(match e {
                Error::Protocol { .. } | Error::Rejected { .. } | Error::InvalidState(_) => {
                    Error::Authentication {
                        message: e.to_string(),
                    }
                }
                other => other,
            })
        }
    }
}

async fn handshake(
    session: &mut Session,
    credentials: Arc<dyn CredentialProvider>,
    deadline: Instant,
) -> Result<(), Error> {
    // ── Identity exchange ──
    session
        .send(Message::Authenticate { token: Vec::new() }, deadline)
        .await?;
    let (service, challenge) = match session.recv(deadline).await? {
        Message::AuthReply { service, challenge } => (service, challenge),
        other => {
            return Err(Error::protocol(format!(
                "expected AuthReply, got {}",
                other.name()
            )));
        }
    };
    tracing::debug!(session = session.id(), %service, "identity exchange complete");

    let token = tokio::task::spawn_blocking(move || credentials.sign(&service, &challenge))
        .await
        .map_err(|e| Error::Authentication {
            message: format!("credential provider failed: {e}"),
        })??;
    session.advance_auth(AuthState::Authenticated)?;

    // ── Enable settings ──
    session
        .send(
            Message::EnableSettings {
                token: token.expose().to_vec(),
            },
            deadline,
        )
        .await?;
    let status = session.await_status(LIST_INDEX, deadline, Stray::Reject).await?;
    if !status.is_ok() {
        return Err(Error::Authentication {
            message: format!("enable settings refused: {status}"),
        });
    }
    session.advance_auth(AuthState::SettingsEnabled)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn static_credentials_return_the_provisioned_token() {
        let creds = StaticCredentials::new("operator@FNAL.GOV", b"ticket".to_vec());
        assert_eq!(creds.principal(), "operator@FNAL.GOV");
        let token = creds.sign("daeset", b"challenge").unwrap();
        assert_eq!(token.expose(), b"ticket");
    }

    #[test]
    fn empty_token_is_an_authentication_error() {
        let creds = StaticCredentials::new("nobody", Vec::new());
        let err = creds.sign("daeset", &[]).unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let creds = StaticCredentials::new("op", b"s3cret".to_vec());
        assert!(!format!("{creds:?}").contains("s3cret"));
        let token = SignedToken::new(b"s3cret".to_vec());
        assert!(!format!("{token:?}").contains("s3cret"));
    }
}
