//! SASL-style authentication performed while opening a connection.
//!
//! When a node answers STARTUP with AUTHENTICATE, the connection asks the
//! configured [`AuthenticatorProvider`] for a session and an initial token,
//! then feeds every AUTH_CHALLENGE to [`AuthenticatorSession::evaluate_challenge`]
//! until the node sends AUTH_SUCCESS.

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};

/// Authentication error message, reported back through `ConnectionError`.
pub type AuthError = String;

/// One authentication exchange on one connection.
#[async_trait]
pub trait AuthenticatorSession: Send + Sync {
    /// Handles an AUTH_CHALLENGE. The token is mechanism specific and may be absent.
    ///
    /// Returning `Ok(None)` means the client has nothing more to say; the
    /// connection is treated as ready without another round trip.
    async fn evaluate_challenge(
        &mut self,
        token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError>;

    /// Handles AUTH_SUCCESS, which ends the exchange.
    async fn success(&mut self, token: Option<&[u8]>) -> Result<(), AuthError>;
}

/// Factory of [`AuthenticatorSession`]s, one per opened connection.
///
/// Set it with `SessionBuilder::authenticator_provider`, or use
/// `SessionBuilder::user` to get a [`PlainTextAuthenticator`].
#[async_trait]
pub trait AuthenticatorProvider: Sync + Send {
    /// Returns the initial response sent in the first AUTH_RESPONSE,
    /// along with the session handling the rest of the exchange.
    async fn start_authentication_session(
        &self,
        authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError>;
}

struct PlainTextAuthenticatorSession;

#[async_trait]
impl AuthenticatorSession for PlainTextAuthenticatorSession {
    async fn evaluate_challenge(
        &mut self,
        _token: Option<&[u8]>,
    ) -> Result<Option<Vec<u8>>, AuthError> {
        Err("Challenges are not expected during plain text authentication".to_string())
    }

    async fn success(&mut self, _token: Option<&[u8]>) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Username and password authentication (`PasswordAuthenticator` on the server).
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        PlainTextAuthenticator {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthenticatorProvider for PlainTextAuthenticator {
    async fn start_authentication_session(
        &self,
        _authenticator_name: &str,
    ) -> Result<(Option<Vec<u8>>, Box<dyn AuthenticatorSession>), AuthError> {
        // \0username\0password
        let mut response =
            BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        response.put_u8(0);
        response.put_slice(self.username.as_bytes());
        response.put_u8(0);
        response.put_slice(self.password.as_bytes());

        Ok((
            Some(response.to_vec()),
            Box::new(PlainTextAuthenticatorSession),
        ))
    }
}
