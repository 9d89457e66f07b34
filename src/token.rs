//! Access tokens.
//!
//! An [`AccessToken`] holds the credentials returned by an authorization
//! server. Register [`hooks::bearer_auth`](crate::hooks::bearer_auth) to send
//! it with every request on a connection.

use std::time::{Duration, SystemTime};

use http::HeaderValue;

/// Token type used when none is set.
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Credentials issued by an authorization server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    access_token: String,
    refresh_token: Option<String>,
    token_type: Option<String>,
    client_id: Option<String>,
    expires_in: Option<Duration>,
    expiration: Option<SystemTime>,
    scopes: Vec<String>,
}

impl AccessToken {
    /// A token with only the access token set.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            token_type: None,
            client_id: None,
            expires_in: None,
            expiration: None,
            scopes: Vec::new(),
        }
    }

    /// The access token.
    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    /// The refresh token, if one was issued.
    pub fn refresh_token(&self) -> Option<&str> {
        self.refresh_token.as_deref()
    }

    /// Set the refresh token.
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// The token type, e.g. `Bearer`.
    pub fn token_type(&self) -> &str {
        self.token_type.as_deref().unwrap_or(DEFAULT_TOKEN_TYPE)
    }

    /// Set the token type.
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    /// The client the token was issued to.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Set the client the token was issued to.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Lifetime of the token as issued.
    pub fn expires_in(&self) -> Option<Duration> {
        self.expires_in
    }

    /// Set the lifetime of the token, counted from now.
    pub fn with_expires_in(self, expires_in: Duration) -> Self {
        self.with_expires_in_from(expires_in, SystemTime::now())
    }

    /// Set the lifetime of the token, counted from `issued`.
    pub fn with_expires_in_from(mut self, expires_in: Duration, issued: SystemTime) -> Self {
        self.expires_in = Some(expires_in);
        self.expiration = issued.checked_add(expires_in);
        self
    }

    /// When the token expires.
    pub fn expiration(&self) -> Option<SystemTime> {
        self.expiration
    }

    /// Set the expiration time directly.
    pub fn with_expiration(mut self, expiration: SystemTime) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// True if the token has an expiration time which has passed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(SystemTime::now())
    }

    /// True if the token has an expiration time at or before `now`.
    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        self.expiration.is_some_and(|expiration| expiration <= now)
    }

    /// Scopes granted to the token.
    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    /// Set the granted scopes.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the granted scopes from a space separated `scope` field.
    pub fn with_scope(self, scope: &str) -> Self {
        self.with_scopes(scope.split_ascii_whitespace())
    }

    /// The value for an `Authorization` header, e.g. `Bearer abc`.
    pub fn authorization(&self) -> Option<HeaderValue> {
        let mut value =
            HeaderValue::try_from(format!("{} {}", self.token_type(), self.access_token)).ok()?;
        value.set_sensitive(true);
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_defaults() {
        let token = AccessToken::new("abc");
        assert_eq!(token.access_token(), "abc");
        assert_eq!(token.token_type(), "Bearer");
        assert!(token.refresh_token().is_none());
        assert!(token.expiration().is_none());
        assert!(!token.is_expired());
        assert!(token.scopes().is_empty());
    }

    #[test]
    fn expiry_is_counted_from_issue() {
        let issued = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let token = AccessToken::new("abc").with_expires_in_from(Duration::from_secs(60), issued);

        assert_eq!(token.expires_in(), Some(Duration::from_secs(60)));
        assert_eq!(
            token.expiration(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_060))
        );
        assert!(!token.is_expired_at(issued + Duration::from_secs(59)));
        assert!(token.is_expired_at(issued + Duration::from_secs(60)));
    }

    #[test]
    fn scope_field_is_split() {
        let token = AccessToken::new("abc").with_scope("profile  email");
        assert_eq!(token.scopes(), ["profile", "email"]);
    }

    #[test]
    fn authorization_header() {
        let token = AccessToken::new("abc").with_token_type("MAC");
        let value = token.authorization().unwrap();
        assert_eq!(value, "MAC abc");
        assert!(value.is_sensitive());

        assert!(AccessToken::new("bad\ntoken").authorization().is_none());
    }
}
