//! Authentication domain models.
//!
//! Claims, bearer credentials and the small value types the session
//! service hands back to callers.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// JWT claims embedded in bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: user id (standard JWT `sub` claim).
    pub sub: String,
    /// Username, when the user has one.
    pub name: Option<String>,
    /// Member of the admin group.
    pub admin: bool,
    /// e.g. `["authenticated", "group:admin", "user:1"]`.
    pub principals: Vec<String>,
    /// Audience.
    pub aud: String,
    /// Expiry (unix timestamp).
    pub exp: i64,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Issued at, in microseconds since the epoch. `iat` alone cannot order
    /// a token against a password change made within the same second.
    #[serde(default)]
    pub iat_us: i64,
}

impl TokenClaims {
    /// Issue instant, at microsecond precision when the token carries it.
    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        if self.iat_us > 0 {
            DateTime::from_timestamp_micros(self.iat_us)
        } else {
            DateTime::from_timestamp(self.iat, 0)
        }
    }
}

/// Signed bearer credential returned by a successful login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerToken {
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Lifetime in seconds.
    pub expires_in: i64,
    pub user_id: i64,
    pub principals: Vec<String>,
}

impl BearerToken {
    /// Value for the `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

/// Where a login came from. Recorded on the `Login` event and in the
/// user's login telemetry.
#[derive(Debug, Clone, Default)]
pub struct LoginContext {
    /// e.g. `login_form`, `email`, `google`, `authorization_code`.
    pub source: String,
    pub client_ip: Option<IpAddr>,
}

impl LoginContext {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            client_ip: None,
        }
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

/// Result of logout: the caller replaces the `Authorization` header with an
/// empty value. No server-side session exists to destroy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogoutSignal {
    pub authorization: String,
}

/// Where to send the user after an authorization code was minted.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationRedirect {
    pub redirect_uri: String,
    pub code: String,
    pub client_id: String,
    pub expires_in: i64,
}

impl AuthorizationRedirect {
    /// `redirect_uri` with `code` and `client_id` appended as query
    /// parameters. The code is URL-safe by construction.
    pub fn location(&self) -> String {
        let separator = if self.redirect_uri.contains('?') { '&' } else { '?' };
        format!(
            "{}{}code={}&client_id={}",
            self.redirect_uri, separator, self.code, self.client_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_header_uses_bearer_scheme() {
        let token = BearerToken {
            access_token: "abc".into(),
            token_type: "Bearer".into(),
            expires_in: 60,
            user_id: 1,
            principals: vec![],
        };
        assert_eq!(token.authorization_header(), "Bearer abc");
    }

    #[test]
    fn redirect_location_appends_query() {
        let redirect = AuthorizationRedirect {
            redirect_uri: "https://app.example.com/cb".into(),
            code: "c0de".into(),
            client_id: "web".into(),
            expires_in: 300,
        };
        assert_eq!(
            redirect.location(),
            "https://app.example.com/cb?code=c0de&client_id=web"
        );

        let with_query = AuthorizationRedirect {
            redirect_uri: "https://app.example.com/cb?x=1".into(),
            ..redirect
        };
        assert!(with_query.location().contains("?x=1&code=c0de"));
    }

    fn claims(iat: i64, iat_us: i64) -> TokenClaims {
        TokenClaims {
            sub: "1".into(),
            name: None,
            admin: false,
            principals: vec![],
            aud: "localhost".into(),
            exp: iat + 60,
            iat,
            iat_us,
        }
    }

    #[test]
    fn issued_at_prefers_microseconds() {
        let precise = claims(1_700_000_000, 1_700_000_000_250_000);
        assert_eq!(
            precise.issued_at().unwrap().timestamp_micros(),
            1_700_000_000_250_000
        );
        let coarse = claims(1_700_000_000, 0);
        assert_eq!(coarse.issued_at().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn logout_clears_authorization() {
        assert_eq!(LogoutSignal::default().authorization, "");
    }
}
