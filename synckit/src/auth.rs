//! Identity validation and document-level authorization.
//!
//! Two credential kinds arrive in an `auth` frame: an HS256 bearer token
//! or a shared API key from a configured allow-list. Either yields a
//! [`Principal`] bound to the connection for its lifetime. Per-operation
//! checks go through [`Principal::can_read`] / [`Principal::can_write`];
//! `is_admin` overrides both sets.
//!
//! Validation failures are detailed internally ([`AuthError`]) but the
//! wire only ever sees `auth_failed`.

use std::collections::{BTreeSet, HashSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HMAC secrets below 128 bits never validate anything.
const MIN_SECRET_BYTES: usize = 16;

/// User id assigned to API-key callers.
pub const API_KEY_USER_ID: &str = "api-key-user";

/// Document-level permission sets. `is_admin` overrides both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permissions {
    #[serde(default)]
    pub can_read: BTreeSet<String>,
    #[serde(default)]
    pub can_write: BTreeSet<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl Permissions {
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Default::default()
        }
    }
}

/// Authenticated identity bound to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub email: Option<String>,
    pub permissions: Permissions,
}

impl Principal {
    /// Synthetic admin used when authentication is disabled.
    pub fn anonymous_admin() -> Self {
        Self {
            user_id: "anonymous".to_string(),
            email: None,
            permissions: Permissions::admin(),
        }
    }

    /// Synthetic admin yielded by a matching API key.
    pub fn api_key_user() -> Self {
        Self {
            user_id: API_KEY_USER_ID.to_string(),
            email: None,
            permissions: Permissions::admin(),
        }
    }

    /// Read access to `document_id`. Empty ids are always denied;
    /// comparison is exact and case-sensitive.
    pub fn can_read(&self, document_id: &str) -> bool {
        if document_id.is_empty() {
            return false;
        }
        self.permissions.is_admin || self.permissions.can_read.contains(document_id)
    }

    /// Write access to `document_id`.
    pub fn can_write(&self, document_id: &str) -> bool {
        if document_id.is_empty() {
            return false;
        }
        self.permissions.is_admin || self.permissions.can_write.contains(document_id)
    }

    /// The permission set as it appears in `auth_success`.
    pub fn permissions_value(&self) -> Value {
        serde_json::to_value(&self.permissions).unwrap_or(Value::Null)
    }
}

/// A credential extracted from an `auth` frame.
#[derive(Debug, Clone)]
pub enum Credential {
    Token(String),
    ApiKey(String),
}

impl Credential {
    /// An `auth` frame must carry exactly one credential.
    pub fn from_fields(
        token: Option<String>,
        api_key: Option<String>,
    ) -> Result<Self, AuthError> {
        match (token, api_key) {
            (Some(token), None) => Ok(Credential::Token(token)),
            (None, Some(key)) => Ok(Credential::ApiKey(key)),
            (Some(_), Some(_)) => Err(AuthError::AmbiguousCredential),
            (None, None) => Err(AuthError::MissingCredential),
        }
    }
}

/// JWT claims: `sub`, `email?`, `permissions`, `iat`/`exp` in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub permissions: Permissions,
    pub iat: u64,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

/// Authentication failures. Logged with full detail; the wire reply is
/// always the generic `auth_failed`.
#[derive(Debug, Clone)]
pub enum AuthError {
    InvalidSignature,
    Expired,
    MissingClaim(String),
    WrongIssuer,
    WrongAudience,
    UnknownApiKey,
    MalformedToken(String),
    /// Secret shorter than 128 bits: accepted at construction, every
    /// validation fails.
    WeakSecret,
    AmbiguousCredential,
    MissingCredential,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidSignature => write!(f, "invalid token signature"),
            AuthError::Expired => write!(f, "token expired"),
            AuthError::MissingClaim(c) => write!(f, "missing or malformed claim: {c}"),
            AuthError::WrongIssuer => write!(f, "issuer mismatch"),
            AuthError::WrongAudience => write!(f, "audience mismatch"),
            AuthError::UnknownApiKey => write!(f, "unknown API key"),
            AuthError::MalformedToken(e) => write!(f, "malformed token: {e}"),
            AuthError::WeakSecret => write!(f, "signing secret below 128 bits"),
            AuthError::AmbiguousCredential => {
                write!(f, "auth carried both a token and an API key")
            }
            AuthError::MissingCredential => write!(f, "auth carried no credential"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::InvalidSignature => AuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => AuthError::Expired,
            ErrorKind::InvalidIssuer => AuthError::WrongIssuer,
            ErrorKind::InvalidAudience => AuthError::WrongAudience,
            ErrorKind::MissingRequiredClaim(c) => AuthError::MissingClaim(c.clone()),
            ErrorKind::Json(err) => AuthError::MissingClaim(err.to_string()),
            other => AuthError::MalformedToken(format!("{other:?}")),
        }
    }
}

/// Validates credentials and yields principals.
///
/// The hub consumes this trait; the stock implementation is
/// [`HmacIdentityProvider`].
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, credential: &Credential) -> Result<Principal, AuthError>;
}

/// HS256 token validation plus a shared API-key allow-list.
pub struct HmacIdentityProvider {
    secret: Vec<u8>,
    issuer: Option<String>,
    audience: Option<String>,
    api_keys: HashSet<String>,
}

impl HmacIdentityProvider {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        issuer: Option<String>,
        audience: Option<String>,
        api_keys: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            secret: secret.into(),
            issuer,
            audience,
            api_keys: api_keys.into_iter().collect(),
        }
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        if let Some(iss) = &self.issuer {
            validation.set_issuer(&[iss]);
        }
        if let Some(aud) = &self.audience {
            validation.set_audience(&[aud]);
        } else {
            validation.validate_aud = false;
        }
        validation
    }

    fn validate_token(&self, token: &str) -> Result<Principal, AuthError> {
        if self.secret.len() < MIN_SECRET_BYTES {
            return Err(AuthError::WeakSecret);
        }
        let data = decode::<TokenClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &self.validation(),
        )?;
        Ok(Principal {
            user_id: data.claims.sub,
            email: data.claims.email,
            permissions: data.claims.permissions,
        })
    }

    fn validate_api_key(&self, key: &str) -> Result<Principal, AuthError> {
        if self.api_keys.contains(key) {
            Ok(Principal::api_key_user())
        } else {
            Err(AuthError::UnknownApiKey)
        }
    }

    /// Sign a token for `principal`, expiring after `ttl`.
    ///
    /// The hub itself only validates; this exists for operators and
    /// tests that need a counterpart to [`Self::authenticate`].
    pub fn issue_token(
        &self,
        principal: &Principal,
        ttl: Duration,
    ) -> Result<String, AuthError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = TokenClaims {
            sub: principal.user_id.clone(),
            email: principal.email.clone(),
            permissions: principal.permissions.clone(),
            iat: now,
            exp: now + ttl.as_secs(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(AuthError::from)
    }

    /// Sign arbitrary claims. Test hook for expiry and claim-shape cases.
    pub fn issue_raw(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(AuthError::from)
    }
}

#[async_trait]
impl IdentityProvider for HmacIdentityProvider {
    async fn authenticate(&self, credential: &Credential) -> Result<Principal, AuthError> {
        match credential {
            Credential::Token(token) => self.validate_token(token),
            Credential::ApiKey(key) => self.validate_api_key(key),
        }
    }
}
