//! Signed token codec (EdDSA / Ed25519).
//!
//! Tokens are compact JWTs. Every token carries `iss`, `iat`, `exp` and an
//! audience *array*; the typed claim struct is flattened next to them. A token
//! is accepted when its signature verifies, its issuer matches, it has not
//! expired and its audience intersects the caller's expected audiences.
//!
//! Verification needs only the public half of the key pair. Tokens are
//! stateless proofs: revocation lives in the session table, not here.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use ed25519_dalek::SigningKey as Ed25519SigningKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use leash_core::{SessionId, UserId};

const ED25519_KEY_LEN: usize = 32;

/// Audience values. Every token leash mints also carries [`audience::SERVICE`].
pub mod audience {
    pub const SERVICE: &str = "leash";
    pub const LOGIN_CALLBACK: &str = "login-callback";
    pub const SESSION: &str = "session";
    pub const CHECKIN: &str = "checkin";
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// Bad signature, wrong issuer or audience, malformed payload.
    #[error("invalid token")]
    Invalid,

    #[error("token expired")]
    Expired,

    #[error("signing key unusable: {0}")]
    Key(String),

    #[error("failed to encode token: {0}")]
    Encode(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidKeyFormat
            | ErrorKind::InvalidEcdsaKey
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::RsaFailedSigning => Self::Key(err.to_string()),
            _ => Self::Invalid,
        }
    }
}

/// Ed25519 key material: a raw 32-byte seed and the public key derived from it.
#[derive(Clone)]
pub struct SigningKeys {
    seed: [u8; ED25519_KEY_LEN],
    public_key: [u8; ED25519_KEY_LEN],
    kid: String,
}

impl core::fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningKeys").field("kid", &self.kid).finish_non_exhaustive()
    }
}

impl SigningKeys {
    pub fn generate() -> Self {
        let mut seed = [0u8; ED25519_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(seed)
    }

    pub fn from_seed(seed: [u8; ED25519_KEY_LEN]) -> Self {
        let public_key = Ed25519SigningKey::from_bytes(&seed).verifying_key().to_bytes();
        // Key id: first 8 bytes of the public key. Not a secret.
        let kid = hex::encode(&public_key[..8]);
        Self {
            seed,
            public_key,
            kid,
        }
    }

    /// Raw private seed. Never log this.
    pub fn seed(&self) -> &[u8; ED25519_KEY_LEN] {
        &self.seed
    }

    pub fn public_key(&self) -> &[u8; ED25519_KEY_LEN] {
        &self.public_key
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

/// Claims as they appear on the wire.
#[derive(Serialize)]
struct OutgoingClaims<'a, C> {
    iss: &'a str,
    iat: i64,
    exp: i64,
    aud: Vec<&'a str>,
    #[serde(flatten)]
    claims: &'a C,
}

#[derive(Deserialize)]
struct IncomingClaims<C> {
    iat: i64,
    exp: i64,
    aud: Vec<String>,
    #[serde(flatten)]
    claims: C,
}

/// A successfully verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified<C> {
    pub claims: C,
    pub audience: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Signs and verifies leash tokens.
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    kid: String,
}

impl core::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    pub fn new(keys: &SigningKeys, issuer: impl Into<String>) -> Result<Self, TokenError> {
        let der = Ed25519SigningKey::from_bytes(keys.seed())
            .to_pkcs8_der()
            .map_err(|e| TokenError::Key(e.to_string()))?;
        let encoding = EncodingKey::from_ed_der(der.as_bytes());
        let decoding = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(keys.public_key()))?;
        Ok(Self {
            encoding,
            decoding,
            issuer: issuer.into(),
            kid: keys.kid().to_string(),
        })
    }

    /// Codec over a fresh per-process key; tokens die with the process.
    pub fn ephemeral(issuer: impl Into<String>) -> Result<Self, TokenError> {
        Self::new(&SigningKeys::generate(), issuer)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Sign `claims` for every audience in `audience`, valid until `expires_at`.
    pub fn sign<C: Serialize>(
        &self,
        claims: &C,
        audience: &[&str],
        expires_at: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let outgoing = OutgoingClaims {
            iss: &self.issuer,
            iat: Utc::now().timestamp(),
            exp: expires_at.timestamp(),
            aud: audience.to_vec(),
            claims,
        };
        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.kid.clone());
        jsonwebtoken::encode(&header, &outgoing, &self.encoding).map_err(|e| TokenError::Encode(e.to_string()))
    }

    /// Verify `token` and decode its claims.
    ///
    /// Succeeds only if the token's audience intersects `expected`.
    pub fn parse<C: DeserializeOwned>(&self, token: &str, expected: &[&str]) -> Result<Verified<C>, TokenError> {
        self.decode(token, expected, true)
    }

    /// Like [`TokenCodec::parse`] but accepts tokens past `exp`.
    ///
    /// Only for revocation paths, where an expired token must still identify
    /// the session it belonged to.
    pub fn parse_ignoring_expiry<C: DeserializeOwned>(
        &self,
        token: &str,
        expected: &[&str],
    ) -> Result<Verified<C>, TokenError> {
        self.decode(token, expected, false)
    }

    fn decode<C: DeserializeOwned>(
        &self,
        token: &str,
        expected: &[&str],
        validate_exp: bool,
    ) -> Result<Verified<C>, TokenError> {
        if expected.is_empty() {
            return Err(TokenError::Invalid);
        }
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_audience(expected);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "aud", "iss"]);
        validation.leeway = 0;
        validation.validate_exp = validate_exp;

        let data = jsonwebtoken::decode::<IncomingClaims<C>>(token, &self.decoding, &validation)?;
        let incoming = data.claims;
        Ok(Verified {
            claims: incoming.claims,
            audience: incoming.aud,
            issued_at: timestamp(incoming.iat)?,
            expires_at: timestamp(incoming.exp)?,
        })
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, TokenError> {
    Utc.timestamp_opt(secs, 0).single().ok_or(TokenError::Invalid)
}

/// Login-callback token: where to send the browser and the caller's
/// anti-forgery value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateClaims {
    #[serde(rename = "return")]
    pub return_to: String,
    pub state: String,
}

/// Session token: the email is the channel of truth for the user lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub email: String,
    pub session: SessionId,
}

/// Short-lived token a member shows at the door.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckinClaims {
    pub sub: String,
}

impl CheckinClaims {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            sub: user_id.to_string(),
        }
    }

    pub fn user_id(&self) -> Result<UserId, TokenError> {
        self.sub.parse().map_err(|_| TokenError::Invalid)
    }
}
