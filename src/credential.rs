// src/credential.rs
//! Device bearer tokens: compact JWS with `alg = EdDSA`.
//!
//! Tokens are signed with an Ed25519 seed and verified with the matching
//! public key only, so a replica holding just the public key can
//! authenticate requests. Verification never touches the store.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD as B64, engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

pub const ALGORITHM: &str = "EdDSA";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    #[error("credential expired")]
    Expired,
    #[error("credential malformed")]
    Malformed,
    #[error("no signing key loaded")]
    SigningUnavailable,
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("{0} is not base64")]
    Encoding(String),
    #[error("{0} must hold 32 key bytes")]
    Length(String),
    #[error("invalid public key: {0}")]
    Invalid(String),
    #[error("public key does not match private key")]
    Mismatch,
}

#[derive(Serialize, Deserialize)]
struct Header {
    alg: String,
    typ: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

#[derive(Clone)]
pub struct Credentials {
    signing: Option<SigningKey>,
    verifying: VerifyingKey,
    ttl: Duration,
}

impl Credentials {
    pub fn from_seed(seed: [u8; 32], ttl: Duration) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        Self {
            verifying: signing.verifying_key(),
            signing: Some(signing),
            ttl,
        }
    }

    pub fn verifier_only(verifying: VerifyingKey, ttl: Duration) -> Self {
        Self {
            signing: None,
            verifying,
            ttl,
        }
    }

    /// Load base64 key files. Without a private key the instance can only verify.
    pub fn load(private: Option<&Path>, public: &Path, ttl: Duration) -> Result<Self, KeyError> {
        let verifying = VerifyingKey::from_bytes(&read_key(public)?)
            .map_err(|e| KeyError::Invalid(e.to_string()))?;
        let Some(private) = private else {
            return Ok(Self::verifier_only(verifying, ttl));
        };
        let creds = Self::from_seed(read_key(private)?, ttl);
        if creds.verifying != verifying {
            return Err(KeyError::Mismatch);
        }
        Ok(creds)
    }

    pub fn can_issue(&self) -> bool {
        self.signing.is_some()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, device_id: &str) -> Result<String, CredentialError> {
        self.issue_at(device_id, Utc::now())
    }

    pub fn issue_at(&self, device_id: &str, now: DateTime<Utc>) -> Result<String, CredentialError> {
        let signing = self.signing.as_ref().ok_or(CredentialError::SigningUnavailable)?;
        let header = Header {
            alg: ALGORITHM.into(),
            typ: "JWT".into(),
        };
        let claims = Claims {
            sub: device_id.to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let signing_input = format!("{}.{}", encode_json(&header)?, encode_json(&claims)?);
        let sig = signing.sign(signing_input.as_bytes());
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig.to_bytes())))
    }

    pub fn verify(&self, token: &str) -> Result<String, CredentialError> {
        self.verify_at(token, Utc::now())
    }

    pub fn verify_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, CredentialError> {
        let (signing_input, sig) = token.rsplit_once('.').ok_or(CredentialError::Malformed)?;
        let (header, claims) = signing_input
            .split_once('.')
            .filter(|(_, claims)| !claims.contains('.'))
            .ok_or(CredentialError::Malformed)?;

        let header: Header = decode_json(header)?;
        if header.alg != ALGORITHM {
            return Err(CredentialError::Malformed);
        }

        let sig = URL_SAFE_NO_PAD.decode(sig).map_err(|_| CredentialError::Malformed)?;
        let sig = Signature::from_slice(&sig).map_err(|_| CredentialError::Malformed)?;
        self.verifying
            .verify(signing_input.as_bytes(), &sig)
            .map_err(|_| CredentialError::Malformed)?;

        let claims: Claims = decode_json(claims)?;
        if now.timestamp() >= claims.exp {
            return Err(CredentialError::Expired);
        }
        if claims.sub.is_empty() {
            return Err(CredentialError::Malformed);
        }
        Ok(claims.sub)
    }
}

fn encode_json<T: Serialize>(value: &T) -> Result<String, CredentialError> {
    let json = serde_json::to_vec(value).map_err(|_| CredentialError::Malformed)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

fn decode_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, CredentialError> {
    let bytes = URL_SAFE_NO_PAD.decode(segment).map_err(|_| CredentialError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| CredentialError::Malformed)
}

fn read_key(path: &Path) -> Result<[u8; 32], KeyError> {
    let name = path.display().to_string();
    let text = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: name.clone(),
        source,
    })?;
    let bytes = B64
        .decode(text.trim())
        .map_err(|_| KeyError::Encoding(name.clone()))?;
    bytes.try_into().map_err(|_| KeyError::Length(name))
}
