//! Component L - authentication and authorization at the transfer boundary.
//!
//! Secret hashing uses Argon2 (salted) rather than a plain digest, and is
//! independent of PAM/libc availability.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Error};
use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::catalog::models::{ClientCredential, Permission};
use crate::catalog::Catalog;
use crate::error::{TransportError, TransportErrorKind};

pub const TOKEN_LIFETIME: Duration = Duration::from_secs(15 * 60);

pub fn hash_secret(secret: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|err| anyhow::anyhow!("unable to hash secret: {err}"))?;
    Ok(hash.to_string())
}

fn verify_secret(secret: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default().verify_password(secret.as_bytes(), &parsed).is_ok()
}

#[derive(Debug, Clone)]
pub struct BearerToken {
    pub value: String,
    pub client_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// In-memory bearer-token store. Tokens are a connection-scoped convenience
/// on top of the per-request `client_id`/`client_secret` in every
/// `TransferRequest` - losing them on restart is fine, a client
/// just re-authenticates on its next request.
pub struct AuthService {
    tokens: Mutex<HashMap<String, BearerToken>>,
}

impl AuthService {
    pub fn new() -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// Validates `client_id`/`client_secret` against the catalog and, on
    /// success, issues a bearer token valid for `TOKEN_LIFETIME`.
    pub fn authenticate(
        &self,
        catalog: &Catalog,
        client_id: &str,
        client_secret: &str,
    ) -> Result<BearerToken, TransportError> {
        let credential = catalog
            .get_credential(client_id)
            .context("catalog lookup failed")
            .map_err(|err| TransportError::new(TransportErrorKind::Auth, err.to_string()))?;

        let credential = match credential {
            Some(credential) => credential,
            None => {
                log::warn!("authentication rejected: unknown client_id '{client_id}'");
                return Err(TransportError::new(TransportErrorKind::Auth, "unknown client"));
            }
        };

        let now = Utc::now();
        if !credential.is_active || credential.is_expired(now) {
            log::warn!("authentication rejected: client '{client_id}' inactive or expired");
            return Err(TransportError::new(TransportErrorKind::Auth, "credential inactive or expired"));
        }

        if !verify_secret(client_secret, &credential.secret_hash) {
            log::warn!("authentication rejected: bad secret for client '{client_id}'");
            return Err(TransportError::new(TransportErrorKind::Auth, "invalid credentials"));
        }

        let token = BearerToken {
            value: random_token(),
            client_id: client_id.to_owned(),
            issued_at: now,
            expires_at: now + chrono::Duration::from_std(TOKEN_LIFETIME).unwrap(),
        };
        self.tokens.lock().unwrap().insert(token.value.clone(), token.clone());
        log::info!("authentication succeeded for client '{client_id}'");
        Ok(token)
    }

    /// Operation-keyed authorization check: a
    /// `SYSTEM_ADMIN` permission grants all operations.
    pub fn authorize(&self, credential: &ClientCredential, required: Permission) -> Result<(), TransportError> {
        let allowed = credential.authorized_for(required);
        log::info!(
            "authorization {} for client '{}': required={:?}",
            if allowed { "granted" } else { "denied" },
            credential.client_id,
            required
        );
        if allowed {
            Ok(())
        } else {
            Err(TransportError::new(TransportErrorKind::Auth, "insufficient permission"))
        }
    }
}

impl Default for AuthService {
    fn default() -> Self {
        Self::new()
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::encode(bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::models::ClientCredential;

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_secret("correct horse battery staple").unwrap();
        assert!(verify_secret("correct horse battery staple", &hash));
        assert!(!verify_secret("wrong", &hash));
    }

    #[test]
    fn authenticate_rejects_inactive_credential() {
        let catalog = Catalog::open_in_memory().unwrap();
        let hash = hash_secret("s3cret").unwrap();
        catalog
            .upsert_credential(&ClientCredential {
                client_id: "client-a".into(),
                secret_hash: hash,
                permissions: Permission::TRANSFER_UPLOAD,
                is_active: false,
                expires_at: None,
            })
            .unwrap();

        let auth = AuthService::new();
        let result = auth.authenticate(&catalog, "client-a", "s3cret");
        assert!(result.is_err());
    }

    #[test]
    fn system_admin_is_authorized_for_everything() {
        let auth = AuthService::new();
        let credential = ClientCredential {
            client_id: "admin".into(),
            secret_hash: String::new(),
            permissions: Permission::SYSTEM_ADMIN,
            is_active: true,
            expires_at: None,
        };
        assert!(auth.authorize(&credential, Permission::TRANSFER_RESUME).is_ok());
    }
}
