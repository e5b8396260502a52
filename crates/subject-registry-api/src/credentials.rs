use anyhow::{anyhow, Result};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::distributions::Alphanumeric;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use subject_registry_core::{RegistryError, TokenId};

const TOKEN_SECRET_LEN: usize = 40;
const SALT_LEN: usize = 16;

pub(crate) fn hash_password(password: &str) -> Result<String> {
    let mut salt_bytes = [0_u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|err| anyhow!("failed to encode password salt: {err}"))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    Ok(hash.to_string())
}

pub(crate) fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

pub(crate) fn new_token_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_SECRET_LEN)
        .map(char::from)
        .collect()
}

pub(crate) fn token_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Split a presented token into its optional id prefix and secret.
///
/// Tokens are issued as `"{id}|{secret}"`; a bare secret is also accepted.
pub(crate) fn split_token(presented: &str) -> Result<(Option<TokenId>, &str), RegistryError> {
    let presented = presented.trim();
    let (id, secret) = match presented.split_once('|') {
        Some((id, secret)) => {
            let id = id
                .parse::<i64>()
                .map_err(|_| RegistryError::Unauthenticated("malformed access token".to_string()))?;
            (Some(TokenId(id)), secret)
        }
        None => (None, presented),
    };

    if secret.is_empty() {
        return Err(RegistryError::Unauthenticated("malformed access token".to_string()));
    }
    Ok((id, secret))
}
