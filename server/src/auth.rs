use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicI64, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::playback::system_time;

/// Ids below this are reserved.
const USER_ID_BASE: i64 = 1_000_000_000;

/// An authenticated account. Identity is the id alone; two User values with
/// the same id compare equal regardless of the other fields.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub password_hash: String,
}

impl PartialEq for User {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for User {}

impl std::hash::Hash for User {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("no credentials supplied")]
    Missing,
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Error)]
#[error("user name already taken")]
pub struct NameTaken;

/// Verified token contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
}

/// In-memory account store. Records live as long as the process; persistence
/// belongs to an external collaborator.
pub struct UserDirectory {
    users: DashMap<String, User>,
    next_id: AtomicI64,
}

impl UserDirectory {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            next_id: AtomicI64::new(USER_ID_BASE),
        }
    }

    pub fn register(&self, name: &str, password: &str) -> Result<User, NameTaken> {
        match self.users.entry(name.to_string()) {
            Entry::Occupied(_) => Err(NameTaken),
            Entry::Vacant(slot) => {
                let user = User {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    name: name.to_string(),
                    password_hash: hash_password(name, password),
                };
                slot.insert(user.clone());
                tracing::info!("registered user {} ({})", user.name, user.id);
                Ok(user)
            }
        }
    }

    pub fn verify_login(&self, name: &str, password: &str) -> Option<User> {
        let user = self.users.get(name)?;
        if user.password_hash == hash_password(name, password) {
            Some(user.clone())
        } else {
            None
        }
    }

    pub fn by_name(&self, name: &str) -> Option<User> {
        self.users.get(name).map(|u| u.clone())
    }
}

impl Default for UserDirectory {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_password(name: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Issues and verifies signed bearer tokens. The signing secret is random per
/// boot, so every token dies with the process.
pub struct TokenKeeper {
    secret: [u8; 32],
}

impl TokenKeeper {
    pub const DEFAULT_TTL_SECS: i64 = 7 * 24 * 3600;

    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        secret[..16].copy_from_slice(Uuid::new_v4().as_bytes());
        secret[16..].copy_from_slice(Uuid::new_v4().as_bytes());
        Self { secret }
    }

    /// Token layout: `<exp>:<hex sig>:<name>`. The name goes last so it may
    /// itself contain colons.
    pub fn issue(&self, name: &str, ttl_secs: i64) -> String {
        let exp = system_time() as i64 + ttl_secs;
        format!("{exp}:{}:{name}", self.signature(name, exp))
    }

    /// Accepts the raw `Authorization` header value, with or without the
    /// `Bearer ` prefix.
    pub fn verify(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let token = header.map(str::trim).filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        let mut parts = token.splitn(3, ':');
        let (exp, sig, name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(exp), Some(sig), Some(name)) => (exp, sig, name),
            _ => return Err(AuthError::Invalid),
        };
        let exp: i64 = exp.parse().map_err(|_| AuthError::Invalid)?;
        if sig != self.signature(name, exp) {
            return Err(AuthError::Invalid);
        }
        if system_time() as i64 >= exp {
            return Err(AuthError::Expired);
        }
        Ok(Claims {
            sub: name.to_string(),
            exp,
        })
    }

    fn signature(&self, name: &str, exp: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret);
        hasher.update(exp.to_be_bytes());
        hasher.update(name.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Default for TokenKeeper {
    fn default() -> Self {
        Self::new()
    }
}
