//! Session and user collaborators.
//!
//! A session keyed by MAC is the only record of who is logged in; the
//! firewall follows it, never the other way round.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};

use hotgate_net::MacAddr;

use crate::error::{PortalError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub device_mac: MacAddr,
    pub username: String,
    pub client_ip: Option<Ipv4Addr>,
    pub created_at: DateTime<Utc>,
}

pub trait SessionStore: Send + Sync {
    fn is_active_session(&self, mac: MacAddr) -> bool;

    /// Creates or replaces the session for `mac`.
    fn create_session(&self, mac: MacAddr, client_ip: Option<Ipv4Addr>, username: &str) -> Session;

    /// Removes the session for `mac` if it belongs to `username`.
    fn invalidate_session(&self, mac: MacAddr, username: &str) -> bool;

    fn find_session(&self, mac: MacAddr) -> Option<Session>;

    fn sessions(&self) -> Vec<Session>;

    /// Drops every session, returning how many there were.
    fn invalidate_all(&self) -> usize;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    by_mac: DashMap<MacAddr, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn is_active_session(&self, mac: MacAddr) -> bool {
        self.by_mac.contains_key(&mac)
    }

    fn create_session(&self, mac: MacAddr, client_ip: Option<Ipv4Addr>, username: &str) -> Session {
        let session = Session {
            device_mac: mac,
            username: username.to_string(),
            client_ip,
            created_at: Utc::now(),
        };
        self.by_mac.insert(mac, session.clone());
        session
    }

    fn invalidate_session(&self, mac: MacAddr, username: &str) -> bool {
        self.by_mac
            .remove_if(&mac, |_, s| s.username == username)
            .is_some()
    }

    fn find_session(&self, mac: MacAddr) -> Option<Session> {
        self.by_mac.get(&mac).map(|s| s.value().clone())
    }

    fn sessions(&self) -> Vec<Session> {
        let mut all: Vec<Session> = self.by_mac.iter().map(|s| s.value().clone()).collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    fn invalidate_all(&self) -> usize {
        let before = self.by_mac.len();
        self.by_mac.clear();
        before
    }
}

pub trait UserDirectory: Send + Sync {
    fn register(&self, username: &str, password: &str) -> Result<()>;
    fn verify(&self, username: &str, password: &str) -> Result<()>;
}

struct Credential {
    salt: [u8; 16],
    digest: String,
}

/// Salted SHA-256 credentials held in memory.
#[derive(Default)]
pub struct InMemoryUserDirectory {
    users: DashMap<String, Credential>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

fn digest(salt: &[u8], password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

impl UserDirectory for InMemoryUserDirectory {
    fn register(&self, username: &str, password: &str) -> Result<()> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(PortalError::Malformed(
                "username and password are required".to_string(),
            ));
        }

        match self.users.entry(username.to_string()) {
            Entry::Occupied(_) => Err(PortalError::UserExists(username.to_string())),
            Entry::Vacant(slot) => {
                let mut salt = [0u8; 16];
                OsRng.fill_bytes(&mut salt);
                slot.insert(Credential {
                    salt,
                    digest: digest(&salt, password),
                });
                Ok(())
            }
        }
    }

    fn verify(&self, username: &str, password: &str) -> Result<()> {
        let user = self
            .users
            .get(username.trim())
            .ok_or(PortalError::InvalidCredentials)?;
        if digest(&user.salt, password) == user.digest {
            Ok(())
        } else {
            Err(PortalError::InvalidCredentials)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr::new([0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);

    #[test]
    fn one_session_per_mac() {
        let store = InMemorySessionStore::new();
        store.create_session(MAC, None, "ann");
        store.create_session(MAC, Some(Ipv4Addr::new(10, 0, 0, 5)), "bob");
        assert_eq!(store.sessions().len(), 1);
        assert_eq!(store.find_session(MAC).unwrap().username, "bob");
    }

    #[test]
    fn invalidate_checks_owner() {
        let store = InMemorySessionStore::new();
        store.create_session(MAC, None, "ann");
        assert!(!store.invalidate_session(MAC, "bob"));
        assert!(store.is_active_session(MAC));
        assert!(store.invalidate_session(MAC, "ann"));
        assert!(!store.is_active_session(MAC));
    }

    #[test]
    fn invalidate_all_empties_the_store() {
        let store = InMemorySessionStore::new();
        store.create_session(MAC, None, "ann");
        store.create_session(MacAddr::new([2, 0, 0, 0, 0, 1]), None, "bob");
        assert_eq!(store.invalidate_all(), 2);
        assert!(store.sessions().is_empty());
        assert_eq!(store.invalidate_all(), 0);
    }

    #[test]
    fn register_then_verify() {
        let users = InMemoryUserDirectory::new();
        users.register("ann", "hunter22").unwrap();
        users.verify("ann", "hunter22").unwrap();
        assert!(matches!(
            users.verify("ann", "wrong"),
            Err(PortalError::InvalidCredentials)
        ));
        assert!(matches!(
            users.verify("nobody", "hunter22"),
            Err(PortalError::InvalidCredentials)
        ));
        assert!(matches!(
            users.register("ann", "other"),
            Err(PortalError::UserExists(_))
        ));
        assert!(users.register("", "x").is_err());
        assert_eq!(users.len(), 1);
    }

    #[test]
    fn same_password_different_salts() {
        let users = InMemoryUserDirectory::new();
        users.register("a", "pw").unwrap();
        users.register("b", "pw").unwrap();
        let a = users.users.get("a").unwrap().digest.clone();
        let b = users.users.get("b").unwrap().digest.clone();
        assert_ne!(a, b);
    }
}
