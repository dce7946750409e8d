//! Identity table: bearer-token authentication and per-model authorization
//!
//! Tokens are kept only as BLAKE3 digests. Lookup hashes the presented token
//! and compares it against every loaded digest without early exit, so the
//! time taken does not depend on which identity (if any) matched.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::IdentityEntry;
use crate::{GatewayError, Result};

/// Permission entry granting every model
pub const WILDCARD: &str = "*";

/// Quota applied when an identity does not declare one
pub const DEFAULT_QUOTA: &str = "10/minute";

/// Stable key of an identity, derived from its token digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub String);

impl std::fmt::Display for IdentityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Request budget over a time unit, written `<count>/<unit>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub count: u32,
    pub window: Duration,
}

impl Quota {
    pub fn new(count: u32, window: Duration) -> Self {
        Self { count, window }
    }

    pub fn per_second(count: u32) -> Self {
        Self::new(count, Duration::from_secs(1))
    }

    pub fn per_minute(count: u32) -> Self {
        Self::new(count, Duration::from_secs(60))
    }
}

impl std::str::FromStr for Quota {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || GatewayError::InvalidConfig(format!("invalid rate limit '{}'", s));

        let (count, unit) = s.split_once('/').ok_or_else(invalid)?;
        let count: u32 = count.trim().parse().map_err(|_| invalid())?;
        if count == 0 {
            return Err(invalid());
        }

        let unit = unit.trim().to_ascii_lowercase();
        let secs = match unit.strip_suffix('s').unwrap_or(&unit) {
            "second" => 1,
            "minute" => 60,
            "hour" => 3_600,
            "day" => 86_400,
            _ => return Err(invalid()),
        };

        Ok(Self::new(count, Duration::from_secs(secs)))
    }
}

/// Which models an identity may use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Permissions {
    All,
    Models(HashSet<String>),
}

impl Permissions {
    pub fn from_list<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let models: HashSet<String> = entries.into_iter().map(Into::into).collect();
        if models.contains(WILDCARD) {
            Permissions::All
        } else {
            Permissions::Models(models)
        }
    }

    /// Permission entries as written in the identity file, sorted.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            Permissions::All => vec![WILDCARD.to_string()],
            Permissions::Models(models) => {
                let mut list: Vec<String> = models.iter().cloned().collect();
                list.sort();
                list
            }
        }
    }

    pub fn allows(&self, model: &str) -> bool {
        match self {
            Permissions::All => true,
            Permissions::Models(models) => models.contains(model),
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub permissions: Permissions,
    pub quota: Quota,
    token_digest: blake3::Hash,
}

impl Identity {
    pub fn new(
        token: &str,
        name: impl Into<String>,
        permissions: Permissions,
        quota: Quota,
    ) -> Self {
        let token_digest = blake3::hash(token.as_bytes());
        Self {
            id: IdentityId(token_digest.to_hex().to_string()),
            name: name.into(),
            permissions,
            quota,
            token_digest,
        }
    }

    pub fn from_entry(entry: &IdentityEntry) -> Result<Self> {
        if entry.token.is_empty() {
            return Err(GatewayError::InvalidConfig(format!(
                "identity '{}' has an empty token",
                entry.name
            )));
        }
        let quota = entry
            .rate_limit
            .as_deref()
            .unwrap_or(DEFAULT_QUOTA)
            .parse()?;
        Ok(Self::new(
            &entry.token,
            entry.name.clone(),
            Permissions::from_list(entry.permissions.iter().cloned()),
            quota,
        ))
    }

    pub fn can_use(&self, model: &str) -> bool {
        self.permissions.allows(model)
    }
}

/// Immutable table of identities, built once at startup
#[derive(Debug, Default)]
pub struct IdentityTable {
    identities: Vec<Arc<Identity>>,
}

impl IdentityTable {
    pub fn new(identities: Vec<Identity>) -> Result<Self> {
        let mut seen = HashSet::new();
        for identity in &identities {
            if !seen.insert(identity.id.clone()) {
                return Err(GatewayError::InvalidConfig(format!(
                    "duplicate token for identity '{}'",
                    identity.name
                )));
            }
        }

        Ok(Self {
            identities: identities.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn from_entries(entries: &[IdentityEntry]) -> Result<Self> {
        let identities = entries
            .iter()
            .map(Identity::from_entry)
            .collect::<Result<Vec<_>>>()?;
        let table = Self::new(identities)?;
        tracing::info!("Loaded {} identities", table.len());
        Ok(table)
    }

    /// Resolve a bearer token to its identity.
    pub fn authenticate(&self, token: &str) -> Result<Arc<Identity>> {
        let digest = blake3::hash(token.as_bytes());
        let mut matched = None;
        for identity in &self.identities {
            // blake3::Hash equality is constant-time
            if identity.token_digest == digest {
                matched = Some(identity.clone());
            }
        }
        matched.ok_or(GatewayError::Unauthorized)
    }

    /// Fail-closed permission check.
    pub fn authorize(&self, identity: &Identity, model: &str) -> bool {
        identity.can_use(model)
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(token: &str, name: &str, permissions: &[&str], rate: Option<&str>) -> IdentityEntry {
        IdentityEntry {
            token: token.to_string(),
            name: name.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            rate_limit: rate.map(str::to_string),
        }
    }

    #[test]
    fn test_quota_parsing() {
        let q: Quota = "2/minute".parse().unwrap();
        assert_eq!(q, Quota::per_minute(2));

        let q: Quota = "100/hours".parse().unwrap();
        assert_eq!(q.window, Duration::from_secs(3_600));

        let q: Quota = " 5 / Day ".parse().unwrap();
        assert_eq!(q.count, 5);
        assert_eq!(q.window, Duration::from_secs(86_400));

        for bad in ["", "10", "ten/minute", "0/minute", "10/fortnight", "-1/second"] {
            assert!(bad.parse::<Quota>().is_err(), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_authenticate_known_and_unknown() {
        let table = IdentityTable::from_entries(&[
            entry("sk-alice", "Alice", &["llama3:latest"], Some("2/minute")),
            entry("sk-bob", "Bob", &["*"], None),
        ])
        .unwrap();

        let alice = table.authenticate("sk-alice").unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.quota, Quota::per_minute(2));

        let bob = table.authenticate("sk-bob").unwrap();
        assert_eq!(bob.quota, Quota::per_minute(10));

        for token in ["", "sk-alic", "sk-alice ", "SK-ALICE", "{\"token\":\"sk-alice\"}"] {
            assert!(matches!(
                table.authenticate(token),
                Err(GatewayError::Unauthorized)
            ));
        }
    }

    #[test]
    fn test_authorize_fails_closed() {
        let table = IdentityTable::from_entries(&[
            entry("t1", "Local", &["llama3:latest"], None),
            entry("t2", "Admin", &["*", "llama3:latest"], None),
            entry("t3", "Nobody", &[], None),
        ])
        .unwrap();

        let local = table.authenticate("t1").unwrap();
        assert!(table.authorize(&local, "llama3:latest"));
        assert!(!table.authorize(&local, "gpt-4o"));
        assert!(!table.authorize(&local, "llama3"));

        let admin = table.authenticate("t2").unwrap();
        assert!(table.authorize(&admin, "gpt-4o"));

        let nobody = table.authenticate("t3").unwrap();
        assert!(!table.authorize(&nobody, "llama3:latest"));

        assert_eq!(admin.permissions.to_list(), vec!["*"]);
        assert!(nobody.permissions.to_list().is_empty());
    }

    #[test]
    fn test_duplicate_tokens_rejected() {
        let result = IdentityTable::from_entries(&[
            entry("same", "A", &[], None),
            entry("same", "B", &[], None),
        ]);
        assert!(matches!(result, Err(GatewayError::InvalidConfig(_))));
    }

    #[test]
    fn test_identity_id_is_not_the_token() {
        let identity = Identity::new("secret", "x", Permissions::All, Quota::per_second(1));
        assert!(!identity.id.0.contains("secret"));
        assert_eq!(identity.id.0.len(), 64);
    }
}
