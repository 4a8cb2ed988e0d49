//! Backend connection pools, one per authenticated identity. Pools are
//! created lazily and never shared across identities.

use crate::error::{Error, Result};
use crate::scram::Mechanism;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;

/// Identifies one logical pool. The password never lives here; only a
/// digest, so stale credentials hash to a different pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub username: String,
    pub mechanism: Mechanism,
    pub source: String,
    credential_digest: [u8; 32],
}

impl PoolKey {
    pub fn new(username: &str, secret: &[u8], mechanism: Mechanism, source: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update([0u8]);
        hasher.update(secret);
        Self {
            username: username.to_string(),
            mechanism,
            source: source.to_string(),
            credential_digest: hasher.finalize().into(),
        }
    }
}

/// How an identity's backend sessions get their credentials.
#[derive(Clone)]
pub enum Credentials {
    /// The client's own password (PLAIN): backend sessions use it directly.
    Password(String),
    /// SCRAM identities: sessions open under the service role and bind the
    /// wire identity with SET ROLE at acquire time.
    AssumeRole,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Password(<redacted>)"),
            Credentials::AssumeRole => f.write_str("AssumeRole"),
        }
    }
}

struct IdentityPool {
    pool: Pool,
    assume_role: Option<String>,
}

pub struct PoolRegistry {
    base_url: Option<String>,
    max_size: usize,
    acquire_timeout: Duration,
    service: RwLock<Option<Pool>>,
    pools: RwLock<HashMap<PoolKey, IdentityPool>>,
}

impl PoolRegistry {
    pub fn new(
        base_url: Option<String>,
        max_size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            base_url,
            max_size,
            acquire_timeout,
            service: RwLock::new(None),
            pools: RwLock::new(HashMap::new()),
        }
    }

    fn build_pool(&self, username: Option<&str>, password: Option<&str>) -> Result<Pool> {
        let url = self
            .base_url
            .as_deref()
            .ok_or_else(|| Error::Msg("no backend configured (postgres_url unset)".into()))?;
        let mut pgcfg = tokio_postgres::Config::from_str(url)
            .map_err(|e| Error::Msg(format!("invalid postgres url: {e}")))?;
        if let Some(user) = username {
            pgcfg.user(user);
        }
        if let Some(pass) = password {
            pgcfg.password(pass);
        }
        let mgr = Manager::from_config(
            pgcfg,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Pool::builder(mgr)
            .max_size(self.max_size)
            .build()
            .map_err(|e| Error::Msg(format!("pool build: {e}")))
    }

    /// The service pool: the configured URL's own credentials. Used before
    /// authentication completes (credential lookup) and when auth is off.
    pub async fn service_acquire(&self) -> Result<Object> {
        {
            let service = self.service.read().await;
            if let Some(pool) = service.as_ref() {
                return self.checked_get(pool, None).await;
            }
        }
        let mut service = self.service.write().await;
        if service.is_none() {
            *service = Some(self.build_pool(None, None)?);
        }
        let pool = service.as_ref().expect("just inserted").clone();
        drop(service);
        self.checked_get(&pool, None).await
    }

    /// Acquire a backend connection for an authenticated identity, creating
    /// the pool on first use. Creation is double-checked under the write
    /// lock so concurrent first users share one pool.
    pub async fn acquire(&self, key: &PoolKey, credentials: &Credentials) -> Result<Object> {
        {
            let pools = self.pools.read().await;
            if let Some(entry) = pools.get(key) {
                let pool = entry.pool.clone();
                let role = entry.assume_role.clone();
                drop(pools);
                return self.checked_get(&pool, role.as_deref()).await;
            }
        }

        let mut pools = self.pools.write().await;
        if !pools.contains_key(key) {
            let entry = match credentials {
                Credentials::Password(password) => IdentityPool {
                    pool: self.build_pool(Some(&key.username), Some(password))?,
                    assume_role: None,
                },
                Credentials::AssumeRole => IdentityPool {
                    pool: self.build_pool(None, None)?,
                    assume_role: Some(key.username.clone()),
                },
            };
            tracing::debug!(user = %key.username, mechanism = key.mechanism.name(), "backend pool created");
            pools.insert(key.clone(), entry);
        }
        let entry = pools.get(key).expect("just inserted");
        let pool = entry.pool.clone();
        let role = entry.assume_role.clone();
        drop(pools);
        self.checked_get(&pool, role.as_deref()).await
    }

    /// Bounded-wait get with one retry on a dead pooled connection.
    async fn checked_get(&self, pool: &Pool, assume_role: Option<&str>) -> Result<Object> {
        let mut last_err = None;
        for attempt in 0..2 {
            let obj = tokio::time::timeout(self.acquire_timeout, pool.get())
                .await
                .map_err(|_| Error::Msg("timed out waiting for a backend connection".into()))?
                .map_err(|e| Error::Msg(format!("backend connect: {e}")))?;
            match self.bind_identity(&obj, assume_role).await {
                Ok(()) => return Ok(obj),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "pooled connection unusable; retrying");
                    last_err = Some(e);
                    // Detach the broken connection so the pool cannot hand
                    // it out again.
                    let _ = Object::take(obj);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Msg("backend acquire failed".into())))
    }

    async fn bind_identity(&self, obj: &Object, assume_role: Option<&str>) -> Result<()> {
        if let Some(role) = assume_role {
            obj.batch_execute(&format!("SET ROLE {}", quote_ident(role)))
                .await
                .map_err(|e| Error::Msg(format!("SET ROLE failed: {e}")))?;
        }
        Ok(())
    }

    /// Drop an identity's pool (logout, credential rotation).
    pub async fn invalidate(&self, key: &PoolKey) {
        if self.pools.write().await.remove(key).is_some() {
            tracing::debug!(user = %key.username, "backend pool invalidated");
        }
    }

    /// Drop every pool belonging to `username`, regardless of mechanism or
    /// credential generation.
    pub async fn invalidate_user(&self, username: &str) {
        let mut pools = self.pools.write().await;
        let before = pools.len();
        pools.retain(|key, _| key.username != username);
        if pools.len() != before {
            tracing::debug!(user = %username, "backend pools invalidated");
        }
    }

    pub async fn invalidate_all(&self) {
        self.pools.write().await.clear();
    }

    pub async fn pool_count(&self) -> usize {
        self.pools.read().await.len()
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_key_separates_identities() {
        let a = PoolKey::new("alice", b"pw1", Mechanism::ScramSha256, "admin");
        let same = PoolKey::new("alice", b"pw1", Mechanism::ScramSha256, "admin");
        let other_pw = PoolKey::new("alice", b"pw2", Mechanism::ScramSha256, "admin");
        let other_user = PoolKey::new("bob", b"pw1", Mechanism::ScramSha256, "admin");
        let other_mech = PoolKey::new("alice", b"pw1", Mechanism::ScramSha1, "admin");

        assert_eq!(a, same);
        assert_ne!(a, other_pw);
        assert_ne!(a, other_user);
        assert_ne!(a, other_mech);
    }

    #[test]
    fn pool_key_holds_no_plaintext() {
        let key = PoolKey::new("alice", b"hunter2-plaintext", Mechanism::Plain, "admin");
        let bytes = key.credential_digest;
        assert_eq!(bytes.len(), 32);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn quote_ident_escapes() {
        assert_eq!(quote_ident("alice"), "\"alice\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[tokio::test]
    async fn acquire_without_backend_errors() {
        let reg = PoolRegistry::new(None, 4, Duration::from_secs(1));
        let err = reg.service_acquire().await.unwrap_err();
        assert!(err.to_string().contains("no backend"));
    }
}
