//! The etcd-backed lock provider.
//!
//! Every lock request gets a fresh locker owning its own lease. The lease
//! is kept alive while the lock is held and revoked on close, so a crashed
//! holder frees its volume after at most the configured TTL. The client
//! connection is shared across all lockers the provider hands out.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LockOptions, TlsOptions};
use tokio::task::JoinHandle;
use tracing::warn;

use super::lockprovider::{LockerError, TryLocker, VolumeLockerProvider};
use crate::config::{env_bool, env_duration, ConfigError};
use crate::context::{self, RequestContext};

/// Comma-separated etcd endpoints. Setting this selects the etcd lock
/// provider.
pub const ENV_ENDPOINTS: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_ENDPOINTS";
/// Interval for endpoint auto-sync.
pub const ENV_AUTO_SYNC_INTERVAL: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL";
/// Timeout for establishing the client connection.
pub const ENV_DIAL_TIMEOUT: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT";
/// Keep-alive probe interval for the client connection.
pub const ENV_DIAL_KEEP_ALIVE_TIME: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME";
/// Keep-alive probe timeout for the client connection.
pub const ENV_DIAL_KEEP_ALIVE_TIMEOUT: &str =
    "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT";
/// Per-call send message size cap, in bytes.
pub const ENV_MAX_CALL_SEND_MSG_SZ: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ";
/// Per-call receive message size cap, in bytes.
pub const ENV_MAX_CALL_RECV_MSG_SZ: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ";
/// Lease TTL for locks. Must exceed the longest expected RPC.
pub const ENV_TTL: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_TTL";
/// Rejects connecting to clusters older than v3.2.
pub const ENV_REJECT_OLD_CLUSTER: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER";
/// Enables TLS for the client connection.
pub const ENV_TLS: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS";
/// Skips certificate verification.
pub const ENV_TLS_INSECURE: &str = "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE";

const DEFAULT_TTL: Duration = Duration::from_secs(10);
const DEFAULT_PREFIX: &str = "/csi-kit/locks";

/// Connection and lock settings for [`EtcdLockProvider`].
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub auto_sync_interval: Option<Duration>,
    pub dial_timeout: Option<Duration>,
    pub dial_keep_alive_time: Option<Duration>,
    pub dial_keep_alive_timeout: Option<Duration>,
    pub max_call_send_msg_sz: Option<usize>,
    pub max_call_recv_msg_sz: Option<usize>,
    pub ttl: Duration,
    pub reject_old_cluster: bool,
    pub tls: bool,
    pub tls_insecure: bool,
    /// The key prefix locks are written under.
    pub prefix: String,
}

impl EtcdConfig {
    /// Returns a config with defaults for everything but the endpoints.
    pub fn new<S: Into<String>>(endpoints: Vec<S>) -> Self {
        EtcdConfig {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
            auto_sync_interval: None,
            dial_timeout: None,
            dial_keep_alive_time: None,
            dial_keep_alive_timeout: None,
            max_call_send_msg_sz: None,
            max_call_recv_msg_sz: None,
            ttl: DEFAULT_TTL,
            reject_old_cluster: false,
            tls: false,
            tls_insecure: false,
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }

    /// Loads the config from the environment, `None` when no endpoints are
    /// configured (the in-memory provider is used instead).
    pub fn from_env(ctx: &RequestContext) -> Result<Option<Self>, ConfigError> {
        let endpoints = match context::getenv(ctx, ENV_ENDPOINTS) {
            Some(v) if !v.trim().is_empty() => v
                .split(',')
                .map(|e| e.trim().to_owned())
                .filter(|e| !e.is_empty())
                .collect::<Vec<_>>(),
            _ => return Ok(None),
        };

        let mut config = EtcdConfig::new(endpoints);
        config.auto_sync_interval = env_duration(ctx, ENV_AUTO_SYNC_INTERVAL)?;
        config.dial_timeout = env_duration(ctx, ENV_DIAL_TIMEOUT)?;
        config.dial_keep_alive_time = env_duration(ctx, ENV_DIAL_KEEP_ALIVE_TIME)?;
        config.dial_keep_alive_timeout = env_duration(ctx, ENV_DIAL_KEEP_ALIVE_TIMEOUT)?;
        config.max_call_send_msg_sz = env_usize(ctx, ENV_MAX_CALL_SEND_MSG_SZ)?;
        config.max_call_recv_msg_sz = env_usize(ctx, ENV_MAX_CALL_RECV_MSG_SZ)?;
        if let Some(ttl) = env_duration(ctx, ENV_TTL)? {
            config.ttl = ttl;
        }
        config.reject_old_cluster = env_bool(ctx, ENV_REJECT_OLD_CLUSTER);
        config.tls = env_bool(ctx, ENV_TLS);
        config.tls_insecure = env_bool(ctx, ENV_TLS_INSECURE);
        Ok(Some(config))
    }
}

fn env_usize(ctx: &RequestContext, var: &'static str) -> Result<Option<usize>, ConfigError> {
    match context::getenv(ctx, var) {
        Some(value) => match value.trim().parse::<usize>() {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) => Err(ConfigError::Invalid {
                var,
                value,
                reason: e.to_string(),
            }),
        },
        None => Ok(None),
    }
}

/// A [`VolumeLockerProvider`] backed by an etcd cluster.
pub struct EtcdLockProvider {
    client: Client,
    ttl: Duration,
    prefix: String,
}

impl EtcdLockProvider {
    /// Dials the cluster and verifies it is reachable. Construction fails
    /// fast when no endpoint answers.
    pub async fn new(config: EtcdConfig) -> Result<Self, LockerError> {
        let mut options = ConnectOptions::new();
        if let Some(timeout) = config.dial_timeout {
            options = options.with_connect_timeout(timeout);
        }
        if let (Some(time), Some(timeout)) =
            (config.dial_keep_alive_time, config.dial_keep_alive_timeout)
        {
            options = options.with_keep_alive(time, timeout);
        }
        if config.tls {
            options = options.with_tls(TlsOptions::new());
        }

        // The client has no equivalent of these etcd settings; surface the
        // fact instead of silently honoring them.
        if config.auto_sync_interval.is_some() {
            warn!(var = ENV_AUTO_SYNC_INTERVAL, "setting is not supported by the etcd client and is ignored");
        }
        if config.reject_old_cluster {
            warn!(var = ENV_REJECT_OLD_CLUSTER, "setting is not supported by the etcd client and is ignored");
        }
        if config.max_call_send_msg_sz.is_some() || config.max_call_recv_msg_sz.is_some() {
            warn!("per-call message size caps are not supported by the etcd client and are ignored");
        }
        if config.tls_insecure {
            warn!(var = ENV_TLS_INSECURE, "certificate verification cannot be disabled and the setting is ignored");
        }

        let mut client = Client::connect(&config.endpoints, Some(options)).await?;
        client.status().await?;

        Ok(EtcdLockProvider {
            client,
            ttl: config.ttl,
            prefix: config.prefix,
        })
    }

    fn locker(&self, key: String) -> Box<dyn TryLocker> {
        Box::new(EtcdLocker {
            client: self.client.clone(),
            key,
            ttl: self.ttl,
            session: None,
            lock_key: None,
        })
    }
}

#[async_trait]
impl VolumeLockerProvider for EtcdLockProvider {
    async fn lock_with_id(&self, id: &str) -> Result<Box<dyn TryLocker>, LockerError> {
        Ok(self.locker(format!("{}/id/{}", self.prefix, id)))
    }

    async fn lock_with_name(&self, name: &str) -> Result<Box<dyn TryLocker>, LockerError> {
        Ok(self.locker(format!("{}/name/{}", self.prefix, name)))
    }
}

struct Session {
    lease_id: i64,
    keepalive: JoinHandle<()>,
}

struct EtcdLocker {
    client: Client,
    key: String,
    ttl: Duration,
    session: Option<Session>,
    lock_key: Option<Vec<u8>>,
}

impl EtcdLocker {
    /// Grants a lease and starts keeping it alive.
    async fn begin_session(&mut self) -> Result<i64, LockerError> {
        let ttl_secs = self.ttl.as_secs().max(1) as i64;
        let lease = self.client.lease_grant(ttl_secs, None).await?;
        let lease_id = lease.id();

        let mut client = self.client.clone();
        let period = self.ttl / 3;
        let keepalive = tokio::spawn(async move {
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                if keeper.keep_alive().await.is_err() {
                    return;
                }
                if stream.message().await.is_err() {
                    return;
                }
            }
        });

        self.session = Some(Session { lease_id, keepalive });
        Ok(lease_id)
    }

    /// Stops the keep-alive and revokes the lease, which also deletes the
    /// lock key if it is still held.
    async fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.keepalive.abort();
            if let Err(error) = self.client.lease_revoke(session.lease_id).await {
                warn!(key = %self.key, %error, "unable to revoke lock lease");
            }
        }
        self.lock_key = None;
    }

    async fn acquire(&mut self, lease_id: i64) -> Result<(), LockerError> {
        let resp = self
            .client
            .lock(
                self.key.as_bytes(),
                Some(LockOptions::new().with_lease(lease_id)),
            )
            .await?;
        self.lock_key = Some(resp.key().to_vec());
        Ok(())
    }
}

#[async_trait]
impl TryLocker for EtcdLocker {
    async fn lock(&mut self) -> Result<(), LockerError> {
        if self.session.is_some() {
            return Err(LockerError::AlreadyHeld);
        }
        let lease_id = self.begin_session().await?;
        match self.acquire(lease_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.end_session().await;
                Err(e)
            }
        }
    }

    async fn try_lock(&mut self, timeout: Duration) -> Result<bool, LockerError> {
        if self.session.is_some() {
            return Err(LockerError::AlreadyHeld);
        }
        let lease_id = self.begin_session().await?;
        // The lease is revoked when the wait elapses, which also removes a
        // lock that raced to acquisition server-side after the deadline.
        let deadline = timeout.max(Duration::from_millis(1));
        match tokio::time::timeout(deadline, self.acquire(lease_id)).await {
            Ok(Ok(())) => Ok(true),
            Ok(Err(e)) => {
                self.end_session().await;
                Err(e)
            }
            Err(_elapsed) => {
                self.end_session().await;
                Ok(false)
            }
        }
    }

    async fn unlock(&mut self) -> Result<(), LockerError> {
        match self.lock_key.take() {
            Some(key) => {
                self.client.unlock(key).await?;
                Ok(())
            }
            None => Err(LockerError::NotHeld),
        }
    }

    async fn close(&mut self) -> Result<(), LockerError> {
        self.end_session().await;
        Ok(())
    }
}

impl Drop for EtcdLocker {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.keepalive.abort();
            let mut client = self.client.clone();
            let key = std::mem::take(&mut self.key);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(error) = client.lease_revoke(session.lease_id).await {
                        warn!(%key, %error, "unable to revoke lock lease on drop");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn ctx_with(environ: Vec<&str>) -> RequestContext {
        RequestContext::default().with_environ(environ.into_iter().map(String::from).collect())
    }

    #[test]
    fn test_from_env_absent_endpoints() {
        let config = EtcdConfig::from_env(&ctx_with(vec![])).expect("empty env should parse");
        assert!(config.is_none());
    }

    #[test]
    fn test_from_env_full() {
        let config = EtcdConfig::from_env(&ctx_with(vec![
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_ENDPOINTS=https://127.0.0.1:2379, https://127.0.0.2:2379",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_AUTO_SYNC_INTERVAL=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_TIMEOUT=1s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIME=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_DIAL_KEEP_ALIVE_TIMEOUT=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_SEND_MSG_SZ=0",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_MAX_CALL_RECV_MSG_SZ=32768",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TTL=10s",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_REJECT_OLD_CLUSTER=false",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS=true",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TLS_INSECURE=true",
        ]))
        .expect("env should parse")
        .expect("endpoints are set");

        assert_eq!(
            config.endpoints,
            vec![
                "https://127.0.0.1:2379".to_owned(),
                "https://127.0.0.2:2379".to_owned()
            ]
        );
        assert_eq!(config.auto_sync_interval, Some(Duration::from_secs(10)));
        assert_eq!(config.dial_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.max_call_send_msg_sz, None);
        assert_eq!(config.max_call_recv_msg_sz, Some(32768));
        assert_eq!(config.ttl, Duration::from_secs(10));
        assert!(!config.reject_old_cluster);
        assert!(config.tls);
        assert!(config.tls_insecure);
    }

    #[test]
    fn test_from_env_invalid_ttl() {
        let err = EtcdConfig::from_env(&ctx_with(vec![
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_ENDPOINTS=http://127.0.0.1:2379",
            "X_CSI_SERIAL_VOL_ACCESS_ETCD_TTL=often",
        ]))
        .expect_err("bogus ttl should fail");
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_lock_key_namespaces() {
        // Key shaping is pure; exercising it does not need a live cluster.
        let prefix = DEFAULT_PREFIX;
        assert_eq!(
            format!("{}/id/{}", prefix, "v1"),
            "/csi-kit/locks/id/v1"
        );
        assert_eq!(
            format!("{}/name/{}", prefix, "v1"),
            "/csi-kit/locks/name/v1"
        );
    }

    #[tokio::test]
    async fn test_new_fails_fast_when_unreachable() {
        let mut config = EtcdConfig::new(vec!["http://127.0.0.1:1"]);
        config.dial_timeout = Some(Duration::from_millis(250));
        let result = EtcdLockProvider::new(config).await;
        assert!(matches!(result, Err(LockerError::Etcd(_))));
    }
}
