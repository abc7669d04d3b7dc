use crate::error::Result;
use crate::traits::{Session, SessionConnector, SessionProvider};
use crate::types::{Credentials, SessionKey, SessionParams};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

struct CachedSession {
    session: Arc<dyn Session>,
    credentials: Credentials,
}

type Slot = Arc<Mutex<Option<CachedSession>>>;

/// Caches one live session per (server, datacenter, user, thumbprint)
///
/// A cached session is reused while the platform still reports it active and
/// the password it was opened with matches the requested one; otherwise it is
/// replaced by a fresh login. Each key has its own lock: concurrent reconciles
/// of the same server share one login, while a slow login to one server does
/// not hold up the others.
pub struct SessionCache {
    connector: Arc<dyn SessionConnector>,
    slots: parking_lot::Mutex<HashMap<SessionKey, Slot>>,
}

impl SessionCache {
    pub fn new(connector: Arc<dyn SessionConnector>) -> Self {
        Self {
            connector,
            slots: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, key: &SessionKey) -> Slot {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    fn all_slots(&self) -> Vec<Slot> {
        self.slots.lock().values().cloned().collect()
    }

    /// Drop a cached session so the next request logs in again
    pub async fn invalidate(&self, key: &SessionKey) -> bool {
        let slot = self.slots.lock().get(key).cloned();
        match slot {
            Some(slot) => slot.lock().await.take().is_some(),
            None => false,
        }
    }

    /// Number of sessions currently cached
    pub async fn len(&self) -> usize {
        let mut count = 0;
        for slot in self.all_slots() {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl SessionProvider for SessionCache {
    async fn get_or_create(&self, params: &SessionParams) -> Result<Arc<dyn Session>> {
        let key = params.key();
        let slot = self.slot(&key);
        let mut cached = slot.lock().await;

        if let Some(current) = cached.as_ref() {
            if current.credentials == params.credentials && current.session.is_active().await {
                debug!("Reusing session {}", key);
                return Ok(current.session.clone());
            }
            info!("Session {} is no longer valid, logging in again", key);
            *cached = None;
        }

        let session = self.connector.connect(params).await?;
        info!("Opened session {}", key);
        *cached = Some(CachedSession {
            session: session.clone(),
            credentials: params.credentials.clone(),
        });
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockInventory, MockPlatform};

    fn params(password: &str) -> SessionParams {
        SessionParams::new("vcenter.local", Credentials::new("admin", password))
            .with_datacenter("dc0")
    }

    #[tokio::test]
    async fn test_session_reused_for_same_key() {
        let platform = MockPlatform::new(MockInventory::default());
        let cache = SessionCache::new(Arc::new(platform.clone()));

        let first = cache.get_or_create(&params("secret")).await.unwrap();
        let second = cache.get_or_create(&params("secret")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(platform.connect_count(), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_inactive_session_reconnects() {
        let platform = MockPlatform::new(MockInventory::default());
        let cache = SessionCache::new(Arc::new(platform.clone()));

        cache.get_or_create(&params("secret")).await.unwrap();
        platform.expire_sessions();
        let session = cache.get_or_create(&params("secret")).await.unwrap();

        assert!(session.is_active().await);
        assert_eq!(platform.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_password_change_reconnects() {
        let platform = MockPlatform::new(MockInventory::default());
        let cache = SessionCache::new(Arc::new(platform.clone()));

        cache.get_or_create(&params("old")).await.unwrap();
        cache.get_or_create(&params("new")).await.unwrap();

        assert_eq!(platform.connect_count(), 2);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_cached() {
        let platform = MockPlatform::new(MockInventory::default());
        platform.set_server_reachable("vcenter.local", false);
        let cache = SessionCache::new(Arc::new(platform.clone()));

        assert!(cache.get_or_create(&params("secret")).await.is_err());
        assert!(cache.is_empty().await);

        platform.set_server_reachable("vcenter.local", true);
        assert!(cache.get_or_create(&params("secret")).await.is_ok());
    }

    /// Connector whose logins to "slow.local" wait until released
    struct GatedConnector {
        platform: MockPlatform,
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl SessionConnector for GatedConnector {
        async fn connect(&self, params: &SessionParams) -> Result<Arc<dyn Session>> {
            if params.server == "slow.local" {
                self.gate.notified().await;
            }
            self.platform.connect(params).await
        }
    }

    #[tokio::test]
    async fn test_slow_login_does_not_block_other_servers() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let cache = Arc::new(SessionCache::new(Arc::new(GatedConnector {
            platform: MockPlatform::new(MockInventory::default()),
            gate: gate.clone(),
        })));

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let p = SessionParams::new("slow.local", Credentials::new("admin", "pw"))
                    .with_datacenter("dc0");
                cache.get_or_create(&p).await.is_ok()
            })
        };
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            cache.get_or_create(&params("secret")),
        )
        .await;
        assert!(matches!(fast, Ok(Ok(_))));

        gate.notify_one();
        assert!(slow.await.unwrap());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let platform = MockPlatform::new(MockInventory::default());
        let cache = SessionCache::new(Arc::new(platform.clone()));

        let p = params("secret");
        cache.get_or_create(&p).await.unwrap();
        assert!(cache.invalidate(&p.key()).await);
        assert!(!cache.invalidate(&p.key()).await);
    }
}
