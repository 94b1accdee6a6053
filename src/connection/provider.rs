use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bb8::{ErrorSink, ManageConnection, Pool, PooledConnection, RunError};

use crate::connection::{Connection, Connector, Role};
use crate::error::{ClientError, ConnectionError};

pub type PooledClient = PooledConnection<'static, ConnectionManager>;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub source_size: u32,
    pub target_size: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            source_size: 4,
            target_size: 4,
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
}

#[async_trait]
impl ManageConnection for ConnectionManager {
    type Connection = Box<dyn Connection>;
    type Error = ClientError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.connector.connect().await
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        conn.ping().await
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.is_broken()
    }
}

/// Keeps the latest failed connection attempt of a pool. bb8 hands those to its
/// error sink instead of the waiting caller, which only sees a timeout.
#[derive(Debug, Clone, Default)]
struct LastConnectError {
    error: Arc<Mutex<Option<ClientError>>>,
}

impl LastConnectError {
    fn take(&self) -> Option<ClientError> {
        self.error.lock().ok().and_then(|mut error| error.take())
    }
}

impl ErrorSink<ClientError> for LastConnectError {
    fn sink(&self, error: ClientError) {
        debug!("Connection attempt failed: {}", error);
        if let Ok(mut last) = self.error.lock() {
            *last = Some(error);
        }
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<ClientError>> {
        Box::new(self.clone())
    }
}

#[derive(Clone)]
struct RolePool {
    pool: Pool<ConnectionManager>,
    connector: Arc<dyn Connector>,
    last_error: LastConnectError,
}

/// Hands out pooled, health-checked connections to the source and the target.
///
/// Connections go back to their pool when the returned guard is dropped. Callers
/// beyond the pool size wait in line until a connection frees up or the acquire
/// timeout elapses.
#[derive(Clone)]
pub struct ConnectionProvider {
    source: RolePool,
    target: RolePool,
    options: PoolOptions,
}

impl ConnectionProvider {
    pub fn new(
        source: Arc<dyn Connector>,
        target: Arc<dyn Connector>,
        options: &PoolOptions,
    ) -> Self {
        ConnectionProvider {
            source: build_pool(source, options.source_size, options.acquire_timeout),
            target: build_pool(target, options.target_size, options.acquire_timeout),
            options: options.clone(),
        }
    }

    pub async fn acquire(&self, role: Role) -> Result<PooledClient, ConnectionError> {
        let pool = self.pool(role);

        pool.pool.get_owned().await.map_err(|err| match err {
            RunError::User(err) => ConnectionError::from_client(role, err),
            RunError::TimedOut => match pool.last_error.take() {
                Some(err) => ConnectionError::from_client(role, err),
                None => ConnectionError::Timeout { role },
            },
        })
    }

    fn pool(&self, role: Role) -> &RolePool {
        match role {
            Role::Source => &self.source,
            Role::Target => &self.target,
        }
    }

    pub fn size(&self, role: Role) -> u32 {
        match role {
            Role::Source => self.options.source_size.max(1),
            Role::Target => self.options.target_size.max(1),
        }
    }

    /// Connects once per role outside the pools so bad credentials surface
    /// before any table starts.
    pub async fn check(&self) -> Result<(), ConnectionError> {
        for role in [Role::Source, Role::Target] {
            let mut conn = self
                .pool(role)
                .connector
                .connect()
                .await
                .map_err(|err| ConnectionError::from_client(role, err))?;
            conn.ping()
                .await
                .map_err(|err| ConnectionError::from_client(role, err))?;
            debug!("{} connection ok ({})", role, conn.engine());
        }
        Ok(())
    }
}

fn build_pool(connector: Arc<dyn Connector>, max_size: u32, acquire_timeout: Duration) -> RolePool {
    let last_error = LastConnectError::default();
    let pool = Pool::builder()
        .max_size(max_size.max(1))
        .connection_timeout(acquire_timeout)
        .test_on_check_out(true)
        .retry_connection(false)
        .error_sink(Box::new(last_error.clone()))
        .build_unchecked(ConnectionManager {
            connector: connector.clone(),
        });

    RolePool {
        pool,
        connector,
        last_error,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::connection::memory::MemoryStore;

    fn provider(store: &MemoryStore, size: u32, timeout: Duration) -> ConnectionProvider {
        ConnectionProvider::new(
            Arc::new(store.connector()),
            Arc::new(store.connector()),
            &PoolOptions {
                source_size: size,
                target_size: size,
                acquire_timeout: timeout,
            },
        )
    }

    #[tokio::test]
    async fn released_connections_are_reused() {
        let store = MemoryStore::default();
        let provider = provider(&store, 1, Duration::from_secs(1));

        for _ in 0..3 {
            let mut conn = provider.acquire(Role::Source).await.unwrap();
            conn.ping().await.unwrap();
        }

        assert_eq!(store.connections_opened(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let store = MemoryStore::default();
        let provider = provider(&store, 1, Duration::from_millis(50));

        let _held = provider.acquire(Role::Target).await.unwrap();
        let started = Instant::now();
        let err = provider.acquire(Role::Target).await.err().unwrap();

        assert!(matches!(err, ConnectionError::Timeout { role: Role::Target }));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn waiting_caller_gets_the_released_connection() {
        let store = MemoryStore::default();
        let provider = provider(&store, 1, Duration::from_secs(2));

        let held = provider.acquire(Role::Source).await.unwrap();
        let waiter = {
            let provider = provider.clone();
            tokio::spawn(async move { provider.acquire(Role::Source).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn bad_credentials_surface_as_authentication_error() {
        let store = MemoryStore::default();
        store.reject_logins("password authentication failed");
        let provider = provider(&store, 2, Duration::from_secs(1));

        let err = provider.check().await.err().unwrap();

        assert!(matches!(
            err,
            ConnectionError::Authentication {
                role: Role::Source,
                ..
            }
        ));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn failed_login_in_the_pool_keeps_its_cause() {
        let store = MemoryStore::default();
        store.reject_logins("password authentication failed for user \"etl\"");
        let provider = provider(&store, 1, Duration::from_millis(100));

        let err = provider.acquire(Role::Target).await.err().unwrap();

        match err {
            ConnectionError::Authentication { role, message } => {
                assert_eq!(role, Role::Target);
                assert!(message.contains("password authentication failed"));
            }
            other => panic!("expected an authentication error, got {:?}", other),
        }
    }
}
