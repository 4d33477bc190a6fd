//! # Connection Lifecycle Manager
//!
//! Lazily creates and caches exactly one shared broker connection. The first
//! caller triggers the connect attempt; concurrent first callers block on
//! that single attempt and all observe the same instance. A failed attempt
//! is surfaced to every waiter and is not cached: the next call makes a
//! fresh attempt. Teardown closes the connection at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::ConnectionConfig;
use crate::errors::{BrokerError, BrokerResult};
use crate::transport::{BrokerConnection, BrokerTransport};

/// Owns the shared broker connection.
///
/// This is the only component permitted to close the connection; publishers
/// and subscribers borrow it and leave it open on their own teardown.
pub struct ConnectionManager {
    transport: Arc<dyn BrokerTransport>,
    config: ConnectionConfig,
    connection: OnceCell<Arc<dyn BrokerConnection>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Create a manager; no connection is attempted until first use
    pub fn new(transport: Arc<dyn BrokerTransport>, config: ConnectionConfig) -> Self {
        Self {
            transport,
            config,
            connection: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the shared connection, creating it on first call.
    ///
    /// Safe under a concurrent first-call race: exactly one connect attempt
    /// is made and every caller shares its outcome.
    pub async fn get_connection(&self) -> BrokerResult<Arc<dyn BrokerConnection>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::closed("connection manager"));
        }

        self.connection
            .get_or_try_init(|| async {
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "creating broker connection"
                );
                let connection = self.transport.connect(&self.config).await?;
                // A close() that raced this attempt wins: the connection is
                // torn down here and never handed out.
                if self.closed.load(Ordering::SeqCst) {
                    if let Err(e) = connection.close().await {
                        tracing::warn!(error = %e, "error closing connection opened during shutdown");
                    }
                    return Err(BrokerError::closed("connection manager"));
                }
                tracing::info!(
                    host = %self.config.host,
                    port = self.config.port,
                    "broker connection established"
                );
                Ok(connection)
            })
            .await
            .map(Arc::clone)
    }

    /// True once a connection has been established
    pub fn is_connected(&self) -> bool {
        self.connection.initialized()
    }

    /// Close the shared connection, idempotently.
    ///
    /// A connect attempt racing this shutdown is waited out: either it
    /// publishes the connection and it is closed here, or it observes the
    /// closed flag and tears its own connection down. Close failures are
    /// logged and swallowed; the broker reclaims a half-closed connection on
    /// its own heartbeat timeout.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connection = self
            .connection
            .get_or_try_init(|| async { Err(BrokerError::closed("connection manager")) })
            .await;
        if let Ok(connection) = connection {
            if let Err(e) = connection.close().await {
                tracing::error!(error = %e, "error closing broker connection");
            } else {
                tracing::info!("broker connection closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::transport::in_memory::{InMemoryBroker, InMemoryTransport};
    use crate::transport::BrokerChannel;

    fn manager_with_transport() -> (Arc<InMemoryTransport>, ConnectionManager) {
        let transport = Arc::new(InMemoryTransport::new(InMemoryBroker::new()));
        let manager = ConnectionManager::new(
            Arc::clone(&transport) as Arc<dyn BrokerTransport>,
            ConnectionConfig::default(),
        );
        (transport, manager)
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_connect_attempt() {
        let (transport, manager) = manager_with_transport();
        let manager = Arc::new(manager);

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(
                async move { manager.get_connection().await },
            ));
        }

        let mut connections = Vec::new();
        for task in tasks {
            connections.push(task.await.unwrap().expect("connect should succeed"));
        }

        assert_eq!(transport.connect_attempts(), 1);
        let first = &connections[0];
        for connection in &connections[1..] {
            assert!(Arc::ptr_eq(first, connection));
        }
    }

    #[tokio::test]
    async fn test_failed_attempt_is_not_cached() {
        let (transport, manager) = manager_with_transport();
        transport.fail_next_connects(1);

        let first = manager.get_connection().await;
        assert!(matches!(first, Err(BrokerError::Connection { .. })));

        // A fresh attempt is made and succeeds.
        let second = manager.get_connection().await;
        assert!(second.is_ok());
        assert_eq!(transport.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_subsequent_calls_reuse_the_connection() {
        let (transport, manager) = manager_with_transport();

        let first = manager.get_connection().await.unwrap();
        let second = manager.get_connection().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(transport.connect_attempts(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_further_use() {
        let (_transport, manager) = manager_with_transport();
        manager.get_connection().await.unwrap();

        manager.close().await;
        manager.close().await; // no-op

        assert!(matches!(
            manager.get_connection().await,
            Err(BrokerError::Closed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_without_connection_is_a_noop() {
        let (transport, manager) = manager_with_transport();
        manager.close().await;
        assert_eq!(transport.connect_attempts(), 0);
    }

    /// Transport whose connect parks on a semaphore, so a shutdown can be
    /// interleaved mid-attempt.
    struct GatedTransport {
        gate: Arc<Semaphore>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrokerTransport for GatedTransport {
        async fn connect(
            &self,
            _config: &ConnectionConfig,
        ) -> BrokerResult<Arc<dyn BrokerConnection>> {
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|_| BrokerError::connection("gate closed"))?;
            permit.forget();
            Ok(Arc::new(CountingConnection {
                closes: Arc::clone(&self.closes),
            }))
        }
    }

    struct CountingConnection {
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl BrokerConnection for CountingConnection {
        async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
            Err(BrokerError::internal("not used in this test"))
        }

        async fn close(&self) -> BrokerResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_racing_first_connect_does_not_leak() {
        let gate = Arc::new(Semaphore::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(ConnectionManager::new(
            Arc::new(GatedTransport {
                gate: Arc::clone(&gate),
                closes: Arc::clone(&closes),
            }),
            ConnectionConfig::default(),
        ));

        // First caller parks inside the transport's connect.
        let caller = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_connection().await })
        };
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // Shutdown begins while the attempt is still in flight.
        let closer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.close().await })
        };
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // The attempt now completes, after the closed flag was set.
        gate.add_permits(1);

        let result = caller.await.unwrap();
        closer.await.unwrap();

        assert!(matches!(result, Err(BrokerError::Closed { .. })));
        // The connection established mid-shutdown was closed, exactly once.
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.get_connection().await,
            Err(BrokerError::Closed { .. })
        ));
    }
}
