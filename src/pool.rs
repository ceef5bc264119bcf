//! Per-node idle-connection pool: connect, liveness check, recycle, destroy.
//!
//! Mirrors the RAII discipline of the server's own `ConnectionGuard` (drop
//! means cleanup) but for outbound connections: a `PooledConnection` that is
//! neither `put` back nor explicitly destroyed is simply dropped, which
//! closes the underlying socket.

use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::PoolError;

/// An idle-queue-backed connection handle. `Drop` closes the socket if it was
/// never returned to the pool.
pub struct PooledConnection {
    stream: Option<TcpStream>,
}

impl PooledConnection {
    /// Borrow the underlying stream for a read/write.
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.stream.as_mut().expect("connection already consumed")
    }

    fn take(mut self) -> TcpStream {
        self.stream.take().expect("connection already consumed")
    }
}

/// A bounded LIFO idle-connection queue for a single node's endpoint set.
pub struct ConnectionPool {
    idle: Mutex<Vec<TcpStream>>,
    max_idle: usize,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_idle: usize, connect_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            connect_timeout,
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Pops the most-recently-pushed idle connection, verifying it is still
    /// alive with a non-destructive liveness probe before handing it back.
    /// Falls through to establishing a fresh connection if the idle queue is
    /// empty or every idle entry was stale.
    pub async fn get(&self, endpoints: &[SocketAddr]) -> Result<PooledConnection, PoolError> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                None => break,
                Some(stream) => match probe_liveness(&stream) {
                    Liveness::Alive => return Ok(PooledConnection { stream: Some(stream) }),
                    Liveness::PeerClosed => {
                        debug!("discarding idle connection closed by peer");
                        continue;
                    }
                    Liveness::Invalid => {
                        warn!("discarding idle connection with invalid descriptor state");
                        continue;
                    }
                    Liveness::Error => {
                        warn!("idle connection liveness probe errored, dunning node");
                        return Err(PoolError::Transient);
                    }
                },
            }
        }

        self.connect(endpoints).await
    }

    /// Returns a connection to the idle queue, closing it instead if the pool
    /// is already at capacity.
    pub fn put(&self, conn: PooledConnection) {
        let stream = conn.take();
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(stream);
        } else {
            drop(stream);
        }
    }

    /// Drains and closes every idle connection. Called when a node is
    /// destroyed, before its memory is released.
    pub fn drain(&self) {
        let drained: Vec<_> = self.idle.lock().drain(..).collect();
        debug!(count = drained.len(), "draining connection pool");
        drop(drained);
    }

    async fn connect(&self, endpoints: &[SocketAddr]) -> Result<PooledConnection, PoolError> {
        if endpoints.is_empty() {
            return Err(PoolError::Fatal);
        }

        let mut last_refused = false;
        for addr in endpoints {
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    return Ok(PooledConnection { stream: Some(stream) });
                }
                Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                    // Recorded but does not by itself dun the node.
                    last_refused = true;
                    continue;
                }
                Ok(Err(_)) | Err(_) => continue,
            }
        }

        let _ = last_refused;
        Err(PoolError::Transient)
    }
}

enum Liveness {
    Alive,
    PeerClosed,
    Invalid,
    Error,
}

/// Non-destructive liveness probe: a non-blocking peek of zero meaningful
/// bytes that distinguishes connected-idle, peer-closed, error, and invalid.
fn probe_liveness(stream: &TcpStream) -> Liveness {
    let mut buf = [0u8; 1];
    match stream.try_read(&mut buf) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Liveness::Alive,
        Ok(0) => Liveness::PeerClosed,
        Ok(_) => Liveness::Invalid,
        Err(_) => Liveness::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_endpoints_is_fatal() {
        let pool = ConnectionPool::new(4, Duration::from_millis(100));
        let err = pool.get(&[]).await.unwrap_err();
        assert_eq!(err, PoolError::Fatal);
    }

    #[tokio::test]
    async fn get_connects_and_put_recycles() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });

        let pool = ConnectionPool::new(4, Duration::from_millis(500));
        let conn = pool.get(&[addr]).await.unwrap();
        assert_eq!(pool.idle_count(), 0);
        pool.put(conn);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn put_above_capacity_closes_instead_of_queuing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    return;
                }
            }
        });

        let pool = ConnectionPool::new(1, Duration::from_millis(500));
        let a = pool.get(&[addr]).await.unwrap();
        let b = pool.get(&[addr]).await.unwrap();
        pool.put(a);
        pool.put(b);
        assert_eq!(pool.idle_count(), 1);
    }
}
