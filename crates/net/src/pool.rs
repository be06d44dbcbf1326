//! A connection pool whose sockets can all be torn down from another thread.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::error::NetError;

#[derive(Debug, Default)]
struct PoolState {
    closed: bool,
    live: HashMap<u64, TcpStream>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<PoolState>,
    next_id: AtomicU64,
    connect_timeout: Option<Duration>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a set of live sockets. Clones share the same pool.
///
/// Once closed a pool stays closed; create a new one for further work.
#[derive(Debug, Clone, Default)]
pub struct CancellablePool {
    inner: Arc<Inner>,
}

impl CancellablePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(timeout: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connect_timeout: timeout,
                ..Inner::default()
            }),
        }
    }

    /// Open a TCP connection and track it until it is dropped.
    pub fn connect(&self, host: &str, port: u16) -> Result<PooledConnection, NetError> {
        if self.is_closed() {
            return Err(NetError::PoolClosed);
        }

        // IPv6 literals come bracketed from URLs.
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let stream = match self.inner.connect_timeout {
            Some(timeout) => connect_timeout((host, port), timeout)?,
            None => TcpStream::connect((host, port))?,
        };
        let tracked = stream.try_clone()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut state = self.inner.lock();
            if state.closed {
                let _ = stream.shutdown(Shutdown::Both);
                return Err(NetError::PoolClosed);
            }
            state.live.insert(id, tracked);
        }

        debug!(host, port, connection = id, "connection opened");
        Ok(PooledConnection {
            id,
            stream,
            pool: Arc::clone(&self.inner),
        })
    }

    /// Shut down every live socket and refuse further connections.
    ///
    /// Blocked reads and writes on those sockets fail or see end-of-stream.
    /// Calling it again has no effect.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }

        let count = state.live.len();
        for (_, stream) in state.live.drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        state.closed = true;
        debug!(connections = count, "connection pool closed");
    }

    /// A callback that closes this pool, for use as a bounded-call cancel hook.
    pub fn canceller(&self) -> impl FnOnce() + Send + 'static {
        let pool = self.clone();
        move || pool.close()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn live_connections(&self) -> usize {
        self.inner.lock().live.len()
    }
}

fn connect_timeout(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<TcpStream> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "host resolved to no addresses")
    }))
}

/// A socket opened through a [`CancellablePool`].
#[derive(Debug)]
pub struct PooledConnection {
    id: u64,
    stream: TcpStream,
    pool: Arc<Inner>,
}

impl PooledConnection {
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    /// Another handle to the same socket. The pool still shuts it down on
    /// `close`, and it stays registered for as long as `self` is alive.
    pub(crate) fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }
}

impl Read for PooledConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for PooledConnection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.lock().live.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    /// Accepts connections and holds them open without writing anything.
    fn silent_server() -> (SocketAddr, mpsc::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        thread::spawn(move || {
            let mut held = Vec::new();
            listener.set_nonblocking(true).unwrap();
            loop {
                if let Ok((stream, _)) = listener.accept() {
                    held.push(stream);
                }
                match stop_rx.recv_timeout(Duration::from_millis(5)) {
                    Err(mpsc::RecvTimeoutError::Timeout) => continue,
                    _ => break,
                }
            }
        });
        (addr, stop_tx)
    }

    #[test]
    fn connections_are_tracked_until_dropped() {
        let (addr, _stop) = silent_server();
        let pool = CancellablePool::new();

        let first = pool.connect("127.0.0.1", addr.port()).unwrap();
        let second = pool.connect("127.0.0.1", addr.port()).unwrap();
        assert_eq!(pool.live_connections(), 2);

        drop(first);
        assert_eq!(pool.live_connections(), 1);
        drop(second);
        assert_eq!(pool.live_connections(), 0);
    }

    #[test]
    fn connect_after_close_fails_fast() {
        let (addr, _stop) = silent_server();
        let pool = CancellablePool::new();
        pool.close();

        let err = pool.connect("127.0.0.1", addr.port()).unwrap_err();
        assert!(matches!(err, NetError::PoolClosed));
    }

    #[test]
    fn close_is_idempotent() {
        let pool = CancellablePool::new();
        pool.close();
        pool.close();
        assert!(pool.is_closed());
    }

    #[test]
    fn close_unblocks_a_parked_read() {
        let (addr, _stop) = silent_server();
        let pool = CancellablePool::new();
        let mut conn = pool.connect("127.0.0.1", addr.port()).unwrap();

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 16];
            let result = conn.read(&mut buf);
            let _ = done_tx.send(result.map_err(|e| e.kind()));
        });

        // Give the reader time to park.
        thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        pool.canceller()();

        let outcome = done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        // Either end-of-stream or an error, never data.
        assert!(matches!(outcome, Ok(0) | Err(_)));
        assert_eq!(pool.live_connections(), 0);
    }

    #[test]
    fn connect_timeout_reports_refused_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let pool = CancellablePool::with_connect_timeout(Some(Duration::from_millis(200)));
        let err = pool.connect("127.0.0.1", port).unwrap_err();
        assert!(matches!(err, NetError::Io(_)));
    }
}
