use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tracing::{debug, info, warn};

use crate::dispatcher::{JobHandler, PeerDispatcher, DEFAULT_PEER_IDLE};
use crate::handler::PortalHandler;
use crate::http::{HttpPetition, HttpResponse, READ_BUFFER};
use crate::settings::PortalSettings;

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub peer_idle: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            max_connections: 256,
            read_timeout: Duration::from_secs(5),
            peer_idle: DEFAULT_PEER_IDLE,
        }
    }
}

impl From<&PortalSettings> for ServerOptions {
    fn from(settings: &PortalSettings) -> Self {
        Self {
            max_connections: settings.max_connections,
            read_timeout: settings.read_timeout(),
            peer_idle: settings.peer_idle(),
        }
    }
}

/// A connection whose request has already been read off the wire.
struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    request: crate::Result<HttpPetition>,
    _permit: OwnedSemaphorePermit,
}

struct ConnectionWorker {
    handler: Arc<PortalHandler>,
    write_timeout: Duration,
}

#[async_trait]
impl JobHandler<Connection> for ConnectionWorker {
    async fn handle(&self, conn: Connection) {
        let Connection {
            mut stream,
            peer,
            request,
            _permit,
        } = conn;
        let response = match request {
            Ok(req) => self.handler.handle(&req).await,
            Err(err) => {
                debug!(%peer, "{err}");
                HttpResponse::text(400, "Bad Request")
            }
        };
        write_response(&mut stream, peer, &response, self.write_timeout).await;
    }
}

pub struct HttpServer {
    listener: TcpListener,
    dispatcher: PeerDispatcher<Connection>,
    max_connections: usize,
    read_timeout: Duration,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<PortalHandler>, opts: ServerOptions) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding portal listener to {addr}"))?;
        let worker = Arc::new(ConnectionWorker {
            handler,
            write_timeout: opts.read_timeout,
        });
        Ok(Self {
            listener,
            dispatcher: PeerDispatcher::new(worker, opts.peer_idle),
            max_connections: opts.max_connections.max(1),
            read_timeout: opts.read_timeout,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until `shutdown` is notified. Each socket is read on its own
    /// task; requests from one address are then handled in arrival order.
    pub async fn run(self, shutdown: Arc<Notify>) {
        let conn_limit = Arc::new(Semaphore::new(self.max_connections));
        if let Ok(addr) = self.local_addr() {
            info!("Portal listening on {addr}");
        }
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    info!("Portal listener shutting down");
                    break;
                }
                result = self.listener.accept() => {
                    let (stream, peer) = match result {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!("Accept error: {}", err);
                            continue;
                        }
                    };

                    let permit = match conn_limit.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(%peer, "Connection limit reached, rejecting");
                            continue;
                        }
                    };

                    tokio::spawn(read_connection(
                        stream,
                        peer,
                        permit,
                        self.dispatcher.clone(),
                        self.read_timeout,
                    ));
                }
            }
        }
    }
}

/// IPv4-mapped peers share a queue with their plain IPv4 form.
fn peer_key(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}

/// Reads the single request of a connection and queues it for its peer.
/// Silent or closed sockets never reach the queue.
async fn read_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    permit: OwnedSemaphorePermit,
    dispatcher: PeerDispatcher<Connection>,
    read_timeout: Duration,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let n = match time::timeout(read_timeout, stream.read(&mut buf)).await {
        Ok(Ok(0)) => return,
        Ok(Ok(n)) => n,
        Ok(Err(err)) => {
            debug!(%peer, "Read failed: {err}");
            return;
        }
        Err(_) => {
            debug!(%peer, "Read timed out");
            return;
        }
    };

    let key = peer_key(peer.ip());
    let request = HttpPetition::parse(&buf[..n], key);
    dispatcher.submit(
        key,
        Connection {
            stream,
            peer,
            request,
            _permit: permit,
        },
    );
}

async fn write_response(
    stream: &mut TcpStream,
    peer: SocketAddr,
    response: &HttpResponse,
    write_timeout: Duration,
) {
    match time::timeout(write_timeout, stream.write_all(&response.to_bytes())).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(%peer, "Write failed: {err}"),
        Err(_) => debug!(%peer, "Write timed out"),
    }
    let _ = stream.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::PortalContext;
    use crate::session::{InMemorySessionStore, InMemoryUserDirectory};
    use hotgate_net::testing::SimulatedHost;
    use hotgate_net::{shared, NetworkConfiguration, NetworkOrchestrator, SystemPaths, Timings};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    async fn start() -> (TempDir, SocketAddr, Arc<Notify>, tokio::task::JoinHandle<()>) {
        let tmp = TempDir::new().unwrap();
        let host = Arc::new(SimulatedHost::new());
        let orchestrator = Arc::new(NetworkOrchestrator::new(
            host,
            shared(NetworkConfiguration::default()),
            SystemPaths::default().relocated(tmp.path()),
            Timings::immediate(),
        ));
        let handler = Arc::new(PortalHandler::new(PortalContext {
            sessions: Arc::new(InMemorySessionStore::new()),
            users: Arc::new(InMemoryUserDirectory::new()),
            resolver: Arc::new(orchestrator.mac_resolver()),
            firewall: Arc::new(orchestrator.firewall()),
            orchestrator,
            visits: None,
        }));
        let server = HttpServer::bind(
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            handler,
            ServerOptions {
                read_timeout: Duration::from_millis(500),
                ..ServerOptions::default()
            },
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(server.run(shutdown.clone()));
        (tmp, addr, shutdown, task)
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn serves_one_request_per_connection() {
        let (_tmp, addr, shutdown, task) = start().await;

        let status = exchange(addr, b"GET /api/network/status HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(status.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(status.contains("\"state\":\"down\""));
        assert!(status.contains("Connection: close"));

        let favicon = exchange(addr, b"GET /favicon.ico HTTP/1.1\r\n\r\n").await;
        assert!(favicon.starts_with("HTTP/1.1 204 No Content\r\n"));

        let garbage = exchange(addr, b"\x16\x03\x01\x00\xa5\x01\x00\x00\xa1\x03\x03").await;
        assert!(garbage.starts_with("HTTP/1.1 400 Bad Request\r\n"));

        shutdown.notify_one();
        time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_timeout() {
        let (_tmp, addr, shutdown, _task) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut out = Vec::new();
        let read = time::timeout(Duration::from_secs(3), stream.read_to_end(&mut out)).await;
        assert!(read.is_ok());
        assert!(out.is_empty());
        shutdown.notify_one();
    }

    #[tokio::test]
    async fn idle_socket_does_not_hold_up_its_peer() {
        let (_tmp, addr, shutdown, _task) = start().await;
        let _idle = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let favicon = exchange(addr, b"GET /favicon.ico HTTP/1.1\r\n\r\n").await;
        assert!(favicon.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(
            started.elapsed() < Duration::from_millis(400),
            "answered after {:?}",
            started.elapsed()
        );
        shutdown.notify_one();
    }

    #[test]
    fn mapped_peers_share_a_key() {
        let mapped: IpAddr = "::ffff:192.168.50.23".parse().unwrap();
        assert_eq!(peer_key(mapped), IpAddr::from([192, 168, 50, 23]));
        let v6: IpAddr = "fe80::1".parse().unwrap();
        assert_eq!(peer_key(v6), v6);
    }
}
