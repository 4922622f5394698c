//! Integration tests for chained dialing
//!
//! A small SOCKS5 server and an in-process SSH server run on loopback and
//! relay to real listeners, so full chains can be exercised without
//! external services.

use async_trait::async_trait;
use proxy_chain::common::socks::ReplyCode;
use proxy_chain::config::{MemoryRepository, ProxyStatus};
use proxy_chain::{
    Config, DialContext, Dialer, Error, ProxyManager, ProxyRepository, Socks5Client, SshTunnel,
};
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use russh_keys::key::KeyPair;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

/// What the mock SOCKS5 server saw on one connection
#[derive(Debug, PartialEq)]
enum Event {
    Connect(String, u16),
    AuthRejected,
    ClosedAfterAuthFailure,
}

struct MockSocks5 {
    credentials: Option<(&'static str, &'static str)>,
    reply: u8,
}

impl MockSocks5 {
    fn open() -> Self {
        MockSocks5 {
            credentials: None,
            reply: 0x00,
        }
    }

    fn with_credentials(user: &'static str, pass: &'static str) -> Self {
        MockSocks5 {
            credentials: Some((user, pass)),
            reply: 0x00,
        }
    }

    fn rejecting(reply: u8) -> Self {
        MockSocks5 {
            credentials: None,
            reply,
        }
    }

    async fn spawn(self) -> (SocketAddr, mpsc::UnboundedReceiver<Event>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(self);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let server = server.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _ = server.handle(stream, tx).await;
                });
            }
        });

        (addr, rx)
    }

    async fn handle(
        &self,
        mut stream: TcpStream,
        events: mpsc::UnboundedSender<Event>,
    ) -> std::io::Result<()> {
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        match self.credentials {
            Some((user, pass)) => {
                if !methods.contains(&0x02) {
                    stream.write_all(&[0x05, 0xFF]).await?;
                    return Ok(());
                }
                stream.write_all(&[0x05, 0x02]).await?;

                let mut ver_ulen = [0u8; 2];
                stream.read_exact(&mut ver_ulen).await?;
                let mut got_user = vec![0u8; ver_ulen[1] as usize];
                stream.read_exact(&mut got_user).await?;
                let plen = stream.read_u8().await?;
                let mut got_pass = vec![0u8; plen as usize];
                stream.read_exact(&mut got_pass).await?;

                if got_user != user.as_bytes() || got_pass != pass.as_bytes() {
                    stream.write_all(&[0x01, 0x01]).await?;
                    let _ = events.send(Event::AuthRejected);
                    // Anything further from the client would be a protocol violation.
                    let mut rest = Vec::new();
                    stream.read_to_end(&mut rest).await?;
                    if rest.is_empty() {
                        let _ = events.send(Event::ClosedAfterAuthFailure);
                    }
                    return Ok(());
                }
                stream.write_all(&[0x01, 0x00]).await?;
            }
            None => stream.write_all(&[0x05, 0x00]).await?,
        }

        let mut req = [0u8; 4];
        stream.read_exact(&mut req).await?;
        let host = match req[3] {
            0x01 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                std::net::Ipv4Addr::from(ip).to_string()
            }
            0x03 => {
                let len = stream.read_u8().await?;
                let mut name = vec![0u8; len as usize];
                stream.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            0x04 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                std::net::Ipv6Addr::from(ip).to_string()
            }
            _ => return Ok(()),
        };
        let port = stream.read_u16().await?;
        let _ = events.send(Event::Connect(host.clone(), port));

        if self.reply != 0x00 {
            stream
                .write_all(&[0x05, self.reply, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await?;
            return Ok(());
        }

        let mut upstream = TcpStream::connect((host.as_str(), port)).await?;
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x1F, 0x90])
            .await?;
        tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        Ok(())
    }
}

async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = stream.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    addr
}

/// Accepts connections and hangs up immediately, like a dead SSH daemon
async fn spawn_hangup() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            drop(stream);
        }
    });
    addr
}

/// In-process SSH server accepting one password and relaying
/// `direct-tcpip` channels to their requested targets
#[derive(Clone)]
struct MockSshd {
    user: &'static str,
    password: &'static str,
    forwards: mpsc::UnboundedSender<(String, u16)>,
}

impl MockSshd {
    async fn spawn(
        user: &'static str,
        password: &'static str,
    ) -> (SocketAddr, mpsc::UnboundedReceiver<(String, u16)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::new(server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys: vec![KeyPair::generate_ed25519().unwrap()],
            ..Default::default()
        });
        let handler = MockSshd {
            user,
            password,
            forwards: tx,
        };

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = config.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(session) = server::run_stream(config, stream, handler).await {
                        let _ = session.await;
                    }
                });
            }
        });

        (addr, rx)
    }
}

#[async_trait]
impl server::Handler for MockSshd {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == self.user && password == self.password {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let host = host_to_connect.to_string();
        let port = port_to_connect as u16;
        let _ = self.forwards.send((host.clone(), port));

        tokio::spawn(async move {
            let mut channel = channel.into_stream();
            if let Ok(mut upstream) = TcpStream::connect((host.as_str(), port)).await {
                let _ = tokio::io::copy_bidirectional(&mut channel, &mut upstream).await;
            }
        });
        Ok(true)
    }
}

async fn assert_echo(conn: &mut Box<dyn proxy_chain::ProxyConnection>, payload: &[u8]) {
    conn.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(WAIT, conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

#[tokio::test]
async fn test_socks5_connect_relays_bytes() {
    let echo = spawn_echo().await;
    let (proxy, mut events) = MockSocks5::open().spawn().await;

    let client = Socks5Client::new("edge", "127.0.0.1", proxy.port());
    let ctx = DialContext::new();
    let mut conn = client.dial(&ctx, "tcp", &echo.to_string()).await.unwrap();

    assert_eq!(
        events.recv().await,
        Some(Event::Connect("127.0.0.1".to_string(), echo.port()))
    );
    assert_echo(&mut conn, b"ping").await;
}

#[tokio::test]
async fn test_socks5_password_auth_accepted() {
    let echo = spawn_echo().await;
    let (proxy, mut events) = MockSocks5::with_credentials("admin", "secret").spawn().await;

    let client = Socks5Client::new("edge", "127.0.0.1", proxy.port())
        .with_credentials(Some("admin".into()), Some("secret".into()));
    let mut conn = client
        .dial(&DialContext::new(), "tcp", &echo.to_string())
        .await
        .unwrap();

    assert!(matches!(events.recv().await, Some(Event::Connect(_, p)) if p == echo.port()));
    assert_echo(&mut conn, b"hello through auth").await;
}

#[tokio::test]
async fn test_socks5_auth_failure_sends_no_connect() {
    let (proxy, mut events) = MockSocks5::with_credentials("admin", "secret").spawn().await;

    let client = Socks5Client::new("edge", "127.0.0.1", proxy.port())
        .with_credentials(Some("admin".into()), Some("wrong".into()));
    let err = client
        .dial(&DialContext::new(), "tcp", "10.0.0.5:22")
        .await
        .err()
        .unwrap();

    assert!(matches!(err.root_cause(), Error::Auth(_)), "got {}", err);
    assert_eq!(events.recv().await, Some(Event::AuthRejected));
    assert_eq!(
        timeout(WAIT, events.recv()).await.unwrap(),
        Some(Event::ClosedAfterAuthFailure)
    );
}

#[tokio::test]
async fn test_socks5_connect_rejected_reports_reply() {
    let (proxy, mut events) = MockSocks5::rejecting(0x05).spawn().await;

    let client = Socks5Client::new("edge", "127.0.0.1", proxy.port());
    let err = client
        .dial(&DialContext::new(), "tcp", "10.0.0.5:22")
        .await
        .err()
        .unwrap();

    assert!(matches!(
        err.root_cause(),
        Error::Socks5(ReplyCode::ConnectionRefused)
    ));
    assert!(err.to_string().contains("connection refused"));
    assert_eq!(
        events.recv().await,
        Some(Event::Connect("10.0.0.5".to_string(), 22))
    );
}

#[tokio::test]
async fn test_socks5_over_socks5_chain() {
    let echo = spawn_echo().await;
    let (outer, mut outer_events) = MockSocks5::open().spawn().await;
    let (inner, mut inner_events) = MockSocks5::open().spawn().await;

    let first: Arc<dyn Dialer> = Arc::new(Socks5Client::new("first", "127.0.0.1", outer.port()));
    let second = Socks5Client::new("second", "127.0.0.1", inner.port()).with_parent(first);

    let mut conn = second
        .dial(&DialContext::new(), "tcp", &echo.to_string())
        .await
        .unwrap();

    // The first hop is asked for the second proxy, the second for the target.
    assert_eq!(
        outer_events.recv().await,
        Some(Event::Connect("127.0.0.1".to_string(), inner.port()))
    );
    assert_eq!(
        inner_events.recv().await,
        Some(Event::Connect("127.0.0.1".to_string(), echo.port()))
    );
    assert_echo(&mut conn, b"two hops").await;
}

#[tokio::test]
async fn test_socks5_test_connection_uses_default_target() {
    let (proxy, mut events) = MockSocks5::rejecting(0x02).spawn().await;
    let client = Socks5Client::new("edge", "127.0.0.1", proxy.port());

    let err = client.test_connection(&DialContext::new()).await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        Error::Socks5(ReplyCode::ConnectionNotAllowed)
    ));
    assert_eq!(
        events.recv().await,
        Some(Event::Connect("8.8.8.8".to_string(), 53))
    );
}

#[tokio::test]
async fn test_socks5_cancelled_before_dial() {
    let (proxy, _events) = MockSocks5::open().spawn().await;
    let client = Socks5Client::new("edge", "127.0.0.1", proxy.port());

    let ctx = DialContext::new();
    ctx.cancel();
    let err = client.dial(&ctx, "tcp", "10.0.0.5:22").await.err().unwrap();
    assert!(matches!(err.root_cause(), Error::Cancelled));
}

fn manager_config(socks_port: u16, ssh_port: u16, test_target: SocketAddr) -> Config {
    let yaml = format!(
        r#"
log-level: debug
dialer:
  handshake-timeout: 5
  max-chain-depth: 4
  test-target: "{test_target}"
proxies:
  - id: 1
    name: jump-socks
    type: socks5
    host: 127.0.0.1
    port: {socks_port}
  - id: 2
    name: device-ssh
    type: ssh
    host: 127.0.0.1
    port: {ssh_port}
    username: monitor
    password: secret
    parent-proxy-id: 1
  - id: 3
    name: switched-off
    type: socks5
    host: 127.0.0.1
    port: {socks_port}
    enabled: false
"#
    );
    Config::from_str(&yaml).unwrap()
}

#[tokio::test]
async fn test_manager_dials_through_socks5_hop() {
    let echo = spawn_echo().await;
    let (proxy, mut events) = MockSocks5::open().spawn().await;
    let config = manager_config(proxy.port(), 1, echo);

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo, config.dialer.clone());
    let ctx = DialContext::new();

    let dialer = manager.get_dialer(&ctx, 1).await.unwrap();
    let mut conn = dialer.dial(&ctx, "tcp", &echo.to_string()).await.unwrap();
    assert!(matches!(events.recv().await, Some(Event::Connect(_, p)) if p == echo.port()));
    assert_echo(&mut conn, b"managed").await;

    assert_eq!(manager.cached_count(), (0, 1));
    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manager_ssh_over_socks5_reaches_ssh_host_through_parent() {
    let echo = spawn_echo().await;
    let ssh_host = spawn_hangup().await;
    let (proxy, mut events) = MockSocks5::open().spawn().await;
    let config = manager_config(proxy.port(), ssh_host.port(), echo);

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo, config.dialer.clone());

    let err = timeout(WAIT, manager.get_dialer(&DialContext::new(), 2))
        .await
        .unwrap()
        .err()
        .unwrap();

    // The SSH handshake fails, but only after the parent carried the connection.
    assert_eq!(
        events.recv().await,
        Some(Event::Connect("127.0.0.1".to_string(), ssh_host.port()))
    );
    assert!(err.to_string().contains("failed to create SSH tunnel"), "got {}", err);
    assert!(!err.is_config_error());
    assert_eq!(manager.cached_count().0, 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_ssh_tunnel_forwards_channel() {
    let echo = spawn_echo().await;
    let (sshd, mut forwards) = MockSshd::spawn("monitor", "secret").await;

    let tunnel = SshTunnel::new("core-jump", "127.0.0.1", sshd.port(), "monitor", "secret");
    let ctx = DialContext::new();
    timeout(WAIT, tunnel.connect(&ctx)).await.unwrap().unwrap();
    assert!(tunnel.is_connected());

    let mut conn = tunnel.dial(&ctx, "tcp", &echo.to_string()).await.unwrap();
    assert_echo(&mut conn, b"hi").await;
    assert_eq!(
        forwards.recv().await,
        Some(("127.0.0.1".to_string(), echo.port()))
    );

    tunnel.close().await.unwrap();
    assert!(!tunnel.is_connected());
    let err = tunnel.dial(&ctx, "tcp", &echo.to_string()).await.err().unwrap();
    assert!(matches!(err, Error::NotConnected(_)));
}

#[tokio::test]
async fn test_ssh_tunnel_wrong_password() {
    let (sshd, _forwards) = MockSshd::spawn("monitor", "secret").await;

    let tunnel = SshTunnel::new("core-jump", "127.0.0.1", sshd.port(), "monitor", "wrong");
    let err = timeout(WAIT, tunnel.connect(&DialContext::new()))
        .await
        .unwrap()
        .unwrap_err();

    assert!(matches!(err.root_cause(), Error::Auth(_)), "got {}", err);
    assert!(err.to_string().contains("monitor"));
    assert!(!tunnel.is_connected());
}

#[tokio::test]
async fn test_manager_ssh_over_socks5_end_to_end() {
    let echo = spawn_echo().await;
    let (sshd, mut forwards) = MockSshd::spawn("monitor", "secret").await;
    let (proxy, mut events) = MockSocks5::open().spawn().await;
    let config = manager_config(proxy.port(), sshd.port(), echo);

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo, config.dialer.clone());
    let ctx = DialContext::new();

    let dialer = timeout(WAIT, manager.get_dialer(&ctx, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        events.recv().await,
        Some(Event::Connect("127.0.0.1".to_string(), sshd.port()))
    );

    // Two channels share the one cached session.
    for payload in [&b"first channel"[..], &b"second channel"[..]] {
        let mut conn = dialer.dial(&ctx, "tcp", &echo.to_string()).await.unwrap();
        assert_echo(&mut conn, payload).await;
        assert_eq!(
            forwards.recv().await,
            Some(("127.0.0.1".to_string(), echo.port()))
        );
    }

    let again = manager.get_dialer(&ctx, 2).await.unwrap();
    assert_eq!(
        Arc::as_ptr(&dialer) as *const (),
        Arc::as_ptr(&again) as *const ()
    );
    assert!(events.try_recv().is_err());
    assert_eq!(manager.cached_count().0, 1);

    manager.shutdown().await.unwrap();
    assert_eq!(manager.cached_count(), (0, 0));
}

#[tokio::test]
async fn test_manager_ssh_over_socks5_wrong_password() {
    let echo = spawn_echo().await;
    let (sshd, _forwards) = MockSshd::spawn("monitor", "rotated").await;
    let (proxy, _events) = MockSocks5::open().spawn().await;
    let config = manager_config(proxy.port(), sshd.port(), echo);

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo, config.dialer.clone());

    let err = timeout(WAIT, manager.get_dialer(&DialContext::new(), 2))
        .await
        .unwrap()
        .err()
        .unwrap();
    assert!(matches!(err.root_cause(), Error::Auth(_)), "got {}", err);
    assert!(err.to_string().contains("failed to create SSH tunnel"));
    assert_eq!(manager.cached_count().0, 0);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manager_disabled_proxy_is_config_error() {
    let (proxy, mut events) = MockSocks5::open().spawn().await;
    let config = manager_config(proxy.port(), 1, "127.0.0.1:1".parse().unwrap());

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo, config.dialer.clone());

    let err = manager.get_dialer(&DialContext::new(), 3).await.err().unwrap();
    assert!(err.is_config_error());
    assert!(matches!(err, Error::ProxyDisabled(3)));
    assert!(events.try_recv().is_err());

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_manager_test_proxy_records_status() {
    let echo = spawn_echo().await;
    let (proxy, _events) = MockSocks5::open().spawn().await;
    let config = manager_config(proxy.port(), 1, echo);

    let repo = Arc::new(MemoryRepository::from_config(&config));
    let manager = ProxyManager::new(repo.clone(), config.dialer.clone());
    let ctx = DialContext::new();

    manager.test_proxy(&ctx, 1).await.unwrap();
    let record = repo.get_by_id(1).await.unwrap();
    assert_eq!(record.status, ProxyStatus::Connected);
    assert!(record.last_error.is_none());
    assert!(record.last_checked_at.is_some());

    // The tested hop is not cached.
    assert_eq!(manager.cached_count(), (0, 0));

    assert!(manager.test_proxy(&ctx, 3).await.is_err());
    let record = repo.get_by_id(3).await.unwrap();
    assert_eq!(record.status, ProxyStatus::Error);
    assert!(record.last_error.unwrap().contains("disabled"));

    manager.shutdown().await.unwrap();
    assert!(matches!(
        manager.get_dialer(&ctx, 1).await.err().unwrap(),
        Error::Shutdown
    ));
}
