//! Transport lifecycle scenarios: admission, scavenging, self-connect,
//! disconnect semantics, and shutdown under churn.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use nexbus::discovery::{NameService, NsEndpoints, PeerFoundCallback};
use nexbus::error::{Error, Result};
use nexbus::router::NullRouter;
use nexbus::transport::{establish_outbound, TcpTransport, TransportOptions};
use nexbus::TransportListener;

const TEST_GUID: &str = "itest-guid";

/// Name service double: remembers what the transport announced and does no
/// networking at all.
#[derive(Default)]
struct StubNameService {
    port: Mutex<u16>,
    advertised: Mutex<Vec<String>>,
    located: Mutex<Vec<String>>,
}

#[async_trait]
impl NameService for StubNameService {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    fn stop(&self) {}

    fn set_callback(&self, _callback: Option<PeerFoundCallback>) {}

    async fn open_interface(&self, _name_or_addr: &str) -> Result<()> {
        Ok(())
    }

    fn set_endpoints(&self, _ipv4: Option<IpAddr>, _ipv6: Option<IpAddr>, port: u16) {
        *self.port.lock() = port;
    }

    fn get_endpoints(&self) -> NsEndpoints {
        NsEndpoints {
            ipv4: Some("192.0.2.1".parse().unwrap()),
            ipv6: None,
            port: *self.port.lock(),
        }
    }

    async fn advertise(&self, name: &str) -> Result<()> {
        self.advertised.lock().push(name.to_string());
        Ok(())
    }

    async fn cancel(&self, name: &str) -> Result<()> {
        self.advertised.lock().retain(|n| n != name);
        Ok(())
    }

    async fn locate(&self, prefix: &str) -> Result<()> {
        self.located.lock().push(prefix.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    lost: Mutex<Vec<String>>,
}

impl TransportListener for RecordingListener {
    fn found_names(&self, _bus_addr: &str, _guid: &str, _transport: u16, _names: &[String], _timer: u8) {}

    fn bus_connection_lost(&self, connect_spec: &str) {
        self.lost.lock().push(connect_spec.to_string());
    }
}

fn test_options() -> TransportOptions {
    TransportOptions {
        auth_timeout: Duration::from_secs(30),
        max_auth: 10,
        max_conn: 50,
        interfaces: "*".to_string(),
        disable_broadcast: true,
        enable_ipv4: true,
        enable_ipv6: false,
        guid: TEST_GUID.to_string(),
    }
}

fn build_transport(
    options: TransportOptions,
) -> (TcpTransport, Arc<StubNameService>, Arc<RecordingListener>) {
    let ns = Arc::new(StubNameService::default());
    let ns_for_factory = ns.clone();
    let transport = TcpTransport::new(options, Arc::new(NullRouter)).with_name_service(Box::new(
        move |_| ns_for_factory.clone() as Arc<dyn NameService>,
    ));
    let listener = Arc::new(RecordingListener::default());
    transport.set_listener(listener.clone());
    (transport, ns, listener)
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Bring a transport up listening on an ephemeral loopback port; returns
/// the port the OS picked.
async fn listen_on_loopback(transport: &TcpTransport, ns: &StubNameService) -> u16 {
    transport.start().await.unwrap();
    transport
        .start_listen("tcp:addr=127.0.0.1,port=0")
        .unwrap();
    wait_for("listener to bind", || *ns.port.lock() != 0).await;
    *ns.port.lock()
}

/// Connect and run the full client side of the wire protocol: the zero
/// byte, then the handshake.
async fn attach(port: u16) -> TcpStream {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&[0u8]).await.unwrap();
    let guid = establish_outbound(&mut stream).await.unwrap();
    assert_eq!(guid, TEST_GUID);
    stream
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_inbound_then_orderly_disconnect() {
    let (transport, ns, listener) = build_transport(test_options());
    let port = listen_on_loopback(&transport, &ns).await;

    let mut client = attach(port).await;
    wait_for("endpoint to become active", || {
        transport.endpoint_counts() == (0, 1)
    })
    .await;

    // Disconnect by the same connect spec the peer is known under.
    let client_port = client.local_addr().unwrap().port();
    transport
        .disconnect(&format!("tcp:addr=127.0.0.1,port={}", client_port))
        .unwrap();

    wait_for("endpoint to drain", || transport.endpoint_counts() == (0, 0)).await;

    // Orderly teardown: the peer sees EOF and nothing is reported lost.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
    assert!(listener.lost.lock().is_empty());

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_authenticator_is_scavenged() {
    let options = TransportOptions {
        auth_timeout: Duration::from_millis(300),
        ..test_options()
    };
    let (transport, ns, _listener) = build_transport(options);
    let port = listen_on_loopback(&transport, &ns).await;

    // Send the zero byte then stall, like a denial-of-service client.
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[0u8]).await.unwrap();

    wait_for("record to enter authenticating list", || {
        transport.endpoint_counts().0 == 1
    })
    .await;
    wait_for("slow authenticator to be scavenged", || {
        transport.endpoint_counts() == (0, 0)
    })
    .await;

    // The aborted worker dropped the socket.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn admission_cap_rejects_excess_connections() {
    let options = TransportOptions {
        max_auth: 2,
        ..test_options()
    };
    let (transport, ns, _listener) = build_transport(options);
    let port = listen_on_loopback(&transport, &ns).await;

    // Two stalled connections occupy both authenticating slots.
    let _c1 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for("first record", || transport.endpoint_counts().0 == 1).await;
    let _c2 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for("second record", || transport.endpoint_counts().0 == 2).await;

    // The third is turned away at the door: no record, immediate EOF.
    let mut c3 = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let mut buf = [0u8; 1];
    let n = tokio::time::timeout(Duration::from_secs(5), c3.read(&mut buf))
        .await
        .expect("expected EOF, got hang")
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(transport.endpoint_counts().0, 2);

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_to_own_wildcard_listener_is_rejected() {
    let (transport, ns, _listener) = build_transport(test_options());
    transport.start().await.unwrap();
    transport.start_listen("tcp:addr=0.0.0.0,port=0").unwrap();
    wait_for("listener to bind", || *ns.port.lock() != 0).await;
    let port = *ns.port.lock();

    // The wildcard listener plus the loopback interface make this a
    // connection to ourselves; it must fail before any socket is opened.
    let result = transport
        .connect(&format!("tcp:addr=127.0.0.1,port={}", port))
        .await;
    assert!(matches!(result, Err(Error::AlreadyListening)));
    assert_eq!(transport.endpoint_counts(), (0, 0));

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_to_own_explicit_listener_is_rejected() {
    let (transport, ns, _listener) = build_transport(test_options());
    let port = listen_on_loopback(&transport, &ns).await;

    let result = transport
        .connect(&format!("tcp:addr=127.0.0.1,port={}", port))
        .await;
    assert!(matches!(result, Err(Error::AlreadyListening)));

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_listen_request_is_rejected() {
    let (transport, _ns, _listener) = build_transport(test_options());
    transport.start().await.unwrap();

    transport
        .start_listen("tcp:addr=127.0.0.1,port=0")
        .unwrap();
    // Lexically different, normalizes to the same spec.
    let result = transport.start_listen("tcp:port=0,addr=127.0.0.1");
    assert!(matches!(result, Err(Error::AlreadyListening)));

    // Un-requesting frees the spec for a later start.
    transport.stop_listen("tcp:addr=127.0.0.1,port=0").unwrap();
    transport
        .start_listen("tcp:addr=127.0.0.1,port=0")
        .unwrap();

    // Stopping a listen that was never requested is not an error.
    transport.stop_listen("tcp:addr=127.0.0.1,port=1").unwrap();

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_listen_tears_the_listener_down() {
    let (transport, ns, _listener) = build_transport(test_options());
    let port = listen_on_loopback(&transport, &ns).await;

    transport.stop_listen("tcp:addr=127.0.0.1,port=0").unwrap();

    wait_for("listener socket to close", || {
        std::net::TcpStream::connect_timeout(
            &format!("127.0.0.1:{}", port).parse().unwrap(),
            Duration::from_millis(100),
        )
        .is_err()
    })
    .await;

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unexpected_remote_drop_reports_lost_connection() {
    let (transport, ns, listener) = build_transport(test_options());
    let port = listen_on_loopback(&transport, &ns).await;

    let client = attach(port).await;
    wait_for("endpoint to become active", || {
        transport.endpoint_counts() == (0, 1)
    })
    .await;

    // The peer vanishes without a Disconnect.
    drop(client);

    wait_for("endpoint exit", || transport.endpoint_counts() == (0, 0)).await;
    wait_for("lost-connection report", || listener.lost.lock().len() == 1).await;

    // Exactly once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(listener.lost.lock().len(), 1);

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbound_connect_between_two_daemons() {
    let (server, server_ns, server_listener) = build_transport(test_options());
    let port = listen_on_loopback(&server, &server_ns).await;

    let (client, _client_ns, client_listener) = build_transport(test_options());
    client.start().await.unwrap();

    let spec = format!("tcp:addr=127.0.0.1,port={}", port);
    let ep = client.connect(&spec).await.unwrap();
    assert_eq!(ep.peer_port(), port);

    wait_for("both sides active", || {
        client.endpoint_counts() == (0, 1) && server.endpoint_counts() == (0, 1)
    })
    .await;

    // Orderly local disconnect: silent on the client...
    client.disconnect(&spec).unwrap();
    wait_for("client side drained", || client.endpoint_counts() == (0, 0)).await;
    assert!(client_listener.lost.lock().is_empty());

    // ...but the server experienced an unexpected remote drop.
    wait_for("server side drained", || server.endpoint_counts() == (0, 0)).await;
    wait_for("server lost report", || {
        server_listener.lost.lock().len() == 1
    })
    .await;

    client.stop();
    client.join().await;
    server.stop();
    server.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn connect_to_unreachable_port_fails_cleanly() {
    let (transport, _ns, _listener) = build_transport(test_options());
    transport.start().await.unwrap();

    // Bind-then-drop guarantees a port nobody is listening on.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = probe.local_addr().unwrap().port();
    drop(probe);

    let result = transport
        .connect(&format!("tcp:addr=127.0.0.1,port={}", dead_port))
        .await;
    assert!(result.is_err());
    assert_eq!(transport.endpoint_counts(), (0, 0));

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn double_start_is_rejected_and_restart_works() {
    let (transport, ns, _listener) = build_transport(test_options());
    let _port = listen_on_loopback(&transport, &ns).await;

    assert!(matches!(transport.start().await, Err(Error::AlreadyStarted)));

    transport.stop();
    transport.join().await;
    assert_eq!(transport.endpoint_counts(), (0, 0));

    // A stopped-and-joined transport can come back up.
    *ns.port.lock() = 0;
    transport.start().await.unwrap();
    transport
        .start_listen("tcp:addr=127.0.0.1,port=0")
        .unwrap();
    wait_for("listener to rebind", || *ns.port.lock() != 0).await;

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_under_churn_is_bounded_and_silent() {
    let (transport, ns, listener) = build_transport(test_options());
    let port = listen_on_loopback(&transport, &ns).await;

    // A mix of endpoints in every stage of life.
    let mut stalled = Vec::new();
    for _ in 0..8 {
        let mut c = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        c.write_all(&[0u8]).await.unwrap();
        stalled.push(c);
    }
    let mut active = Vec::new();
    for _ in 0..8 {
        active.push(attach(port).await);
    }
    for _ in 0..4 {
        let c = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        drop(c);
    }

    wait_for("active endpoints up", || transport.endpoint_counts().1 >= 8).await;

    transport.stop();
    tokio::time::timeout(Duration::from_secs(10), transport.join())
        .await
        .expect("join did not return in bounded time");

    assert_eq!(transport.endpoint_counts(), (0, 0));

    // Orderly shutdown is silent, and nothing fires after join returns.
    let lost_at_join = listener.lost.lock().len();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.lost.lock().len(), lost_at_join);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn discovery_surface_reaches_name_service() {
    use nexbus::common::local_interfaces;
    use nexbus::router::{SessionOpts, Traffic, TRANSPORT_LOCAL};

    let (transport, ns, _listener) = build_transport(test_options());
    transport.start().await.unwrap();

    transport
        .enable_advertisement("org.example.bus")
        .await
        .unwrap();
    assert_eq!(*ns.advertised.lock(), vec!["org.example.bus".to_string()]);

    // The wildcard is appended for the caller.
    transport.enable_discovery("org.example").await.unwrap();
    assert_eq!(*ns.located.lock(), vec!["org.example*".to_string()]);

    transport
        .disable_advertisement("org.example.bus", true)
        .await
        .unwrap();
    assert!(ns.advertised.lock().is_empty());

    // No listener announced yet: no addresses whatever the options.
    let opts = SessionOpts::default();
    assert!(transport.get_listen_addresses(&opts).unwrap().is_empty());

    transport
        .start_listen("tcp:addr=127.0.0.1,port=0")
        .unwrap();
    wait_for("listener to bind", || *ns.port.lock() != 0).await;

    // Unreliable traffic and non-IP transports are not ours to serve.
    let unreliable = SessionOpts {
        traffic: Traffic::RawUnreliable,
        ..SessionOpts::default()
    };
    assert!(transport.get_listen_addresses(&unreliable).unwrap().is_empty());
    let local_only = SessionOpts {
        transports: TRANSPORT_LOCAL,
        ..SessionOpts::default()
    };
    assert!(transport.get_listen_addresses(&local_only).unwrap().is_empty());

    // With a port announced, each UP non-loopback IPv4 interface yields a
    // bus address (the stub advertises IPv4 only).
    let addrs = transport.get_listen_addresses(&opts).unwrap();
    let expected = local_interfaces()
        .iter()
        .filter(|nif| !nif.is_loopback && nif.addr.is_ipv4())
        .count();
    assert_eq!(addrs.len(), expected);
    for addr in &addrs {
        assert!(addr.starts_with("tcp:addr="));
        assert!(addr.ends_with(&format!("port={}", *ns.port.lock())));
    }

    transport.stop();
    transport.join().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_and_join_without_start_are_harmless() {
    let (transport, _ns, _listener) = build_transport(test_options());
    transport.stop();
    transport.join().await;
    assert!(!transport.is_running());
}
