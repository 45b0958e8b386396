//! End-to-end proxy tests
//!
//! These tests run the whole broker on loopback ports: a public server, an
//! agent listener with a real handshake, and WebSocket agents driven from
//! the test. Public requests are raw TCP writes, exactly like a browser in
//! front of the broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use pylon_control::{AgentListener, PendingExchanges, TunnelHandler};
use pylon_directory::AgentDirectory;
use pylon_proto::http::{BAD_GATEWAY, BAD_REQUEST, GATEWAY_TIMEOUT};
use pylon_server_http::{PublicServer, PublicServerConfig};
use pylon_store::MemoryStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::info;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

struct TestBroker {
    public_addr: SocketAddr,
    agent_addr: SocketAddr,
    directory: Arc<AgentDirectory>,
}

/// Start a full broker on ephemeral ports: store seeded with one agent
/// owning app.example.com, agent listener, public server.
async fn start_broker(exchange_timeout: Duration) -> TestBroker {
    let store = Arc::new(MemoryStore::new());
    store.put("alice", "s3cr3t");
    store.hset("alice", "app.example.com", "127.0.0.1:3000");

    let directory = Arc::new(AgentDirectory::new());
    let pending = Arc::new(PendingExchanges::new());

    let handler = Arc::new(TunnelHandler::new(
        directory.clone(),
        store,
        pending.clone(),
    ));
    let agent_listener = AgentListener::bind("127.0.0.1:0".parse().unwrap(), handler)
        .await
        .expect("Failed to bind agent listener");
    let agent_addr = agent_listener.local_addr().unwrap();
    tokio::spawn(async move {
        agent_listener.run().await;
    });

    let config = PublicServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        exchange_timeout,
    };
    let public_server = PublicServer::bind(config, directory.clone(), pending)
        .await
        .expect("Failed to bind public server");
    let public_addr = public_server.local_addr().unwrap();
    tokio::spawn(async move {
        public_server.run().await;
    });

    TestBroker {
        public_addr,
        agent_addr,
        directory,
    }
}

async fn next_text(ws: &mut WsClient) -> String {
    let message = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("Timeout waiting for server message")
        .expect("Connection closed while waiting for server message")
        .expect("WebSocket error");
    match message {
        Message::Text(text) => text,
        other => panic!("Expected text message, got: {:?}", other),
    }
}

/// Connect and run the login exchange for alice.
async fn login_agent(agent_addr: SocketAddr) -> WsClient {
    let (mut ws, _response) = connect_async(format!("ws://{}", agent_addr))
        .await
        .expect("Failed to connect agent");

    assert_eq!(next_text(&mut ws).await, "Please login");
    ws.send(Message::Text("alice:s3cr3t".to_string()))
        .await
        .expect("Failed to send credentials");
    assert_eq!(next_text(&mut ws).await, "ok");
    let _listing = next_text(&mut ws).await;

    ws
}

/// Agent that answers every relayed frame with `HTTP/1.1 200 OK` plus an
/// echo of the request bytes, under the frame's own key.
fn spawn_echo_agent(mut ws: WsClient) {
    tokio::spawn(async move {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Binary(data) = message {
                let split = data
                    .iter()
                    .position(|&b| b == b'\n')
                    .expect("Frame without separator");

                let mut reply = Vec::with_capacity(data.len() + 32);
                reply.extend_from_slice(&data[..split + 1]);
                reply.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\nechoed:");
                reply.extend_from_slice(&data[split + 1..]);

                if ws.send(Message::Binary(reply)).await.is_err() {
                    break;
                }
            }
        }
    });
}

/// Send one raw request to the public side and read until the broker closes
/// the connection.
async fn send_public_request(public_addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut socket = TcpStream::connect(public_addr)
        .await
        .expect("Failed to connect to public server");
    socket.write_all(request).await.expect("Failed to write request");

    let mut response = Vec::new();
    timeout(Duration::from_secs(10), socket.read_to_end(&mut response))
        .await
        .expect("Timeout reading public response")
        .expect("Failed to read public response");
    response
}

#[tokio::test(flavor = "multi_thread")]
async fn test_proxy_roundtrip() {
    init_tracing();
    info!("🧪 TEST: public request roundtrip through an agent tunnel");

    let broker = start_broker(Duration::from_secs(30)).await;
    let agent = login_agent(broker.agent_addr).await;
    spawn_echo_agent(agent);

    let request = b"GET /hello HTTP/1.1\r\nHost: app.example.com\r\n\r\n";
    let response = send_public_request(broker.public_addr, request).await;

    let mut expected = b"HTTP/1.1 200 OK\r\n\r\nechoed:".to_vec();
    expected.extend_from_slice(request);
    assert_eq!(response, expected);

    info!("✅ TEST PASSED: request bytes went through unmodified");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_domain_returns_not_found() {
    init_tracing();
    info!("🧪 TEST: unknown domain gets the canned 404");

    let broker = start_broker(Duration::from_secs(30)).await;

    let response = send_public_request(
        broker.public_addr,
        b"GET / HTTP/1.1\r\nHost: ghost.example.com\r\n\r\n",
    )
    .await;

    // 18-byte prefix plus the domain, Content-Length included.
    assert_eq!(
        response,
        b"HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 35\r\n\r\nDomain not found: ghost.example.com".as_slice()
    );

    info!("✅ TEST PASSED: exact 404 template served");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_without_domain_line_is_rejected() {
    init_tracing();
    info!("🧪 TEST: request with no second line gets a 400");

    let broker = start_broker(Duration::from_secs(30)).await;

    let response = send_public_request(broker.public_addr, b"GET / HTTP/1.1\r\n").await;
    assert_eq!(response, BAD_REQUEST);

    info!("✅ TEST PASSED: unroutable request rejected");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_demultiplex() {
    init_tracing();
    info!("🧪 TEST: concurrent requests come back to their own connections");

    let broker = start_broker(Duration::from_secs(30)).await;
    let mut agent = login_agent(broker.agent_addr).await;

    // Collect both frames before answering, then reply in reverse arrival
    // order. Only key-based routing gets each reply home.
    tokio::spawn(async move {
        let mut frames = Vec::new();
        while frames.len() < 2 {
            match agent.next().await {
                Some(Ok(Message::Binary(data))) => frames.push(data),
                Some(Ok(_)) => continue,
                _ => return,
            }
        }

        for data in frames.into_iter().rev() {
            let split = data.iter().position(|&b| b == b'\n').unwrap();

            let mut reply = data[..split + 1].to_vec();
            reply.extend_from_slice(b"HTTP/1.1 200 OK\r\n\r\nyou sent:");
            reply.extend_from_slice(&data[split + 1..]);

            if agent.send(Message::Binary(reply)).await.is_err() {
                return;
            }
        }
    });

    let (alpha_response, beta_response) = tokio::join!(
        send_public_request(
            broker.public_addr,
            b"GET /alpha HTTP/1.1\r\nHost: app.example.com\r\n\r\n",
        ),
        send_public_request(
            broker.public_addr,
            b"GET /beta HTTP/1.1\r\nHost: app.example.com\r\n\r\n",
        ),
    );

    let alpha_text = String::from_utf8_lossy(&alpha_response);
    let beta_text = String::from_utf8_lossy(&beta_response);

    assert!(alpha_text.contains("GET /alpha"), "alpha got: {}", alpha_text);
    assert!(!alpha_text.contains("GET /beta"), "alpha got: {}", alpha_text);
    assert!(beta_text.contains("GET /beta"), "beta got: {}", beta_text);
    assert!(!beta_text.contains("GET /alpha"), "beta got: {}", beta_text);

    info!("✅ TEST PASSED: out-of-order replies landed on the right sockets");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_disconnect_fails_exchange_fast() {
    init_tracing();
    info!("🧪 TEST: agent dying mid-exchange fails fast with a 502");

    let broker = start_broker(Duration::from_secs(30)).await;
    let mut agent = login_agent(broker.agent_addr).await;

    // Agent that hangs up as soon as the first request frame arrives.
    tokio::spawn(async move {
        while let Some(Ok(message)) = agent.next().await {
            if matches!(message, Message::Binary(_)) {
                let _ = agent.close(None).await;
                return;
            }
        }
    });

    let started = Instant::now();
    let response = send_public_request(
        broker.public_addr,
        b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n",
    )
    .await;

    assert_eq!(response, BAD_GATEWAY);
    // The waiter is failed by the teardown, not by running out the clock.
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "502 took {:?}, should not wait for the timeout",
        started.elapsed()
    );

    info!("✅ TEST PASSED: 502 delivered without waiting out the timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reply_timeout_returns_gateway_timeout() {
    init_tracing();
    info!("🧪 TEST: silent agent runs the exchange into a 504");

    let broker = start_broker(Duration::from_millis(200)).await;
    let mut agent = login_agent(broker.agent_addr).await;

    // Agent that reads frames and never answers.
    tokio::spawn(async move { while let Some(Ok(_)) = agent.next().await {} });

    let started = Instant::now();
    let response = send_public_request(
        broker.public_addr,
        b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n",
    )
    .await;

    assert_eq!(response, GATEWAY_TIMEOUT);
    assert!(started.elapsed() >= Duration::from_millis(200));

    info!("✅ TEST PASSED: 504 served after the exchange timeout");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_http_reply_passes_verbatim() {
    init_tracing();
    info!("🧪 TEST: reply bytes are forwarded without interpretation");

    let broker = start_broker(Duration::from_secs(30)).await;
    let mut agent = login_agent(broker.agent_addr).await;

    tokio::spawn(async move {
        while let Some(Ok(message)) = agent.next().await {
            if let Message::Binary(data) = message {
                let split = data.iter().position(|&b| b == b'\n').unwrap();

                let mut reply = data[..split + 1].to_vec();
                reply.extend_from_slice(&[0x00, 0xff, 0x7f, b'\n', 0x01]);

                if agent.send(Message::Binary(reply)).await.is_err() {
                    break;
                }
            }
        }
    });

    let response = send_public_request(
        broker.public_addr,
        b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n",
    )
    .await;

    assert_eq!(response, [0x00, 0xff, 0x7f, b'\n', 0x01].as_slice());

    info!("✅ TEST PASSED: opaque bytes reached the client untouched");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_domain_returns_not_found_after_agent_disconnects() {
    init_tracing();
    info!("🧪 TEST: domains stop resolving once their agent is gone");

    let broker = start_broker(Duration::from_secs(30)).await;
    let mut agent = login_agent(broker.agent_addr).await;

    agent.close(None).await.expect("Failed to close agent");
    drop(agent);

    // Wait for the broker to finish tearing the agent down.
    let deadline = Instant::now() + Duration::from_secs(5);
    while broker.directory.connection_count() > 0 {
        assert!(
            Instant::now() < deadline,
            "Timeout waiting for agent teardown"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let response = send_public_request(
        broker.public_addr,
        b"GET / HTTP/1.1\r\nHost: app.example.com\r\n\r\n",
    )
    .await;

    let text = String::from_utf8_lossy(&response);
    assert!(
        text.starts_with("HTTP/1.1 404 Not Found"),
        "expected 404, got: {}",
        text
    );
    assert!(text.ends_with("Domain not found: app.example.com"));

    info!("✅ TEST PASSED: routing state was removed with the agent");
}
