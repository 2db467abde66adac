//! End-to-end tests: a real relay listener on an ephemeral port in front of a
//! local WebSocket backend.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

use ws_relay::{
    Credentials, Proxy, ProxyConfig, ResolverConfig, SessionConfig, SessionVerifier,
    UpstreamMode, UpstreamResolver, VerificationResult,
};

const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct StubVerifier {
    calls: AtomicUsize,
    result: VerificationResult,
}

impl StubVerifier {
    fn new(result: VerificationResult) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            result,
        })
    }
}

#[async_trait]
impl SessionVerifier for StubVerifier {
    async fn verify(&self, _credentials: &Credentials) -> VerificationResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Headers the backend saw on each handshake.
#[derive(Debug, Default)]
struct Handshake {
    protocol: Option<String>,
    extensions: Option<String>,
}

/// A local backend that echoes data frames. Returns its `ws://` URL, a
/// counter of accepted connections and the handshake headers it saw.
async fn start_backend() -> (String, Arc<AtomicUsize>, mpsc::UnboundedReceiver<Handshake>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let tx = tx.clone();
            tokio::spawn(async move {
                let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
                    let header = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    let handshake = Handshake {
                        protocol: header("sec-websocket-protocol"),
                        extensions: header("sec-websocket-extensions"),
                    };
                    if let Some(first) = handshake
                        .protocol
                        .as_deref()
                        .and_then(|p| p.split(',').next())
                    {
                        resp.headers_mut().insert(
                            "sec-websocket-protocol",
                            HeaderValue::from_str(first.trim()).unwrap(),
                        );
                    }
                    let _ = tx.send(handshake);
                    Ok(resp)
                };

                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                while let Some(Ok(msg)) = ws.next().await {
                    if msg.is_binary() || msg.is_text() {
                        if ws.send(msg).await.is_err() {
                            break;
                        }
                    } else if msg.is_close() {
                        break;
                    }
                }
            });
        }
    });

    (format!("ws://{addr}"), accepted, rx)
}

async fn start_relay(verifier: Arc<StubVerifier>, upstream_url: String) -> SocketAddr {
    let resolver = UpstreamResolver::new(ResolverConfig {
        mode: UpstreamMode::Static,
        url: upstream_url,
        token: None,
        extra_query: Vec::new(),
        request_timeout: Duration::from_secs(2),
    })
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ProxyConfig {
        listen_addr: addr,
        verify_enabled: true,
        session: SessionConfig {
            keepalive_interval: None,
            ..SessionConfig::default()
        },
        upstream_connect_timeout: Duration::from_secs(2),
    };

    let proxy = Proxy::new(config, verifier, resolver);
    tokio::spawn(async move { proxy.serve(listener).await });
    addr
}

/// Send a raw HTTP/1.1 request and return the response head (and, for
/// responses that close the connection, the body).
async fn raw_request(addr: SocketAddr, request: &str) -> String {
    raw_exchange(addr, request).await.0
}

/// Like [`raw_request`], but hands back the connection so an upgraded
/// session stays alive.
async fn raw_exchange(addr: SocketAddr, request: &str) -> (String, TcpStream) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = tokio::time::timeout(TIMEOUT, stream.read(&mut chunk))
            .await
            .expect("response timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        // A 101 keeps the connection open; the head is all there is.
        if buf.starts_with(b"HTTP/1.1 101") && buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    (String::from_utf8_lossy(&buf).into_owned(), stream)
}

fn upgrade_request(target: &str, extra_headers: &str) -> String {
    format!(
        "GET {target} HTTP/1.1\r\n\
         Host: relay.test\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         {extra_headers}\r\n"
    )
}

async fn next_message<S>(ws: &mut S) -> Message
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(TIMEOUT, ws.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .expect("websocket error")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_answers_ok() {
    let (backend, _, _) = start_backend().await;
    let addr = start_relay(StubVerifier::new(VerificationResult::accepted()), backend).await;

    let response = raw_request(
        addr,
        "GET /health HTTP/1.1\r\nHost: relay.test\r\nConnection: close\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("ok"), "{response}");
}

#[tokio::test]
async fn verified_session_relays_frames_both_ways() {
    let (backend, accepted, _) = start_backend().await;
    let verifier = StubVerifier::new(VerificationResult::accepted());
    let addr = start_relay(Arc::clone(&verifier), backend).await;

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sessionId=abc&proxySecret=xyz"))
            .await
            .unwrap();

    client
        .send(Message::Binary(vec![0x01, 0x02, 0x03].into()))
        .await
        .unwrap();
    client
        .send(Message::Text(r#"{"id":1,"method":"Browser.getVersion"}"#.into()))
        .await
        .unwrap();

    assert_eq!(
        next_message(&mut client).await,
        Message::Binary(vec![0x01, 0x02, 0x03].into())
    );
    assert_eq!(
        next_message(&mut client).await,
        Message::Text(r#"{"id":1,"method":"Browser.getVersion"}"#.into())
    );

    assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_credentials_are_rejected_without_dialing() {
    let (backend, accepted, _) = start_backend().await;
    let verifier = StubVerifier::new(VerificationResult::accepted());
    let addr = start_relay(Arc::clone(&verifier), backend).await;

    let response = raw_request(addr, &upgrade_request("/?sessionId=abc", "")).await;

    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.contains("Missing sessionId/proxySecret"), "{response}");
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_verification_is_forbidden_without_dialing() {
    let (backend, accepted, _) = start_backend().await;
    let verifier = StubVerifier::new(VerificationResult::rejected("expired").with_status(401));
    let addr = start_relay(Arc::clone(&verifier), backend).await;

    let response = raw_request(addr, &upgrade_request("/?sessionId=abc&proxySecret=xyz", "")).await;

    assert!(response.starts_with("HTTP/1.1 403"), "{response}");
    assert!(response.contains("expired"), "{response}");
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(accepted.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn unsupported_version_is_bad_request() {
    let (backend, _, _) = start_backend().await;
    let verifier = StubVerifier::new(VerificationResult::accepted());
    let addr = start_relay(Arc::clone(&verifier), backend).await;

    let request = "GET /?sessionId=abc&proxySecret=xyz HTTP/1.1\r\n\
                   Host: relay.test\r\n\
                   Connection: Upgrade\r\n\
                   Upgrade: websocket\r\n\
                   Sec-WebSocket-Version: 8\r\n\
                   Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";
    let response = raw_request(addr, request).await;

    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(
        response.to_ascii_lowercase().contains("sec-websocket-version: 13"),
        "{response}"
    );
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn offered_compression_is_never_negotiated() {
    let (backend, _, mut handshakes) = start_backend().await;
    let addr = start_relay(StubVerifier::new(VerificationResult::accepted()), backend).await;

    let (response, _conn) = raw_exchange(
        addr,
        &upgrade_request(
            "/?sessionId=abc&proxySecret=xyz",
            "Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n",
        ),
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 101"), "{response}");
    assert!(
        response.to_ascii_lowercase().contains("sec-websocket-accept: s3pplmbitxaq9kygzzhzrbk+xoo="),
        "{response}"
    );
    assert!(
        !response.to_ascii_lowercase().contains("sec-websocket-extensions"),
        "{response}"
    );

    let seen = tokio::time::timeout(TIMEOUT, handshakes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.extensions, None);
}

#[tokio::test]
async fn subprotocols_are_echoed_and_forwarded() {
    let (backend, _, mut handshakes) = start_backend().await;
    let addr = start_relay(StubVerifier::new(VerificationResult::accepted()), backend).await;

    let mut request = format!("ws://{addr}/?sessionId=abc&proxySecret=xyz")
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("sec-websocket-protocol", HeaderValue::from_static("cdp, v2"));

    let (_client, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.headers()["sec-websocket-protocol"], "cdp");

    let seen = tokio::time::timeout(TIMEOUT, handshakes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.protocol.as_deref(), Some("cdp, v2"));
}

#[tokio::test]
async fn unreachable_upstream_closes_client_with_internal_error() {
    // Bind then drop to get a port nothing is listening on.
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = format!("ws://{}", unused.local_addr().unwrap());
    drop(unused);

    let addr = start_relay(StubVerifier::new(VerificationResult::accepted()), dead).await;

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sessionId=abc&proxySecret=xyz"))
            .await
            .unwrap();

    match next_message(&mut client).await {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Error);
            assert!(!frame.reason.is_empty());
        }
        other => panic!("expected close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn client_close_reaches_upstream_and_session_ends() {
    let (backend, _, _) = start_backend().await;
    let addr = start_relay(StubVerifier::new(VerificationResult::accepted()), backend).await;

    let (mut client, _) =
        tokio_tungstenite::connect_async(format!("ws://{addr}/?sessionId=abc&proxySecret=xyz"))
            .await
            .unwrap();

    client.send(Message::Text("ping".into())).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::Text("ping".into()));

    client.close(None).await.unwrap();

    // The relay answers the close handshake and the stream ends.
    let ended = tokio::time::timeout(TIMEOUT, async {
        while let Some(Ok(_)) = client.next().await {}
    })
    .await;
    assert!(ended.is_ok());
}
