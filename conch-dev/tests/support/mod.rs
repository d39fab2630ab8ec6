// Shared between the integration test binaries; not every binary uses every
// helper.
#![allow(dead_code)]

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use conch_dev::AbortSignal;

/// A throwaway upstream server living for one test.
pub struct Upstream {
    pub port: u16,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// HTTP upstream that answers every request with its tag, the request path,
/// and the Host header it saw.
pub async fn spawn_http_upstream(tag: &'static str) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(serve_http(listener, tag));
    Upstream { port, handle }
}

/// Same responder, but bound to a pre-assigned port and running until the
/// signal fires. Used as the body of fabricated proxy-target actions.
pub async fn run_http_upstream_on(port: u16, tag: &'static str, signal: AbortSignal) {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::select! {
        _ = serve_http(listener, tag) => {}
        _ = signal.aborted() => {}
    }
}

async fn serve_http(listener: TcpListener, tag: &'static str) {
    loop {
        let Ok((stream, _peer)) = listener.accept().await else {
            break;
        };
        tokio::spawn(async move {
            let service = service_fn(move |req: Request<Incoming>| async move {
                let host = req
                    .headers()
                    .get(hyper::header::HOST)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let body = format!("{tag} path={} host={host}", req.uri().path());
                Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(body))))
            });
            let _ = hyper::server::conn::http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

/// Bare-bones WebSocket-ish upstream: accepts the upgrade handshake and then
/// echoes every byte back. Both ends of the tests speak raw bytes, so no
/// RFC 6455 framing is involved.
pub async fn spawn_ws_echo_upstream() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _peer)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() {
                    return;
                }
                let head = "HTTP/1.1 101 Switching Protocols\r\n\
                            Connection: Upgrade\r\n\
                            Upgrade: websocket\r\n\r\n";
                if stream.write_all(head.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    Upstream { port, handle }
}

async fn read_head(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => head.push(byte[0]),
        }
        if head.len() > 64 * 1024 {
            return None;
        }
    }
    Some(head)
}

/// Open a raw connection to the proxy, perform a WebSocket handshake on
/// `path`, send `payload`, and return the echoed bytes.
pub async fn websocket_roundtrip(proxy_port: u16, path: &str, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    let request = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: 127.0.0.1\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await.expect("handshake response");
    let head = String::from_utf8_lossy(&head);
    assert!(
        head.starts_with("HTTP/1.1 101"),
        "expected an upgrade, got: {head}"
    );

    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    stream.read_exact(&mut echoed).await.unwrap();
    echoed
}

/// Raw request helper for cases where reqwest would get in the way (e.g.
/// sending upgrade headers at a route that does not tunnel them). Returns
/// the response head only.
pub async fn raw_request_head(proxy_port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let head = read_head(&mut stream).await.expect("response head");
    String::from_utf8_lossy(&head).into_owned()
}

/// Poll an async condition until it holds or the timeout elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
