#![cfg(feature = "reqwest")]

use std::net::SocketAddr;

use tether::{ErrorKind, EventLoop, KnownHeader, Manager, Request, BytesSource};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn respond(mut socket: TcpStream) {
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    let head_end = loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        request.extend_from_slice(&buf[..n]);
        if let Some(at) = request.windows(4).position(|w| w == b"\r\n\r\n") {
            break at + 4;
        }
    };
    let head = String::from_utf8_lossy(&request[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    while request.len() < head_end + content_length {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        request.extend_from_slice(&buf[..n]);
    }
    let body = request[head_end..head_end + content_length].to_vec();

    let mut parts = head.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let path = parts.next().unwrap_or_default().to_owned();
    let (status, extra, payload) = match (method.as_str(), path.as_str()) {
        ("GET", "/") => ("200 OK", String::new(), b"hello from server".to_vec()),
        ("GET", "/moved") => ("302 Found", "Location: /\r\n".to_owned(), Vec::new()),
        ("POST", "/echo") => ("200 OK", String::new(), body),
        _ => ("404 Not Found", String::new(), b"nothing here".to_vec()),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n{extra}\r\n",
        payload.len()
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.write_all(&payload).await;
    let _ = socket.shutdown().await;
}

async fn serve() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            tokio::spawn(respond(socket));
        }
    });
    addr
}

fn request(addr: SocketAddr, path: &str) -> Request {
    Request::parse(&format!("http://{addr}{path}")).unwrap()
}

#[tokio::test]
async fn test_http_get() {
    let addr = serve().await;
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let reply = manager.get(request(addr, "/"));
    assert!(ev.run_until(|| reply.is_finished()).await);

    assert!(reply.error().is_none(), "{:?}", reply.error());
    assert_eq!(reply.attributes().http_status, Some(200));
    assert_eq!(reply.header(KnownHeader::ContentLength).as_deref(), Some("17"));
    assert_eq!(&reply.read_all()[..], b"hello from server");
    assert_eq!(manager.connection_cache_len(), 1);
}

#[tokio::test]
async fn test_http_status_error_keeps_body() {
    let addr = serve().await;
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let reply = manager.get(request(addr, "/missing"));
    assert!(ev.run_until(|| reply.is_finished()).await);

    let error = reply.error().unwrap();
    assert_eq!(error.kind, ErrorKind::ContentNotFound);
    assert!(error.message.contains("server replied: Not Found"));
    assert_eq!(reply.attributes().http_status, Some(404));
    assert_eq!(&reply.read_all()[..], b"nothing here");
}

#[tokio::test]
async fn test_http_redirect_is_followed() {
    let addr = serve().await;
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let reply = manager.get(request(addr, "/moved"));
    assert!(ev.run_until(|| reply.is_finished()).await);

    assert!(reply.error().is_none(), "{:?}", reply.error());
    assert_eq!(reply.url().path(), "/");
    assert_eq!(&reply.read_all()[..], b"hello from server");
}

#[tokio::test]
async fn test_http_post_sends_body() {
    let addr = serve().await;
    let ev = EventLoop::new();
    let manager = Manager::new(&ev);

    let reply = manager.post(request(addr, "/echo"), BytesSource::shared(&b"ping"[..]));
    assert!(ev.run_until(|| reply.is_finished()).await);

    assert!(reply.error().is_none(), "{:?}", reply.error());
    assert_eq!(&reply.read_all()[..], b"ping");
}

#[tokio::test]
async fn test_http_connection_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let ev = EventLoop::new();
    let manager = Manager::new(&ev);
    let reply = manager.get(request(addr, "/"));
    assert!(ev.run_until(|| reply.is_finished()).await);

    assert_eq!(reply.error().unwrap().kind, ErrorKind::ConnectionRefused);
}
