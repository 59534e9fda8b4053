mod common;

use common::{TestServer, exchange, overfill, read_response};
use etude_core::status::{CURRENT_CONNECTIONS, TOTAL_CONNECTIONS};
use etude_core::{Handlers, HttpResponse, Inbound, Protocol};
use std::fs;
use std::io::Write;
use tempfile::TempDir;

fn site() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    let five_hundred: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    fs::write(dir.path().join("file500.txt"), five_hundred).unwrap();
    let hundred: Vec<u8> = (0..100u8).collect();
    fs::write(dir.path().join("hundred.bin"), hundred).unwrap();
    let large: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
    fs::write(dir.path().join("large.bin"), large).unwrap();
    fs::create_dir(dir.path().join("docs")).unwrap();
    fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
    dir
}

fn static_only() -> Handlers {
    Handlers::default()
}

fn echo_post() -> Handlers {
    Handlers::default()
        .on_message(|h, inbound| {
            if let Inbound::Request(req) = inbound {
                let body = format!("{} {} bytes", req.path(), req.body.len());
                h.send_string(
                    HttpResponse::new(200)
                        .header("Content-Type", "text/plain")
                        .header("Content-Length", body.len())
                        .body(body),
                );
            }
        })
        .on_close(|h| {
            let _ = h.counters().increment("closed", 1);
        })
}

fn server(dir: &TempDir, handlers: fn() -> Handlers) -> TestServer {
    TestServer::start(Protocol::Http, Some(dir.path().to_path_buf()), handlers)
}

#[test]
fn test_get_existing_file() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(
        &server,
        b"GET /file500.txt HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("500"));
    assert_eq!(res.header("Content-Type"), Some("text/plain"));
    assert!(res.header("Last-Modified").is_some());
    assert!(res.header("Date").is_some());
    assert_eq!(res.body, fs::read(dir.path().join("file500.txt")).unwrap());
}

#[test]
fn test_large_file_is_streamed_completely() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(
        &server,
        b"GET /large.bin HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.body.len(), 200_000);
    assert_eq!(res.body, fs::read(dir.path().join("large.bin")).unwrap());
}

#[test]
fn test_directory_serves_index() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(&server, b"GET /docs/ HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert_eq!(res.body, b"<h1>docs</h1>");
}

#[test]
fn test_range_request() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(
        &server,
        b"GET /hundred.bin HTTP/1.1\r\nRange: bytes=10-19\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 206);
    assert_eq!(res.header("Content-Range"), Some("bytes 10-19/100"));
    assert_eq!(res.header("Content-Length"), Some("10"));
    assert_eq!(res.body, (10..20u8).collect::<Vec<_>>());
}

#[test]
fn test_range_past_end_is_unsatisfiable() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(
        &server,
        b"GET /hundred.bin HTTP/1.1\r\nRange: bytes=10-500\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 416);
}

#[test]
fn test_unparsable_range_is_ignored() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(
        &server,
        b"GET /hundred.bin HTTP/1.1\r\nRange: lines=1-2\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.body.len(), 100);
}

#[test]
fn test_missing_file() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(&server, b"GET /nope.html HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(res.status, 404);
    let body = String::from_utf8(res.body).unwrap();
    assert!(body.contains("The requested URL /nope.html was not found on this server."));
}

#[test]
fn test_parent_directory_is_forbidden() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(
        &server,
        b"GET /docs/../../etc/passwd HTTP/1.1\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 403);
}

#[test]
fn test_head_sends_headers_only() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(&server, b"HEAD /file500.txt HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("500"));
    assert!(res.body.is_empty());
}

#[test]
fn test_options_lists_methods() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(&server, b"OPTIONS / HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Allow"), Some("GET, POST, HEAD, OPTIONS"));
    assert_eq!(res.header("Content-Length"), Some("0"));
}

#[test]
fn test_unsupported_method() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(&server, b"DELETE /file500.txt HTTP/1.1\r\nConnection: close\r\n\r\n");
    assert_eq!(res.status, 405);
    assert_eq!(res.header("Allow"), Some("GET, POST, HEAD, OPTIONS"));
}

#[test]
fn test_malformed_request_gets_400_and_close() {
    let dir = site();
    let server = server(&dir, static_only);
    let res = exchange(&server, b"NONSENSE\r\n\r\n");
    assert_eq!(res.status, 400);
    assert!(String::from_utf8_lossy(&res.body).contains("<h1>Bad Request</h1>"));
}

#[test]
fn test_oversized_request_gets_413_and_close() {
    let dir = site();
    let server = server(&dir, static_only);
    let reply = overfill(&server, b"GET / HTTP/1.1\r\nX-Fill: ");
    let reply = String::from_utf8_lossy(&reply);
    assert!(reply.starts_with("HTTP/1.1 413 Request Entity Too Large\r\n"), "{reply}");
    assert!(reply.contains("Connection: close\r\n"));

    assert!(server.wait_for(CURRENT_CONNECTIONS, 0));
    assert_eq!(server.counter(TOTAL_CONNECTIONS), 1);
}

#[test]
fn test_post_goes_to_message_handler() {
    let dir = site();
    let server = server(&dir, echo_post);
    let res = exchange(
        &server,
        b"POST /submit HTTP/1.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"/submit 5 bytes");
    assert!(server.wait_for("closed", 1));
}

#[test]
fn test_keep_alive_serves_several_requests() {
    let dir = site();
    let server = server(&dir, echo_post);
    let mut stream = server.connect();

    stream
        .write_all(b"GET /hundred.bin HTTP/1.1\r\nKeep-Alive: timeout=5, max=10\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream);
    assert_eq!(first.status, 200);
    assert_eq!(first.body.len(), 100);

    // Two pipelined requests in one write.
    stream
        .write_all(
            b"POST /a HTTP/1.1\r\nContent-Length: 2\r\n\r\nxyPOST /b HTTP/1.1\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
    assert_eq!(read_response(&mut stream).body, b"/a 2 bytes");
    assert_eq!(read_response(&mut stream).body, b"/b 0 bytes");

    assert_eq!(server.counter(CURRENT_CONNECTIONS), 1);
    drop(stream);
    assert!(server.wait_for(CURRENT_CONNECTIONS, 0));
    assert_eq!(server.counter(TOTAL_CONNECTIONS), 1);
    assert!(server.wait_for("closed", 1));
}

#[test]
fn test_request_cap_closes_connection() {
    let dir = site();
    let server = server(&dir, static_only);
    let mut stream = server.connect();
    stream
        .write_all(b"GET /hundred.bin HTTP/1.1\r\nKeep-Alive: max=1\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).status, 200);
    assert!(server.wait_for(CURRENT_CONNECTIONS, 0));
}
