//! HTTP request handling: keep-alive negotiation, method dispatch, static
//! files with single byte ranges, canned error pages.

use crate::codec::{HttpRequest, HttpResponse, Method};
use crate::conn::ConnectionHandle;
use crate::error::ProtocolError;
use crate::site::StaticSite;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const ALLOW: &str = "GET, POST, HEAD, OPTIONS";

/// What the worker should do after the responder ran.
pub(crate) enum Outcome {
    Done,
    /// POST: hand the request to the message handler.
    Delegate(HttpRequest),
}

/// Parsed `Range` header against a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Inclusive bounds.
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

/// Parse a single `bytes=a-b`, `bytes=a-` or `bytes=-n` range. `None` when
/// the header is not understood and should be ignored.
pub fn parse_range(value: &str, size: u64) -> Option<ByteRange> {
    let ranges = value.trim().strip_prefix("bytes=")?.trim();
    if ranges.contains(',') {
        return None;
    }
    let (first, last) = ranges.split_once('-')?;
    let (first, last) = (first.trim(), last.trim());

    let range = match (first.is_empty(), last.is_empty()) {
        (true, true) => return None,
        (true, false) => {
            let suffix: u64 = last.parse().ok()?;
            if suffix == 0 || size == 0 {
                ByteRange::Unsatisfiable
            } else {
                ByteRange::Satisfiable {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                }
            }
        }
        (false, true) => {
            let start: u64 = first.parse().ok()?;
            if start >= size {
                ByteRange::Unsatisfiable
            } else {
                ByteRange::Satisfiable {
                    start,
                    end: size - 1,
                }
            }
        }
        (false, false) => {
            let start: u64 = first.parse().ok()?;
            let end: u64 = last.parse().ok()?;
            if start > end || end >= size || start >= size {
                ByteRange::Unsatisfiable
            } else {
                ByteRange::Satisfiable { start, end }
            }
        }
    };
    Some(range)
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Canned HTML body for an error status.
pub fn error_page(code: u16, uri: &str) -> String {
    let reason = crate::codec::http::reason_phrase(code);
    let detail = if code == 404 {
        format!(
            "<p>The requested URL {} was not found on this server.</p>\n",
            escape_html(uri)
        )
    } else {
        String::new()
    };
    format!(
        "<!DOCTYPE HTML PUBLIC \"-//IETF//DTD HTML 2.0//EN\">\n<html><head>\n\
<title>{code} {reason}</title>\n</head><body>\n<h1>{reason}</h1>\n{detail}</body></html>"
    )
}

fn http_date(at: SystemTime) -> String {
    httpdate::fmt_http_date(at)
}

pub(crate) fn send_error(h: &mut ConnectionHandle<'_>, req: &HttpRequest, code: u16) {
    let body = if req.method == Method::Head {
        String::new()
    } else {
        error_page(code, &req.uri)
    };
    let mut response = HttpResponse::new(code)
        .version(req.version.clone())
        .header("Content-Type", "text/html")
        .header("Content-Length", body.len())
        .header("Date", http_date(SystemTime::now()));
    if code == 405 {
        response = response.header("Allow", ALLOW);
    }
    h.send_string(response.body(body));
}

/// Answer a request that could not be parsed, then close.
pub(crate) fn reject(h: &mut ConnectionHandle<'_>, err: &ProtocolError) {
    let code = err.status_code();
    let body = error_page(code, "");
    let response = HttpResponse::new(code)
        .header("Content-Type", "text/html")
        .header("Content-Length", body.len())
        .header("Connection", "close")
        .body(body);
    h.send_string(response);

    let conn = h.connection();
    conn.recv_buf.clear();
    if conn.send_buffer_empty() {
        h.close();
    } else {
        conn.expire_now();
    }
}

/// Apply `Connection` and `Keep-Alive` request headers and count the request.
fn negotiate_keep_alive(h: &mut ConnectionHandle<'_>, req: &HttpRequest) {
    let conn = h.connection();
    conn.record_request();

    if req
        .header("Connection")
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("close"))
    {
        conn.expire_now();
        return;
    }

    if let Some(value) = req.header("Keep-Alive") {
        let mut timeout = None;
        let mut max = None;
        for param in value.split(',') {
            let Some((key, val)) = param.split_once('=') else {
                continue;
            };
            let val = val.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "timeout" => timeout = val.parse().ok().map(Duration::from_secs),
                "max" => max = val.parse().ok(),
                _ => {}
            }
        }
        conn.keep_alive(timeout, max);
    }
}

pub(crate) fn respond(
    h: &mut ConnectionHandle<'_>,
    site: Option<&StaticSite>,
    req: HttpRequest,
) -> Outcome {
    negotiate_keep_alive(h, &req);

    match req.method {
        Method::Post => Outcome::Delegate(req),
        Method::Options => {
            let response = HttpResponse::new(200)
                .version(req.version.clone())
                .header("Allow", ALLOW)
                .header("Content-Length", 0)
                .header("Date", http_date(SystemTime::now()));
            h.send_string(response);
            Outcome::Done
        }
        Method::Get | Method::Head => {
            serve_file(h, site, &req);
            Outcome::Done
        }
        _ => {
            send_error(h, &req, 405);
            Outcome::Done
        }
    }
}

enum Lookup {
    Found(PathBuf, File, fs::Metadata),
    Forbidden,
    NotFound,
}

fn lookup(root: &Path, index: &[String], uri_path: &str) -> Lookup {
    if uri_path.contains("..") {
        return Lookup::Forbidden;
    }
    let relative = uri_path.trim_start_matches(['/', '.']).trim_end_matches('/');
    let mut path = root.join(relative);

    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Lookup::NotFound,
        Err(_) => return Lookup::Forbidden,
    };
    if meta.is_dir() {
        let Some(found) = index.iter().map(|name| path.join(name)).find(|p| p.is_file()) else {
            return Lookup::Forbidden;
        };
        path = found;
    }

    match File::open(&path).and_then(|f| f.metadata().map(|m| (f, m))) {
        Ok((file, meta)) if meta.is_file() => Lookup::Found(path, file, meta),
        Ok(_) => Lookup::Forbidden,
        Err(err) if err.kind() == io::ErrorKind::NotFound => Lookup::NotFound,
        Err(_) => Lookup::Forbidden,
    }
}

fn serve_file(h: &mut ConnectionHandle<'_>, site: Option<&StaticSite>, req: &HttpRequest) {
    let Some(site) = site else {
        warn!(uri = %req.uri, "no static site configured");
        send_error(h, req, 404);
        return;
    };
    let Some(host) = site.host(req.header("Host")) else {
        debug!(host = ?req.header("Host"), "unknown host");
        send_error(h, req, 404);
        return;
    };

    let (path, file, meta) = match lookup(&host.root, &host.index, req.path()) {
        Lookup::Found(path, file, meta) => (path, file, meta),
        Lookup::Forbidden => return send_error(h, req, 403),
        Lookup::NotFound => return send_error(h, req, 404),
    };

    let size = meta.len();
    let range = req.header("Range").and_then(|v| parse_range(v, size));
    let (code, start, len) = match range {
        Some(ByteRange::Unsatisfiable) => return send_error(h, req, 416),
        Some(ByteRange::Satisfiable { start, end }) => (206, start, end - start + 1),
        None => (200, 0, size),
    };

    let mut response = HttpResponse::new(code)
        .version(req.version.clone())
        .header("Content-Type", site.mime_type(&path))
        .header("Content-Length", len);
    if code == 206 {
        response = response.header(
            "Content-Range",
            format!("bytes {}-{}/{}", start, start + len - 1, size),
        );
    }
    if let Ok(modified) = meta.modified() {
        response = response.header("Last-Modified", http_date(modified));
    }
    response = response.header("Date", http_date(SystemTime::now()));

    h.send_string(response);
    if req.method == Method::Head || h.is_closed() {
        return;
    }
    if let Err(err) = h.send_file_range(file, start, len) {
        warn!(path = %path.display(), %err, "failed to queue file");
        h.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            parse_range("bytes=10-19", 100),
            Some(ByteRange::Satisfiable { start: 10, end: 19 })
        );
        assert_eq!(
            parse_range("bytes=90-", 100),
            Some(ByteRange::Satisfiable { start: 90, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=-10", 100),
            Some(ByteRange::Satisfiable { start: 90, end: 99 })
        );
        assert_eq!(
            parse_range("bytes=-500", 100),
            Some(ByteRange::Satisfiable { start: 0, end: 99 })
        );
    }

    #[test]
    fn test_parse_range_unsatisfiable() {
        assert_eq!(parse_range("bytes=10-500", 100), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=20-10", 100), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=100-", 100), Some(ByteRange::Unsatisfiable));
        assert_eq!(parse_range("bytes=99-99", 100), Some(ByteRange::Satisfiable { start: 99, end: 99 }));
    }

    #[test]
    fn test_parse_range_ignored() {
        assert_eq!(parse_range("items=1-2", 100), None);
        assert_eq!(parse_range("bytes=a-b", 100), None);
        assert_eq!(parse_range("bytes=1-2,5-6", 100), None);
        assert_eq!(parse_range("bytes=-", 100), None);
    }

    #[test]
    fn test_error_pages() {
        let page = error_page(403, "/x");
        assert!(page.contains("<title>403 Forbidden</title>"));
        assert!(page.contains("<h1>Forbidden</h1>"));

        let page = error_page(404, "/missing<script>");
        assert!(page.contains(
            "The requested URL /missing&lt;script&gt; was not found on this server."
        ));
    }

    #[test]
    fn test_lookup() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.htm"), b"idx").unwrap();
        fs::create_dir(dir.path().join("empty")).unwrap();
        let index = vec!["index.html".to_string(), "index.htm".to_string()];

        assert!(matches!(lookup(dir.path(), &index, "/a.txt"), Lookup::Found(..)));
        match lookup(dir.path(), &index, "/docs/") {
            Lookup::Found(path, ..) => assert!(path.ends_with("docs/index.htm")),
            _ => panic!("expected index file"),
        }
        assert!(matches!(lookup(dir.path(), &index, "/empty"), Lookup::Forbidden));
        assert!(matches!(lookup(dir.path(), &index, "/../etc/passwd"), Lookup::Forbidden));
        assert!(matches!(lookup(dir.path(), &index, "/nope.txt"), Lookup::NotFound));
    }
}
