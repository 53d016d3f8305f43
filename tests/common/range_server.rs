//! Minimal HTTP/1.1 server that supports Range GET for integration tests.
//!
//! Serves static bodies by path. Responds to GET with `Range: bytes=a-b` with
//! 206 Partial Content, or with 200 and the full body when ranges are
//! disabled. Failures and stalls can be injected per range start offset.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RangeServerOptions {
    /// If false, GET ignores Range and always returns 200 with the full body.
    pub support_ranges: bool,
    /// Answer the first N bounded range requests with 500.
    pub fail_first: usize,
    /// Bounded range requests starting at this offset always get 500.
    pub always_fail_at: Option<u64>,
    /// Requests whose range starts at or after this offset (or any request
    /// without a range) hang until `release` is set.
    pub stall_from: Option<u64>,
    /// Requests for these paths hang until `release` is set.
    pub stall_paths: Vec<String>,
    /// Open-ended range requests (`bytes=X-`) get 500.
    pub fail_open_ranges: bool,
    /// Answer open-ended range requests with at most this many bytes and an
    /// unknown total (`Content-Range: bytes X-Y/*`).
    pub partial_open_ranges: Option<u64>,
    pub release: Arc<AtomicBool>,
}

impl Default for RangeServerOptions {
    fn default() -> Self {
        Self {
            support_ranges: true,
            fail_first: 0,
            always_fail_at: None,
            stall_from: None,
            stall_paths: Vec::new(),
            fail_open_ranges: false,
            partial_open_ranges: None,
            release: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// One request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hit {
    pub path: String,
    pub range: Option<String>,
}

pub struct RangeServer {
    pub base_url: String,
    hits: Arc<Mutex<Vec<Hit>>>,
    release: Arc<AtomicBool>,
}

impl RangeServer {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap().clone()
    }

    pub fn clear_hits(&self) {
        self.hits.lock().unwrap().clear();
    }

    /// Range headers of bounded (non-probe) requests, sorted.
    pub fn bounded_ranges(&self) -> Vec<String> {
        let mut ranges: Vec<String> = self
            .hits()
            .into_iter()
            .filter_map(|h| h.range)
            .filter(|r| !r.ends_with('-'))
            .collect();
        ranges.sort();
        ranges
    }

    /// Let stalled requests through.
    pub fn release(&self) {
        self.release.store(true, Ordering::SeqCst);
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        // never leave handler threads hanging
        self.release();
    }
}

/// Serve `body` at `/file.bin`.
pub fn start(body: Vec<u8>) -> RangeServer {
    start_with_options(vec![("/file.bin".to_string(), body)], RangeServerOptions::default())
}

/// Starts a server in a background thread. The server runs until the
/// process exits.
pub fn start_with_options(routes: Vec<(String, Vec<u8>)>, opts: RangeServerOptions) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().unwrap().port();
    let routes: Arc<HashMap<String, Vec<u8>>> = Arc::new(routes.into_iter().collect());
    let hits = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(AtomicUsize::new(0));
    let release = Arc::clone(&opts.release);

    let server_hits = Arc::clone(&hits);
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            let routes = Arc::clone(&routes);
            let hits = Arc::clone(&server_hits);
            let failures = Arc::clone(&failures);
            let opts = opts.clone();
            thread::spawn(move || handle(stream, &routes, &hits, &failures, &opts));
        }
    });

    RangeServer {
        base_url: format!("http://127.0.0.1:{}/", port),
        hits,
        release,
    }
}

fn handle(
    mut stream: TcpStream,
    routes: &HashMap<String, Vec<u8>>,
    hits: &Mutex<Vec<Hit>>,
    failures: &AtomicUsize,
    opts: &RangeServerOptions,
) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) => return,
        Ok(n) => n,
        Err(_) => return,
    };
    let request = match std::str::from_utf8(&buf[..n]) {
        Ok(s) => s,
        Err(_) => return,
    };
    let (method, path, range_header) = parse_request(request);
    hits.lock().unwrap().push(Hit {
        path: path.to_string(),
        range: range_header.map(str::to_string),
    });

    if !method.eq_ignore_ascii_case("GET") {
        let _ = stream.write_all(b"HTTP/1.1 405 Method Not Allowed\r\nConnection: close\r\n\r\n");
        return;
    }
    let Some(body) = routes.get(path) else {
        let _ = stream.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
        return;
    };

    let range = range_header.and_then(parse_range);
    let start = range.map(|(s, _)| s).unwrap_or(0);
    let bounded = range.map(|(_, e)| e != u64::MAX).unwrap_or(false);

    let stalled_offset = opts.stall_from.map(|from| start >= from).unwrap_or(false);
    if stalled_offset || opts.stall_paths.iter().any(|p| p == path) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !opts.release.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    if range.is_some() && !bounded && opts.fail_open_ranges {
        let _ = stream.write_all(
            b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    }

    if bounded {
        let injected = failures.fetch_add(1, Ordering::SeqCst) < opts.fail_first;
        if injected || opts.always_fail_at == Some(start) {
            let _ = stream.write_all(
                b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            );
            return;
        }
    }

    let total = body.len() as u64;
    let (status, content_range, slice) = match range {
        Some((start, u64::MAX))
            if opts.support_ranges && start < total && opts.partial_open_ranges.is_some() =>
        {
            let limit = opts.partial_open_ranges.unwrap_or(total).max(1);
            let end_excl = (start + limit).min(total);
            (
                "206 Partial Content",
                Some(format!("bytes {}-{}/*", start, end_excl - 1)),
                &body[start as usize..end_excl as usize],
            )
        }
        Some((start, end_incl)) if opts.support_ranges => {
            let end_incl = end_incl.min(total.saturating_sub(1));
            if start > end_incl || start >= total {
                (
                    "416 Range Not Satisfiable",
                    Some(format!("bytes */{}", total)),
                    &body[0..0],
                )
            } else {
                let end_excl = (end_incl + 1) as usize;
                (
                    "206 Partial Content",
                    Some(format!("bytes {}-{}/{}", start, end_incl, total)),
                    &body[start as usize..end_excl],
                )
            }
        }
        _ => ("200 OK", None, &body[..]),
    };

    let content_range = content_range
        .map(|v| format!("Content-Range: {}\r\n", v))
        .unwrap_or_default();
    let accept_ranges = if opts.support_ranges {
        "Accept-Ranges: bytes\r\n"
    } else {
        ""
    };
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Length: {}\r\n{}{}Connection: close\r\n\r\n",
        status,
        slice.len(),
        content_range,
        accept_ranges
    );
    let _ = stream.write_all(response.as_bytes());
    let _ = stream.write_all(slice);
    let _ = stream.flush();
}

/// Returns (method, path, raw Range header value).
fn parse_request(request: &str) -> (&str, &str, Option<&str>) {
    let mut lines = request.lines();
    let mut first = lines.next().unwrap_or("").split_whitespace();
    let method = first.next().unwrap_or("");
    let path = first.next().unwrap_or("/");
    let mut range = None;
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim());
            }
        }
    }
    (method, path, range)
}

/// `bytes=X-Y` to (start, end_inclusive); an open end is `u64::MAX`.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let part = value.strip_prefix("bytes=")?.trim();
    let (a, b) = part.split_once('-')?;
    let start = a.trim().parse::<u64>().ok()?;
    let end = b.trim();
    let end_incl = if end.is_empty() {
        u64::MAX
    } else {
        end.parse::<u64>().ok()?
    };
    Some((start, end_incl))
}
