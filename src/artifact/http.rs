//! Minimal HTTP/1.1 client over a plain TCP socket
//!
//! Just enough protocol for the artifact store: GET and PUT with
//! `Connection: close`, Content-Length or close-delimited bodies, and
//! configurable socket timeouts. 404 maps to `ArtifactNotFound`; any other
//! status at or above 400 maps to `Network`.

use crate::error::{BuildError, BuildResult};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// A parsed `http[s]://host[:port]/path` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUrl {
    /// Whether the scheme was `https`
    pub secure: bool,
    /// Host name or address
    pub host: String,
    /// Port, defaulted from the scheme when absent
    pub port: u16,
    /// Path, always starting with `/`
    pub path: String,
}

impl ParsedUrl {
    /// Parse a URL of the shape the artifact store accepts
    pub fn parse(url: &str) -> BuildResult<Self> {
        let (secure, rest) = if let Some(rest) = url.strip_prefix("https://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("http://") {
            (false, rest)
        } else {
            return Err(BuildError::Network(format!(
                "unsupported URL scheme in '{url}'"
            )));
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(BuildError::Network(format!("missing host in '{url}'")));
        }

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_str)) => {
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| BuildError::Network(format!("bad port in '{url}'")))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), if secure { 443 } else { 80 }),
        };

        Ok(Self {
            secure,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// Join a sub-path onto this URL's path
    pub fn join(&self, suffix: &str) -> Self {
        let mut joined = self.clone();
        if !joined.path.ends_with('/') {
            joined.path.push('/');
        }
        joined.path.push_str(suffix.trim_start_matches('/'));
        joined
    }
}

/// Blocking HTTP client with per-socket timeouts
#[derive(Debug, Clone)]
pub struct HttpClient {
    read_timeout: Duration,
    write_timeout: Duration,
}

impl HttpClient {
    /// Create a client with the given socket timeouts
    pub fn new(read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            read_timeout,
            write_timeout,
        }
    }

    /// GET a URL; 404 is `ArtifactNotFound`, other >= 400 is `Network`
    pub fn get(&self, url: &ParsedUrl) -> BuildResult<Vec<u8>> {
        let (status, body) = self.request("GET", url, None)?;
        match status {
            200..=299 => Ok(body),
            404 => Err(BuildError::ArtifactNotFound(url.path.clone())),
            _ => Err(BuildError::Network(format!(
                "GET {} returned status {status}",
                url.path
            ))),
        }
    }

    /// PUT a body to a URL
    pub fn put(&self, url: &ParsedUrl, body: &[u8]) -> BuildResult<()> {
        let (status, _) = self.request("PUT", url, Some(body))?;
        match status {
            200..=299 => Ok(()),
            _ => Err(BuildError::Network(format!(
                "PUT {} returned status {status}",
                url.path
            ))),
        }
    }

    fn request(
        &self,
        method: &str,
        url: &ParsedUrl,
        body: Option<&[u8]>,
    ) -> BuildResult<(u16, Vec<u8>)> {
        let mut stream = TcpStream::connect((url.host.as_str(), url.port))
            .map_err(|e| BuildError::Network(format!("connect {}:{}: {e}", url.host, url.port)))?;
        stream.set_read_timeout(Some(self.read_timeout))?;
        stream.set_write_timeout(Some(self.write_timeout))?;

        let mut request = format!(
            "{method} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nUser-Agent: forge/{}\r\n",
            url.path,
            url.host,
            env!("CARGO_PKG_VERSION"),
        );
        if let Some(body) = body {
            request.push_str(&format!("Content-Length: {}\r\n", body.len()));
        }
        request.push_str("\r\n");

        stream.write_all(request.as_bytes())?;
        if let Some(body) = body {
            stream.write_all(body)?;
        }
        stream.flush()?;

        let mut response = Vec::new();
        stream
            .read_to_end(&mut response)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    BuildError::Timeout(format!("reading response from {}", url.host))
                }
                _ => BuildError::Network(format!("read from {}: {e}", url.host)),
            })?;

        parse_response(&response)
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(30))
    }
}

fn parse_response(raw: &[u8]) -> BuildResult<(u16, Vec<u8>)> {
    let header_end = find_header_end(raw)
        .ok_or_else(|| BuildError::Network("malformed HTTP response: no header end".into()))?;
    let head = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| BuildError::Network("malformed HTTP response: non-UTF-8 headers".into()))?;

    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| BuildError::Network("empty HTTP response".into()))?;
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| BuildError::Network(format!("bad status line '{status_line}'")))?;

    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            if name == "content-length" {
                content_length = value.parse().ok();
            } else if name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
                chunked = true;
            }
        }
    }
    if chunked {
        return Err(BuildError::Network(
            "chunked transfer encoding not supported".into(),
        ));
    }

    let body_start = header_end + 4;
    let mut body = raw.get(body_start..).unwrap_or_default().to_vec();
    if let Some(len) = content_length {
        if body.len() < len {
            return Err(BuildError::Network(format!(
                "truncated body: got {} of {len} bytes",
                body.len()
            )));
        }
        body.truncate(len);
    }
    Ok((status, body))
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}
