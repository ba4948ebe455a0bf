// Minimal HTTP/1.1 plumbing over TcpStream: request parsing for the front,
// response writing, and a small client for talking to peers. Connections are
// one-shot (`Connection: close` both ways).

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

const CHUNK: usize = 4096;

/// Hard cap on accepted bodies; wallets are far smaller.
pub const MAX_BODY: usize = 8 * 1024 * 1024;

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Request {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }
}

pub fn read_request(stream: &mut TcpStream) -> Result<Request> {
    let mut data = Vec::new();
    let mut buf = [0u8; CHUNK];
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if data.len() > MAX_BODY {
            return Err(Error::validation("request headers too big"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(Error::validation("connection closed mid-request"));
        }
        data.extend_from_slice(&buf[..n]);
    };
    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut body = data[header_end..].to_vec();

    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| Error::validation("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| Error::validation("no method"))?
        .to_string();
    let target = parts.next().ok_or_else(|| Error::validation("no path"))?;
    let (path, query) = parse_target(target);

    let mut headers = HashMap::new();
    let mut content_len = 0usize;
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_lowercase();
            let value = value.trim().to_string();
            if name == "content-length" {
                content_len = value.parse().unwrap_or(0);
            }
            headers.insert(name, value);
        }
    }
    if content_len > MAX_BODY {
        return Err(Error::validation("request body too big"));
    }
    while body.len() < content_len {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_len);

    Ok(Request {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn parse_target(target: &str) -> (String, HashMap<String, String>) {
    let mut query = HashMap::new();
    let (path, raw) = match target.split_once('?') {
        Some((path, raw)) => (path, raw),
        None => return (target.to_string(), query),
    };
    for pair in raw.split('&') {
        match pair.split_once('=') {
            Some((k, v)) => query.insert(k.to_string(), v.to_string()),
            None => query.insert(pair.to_string(), String::new()),
        };
    }
    (path.to_string(), query)
}

pub fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Internal Server Error",
    }
}

pub fn write_response(
    stream: &mut TcpStream,
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
) {
    let mut out = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    let _ = stream.write_all(out.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(|s| s.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

pub struct HttpClient {
    host: String,
    port: u16,
    timeout: Duration,
}

impl HttpClient {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        HttpClient {
            host: host.to_string(),
            port,
            timeout,
        }
    }

    pub fn get(&self, path: &str, headers: &[(String, String)]) -> Result<HttpResponse> {
        self.request("GET", path, headers, b"")
    }

    pub fn put(
        &self,
        path: &str,
        headers: &[(String, String)],
        body: &str,
    ) -> Result<HttpResponse> {
        self.request("PUT", path, headers, body.as_bytes())
    }

    fn request(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<HttpResponse> {
        let addr = format!("{}:{}", self.host, self.port)
            .to_socket_addrs()
            .map_err(|e| Error::Peer(format!("can't resolve {}:{}: {}", self.host, self.port, e)))?
            .next()
            .ok_or_else(|| Error::Peer(format!("no address for {}:{}", self.host, self.port)))?;
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .map_err(|e| Error::Peer(format!("can't connect to {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;

        let mut out = format!("{} {} HTTP/1.1\r\n", method, path);
        out.push_str(&format!("Host: {}:{}\r\n", self.host, self.port));
        for (name, value) in headers {
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str(&format!("Content-Length: {}\r\n", body.len()));
        out.push_str("Connection: close\r\n\r\n");
        stream
            .write_all(out.as_bytes())
            .and_then(|_| stream.write_all(body))
            .map_err(|e| Error::Peer(format!("can't send to {}: {}", addr, e)))?;

        let mut data = Vec::new();
        let mut buf = [0u8; CHUNK];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&buf[..n]);
                    if data.len() > MAX_BODY {
                        return Err(Error::Peer(format!("response from {} too big", addr)));
                    }
                }
                Err(e) => return Err(Error::Peer(format!("can't read from {}: {}", addr, e))),
            }
        }
        parse_response(&data).ok_or_else(|| Error::Peer(format!("bad response from {}", addr)))
    }
}

fn parse_response(data: &[u8]) -> Option<HttpResponse> {
    let header_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = head.split("\r\n");
    let status: u16 = lines.next()?.split_whitespace().nth(1)?.parse().ok()?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }
    Some(HttpResponse {
        status,
        headers,
        body: data[header_end..].to_vec(),
    })
}
