//! Minimal HTTP/1.x framing for one-shot connections.
//!
//! A request is whatever arrived in a single read; bodies that spill past the
//! read buffer are truncated.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{PortalError, Result};

/// Size of the single read each connection gets.
pub const READ_BUFFER: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Options,
    Other,
}

impl Method {
    fn parse(raw: &str) -> Self {
        match raw {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "OPTIONS" => Method::Options,
            _ => Method::Other,
        }
    }
}

/// A parsed request plus the address it came from.
#[derive(Debug, Clone)]
pub struct HttpPetition {
    pub method: Method,
    pub path: String,
    pub query: String,
    /// Lower-cased, without port.
    pub host: String,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub client_ip: IpAddr,
}

impl HttpPetition {
    pub fn parse(raw: &[u8], client_ip: IpAddr) -> Result<Self> {
        let text = String::from_utf8_lossy(raw);
        let (head, body) = match text.find("\r\n\r\n") {
            Some(at) => (&text[..at], &text[at + 4..]),
            None => match text.find("\n\n") {
                Some(at) => (&text[..at], &text[at + 2..]),
                None => (text.as_ref(), ""),
            },
        };

        let mut lines = head.lines();
        let request_line = lines
            .next()
            .filter(|l| !l.trim().is_empty())
            .ok_or_else(|| PortalError::Malformed("empty request".to_string()))?;
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(PortalError::Malformed(format!(
                "bad request line '{request_line}'"
            )));
        };
        if !version.starts_with("HTTP/") {
            return Err(PortalError::Malformed(format!("bad version '{version}'")));
        }

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        // Proxies and some probes send absolute-form targets.
        let (target_host, origin) = split_absolute(target);
        let (path, query) = match origin.split_once('?') {
            Some((p, q)) => (p, q),
            None => (origin, ""),
        };
        let host = headers
            .get("host")
            .map(String::as_str)
            .or(target_host)
            .map(strip_port)
            .unwrap_or_default()
            .to_ascii_lowercase();

        let mut body = body.to_string();
        if let Some(len) = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
        {
            if body.len() > len && body.is_char_boundary(len) {
                body.truncate(len);
            }
        }

        Ok(Self {
            method: Method::parse(method),
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query: query.to_string(),
            host,
            headers,
            body,
            client_ip,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn user_agent(&self) -> &str {
        self.header("user-agent").unwrap_or("unknown")
    }

    /// `application/x-www-form-urlencoded` body fields.
    pub fn form(&self) -> HashMap<String, String> {
        parse_urlencoded(&self.body)
    }

    pub fn query_params(&self) -> HashMap<String, String> {
        parse_urlencoded(&self.query)
    }

    /// The client as IPv4; IPv4-mapped IPv6 peers are unwrapped.
    pub fn client_v4(&self) -> Option<Ipv4Addr> {
        match self.client_ip {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        }
    }

    pub fn is_loopback(&self) -> bool {
        match self.client_v4() {
            Some(v4) => v4.is_loopback(),
            None => self.client_ip.is_loopback(),
        }
    }

    pub fn uri(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    pub fn os_family(&self) -> OsFamily {
        OsFamily::from_user_agent(self.user_agent())
    }

    pub fn browser_family(&self) -> BrowserFamily {
        BrowserFamily::from_user_agent(self.user_agent())
    }
}

fn split_absolute(target: &str) -> (Option<&str>, &str) {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(at) => (Some(&rest[..at]), &rest[at..]),
                None => (Some(rest), "/"),
            };
        }
    }
    (None, target)
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

pub fn parse_urlencoded(input: &str) -> HashMap<String, String> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(k), decode_component(v))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

/// Operating system guessed from the user agent. Only shapes responses and
/// logs; never used for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Ios,
    MacOs,
    Android,
    Windows,
    Linux,
    ChromeOs,
    FireOs,
    Nintendo,
    PlayStation,
    Unknown,
}

impl OsFamily {
    pub fn from_user_agent(ua: &str) -> Self {
        let ua = ua.to_ascii_lowercase();
        if ua.contains("nintendo") {
            OsFamily::Nintendo
        } else if ua.contains("playstation") {
            OsFamily::PlayStation
        } else if ua.contains("kindle") || ua.contains("silk/") {
            OsFamily::FireOs
        } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
            OsFamily::Ios
        } else if ua.contains("captivenetworksupport") || ua.contains("mac os x") {
            OsFamily::MacOs
        } else if ua.contains("android") || ua.contains("dalvik") {
            OsFamily::Android
        } else if ua.contains("windows") || ua.contains("microsoft ncsi") {
            OsFamily::Windows
        } else if ua.contains("cros") {
            OsFamily::ChromeOs
        } else if ua.contains("linux") || ua.contains("networkmanager") {
            OsFamily::Linux
        } else {
            OsFamily::Unknown
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserFamily {
    CaptiveAssistant,
    Edge,
    Samsung,
    Chrome,
    Firefox,
    Safari,
    Unknown,
}

impl BrowserFamily {
    pub fn from_user_agent(ua: &str) -> Self {
        let ua = ua.to_ascii_lowercase();
        if ua.contains("captivenetworksupport") || ua.contains("microsoft ncsi") {
            BrowserFamily::CaptiveAssistant
        } else if ua.contains("edg/") {
            BrowserFamily::Edge
        } else if ua.contains("samsungbrowser") {
            BrowserFamily::Samsung
        } else if ua.contains("firefox/") {
            BrowserFamily::Firefox
        } else if ua.contains("chrome/") || ua.contains("crios/") {
            BrowserFamily::Chrome
        } else if ua.contains("safari/") {
            BrowserFamily::Safari
        } else {
            BrowserFamily::Unknown
        }
    }
}

impl fmt::Display for BrowserFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn no_content() -> Self {
        Self::new(204)
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/plain; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn html(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(body.into().into_bytes())
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    /// 302 with a meta-refresh body for clients that ignore `Location`.
    pub fn redirect(location: &str) -> Self {
        let body = format!(
            "<!DOCTYPE html><html><head><meta http-equiv=\"refresh\" content=\"0; url={location}\"></head>\
             <body><a href=\"{location}\">Continue</a></body></html>"
        );
        Self::html(302, body).with_header("Location", location)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status, reason(self.status));
        for (name, value) in &self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        head.push_str("Cache-Control: no-cache, no-store, must-revalidate\r\n");
        head.push_str("Connection: close\r\n\r\n");
        let mut out = head.into_bytes();
        out.extend_from_slice(&self.body);
        out
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        202 => "Accepted",
        204 => "No Content",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> IpAddr {
        "10.0.0.5".parse().unwrap()
    }

    #[test]
    fn parses_request_line_host_and_query() {
        let raw = b"GET /generate_204?x=1 HTTP/1.1\r\nHost: ConnectivityCheck.gstatic.com:80\r\nUser-Agent: Dalvik/2.1.0 (Linux; U; Android 13)\r\n\r\n";
        let req = HttpPetition::parse(raw, client()).unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.path, "/generate_204");
        assert_eq!(req.query, "x=1");
        assert_eq!(req.host, "connectivitycheck.gstatic.com");
        assert_eq!(req.os_family(), OsFamily::Android);
        assert_eq!(req.uri(), "/generate_204?x=1");
    }

    #[test]
    fn absolute_target_supplies_host() {
        let raw = b"GET http://captive.apple.com/hotspot-detect.html HTTP/1.0\r\n\r\n";
        let req = HttpPetition::parse(raw, client()).unwrap();
        assert_eq!(req.host, "captive.apple.com");
        assert_eq!(req.path, "/hotspot-detect.html");
    }

    #[test]
    fn decodes_form_body() {
        let raw = b"POST /portal/login HTTP/1.1\r\nHost: 192.168.50.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 35\r\n\r\nusername=ann+lee&password=p%40ss%21trailing";
        let req = HttpPetition::parse(raw, client()).unwrap();
        let form = req.form();
        assert_eq!(form["username"], "ann lee");
        assert_eq!(form["password"], "p@ss!");
    }

    #[test]
    fn rejects_garbage() {
        assert!(HttpPetition::parse(b"", client()).is_err());
        assert!(HttpPetition::parse(b"\x16\x03\x01\x02\x00", client()).is_err());
        assert!(HttpPetition::parse(b"GET /\r\n\r\n", client()).is_err());
    }

    #[test]
    fn mapped_ipv6_counts_as_loopback() {
        let req = HttpPetition::parse(b"GET / HTTP/1.1\r\n\r\n", "::ffff:127.0.0.1".parse().unwrap())
            .unwrap();
        assert!(req.is_loopback());
        assert_eq!(req.client_v4(), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn serializes_with_length_and_close() {
        let bytes = HttpResponse::text(200, "Microsoft NCSI").to_bytes();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 14\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\nMicrosoft NCSI"));
    }

    #[test]
    fn redirect_carries_location_and_refresh() {
        let resp = HttpResponse::redirect("http://192.168.50.1:8080/portal/login");
        assert_eq!(resp.status, 302);
        assert_eq!(resp.header("location"), Some("http://192.168.50.1:8080/portal/login"));
        assert!(resp.body_text().contains("http-equiv=\"refresh\""));
    }

    #[test]
    fn families_from_user_agents() {
        assert_eq!(
            OsFamily::from_user_agent("CaptiveNetworkSupport-443.1 wispr"),
            OsFamily::MacOs
        );
        assert_eq!(
            OsFamily::from_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X)"),
            OsFamily::Ios
        );
        assert_eq!(OsFamily::from_user_agent("Microsoft NCSI"), OsFamily::Windows);
        assert_eq!(
            BrowserFamily::from_user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0"),
            BrowserFamily::Firefox
        );
        assert_eq!(
            BrowserFamily::from_user_agent("Mozilla/5.0 AppleWebKit/537.36 Chrome/120.0 Safari/537.36 Edg/120.0"),
            BrowserFamily::Edge
        );
    }
}
