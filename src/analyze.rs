use crate::http::{Method, Request};

/// Routing decision extracted from a request or authority string
///
/// `port` stays a string because it is only ever re-joined into a
/// `host:port` pair for resolution; nothing is trimmed or URL-decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub host: String,
    pub port: String,
    pub forward_proxy: bool,
}

impl RouteTarget {
    /// Decide forward-vs-reverse from a parsed request
    ///
    /// CONNECT and absolute-form targets mean the client is using us as a
    /// forward proxy; an origin-form target means reverse proxying by the
    /// `Host` header.
    pub fn from_request(req: &Request) -> Self {
        if req.method() == Method::Connect {
            let (host, port) = split_host_port(req.target(), "443");
            return Self {
                host,
                port,
                forward_proxy: true,
            };
        }

        if let Some(rest) = req.target().strip_prefix("http://") {
            let authority = rest.split('/').next().unwrap_or("");
            let (host, port) = split_host_port(authority, "80");
            return Self {
                host,
                port,
                forward_proxy: true,
            };
        }
        if let Some(rest) = req.target().strip_prefix("https://") {
            let authority = rest.split('/').next().unwrap_or("");
            let (host, port) = split_host_port(authority, "443");
            return Self {
                host,
                port,
                forward_proxy: true,
            };
        }

        let (host, port) = split_host_port(req.headers.get("Host").unwrap_or(""), "80");
        Self {
            host,
            port,
            forward_proxy: false,
        }
    }

    /// Decide from a raw `host[:port]` string (always forward)
    pub fn from_authority(authority: &str) -> Self {
        let (host, port) = split_host_port(authority, "80");
        Self {
            host,
            port,
            forward_proxy: true,
        }
    }
}

/// Split on the first `:`; a missing or empty port becomes the default
fn split_host_port(src: &str, default_port: &str) -> (String, String) {
    match src.find(':') {
        Some(pos) => {
            let port = &src[pos + 1..];
            (
                src[..pos].to_string(),
                if port.is_empty() {
                    default_port.to_string()
                } else {
                    port.to_string()
                },
            )
        }
        None => (src.to_string(), default_port.to_string()),
    }
}
