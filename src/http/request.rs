use super::HeaderBag;

/// Request method, with unrecognized verbs preserved as [`Method::Other`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
    Other,
}

impl Method {
    fn from_raw(raw: &str) -> Self {
        match raw {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "CONNECT" => Method::Connect,
            "OPTIONS" => Method::Options,
            "TRACE" => Method::Trace,
            "PATCH" => Method::Patch,
            _ => Method::Other,
        }
    }
}

/// One parsed HTTP/1.x request
///
/// `version` is 10 or 11. The body, when present, is always fully decoded
/// into memory by the reader, so `Content-Length` and the body length agree
/// and `Transfer-Encoding` never survives into serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    method_raw: String,
    target: String,
    version: u8,
    pub headers: HeaderBag,
    body: Vec<u8>,
}

impl Request {
    pub fn new(method_raw: impl Into<String>, target: impl Into<String>, version: u8) -> Self {
        let method_raw = method_raw.into();
        Self {
            method: Method::from_raw(&method_raw),
            method_raw,
            target: target.into(),
            version,
            headers: HeaderBag::new(),
            body: Vec::new(),
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn method_raw(&self) -> &str {
        &self.method_raw
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Install a fully decoded body
    ///
    /// Regenerates `Content-Length` from the body size and strips any
    /// `Transfer-Encoding` header, since the framing it described no longer
    /// applies to the in-memory bytes.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.remove("Transfer-Encoding");
        self.headers.set("Content-Length", body.len().to_string());
        self.body = body;
    }

    /// Keep-alive flag derived from the version and the `Connection` header
    pub fn keep_alive(&self) -> bool {
        let connection = self.headers.get("Connection");
        match self.version {
            11 => !connection_has_token(connection, "close"),
            _ => connection_has_token(connection, "keep-alive"),
        }
    }
}

fn connection_has_token(value: Option<&str>, token: &str) -> bool {
    match value {
        Some(v) => v
            .split(',')
            .any(|part| part.trim().eq_ignore_ascii_case(token)),
        None => false,
    }
}
