use super::HeaderBag;

/// One HTTP/1.1 response, serialized only (the proxy never parses responses)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    status: u16,
    reason: String,
    pub headers: HeaderBag,
    body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: HeaderBag::new(),
            body: Vec::new(),
        }
    }

    /// The CONNECT success response, exactly as written to the client
    pub fn connection_established() -> Self {
        Self::new(200, "Connection Established")
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[allow(dead_code)]
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.set("Content-Length", body.len().to_string());
        self.body = body;
    }
}
