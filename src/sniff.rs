/// Traffic classification derived from the first peeked bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Unknown,
    Http,
    /// Anything that does not look like HTTP; includes TLS ClientHello,
    /// which the obscura handler terminates itself
    Obscura,
}

/// HTTP request-line prefixes, trailing space mandatory
const HTTP_METHODS: [&str; 9] = [
    "GET ", "POST ", "HEAD ", "PUT ", "DELETE ", "CONNECT ", "OPTIONS ", "TRACE ", "PATCH ",
];

/// Classify peeked bytes without consuming them
///
/// Whitelist detection: if the prefix matches a known HTTP method it is HTTP,
/// otherwise the stream is treated as obscura traffic. Fewer than four bytes
/// is not enough to decide.
pub fn classify(peeked: &[u8]) -> Protocol {
    if peeked.len() < 4 {
        return Protocol::Unknown;
    }

    for method in HTTP_METHODS {
        if peeked.len() >= method.len() && &peeked[..method.len()] == method.as_bytes() {
            return Protocol::Http;
        }
    }

    Protocol::Obscura
}
