use super::{Request, Response};

fn version_str(version: u8) -> &'static str {
    match version {
        10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    }
}

/// Serialize a request for forwarding
///
/// Headers are written in stored order with their original casing. The
/// `Connection` header, when present, is regenerated from the keep-alive
/// flag; everything else passes through untouched. Serialization is
/// deterministic: the same request always produces the same bytes.
pub fn serialize_request(req: &Request) -> Vec<u8> {
    let mut out = Vec::with_capacity(256 + req.body().len());

    out.extend_from_slice(req.method_raw().as_bytes());
    out.push(b' ');
    out.extend_from_slice(req.target().as_bytes());
    out.push(b' ');
    out.extend_from_slice(version_str(req.version()).as_bytes());
    out.extend_from_slice(b"\r\n");

    let connection_value = if req.keep_alive() { "keep-alive" } else { "close" };
    let mut wrote_connection = false;
    for (name, value) in req.headers.iter() {
        if name.eq_ignore_ascii_case("connection") {
            if wrote_connection {
                continue;
            }
            wrote_connection = true;
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(connection_value.as_bytes());
        } else {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
        }
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(req.body());
    out
}

/// Serialize a response
pub fn serialize_response(resp: &Response) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + resp.body().len());

    out.extend_from_slice(b"HTTP/1.1 ");
    out.extend_from_slice(resp.status().to_string().as_bytes());
    out.push(b' ');
    out.extend_from_slice(resp.reason().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in resp.headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(resp.body());
    out
}
