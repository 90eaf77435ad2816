//! Minimal HTTP/1.x wire layer
//!
//! The proxy forwards requests byte-faithfully, so headers keep their
//! original casing and order of first appearance; only the bookkeeping
//! headers (`Connection`, `Content-Length`, `Transfer-Encoding`) are
//! regenerated. The reader is bounded and never trusts the peer for sizes.

mod header;
mod reader;
mod request;
mod response;
mod serialize;

pub use header::HeaderBag;
pub use reader::{read_request, MAX_BODY_BYTES, MAX_HEADER_BYTES};
pub use request::{Method, Request};
pub use response::Response;
pub use serialize::{serialize_request, serialize_response};
