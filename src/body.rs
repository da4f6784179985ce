//! Response body type shared by the middleware chain and the dispatcher

use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

/// Boxed error carried by proxied bodies. Returning one from a body aborts the
/// client connection instead of ending the response cleanly.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response produced by the gateway
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
