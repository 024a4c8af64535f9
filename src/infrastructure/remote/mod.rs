//! Remote business-object sources.

mod http_source;

pub use http_source::{HttpJsonSource, RemoteError};
