//! Port definitions for the image engine: payloads, targets and the
//! caller-supplied instructions that drive every resolution.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::domain::entities::CacheKey;
use crate::domain::errors::ResourceResult;

/// A decoded resource held by the memory cache.
pub trait Payload: Send + Sync + 'static {
    /// Estimated memory footprint, used for the cache byte budget.
    fn size_in_bytes(&self) -> u64;
}

impl Payload for image::DynamicImage {
    fn size_in_bytes(&self) -> u64 {
        self.as_bytes().len() as u64
    }
}

impl Payload for Bytes {
    fn size_in_bytes(&self) -> u64 {
        self.len() as u64
    }
}

impl Payload for Vec<u8> {
    fn size_in_bytes(&self) -> u64 {
        self.len() as u64
    }
}

/// A presentation target the engine can bind a payload to.
///
/// Only ever called from the UI thread.
pub trait BindTarget<P>: Send + Sync + 'static {
    /// Displays `resource`, or clears the target when `None`.
    fn set_resource(&self, resource: Option<Arc<P>>);
}

/// How the bytes of a resource are obtained.
#[derive(Debug)]
pub enum StreamSupply {
    /// Let the engine fetch the URL over HTTP.
    Network,
    /// The bytes are already available (alternate cache, bundled file...).
    Ready(Bytes),
    /// The bytes will be delivered later through an [`AsyncInstructor`].
    Deferred(oneshot::Receiver<Option<Bytes>>),
}

/// Sending half of a deferred stream supply.
#[derive(Debug)]
pub struct AsyncInstructor {
    tx: oneshot::Sender<Option<Bytes>>,
}

impl AsyncInstructor {
    /// Creates an instructor and the supply to hand back to the engine.
    #[must_use]
    pub fn new() -> (Self, StreamSupply) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, StreamSupply::Deferred(rx))
    }

    /// Delivers the bytes, or `None` when the resource turned out unavailable.
    pub fn deliver(self, bytes: Option<Bytes>) {
        // The command may have been dropped by `empty()`; nothing to notify then.
        let _ = self.tx.send(bytes);
    }
}

/// Strategy supplied with each request: key and URL computation, local and
/// placeholder policies, decoding and binding callbacks.
///
/// `uid` is `None` when the caller has no identifier for the target (for
/// instance an item without a picture). Methods taking a target run on the UI
/// thread unless stated otherwise.
pub trait Instructions: Send + Sync + 'static {
    /// The presentation target type.
    type Target: BindTarget<Self::Payload>;
    /// The decoded payload type.
    type Payload: Payload;
    /// Caller-defined descriptor of the wanted variant (size, orientation...).
    type Spec: Send + Sync + 'static;

    /// Computes the memory cache key. `None` disables caching for this request.
    fn compute_key(&self, uid: &str, _spec: &Self::Spec) -> Option<CacheKey> {
        Some(CacheKey::new(uid))
    }

    /// Computes the URL to download.
    fn compute_url(&self, uid: &str, _spec: &Self::Spec) -> String {
        uid.to_string()
    }

    /// Whether the resource can be served without the network. Worker thread.
    fn has_local_resource(&self, _uid: Option<&str>, _spec: &Self::Spec) -> bool {
        false
    }

    /// Binds the local resource.
    fn bind_local(&self, _target: &Self::Target, _uid: Option<&str>, _spec: &Self::Spec) {}

    /// Whether a placeholder should be shown while resolving. Worker thread.
    fn has_placeholder(&self, _uid: Option<&str>, _spec: &Self::Spec) -> bool {
        false
    }

    /// Binds the placeholder.
    fn bind_placeholder(&self, _target: &Self::Target, _uid: Option<&str>, _spec: &Self::Spec) {}

    /// Called once a download attempt finished. Not guaranteed to run on the UI thread.
    fn on_resource_ready(
        &self,
        _success: bool,
        _target: Option<&Self::Target>,
        _payload: Option<&Self::Payload>,
        _uid: Option<&str>,
        _spec: &Self::Spec,
    ) {
    }

    /// Binds the resolved payload. Return `false` to let the engine call
    /// [`BindTarget::set_resource`] itself.
    fn bind_resource(
        &self,
        _downloaded: bool,
        _target: &Self::Target,
        _payload: &Arc<Self::Payload>,
        _uid: Option<&str>,
        _spec: &Self::Spec,
    ) -> bool {
        false
    }

    /// Called on the UI thread once the command for `target` is over, whatever
    /// the outcome, including a `None` uid.
    fn on_resource_bound(
        &self,
        _success: bool,
        _target: &Self::Target,
        _uid: Option<&str>,
        _spec: &Self::Spec,
    ) {
    }

    /// Decorates the HTTP request before it is sent (headers, auth...).
    fn before_download(
        &self,
        _uid: &str,
        _spec: &Self::Spec,
        request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        request
    }

    /// Lets the caller short-circuit the network or deliver bytes later.
    fn supply_stream(&self, _uid: &str, _spec: &Self::Spec, _url: &str) -> StreamSupply {
        StreamSupply::Network
    }

    /// Turns raw bytes into a payload. Runs on a blocking thread.
    ///
    /// # Errors
    /// Any error marks the resource unavailable; [`ResourceError::OutOfMemory`]
    /// additionally empties the memory cache.
    ///
    /// [`ResourceError::OutOfMemory`]: crate::domain::errors::ResourceError::OutOfMemory
    fn decode(&self, bytes: &[u8], uid: &str, spec: &Self::Spec) -> ResourceResult<Self::Payload>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_async_instructor_delivers() {
        let (instructor, supply) = AsyncInstructor::new();
        instructor.deliver(Some(Bytes::from_static(b"png")));

        let StreamSupply::Deferred(rx) = supply else {
            panic!("expected a deferred supply");
        };
        assert_eq!(rx.await.unwrap(), Some(Bytes::from_static(b"png")));
    }

    #[test]
    fn test_payload_sizes() {
        let img = image::DynamicImage::new_rgba8(10, 10);
        assert_eq!(img.size_in_bytes(), 400);
        assert_eq!(Bytes::from_static(b"abc").size_in_bytes(), 3);
    }
}
