//! Ready-made instructions for decoded bitmaps.

use std::collections::HashMap;
use std::io::Cursor;
use std::marker::PhantomData;
use std::sync::Arc;

use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageReader, Limits};
use tracing::trace;

use crate::domain::entities::CacheKey;
use crate::domain::errors::{ResourceError, ResourceResult};
use crate::domain::ports::{BindTarget, Instructions};

/// Bounds a decoded bitmap is scaled down to. `None` leaves the axis free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BitmapSpec {
    /// Maximum width in pixels.
    pub max_width: Option<u32>,
    /// Maximum height in pixels.
    pub max_height: Option<u32>,
}

impl BitmapSpec {
    /// No bounds: the bitmap keeps its natural size.
    #[must_use]
    pub const fn natural() -> Self {
        Self {
            max_width: None,
            max_height: None,
        }
    }

    /// Fits the bitmap inside `width` x `height`, keeping its aspect ratio.
    #[must_use]
    pub const fn fit(width: u32, height: u32) -> Self {
        Self {
            max_width: Some(width),
            max_height: Some(height),
        }
    }

    const fn is_natural(&self) -> bool {
        self.max_width.is_none() && self.max_height.is_none()
    }
}

type BoundCallback<T> = Box<dyn Fn(&T, Option<&str>, bool) + Send + Sync>;

/// Instructions decoding image bytes into a [`DynamicImage`], with optional
/// bundled images, a placeholder, extra request headers and a decode budget.
pub struct BitmapInstructions<T> {
    local: HashMap<String, Arc<DynamicImage>>,
    placeholder: Option<Arc<DynamicImage>>,
    headers: Vec<(String, String)>,
    max_alloc: Option<u64>,
    on_bound: Option<BoundCallback<T>>,
    _target: PhantomData<fn(&T)>,
}

impl<T> Default for BitmapInstructions<T> {
    fn default() -> Self {
        Self {
            local: HashMap::new(),
            placeholder: None,
            headers: Vec::new(),
            max_alloc: None,
            on_bound: None,
            _target: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for BitmapInstructions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitmapInstructions")
            .field("local", &self.local.len())
            .field("placeholder", &self.placeholder.is_some())
            .field("headers", &self.headers.len())
            .field("max_alloc", &self.max_alloc)
            .finish_non_exhaustive()
    }
}

impl<T> BitmapInstructions<T> {
    /// Creates instructions fetching everything over the network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `uid` from a bundled image instead of the network.
    #[must_use]
    pub fn with_local(mut self, uid: impl Into<String>, image: DynamicImage) -> Self {
        self.local.insert(uid.into(), Arc::new(image));
        self
    }

    /// Shows `image` while resolving, and for items without a uid.
    #[must_use]
    pub fn with_placeholder(mut self, image: DynamicImage) -> Self {
        self.placeholder = Some(Arc::new(image));
        self
    }

    /// Adds a header to every download.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Caps the memory a single decode may allocate. Exceeding it is reported
    /// as an out-of-memory condition.
    #[must_use]
    pub const fn with_max_alloc(mut self, bytes: u64) -> Self {
        self.max_alloc = Some(bytes);
        self
    }

    /// Registers a callback run on the UI thread once a target is settled.
    #[must_use]
    pub fn on_bound(mut self, callback: impl Fn(&T, Option<&str>, bool) + Send + Sync + 'static) -> Self {
        self.on_bound = Some(Box::new(callback));
        self
    }

    fn limits(&self) -> Limits {
        let mut limits = Limits::default();
        if let Some(max_alloc) = self.max_alloc {
            limits.max_alloc = Some(max_alloc);
        }
        limits
    }
}

impl<T: BindTarget<DynamicImage>> Instructions for BitmapInstructions<T> {
    type Target = T;
    type Payload = DynamicImage;
    type Spec = BitmapSpec;

    fn compute_key(&self, uid: &str, spec: &BitmapSpec) -> Option<CacheKey> {
        if spec.is_natural() {
            return Some(CacheKey::from_url(uid));
        }
        let width = spec.max_width.map_or_else(|| "*".to_string(), |w| w.to_string());
        let height = spec.max_height.map_or_else(|| "*".to_string(), |h| h.to_string());
        Some(CacheKey::from_url(&format!("{uid}@{width}x{height}")))
    }

    fn has_local_resource(&self, uid: Option<&str>, _spec: &BitmapSpec) -> bool {
        uid.is_some_and(|uid| self.local.contains_key(uid))
    }

    fn bind_local(&self, target: &T, uid: Option<&str>, _spec: &BitmapSpec) {
        let image = uid.and_then(|uid| self.local.get(uid)).cloned();
        target.set_resource(image);
    }

    fn has_placeholder(&self, _uid: Option<&str>, _spec: &BitmapSpec) -> bool {
        self.placeholder.is_some()
    }

    fn bind_placeholder(&self, target: &T, _uid: Option<&str>, _spec: &BitmapSpec) {
        target.set_resource(self.placeholder.clone());
    }

    fn on_resource_bound(&self, success: bool, target: &T, uid: Option<&str>, _spec: &BitmapSpec) {
        if let Some(callback) = &self.on_bound {
            callback(target, uid, success);
        }
    }

    fn before_download(
        &self,
        _uid: &str,
        _spec: &BitmapSpec,
        mut request: reqwest::RequestBuilder,
    ) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    fn decode(&self, bytes: &[u8], uid: &str, spec: &BitmapSpec) -> ResourceResult<DynamicImage> {
        let mut reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ResourceError::decode(format!("Failed to sniff format: {e}")))?;
        reader.limits(self.limits());

        let decoded = reader.decode().map_err(|e| match e {
            ImageError::Limits(_) => ResourceError::out_of_memory(uid),
            other => ResourceError::decode(format!("Failed to decode image: {other}")),
        })?;

        Ok(scale_down(decoded, spec))
    }
}

/// Shrinks `image` to fit `spec`, never enlarging it.
fn scale_down(image: DynamicImage, spec: &BitmapSpec) -> DynamicImage {
    let max_width = spec.max_width.unwrap_or(u32::MAX);
    let max_height = spec.max_height.unwrap_or(u32::MAX);
    if image.width() <= max_width && image.height() <= max_height {
        return image;
    }
    trace!(
        width = image.width(),
        height = image.height(),
        max_width,
        max_height,
        "Scaling bitmap down"
    );
    image.resize(max_width, max_height, FilterType::Triangle)
}
