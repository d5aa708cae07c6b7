use std::error::Error as StdError;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::{HeaderName, Request, Response};
use http_body::Body;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service, ServiceExt};

use crate::backend::{self, PageStore};
use crate::config::PageCacheConfig;
use crate::dynamic::{DynamicProcessor, FragmentRegistry};
use crate::error::CacheError;
use crate::grabber::{ContentGrabber, Outcome};
use crate::hooks::Hooks;
use crate::logging::LoggingConfig;
use crate::request::RequestContext;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Header carrying the request outcome when enabled with
/// [`PageCacheLayerBuilder::cache_status_header`].
pub const DEFAULT_CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-cache-status");

/// Full-page caching layer for Tower services.
///
/// The layer answers cacheable requests from its [`PageStore`] and captures
/// the inner service's responses for later requests. Create instances via
/// [`PageCacheLayer::builder`], [`PageCacheLayer::new`], or
/// [`PageCacheLayer::from_config`] to build the configured engine.
///
/// Cloning a `PageCacheLayer` is cheap and shares the store.
#[derive(Clone, Debug)]
pub struct PageCacheLayer {
    grabber: Arc<ContentGrabber>,
}

/// Builder for configuring [`PageCacheLayer`] instances.
pub struct PageCacheLayerBuilder {
    store: Arc<dyn PageStore>,
    config: PageCacheConfig,
    hooks: Hooks,
    fragments: FragmentRegistry,
    logging: LoggingConfig,
    status_header: Option<HeaderName>,
}

impl PageCacheLayerBuilder {
    pub fn new<B>(store: B) -> Self
    where
        B: PageStore,
    {
        Self::from_store(Arc::new(store))
    }

    /// Starts from an already shared store, such as the one returned by
    /// [`backend::build_store`].
    pub fn from_store(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            config: PageCacheConfig::default(),
            hooks: Hooks::default(),
            fragments: FragmentRegistry::default(),
            logging: LoggingConfig::default(),
            status_header: None,
        }
    }

    /// Replaces the configuration with a pre-built value.
    pub fn config(mut self, config: PageCacheConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lifetime(mut self, lifetime: Duration) -> Self {
        self.config.lifetime = lifetime;
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Functions callable from dynamic fragment markers.
    pub fn fragments(mut self, fragments: FragmentRegistry) -> Self {
        self.fragments = fragments;
        self
    }

    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = logging;
        self
    }

    /// Adds a header naming the request outcome (`hit`, `miss_fill`, ...)
    /// to every response.
    pub fn cache_status_header(mut self, name: HeaderName) -> Self {
        self.status_header = Some(name);
        self
    }

    pub fn build(self) -> PageCacheLayer {
        let dynamic = DynamicProcessor::from_config(&self.config, self.fragments);
        let grabber = ContentGrabber::new(self.store, Arc::new(self.config))
            .with_hooks(self.hooks)
            .with_dynamic(dynamic)
            .with_logging(self.logging)
            .with_status_header(self.status_header);

        PageCacheLayer {
            grabber: Arc::new(grabber),
        }
    }
}

impl PageCacheLayer {
    /// Builds a page cache layer with the given configuration.
    pub fn new<B>(store: B, config: PageCacheConfig) -> Self
    where
        B: PageStore,
    {
        PageCacheLayerBuilder::new(store).config(config).build()
    }

    /// Returns a builder for fine-grained control over the layer.
    pub fn builder<B>(store: B) -> PageCacheLayerBuilder
    where
        B: PageStore,
    {
        PageCacheLayerBuilder::new(store)
    }

    /// Connects the engine named by `config.engine` and builds a layer
    /// over it.
    pub async fn from_config(config: PageCacheConfig) -> Result<Self, CacheError> {
        let store = backend::build_store(&config).await?;
        Ok(PageCacheLayerBuilder::from_store(store).config(config).build())
    }

    pub fn grabber(&self) -> &ContentGrabber {
        &self.grabber
    }
}

impl<S> Layer<S> for PageCacheLayer {
    type Service = PageCacheService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PageCacheService {
            inner,
            grabber: self.grabber.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PageCacheService<S> {
    inner: S,
    grabber: Arc<ContentGrabber>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for PageCacheService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError> + Send,
    ReqBody: Send + 'static,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError> + Send,
{
    type Response = Response<Full<Bytes>>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let ctx = RequestContext::from_request(&req);
        let grabber = self.grabber.clone();
        let inner = self.inner.clone();

        Box::pin(async move {
            tracing::debug!(method = %ctx.method(), uri = %ctx.request_uri(), "page_cache_call");

            let state = match grabber.process(ctx).await {
                Outcome::Respond(response) => return Ok(response),
                Outcome::Generate(state) => state,
                Outcome::Deferred(state) => match grabber.delayed_cache_print(state).await {
                    Outcome::Respond(response) => return Ok(response),
                    Outcome::Generate(state) | Outcome::Deferred(state) => state,
                },
            };

            let response = inner.oneshot(req).await.map_err(Into::into)?;
            let (parts, body) = response.into_parts();
            let body = BodyExt::collect(body).await.map_err(Into::into)?.to_bytes();

            Ok(grabber.capture(state, parts, body).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::InMemoryBackend;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    #[test]
    fn page_cache_service_implements_clone() {
        fn assert_clone<T: Clone>(_: &T) {}

        let layer = PageCacheLayer::new(InMemoryBackend::new(100), PageCacheConfig::default());
        let service = layer.layer(service_fn(|_req: Request<()>| async {
            Ok::<_, Infallible>(Response::new(Full::<Bytes>::from(Bytes::new())))
        }));

        assert_clone(&service);
    }

    #[tokio::test]
    async fn second_request_skips_inner_service() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let layer = PageCacheLayer::builder(InMemoryBackend::new(100))
            .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
            .build();
        let service = layer.layer(service_fn(move |_req: Request<()>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(
                    Response::builder()
                        .header("content-type", "text/html")
                        .body(Full::from("<p>hello</p>"))
                        .expect("response"),
                )
            }
        }));

        for expected in ["miss_fill", "hit"] {
            let response = service
                .clone()
                .oneshot(Request::builder().uri("/hello/").body(()).expect("request"))
                .await
                .expect("response");
            assert_eq!(response.headers()[DEFAULT_CACHE_STATUS_HEADER], expected);
            let body = response.into_body().collect().await.expect("body").to_bytes();
            assert_eq!(body, Bytes::from_static(b"<p>hello</p>"));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
