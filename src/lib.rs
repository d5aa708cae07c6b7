//! Tower Page Cache
//! ================
//!
//! `tower-page-cache` is a full-page response cache for Tower-based HTTP
//! services. It answers repeat requests for public pages from a pluggable
//! store (disk, URL-shaped static files, Redis, Memcached or memory),
//! keeping separate variants per device class, referrer class, cookie
//! group, encryption and content encoding, and handling conditional GETs
//! itself.
//!
//! Most consumers start from [`PageCacheLayer::builder`]:
//!
//! ```no_run
//! use std::time::Duration;
//! use tower::{Service, ServiceBuilder, ServiceExt};
//! use tower_page_cache::prelude::*;
//!
//! # async fn run() -> Result<(), tower_page_cache::layer::BoxError> {
//! let config = PageCacheConfig::default()
//!     .with_engine(Engine::Memory)
//!     .with_lifetime(Duration::from_secs(600));
//! let layer = PageCacheLayer::builder(InMemoryBackend::new(1_000))
//!     .config(config)
//!     .build();
//!
//! let mut svc = ServiceBuilder::new()
//!     .layer(layer)
//!     .service(tower::service_fn(|_req| async {
//!         Ok::<_, std::convert::Infallible>(http::Response::new(http_body_util::Full::from("ok")))
//!     }));
//!
//! let response = svc
//!     .ready()
//!     .await?
//!     .call(http::Request::new(()))
//!     .await?;
//! # drop(response);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod codec;
pub mod compression;
pub mod conditional;
pub mod config;
pub mod dynamic;
pub mod error;
pub mod grabber;
pub mod hooks;
pub mod key;
pub mod layer;
pub mod logging;
pub mod policy;
pub mod prelude;
pub mod request;
pub mod telemetry;

/// Product token sent in `X-Powered-By` and recognized in responses.
pub const POWERED_BY: &str = "tower-page-cache";

pub use config::PageCacheConfig;
pub use error::CacheError;
pub use grabber::{ContentGrabber, Outcome, RequestState};
pub use layer::{PageCacheLayer, PageCacheLayerBuilder, PageCacheService};
pub use logging::{CacheEvent, LoggingConfig};
pub use telemetry::ProcessStatus;
