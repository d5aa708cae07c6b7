use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::header::{CONTENT_ENCODING, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use tower::util::BoxCloneService;
use tower::{service_fn, Layer, ServiceExt};
use tower_page_cache::prelude::*;
use tower_page_cache::PageCacheService;

type Page = BoxCloneService<Request<()>, Response<Full<Bytes>>, Infallible>;

fn counting<F>(counter: Arc<AtomicUsize>, respond: F) -> Page
where
    F: Fn(&Request<()>, usize) -> Response<Full<Bytes>> + Clone + Send + Sync + 'static,
{
    BoxCloneService::new(service_fn(move |req: Request<()>| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let response = respond(&req, n);
        async move { Ok::<_, Infallible>(response) }
    }))
}

fn html(body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .header("content-type", "text/html; charset=UTF-8")
        .body(Full::from(body.into()))
        .expect("response")
}

fn numbered_page(counter: Arc<AtomicUsize>) -> Page {
    counting(counter, |_req, n| html(format!("<html>render {n}</html>")))
}

fn get(uri: &str) -> http::request::Builder {
    Request::builder().uri(uri).header("host", "example.com")
}

async fn send(service: &PageCacheService<Page>, request: http::request::Builder) -> Response<Full<Bytes>> {
    service
        .clone()
        .oneshot(request.body(()).expect("request"))
        .await
        .expect("service call succeeds")
}

async fn body(response: Response<Full<Bytes>>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("body collected")
        .to_bytes()
}

fn outcome(response: &Response<Full<Bytes>>) -> &str {
    response.headers()[DEFAULT_CACHE_STATUS_HEADER]
        .to_str()
        .expect("status header is ascii")
}

fn layer(config: PageCacheConfig) -> PageCacheLayer {
    PageCacheLayer::builder(InMemoryBackend::new(1_000))
        .config(config)
        .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
        .build()
}

#[tokio::test]
async fn gzip_variant_is_stored_and_served() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default().with_gzip(true)).layer(numbered_page(counter.clone()));

    let first = send(&service, get("/").header("accept-encoding", "gzip, deflate")).await;
    assert_eq!(outcome(&first), "miss_fill");
    assert_eq!(first.headers()[CONTENT_ENCODING], "gzip");
    assert!(first.headers()["vary"].to_str().expect("vary").contains("Accept-Encoding"));
    let first_etag = first.headers()[ETAG].clone();
    let first_body = body(first).await;

    let second = send(&service, get("/").header("accept-encoding", "gzip")).await;
    assert_eq!(outcome(&second), "hit");
    assert_eq!(second.headers()[CONTENT_ENCODING], "gzip");
    assert_eq!(second.headers()[ETAG], first_etag);
    let second_body = body(second).await;
    assert_eq!(first_body, second_body);

    let plain = Compression::Gzip.decompress(&second_body).expect("valid gzip");
    assert_eq!(plain, Bytes::from_static(b"<html>render 1</html>"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn compression_variants_are_isolated() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default().with_gzip(true)).layer(numbered_page(counter.clone()));

    send(&service, get("/news/").header("accept-encoding", "gzip")).await;

    let identity = send(&service, get("/news/")).await;
    assert_eq!(outcome(&identity), "hit");
    assert!(identity.headers().get(CONTENT_ENCODING).is_none());
    assert_eq!(body(identity).await, Bytes::from_static(b"<html>render 1</html>"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn matching_etag_yields_304_without_body() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(numbered_page(counter.clone()));

    let first = send(&service, get("/post/").header("accept-encoding", "gzip")).await;
    let etag = first.headers()[ETAG].clone();

    let revalidated = send(
        &service,
        get("/post/")
            .header("accept-encoding", "gzip")
            .header(IF_NONE_MATCH, etag),
    )
    .await;
    assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
    assert!(revalidated.headers().get(CONTENT_ENCODING).is_none());
    assert!(body(revalidated).await.is_empty());

    let other = send(&service, get("/post/").header(IF_NONE_MATCH, "\"not-the-tag\"")).await;
    assert_eq!(other.status(), StatusCode::OK);
    assert!(!body(other).await.is_empty());
}

#[tokio::test]
async fn matching_if_modified_since_yields_304() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(numbered_page(counter.clone()));

    let first = send(&service, get("/archive/")).await;
    let last_modified = first.headers()[LAST_MODIFIED].clone();

    let revalidated = send(&service, get("/archive/").header(IF_MODIFIED_SINCE, last_modified)).await;
    assert_eq!(revalidated.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(outcome(&revalidated), "hit");
    assert!(body(revalidated).await.is_empty());

    let older = send(
        &service,
        get("/archive/").header(IF_MODIFIED_SINCE, "Mon, 01 Jan 2001 00:00:00 GMT"),
    )
    .await;
    assert_eq!(older.status(), StatusCode::OK);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn head_request_gets_headers_only() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(numbered_page(counter.clone()));

    send(&service, get("/about/")).await;

    let head = send(&service, get("/about/").method(Method::HEAD)).await;
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(outcome(&head), "hit");
    assert!(head.headers().contains_key(ETAG));
    assert!(head.headers().get("content-length").is_none());
    assert!(body(head).await.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn head_miss_gets_headers_only() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(numbered_page(counter.clone()));

    let head = send(&service, get("/fresh/").method(Method::HEAD)).await;
    assert_eq!(outcome(&head), "miss_request_method");
    assert!(body(head).await.is_empty());

    let get_after = send(&service, get("/fresh/")).await;
    assert_eq!(outcome(&get_after), "miss_fill");
    assert_eq!(body(get_after).await, Bytes::from_static(b"<html>render 2</html>"));
}

#[tokio::test]
async fn head_on_rejected_request_gets_headers_only() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(numbered_page(counter.clone()));

    let query = send(&service, get("/s?q=1").method(Method::HEAD)).await;
    assert_eq!(query.status(), StatusCode::OK);
    assert!(body(query).await.is_empty());

    let logged_in = send(
        &service,
        get("/account/")
            .method(Method::HEAD)
            .header("cookie", "wordpress_logged_in_abc=admin"),
    )
    .await;
    assert!(body(logged_in).await.is_empty());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn dynamic_fragments_render_per_request() {
    let counter = Arc::new(AtomicUsize::new(0));
    let visits = Arc::new(AtomicUsize::new(0));
    let fragments = FragmentRegistry::new().register("visits", {
        let visits = visits.clone();
        move |_args| Ok((visits.fetch_add(1, Ordering::SeqCst) + 1).to_string())
    });

    let layer = PageCacheLayer::builder(InMemoryBackend::new(100))
        .config(PageCacheConfig::default().with_gzip(false).with_dynamic_secret("s3cr3t"))
        .fragments(fragments)
        .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
        .build();
    let service = layer.layer(counting(counter.clone(), |_req, _n| {
        html("<p>seen <!-- mfunc s3cr3t visits --><!-- /mfunc s3cr3t --> times</p>")
    }));

    let first = send(&service, get("/counter/")).await;
    assert_eq!(outcome(&first), "miss_fill");
    let first_etag = first.headers()[ETAG].clone();
    assert_eq!(body(first).await, Bytes::from_static(b"<p>seen 1 times</p>"));

    let second = send(&service, get("/counter/")).await;
    assert_eq!(outcome(&second), "hit");
    assert_ne!(second.headers()[ETAG], first_etag);
    let rendered = body(second).await;
    assert_eq!(rendered, Bytes::from_static(b"<p>seen 2 times</p>"));
    assert!(!String::from_utf8_lossy(&rendered).contains("s3cr3t"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn normalization_redirect_is_not_cached() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default().with_accept_qs(["utm_source"])).layer(counting(
        counter.clone(),
        |_req, _n| {
            Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(LOCATION, "/landing/")
                .body(Full::from(Bytes::new()))
                .expect("response")
        },
    ));

    for _ in 0..2 {
        let response = send(&service, get("/landing/?utm_source=mail")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(outcome(&response), "miss_normalization_redirect");
    }
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn redirect_elsewhere_is_cached_with_location() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(counting(counter.clone(), |_req, _n| {
        Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, "https://example.com/new-home/")
            .body(Full::from(Bytes::new()))
            .expect("response")
    }));

    send(&service, get("/old-home/")).await;
    let cached = send(&service, get("/old-home/")).await;
    assert_eq!(outcome(&cached), "hit");
    assert_eq!(cached.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(cached.headers()[LOCATION], "https://example.com/new-home/");
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn rejected_requests_always_reach_the_application() {
    let counter = Arc::new(AtomicUsize::new(0));
    let service = layer(PageCacheConfig::default()).layer(numbered_page(counter.clone()));

    let cases = [
        (get("/account/").header("cookie", "wordpress_logged_in_abc=admin"), "miss_logged_in"),
        (get("/search/?s=rust"), "miss_query_string"),
        (get("/form/").method(Method::POST), "miss_request_method"),
        (get("/wp-login.php"), "miss_configuration"),
    ];
    for (request, expected) in cases {
        let uri = request.uri_ref().expect("uri").clone();
        let method = request.method_ref().expect("method").clone();
        let first = send(&service, request).await;
        assert_eq!(outcome(&first), expected, "{method} {uri}");

        let mut again = get(&uri.to_string()).method(method);
        if expected == "miss_logged_in" {
            again = again.header("cookie", "wordpress_logged_in_abc=admin");
        }
        assert_eq!(outcome(&send(&service, again).await), expected);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 8);
}

#[tokio::test]
async fn not_found_pages_follow_configuration() {
    let counter = Arc::new(AtomicUsize::new(0));
    let missing = |_req: &Request<()>, _n: usize| {
        let mut response = html("<h1>Not found</h1>");
        *response.status_mut() = StatusCode::NOT_FOUND;
        response
    };

    let service = layer(PageCacheConfig::default()).layer(counting(counter.clone(), missing));
    assert_eq!(outcome(&send(&service, get("/nope/")).await), "miss_404");
    assert_eq!(outcome(&send(&service, get("/nope/")).await), "miss_404");

    let service = layer(PageCacheConfig::default().with_cache_404(true)).layer(counting(counter.clone(), missing));
    send(&service, get("/nope/")).await;
    let cached = send(&service, get("/nope/")).await;
    assert_eq!(outcome(&cached), "hit");
    assert_eq!(cached.status(), StatusCode::NOT_FOUND);
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn can_write_hook_vetoes_storage() {
    let counter = Arc::new(AtomicUsize::new(0));
    let layer = PageCacheLayer::builder(InMemoryBackend::new(100))
        .hooks(Hooks::new().with_can_write(|_ctx, _decision| false))
        .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
        .build();
    let service = layer.layer(numbered_page(counter.clone()));

    let first = send(&service, get("/")).await;
    assert_eq!(outcome(&first), "miss_third_party");
    let second = send(&service, get("/")).await;
    assert_eq!(body(second).await, Bytes::from_static(b"<html>render 2</html>"));
}

#[tokio::test]
async fn late_caching_consults_the_late_init_hook() {
    let counter = Arc::new(AtomicUsize::new(0));
    let hooks = Hooks::new().with_late_init(|ctx| {
        ctx.cookies()
            .iter()
            .any(|(name, _)| name == "cart")
            .then(|| "Visitor has a cart".to_owned())
    });
    let layer = PageCacheLayer::builder(InMemoryBackend::new(100))
        .config(PageCacheConfig::default().with_late_caching(true))
        .hooks(hooks)
        .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
        .build();
    let service = layer.layer(numbered_page(counter.clone()));

    assert_eq!(outcome(&send(&service, get("/shop/")).await), "miss_fill");
    assert_eq!(outcome(&send(&service, get("/shop/")).await), "hit");

    let with_cart = send(&service, get("/shop/").header("cookie", "cart=3")).await;
    assert_eq!(outcome(&with_cart), "miss_configuration");
    assert_eq!(body(with_cart).await, Bytes::from_static(b"<html>render 2</html>"));

    let again = send(&service, get("/shop/")).await;
    assert_eq!(body(again).await, Bytes::from_static(b"<html>render 1</html>"));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn file_backend_persists_across_layers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PageCacheConfig::default();
    let counter = Arc::new(AtomicUsize::new(0));

    let first = PageCacheLayer::new(FileBackend::new(dir.path()), config.clone()).layer(numbered_page(counter.clone()));
    send(&first, get("/persisted/")).await;

    let second = PageCacheLayer::builder(FileBackend::new(dir.path()))
        .config(config)
        .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
        .build()
        .layer(numbered_page(counter.clone()));
    let response = send(&second, get("/persisted/")).await;
    assert_eq!(outcome(&response), "hit");
    assert_eq!(body(response).await, Bytes::from_static(b"<html>render 1</html>"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn enhanced_mode_writes_url_shaped_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PageCacheConfig::default()
        .with_engine(Engine::FileGeneric)
        .with_gzip(true);
    let counter = Arc::new(AtomicUsize::new(0));
    let service = PageCacheLayer::builder(GenericFileBackend::new(dir.path()))
        .config(config)
        .cache_status_header(DEFAULT_CACHE_STATUS_HEADER)
        .build()
        .layer(numbered_page(counter.clone()));

    let response = send(&service, get("/blog/").header("accept-encoding", "gzip")).await;
    assert_eq!(outcome(&response), "miss_fill");

    let page_dir = dir.path().join("example.com").join("blog");
    let plain = tokio::fs::read(page_dir.join("_index_slash.html"))
        .await
        .expect("identity page written");
    assert_eq!(plain, b"<html>render 1</html>");
    let gzip = tokio::fs::read(page_dir.join("_index_slash.html_gzip"))
        .await
        .expect("gzip page written");
    assert_eq!(
        Compression::Gzip.decompress(&gzip).expect("valid gzip"),
        Bytes::from_static(b"<html>render 1</html>")
    );

    let head = send(&service, get("/blog/").method(Method::HEAD)).await;
    assert_eq!(outcome(&head), "miss_request_method");
    assert!(body(head).await.is_empty());
}

#[tokio::test]
async fn layer_from_json_configuration() {
    let source = JsonConfig::parse(
        r#"{
            "pgcache": {"engine": "memory", "lifetime": 120},
            "browsercache.html.compression": false
        }"#,
    )
    .expect("valid json");
    let config = PageCacheConfig::try_from_source(&source).expect("patterns compile");
    assert_eq!(config.engine, Engine::Memory);

    let counter = Arc::new(AtomicUsize::new(0));
    let service = PageCacheLayer::from_config(config)
        .await
        .expect("memory engine builds")
        .layer(numbered_page(counter.clone()));
    send(&service, get("/configured/")).await;
    send(&service, get("/configured/")).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
