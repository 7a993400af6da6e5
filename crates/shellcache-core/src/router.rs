//! Request router: picks a strategy per intercepted request and runs it.
//!
//! - Navigation: network (or preload) first, application shell as fallback
//! - Static asset: stale-while-revalidate against the static store
//! - Passthrough: network first, runtime store as fallback, never cached
//!
//! No strategy fails. Every fetch or cache error turns into a fallback or the
//! network-error response.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::classify::{classify, request_key, static_key, Route};
use crate::error::FetchError;
use crate::generation::{CacheGeneration, SHELL_KEY};
use crate::network::Fetcher;
use crate::request::{Origin, Request, Response};
use crate::store::CacheStorage;

/// A navigation-preload response already in flight for a navigation.
pub type Preload = BoxFuture<'static, Result<Response, FetchError>>;

/// One intercepted request.
pub struct FetchEvent {
    pub request: Request,
    pub preload: Option<Preload>,
}

impl FetchEvent {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            preload: None,
        }
    }

    pub fn with_preload(mut self, preload: Preload) -> Self {
        self.preload = Some(preload);
        self
    }
}

impl From<Request> for FetchEvent {
    fn from(request: Request) -> Self {
        Self::new(request)
    }
}

#[derive(Clone)]
pub struct Router {
    generation: CacheGeneration,
    origin: Origin,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl Router {
    pub fn new(
        generation: CacheGeneration,
        origin: Origin,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            generation,
            origin,
            storage,
            fetcher,
        }
    }

    pub fn generation(&self) -> &CacheGeneration {
        &self.generation
    }

    pub fn route(&self, request: &Request) -> Route {
        classify(request, &self.origin)
    }

    /// Handle an intercepted request. `None` means the request is not
    /// intercepted and should go to the network untouched.
    pub async fn handle(&self, event: FetchEvent) -> Option<Response> {
        let route = self.route(&event.request);
        debug!(route = %route, url = %event.request.url, generation = %self.generation, "Routing request");

        match route {
            Route::Bypass => None,
            Route::Navigation => Some(self.navigation(event).await),
            Route::StaticAsset => Some(self.static_asset(event.request).await),
            Route::Passthrough => Some(self.passthrough(event.request).await),
        }
    }

    async fn navigation(&self, event: FetchEvent) -> Response {
        let FetchEvent { request, preload } = event;
        let runtime = self.generation.runtime_name();

        let network = match preload {
            Some(preload) => preload.await,
            None => self.fetcher.fetch(&request).await,
        };

        match network {
            Ok(response) => {
                if response.ok() {
                    Self::store(self.storage.as_ref(), &runtime, SHELL_KEY, &response).await;
                }
                response
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Navigation failed, falling back to cached shell");
                self.lookup(&runtime, SHELL_KEY)
                    .await
                    .unwrap_or_else(Response::network_error)
            }
        }
    }

    async fn static_asset(&self, request: Request) -> Response {
        let cache = self.generation.static_name();
        let key = static_key(&request.url);
        let cached = self.lookup(&cache, &key).await;

        // Runs to completion even if nobody awaits it
        let revalidation = tokio::spawn(Self::revalidate(
            Arc::clone(&self.storage),
            Arc::clone(&self.fetcher),
            cache,
            key,
            request,
        ));

        if let Some(cached) = cached {
            return cached;
        }

        match revalidation.await {
            Ok(Some(response)) => response,
            Ok(None) => Response::network_error(),
            Err(e) => {
                warn!(error = %e, "Static asset fetch task failed");
                Response::network_error()
            }
        }
    }

    async fn revalidate(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        cache: String,
        key: String,
        request: Request,
    ) -> Option<Response> {
        match fetcher.fetch(&request).await {
            Ok(response) => {
                if response.ok() {
                    Self::store(storage.as_ref(), &cache, &key, &response).await;
                }
                Some(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Static asset revalidation failed");
                None
            }
        }
    }

    async fn passthrough(&self, request: Request) -> Response {
        match self.fetcher.fetch(&request).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "Passthrough failed, checking runtime cache");
                let runtime = self.generation.runtime_name();
                self.lookup(&runtime, &request_key(&request))
                    .await
                    .unwrap_or_else(Response::network_error)
            }
        }
    }

    async fn lookup(&self, cache: &str, key: &str) -> Option<Response> {
        match self.storage.match_entry(cache, key).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(cache = cache, key = key, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    async fn store(storage: &dyn CacheStorage, cache: &str, key: &str, response: &Response) {
        if let Err(e) = storage.put(cache, key, response).await {
            warn!(cache = cache, key = key, error = %e, "Failed to update cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::Notify;
    use url::Url;

    use crate::request::Method;
    use crate::store::MemoryStorage;
    use crate::testing::{MockFetcher, Reply};

    const ORIGIN: &str = "https://app.test/";

    struct Fixture {
        router: Router,
        storage: Arc<MemoryStorage>,
        fetcher: Arc<MockFetcher>,
        generation: CacheGeneration,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let fetcher = Arc::new(MockFetcher::new());
        let generation = CacheGeneration::new("v2");
        let origin = Origin::of(&Url::parse(ORIGIN).expect("url"));
        let router = Router::new(
            generation.clone(),
            origin,
            storage.clone(),
            fetcher.clone(),
        );
        Fixture {
            router,
            storage,
            fetcher,
            generation,
        }
    }

    fn url(path: &str) -> Url {
        Url::parse(ORIGIN).expect("url").join(path).expect("join")
    }

    // -------------------------------------------------------------------------
    // Bypass
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_non_get_and_cross_origin_are_not_intercepted() {
        let f = fixture();
        let post = Request::new(Method::Post, url("/api/attendance"));
        assert!(f.router.handle(post.into()).await.is_none());

        let foreign = Request::get(Url::parse("https://cdn.test/lib.js").expect("url"));
        assert!(f.router.handle(foreign.into()).await.is_none());
        assert!(f.fetcher.calls().is_empty());
    }

    // -------------------------------------------------------------------------
    // Navigation
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_navigation_online_returns_live_and_stores_shell() {
        let f = fixture();
        f.fetcher.respond(url("/roster").as_str(), 200, "<html>v2</html>");

        let response = f
            .router
            .handle(Request::navigate(url("/roster")).into())
            .await
            .expect("intercepted");
        assert_eq!(response.body, b"<html>v2</html>");

        let shell = f
            .storage
            .match_entry(&f.generation.runtime_name(), SHELL_KEY)
            .await
            .expect("match")
            .expect("shell stored");
        assert_eq!(shell, response);
    }

    #[tokio::test]
    async fn test_navigation_keeps_only_latest_shell() {
        let f = fixture();
        f.fetcher.respond(url("/").as_str(), 200, "first");
        f.fetcher.respond(url("/export").as_str(), 200, "second");
        f.router.handle(Request::navigate(url("/")).into()).await;
        f.router.handle(Request::navigate(url("/export")).into()).await;

        let runtime = f.generation.runtime_name();
        assert_eq!(f.storage.entries(&runtime).await.expect("entries"), vec![SHELL_KEY]);
        let shell = f.storage.match_entry(&runtime, SHELL_KEY).await.expect("match").expect("shell");
        assert_eq!(shell.body, b"second");
    }

    #[tokio::test]
    async fn test_navigation_offline_serves_stored_shell() {
        let f = fixture();
        let shell = Response::new(200, "<html>cached</html>");
        f.storage
            .put(&f.generation.runtime_name(), SHELL_KEY, &shell)
            .await
            .expect("put");

        let response = f
            .router
            .handle(Request::navigate(url("/scan")).into())
            .await
            .expect("intercepted");
        assert_eq!(response, shell);
    }

    #[tokio::test]
    async fn test_navigation_offline_without_shell_is_network_error() {
        let f = fixture();
        let response = f
            .router
            .handle(Request::navigate(url("/")).into())
            .await
            .expect("intercepted");
        assert!(response.is_network_error());
    }

    #[tokio::test]
    async fn test_navigation_error_status_is_returned_but_not_stored() {
        let f = fixture();
        f.fetcher.respond(url("/missing").as_str(), 404, "not here");
        let response = f
            .router
            .handle(Request::navigate(url("/missing")).into())
            .await
            .expect("intercepted");
        assert_eq!(response.status, 404);
        assert!(!f.storage.has(&f.generation.runtime_name()).await.expect("has"));
    }

    #[tokio::test]
    async fn test_navigation_uses_preload_instead_of_fetching() {
        let f = fixture();
        let event = FetchEvent::new(Request::navigate(url("/")))
            .with_preload(Box::pin(async { Ok::<_, FetchError>(Response::new(200, "preloaded")) }));

        let response = f.router.handle(event).await.expect("intercepted");
        assert_eq!(response.body, b"preloaded");
        assert!(f.fetcher.calls().is_empty());
    }

    // -------------------------------------------------------------------------
    // Static assets
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_static_hit_does_not_wait_for_network() {
        let f = fixture();
        let cached = Response::new(200, "cached css");
        f.storage
            .put(&f.generation.static_name(), "/css/app.css", &cached)
            .await
            .expect("put");
        f.fetcher.reply(url("/css/app.css?v=9").as_str(), Reply::Hang);

        let response = tokio::time::timeout(
            Duration::from_millis(200),
            f.router.handle(Request::get(url("/css/app.css?v=9")).into()),
        )
        .await
        .expect("returned without waiting for the network")
        .expect("intercepted");
        assert_eq!(response, cached);
    }

    #[tokio::test]
    async fn test_static_hit_refreshes_cache_in_background() {
        let f = fixture();
        let static_name = f.generation.static_name();
        f.storage
            .put(&static_name, "/js/app.js", &Response::new(200, "old"))
            .await
            .expect("put");
        let gate = Arc::new(Notify::new());
        f.fetcher.reply(
            url("/js/app.js?build=2").as_str(),
            Reply::Gated(gate.clone(), Response::new(200, "new")),
        );

        let response = f
            .router
            .handle(Request::get(url("/js/app.js?build=2")).into())
            .await
            .expect("intercepted");
        assert_eq!(response.body, b"old");

        gate.notify_one();
        for _ in 0..50 {
            let hit = f.storage.match_entry(&static_name, "/js/app.js").await.expect("match");
            if hit.map(|r| r.body) == Some(b"new".to_vec()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let hit = f.storage.match_entry(&static_name, "/js/app.js").await.expect("match");
        assert_eq!(hit.expect("entry").body, b"new");
        // The network sees the original query string
        assert_eq!(f.fetcher.calls()[0].url.query(), Some("build=2"));
    }

    #[tokio::test]
    async fn test_static_miss_awaits_network_and_stores_by_path() {
        let f = fixture();
        f.fetcher.respond(url("/icons/icon-192.png?x=1").as_str(), 200, "png");

        let response = f
            .router
            .handle(Request::get(url("/icons/icon-192.png?x=1")).into())
            .await
            .expect("intercepted");
        assert_eq!(response.body, b"png");
        let stored = f
            .storage
            .match_entry(&f.generation.static_name(), "/icons/icon-192.png")
            .await
            .expect("match");
        assert!(stored.is_some());
    }

    #[tokio::test]
    async fn test_static_miss_offline_is_network_error() {
        let f = fixture();
        let response = f
            .router
            .handle(Request::get(url("/lib/qrcode.min.js")).into())
            .await
            .expect("intercepted");
        assert!(response.is_network_error());
    }

    // -------------------------------------------------------------------------
    // Passthrough
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_passthrough_success_is_not_cached() {
        let f = fixture();
        f.fetcher.respond(url("/api/students").as_str(), 200, "[]");
        let response = f
            .router
            .handle(Request::get(url("/api/students")).into())
            .await
            .expect("intercepted");
        assert_eq!(response.body, b"[]");
        assert!(f.storage.keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn test_passthrough_offline_uses_exact_runtime_entry() {
        let f = fixture();
        let runtime = f.generation.runtime_name();
        let previous = Response::new(200, "[\"ada\"]");
        f.storage
            .put(&runtime, "https://app.test/api/students?class=3", &previous)
            .await
            .expect("put");

        let hit = f
            .router
            .handle(Request::get(url("/api/students?class=3")).into())
            .await
            .expect("intercepted");
        assert_eq!(hit, previous);

        let miss = f
            .router
            .handle(Request::get(url("/api/students?class=4")).into())
            .await
            .expect("intercepted");
        assert!(miss.is_network_error());
    }

    #[tokio::test]
    async fn test_passthrough_offline_without_entry_mutates_nothing() {
        let f = fixture();
        let response = f
            .router
            .handle(Request::get(url("/api/sync")).into())
            .await
            .expect("intercepted");
        assert!(response.is_network_error());
        assert!(f.storage.keys().await.expect("keys").is_empty());
    }
}
