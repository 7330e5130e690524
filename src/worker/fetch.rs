//! Network-first fetch policy with cache and offline-page fallback.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{run_blocking, CacheResult, CacheStorage, RequestKey};
use crate::event::ExtendableEvent;
use crate::network::{Network, Request, Response};

/// What the requester receives for an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// Not intercepted; the host performs the request itself
  PassThrough,
  /// A usable response and where it came from
  Respond(CacheResult<Response>),
  /// Network failed and there is nothing to fall back to
  NetworkError,
}

#[cfg(test)]
impl FetchOutcome {
  pub fn response(&self) -> Option<&Response> {
    match self {
      FetchOutcome::Respond(result) => Some(&result.data),
      _ => None,
    }
  }
}

/// Intercepts requests for one cache generation.
pub struct FetchInterceptor<S: CacheStorage> {
  generation: String,
  offline_key: RequestKey,
  storage: Arc<S>,
  network: Arc<dyn Network>,
}

impl<S: CacheStorage + 'static> FetchInterceptor<S> {
  pub fn new(
    generation: String,
    offline_key: RequestKey,
    storage: Arc<S>,
    network: Arc<dyn Network>,
  ) -> Self {
    Self {
      generation,
      offline_key,
      storage,
      network,
    }
  }

  /// Serve a request: network first, then the cached entry, then (for
  /// navigations only) the offline page.
  ///
  /// Successful network responses are written to the cache as a lifetime
  /// extension of `event`; the write never delays or fails the response.
  pub async fn handle(&self, request: &Request, event: &ExtendableEvent) -> FetchOutcome {
    if !request.is_get() || !request.is_network_scheme() {
      debug!(method = %request.method, url = %request.url, "Passing through");
      return FetchOutcome::PassThrough;
    }

    let key = request.key();

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.cache_in_background(key, response.clone(), event);
        }
        FetchOutcome::Respond(CacheResult::from_network(response))
      }
      Err(e) => {
        info!(url = %request.url, "Network failed, falling back to cache: {}", e);
        self.fallback(key, request.is_navigation()).await
      }
    }
  }

  fn cache_in_background(&self, key: RequestKey, response: Response, event: &ExtendableEvent) {
    let storage = Arc::clone(&self.storage);
    let generation = self.generation.clone();

    event.wait_until(async move {
      let label = key.to_string();
      match run_blocking(&storage, move |s| s.put(&generation, &key, &response)).await {
        Ok(()) => debug!(request = %label, "Cached response"),
        Err(e) => warn!(request = %label, "Failed to cache response: {}", e),
      }
      Ok(())
    });
  }

  async fn fallback(&self, key: RequestKey, navigation: bool) -> FetchOutcome {
    if let Some(cached) = self.lookup(key).await {
      return FetchOutcome::Respond(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    if navigation {
      if let Some(page) = self.lookup(self.offline_key.clone()).await {
        info!("Serving offline page");
        return FetchOutcome::Respond(CacheResult::offline_fallback(page.response, page.cached_at));
      }
      warn!(generation = %self.generation, "Offline page missing from cache");
    }

    FetchOutcome::NetworkError
  }

  /// Cache errors are treated as misses.
  async fn lookup(&self, key: RequestKey) -> Option<crate::cache::CachedResponse> {
    let generation = self.generation.clone();
    let label = key.to_string();
    match run_blocking(&self.storage, move |s| s.lookup(&generation, &key)).await {
      Ok(found) => found,
      Err(e) => {
        warn!(request = %label, "Cache lookup failed: {}", e);
        None
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::network::stub::StubNetwork;
  use url::Url;

  const GEN: &str = "app@v1";

  struct Fixture {
    storage: Arc<SqliteStorage>,
    network: Arc<StubNetwork>,
    interceptor: FetchInterceptor<SqliteStorage>,
  }

  fn url(path: &str) -> Url {
    Url::parse("https://app.test").unwrap().join(path).unwrap()
  }

  fn fixture() -> Fixture {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .seed(
        GEN,
        &[(RequestKey::get(&url("/offline.html")), Response::new(200, "offline"))],
      )
      .unwrap();
    let network = Arc::new(
      StubNetwork::new()
        .route("https://app.test/api/headcount", Response::new(200, "42"))
        .route("https://app.test/reports", Response::new(200, "<html>reports</html>"))
        .route("https://app.test/missing", Response::new(404, "nope")),
    );
    let interceptor = FetchInterceptor::new(
      GEN.to_string(),
      RequestKey::get(&url("/offline.html")),
      Arc::clone(&storage),
      Arc::clone(&network) as Arc<dyn Network>,
    );
    Fixture {
      storage,
      network,
      interceptor,
    }
  }

  async fn serve(f: &Fixture, request: Request) -> FetchOutcome {
    let event = ExtendableEvent::new();
    let outcome = f.interceptor.handle(&request, &event).await;
    event.settle().await.unwrap();
    outcome
  }

  #[tokio::test]
  async fn test_online_response_is_returned_and_cached() {
    let f = fixture();
    let outcome = serve(&f, Request::get(url("/api/headcount"))).await;

    match outcome {
      FetchOutcome::Respond(result) => {
        assert_eq!(result.source, CacheSource::Network);
        assert_eq!(result.data.body, b"42");
      }
      other => panic!("unexpected outcome {:?}", other),
    }
    let cached = f
      .storage
      .lookup(GEN, &RequestKey::get(&url("/api/headcount")))
      .unwrap();
    assert!(cached.is_some());
  }

  #[tokio::test]
  async fn test_offline_serves_what_was_cached() {
    let f = fixture();
    serve(&f, Request::get(url("/api/headcount"))).await;

    f.network.set_offline(true);
    let outcome = serve(&f, Request::get(url("/api/headcount"))).await;

    match outcome {
      FetchOutcome::Respond(result) => {
        assert_eq!(result.source, CacheSource::Cache);
        assert_eq!(result.data, Response::new(200, "42"));
        assert!(result.cached_at.is_some());
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_page() {
    let f = fixture();
    f.network.set_offline(true);

    let outcome = serve(&f, Request::navigate(url("/reports"))).await;
    match outcome {
      FetchOutcome::Respond(result) => {
        assert_eq!(result.source, CacheSource::OfflineFallback);
        assert_eq!(result.data.body, b"offline");
      }
      other => panic!("unexpected outcome {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_offline_subresource_gets_network_error() {
    let f = fixture();
    f.network.set_offline(true);

    let outcome = serve(&f, Request::get(url("/api/headcount"))).await;
    assert!(matches!(outcome, FetchOutcome::NetworkError));
  }

  #[tokio::test]
  async fn test_error_status_is_returned_but_not_cached() {
    let f = fixture();
    let outcome = serve(&f, Request::get(url("/missing"))).await;

    assert_eq!(outcome.response().map(|r| r.status), Some(404));
    assert!(f
      .storage
      .lookup(GEN, &RequestKey::get(&url("/missing")))
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let f = fixture();
    let outcome = serve(&f, Request::get(url("/api/headcount")).with_method("POST")).await;

    assert!(matches!(outcome, FetchOutcome::PassThrough));
    assert_eq!(f.network.calls(), 0);
    assert_eq!(f.storage.entry_count(GEN).unwrap(), 1);
  }

  #[tokio::test]
  async fn test_internal_scheme_passes_through() {
    let f = fixture();
    let request = Request::get(Url::parse("chrome-extension://abc/inject.js").unwrap());

    assert!(matches!(serve(&f, request).await, FetchOutcome::PassThrough));
    assert_eq!(f.network.calls(), 0);
  }

  /// Storage whose writes always fail.
  struct FullStorage;

  impl CacheStorage for FullStorage {
    fn open_cache(&self, _generation: &str) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("quota exceeded"))
    }
    fn has_cache(&self, _generation: &str) -> color_eyre::Result<bool> {
      Ok(false)
    }
    fn is_seeded(&self, _generation: &str) -> color_eyre::Result<bool> {
      Ok(false)
    }
    fn cache_names(&self) -> color_eyre::Result<Vec<String>> {
      Ok(Vec::new())
    }
    fn put(&self, _: &str, _: &RequestKey, _: &Response) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("quota exceeded"))
    }
    fn seed(&self, _: &str, _: &[(RequestKey, Response)]) -> color_eyre::Result<()> {
      Err(color_eyre::eyre::eyre!("quota exceeded"))
    }
    fn lookup(
      &self,
      _: &str,
      _: &RequestKey,
    ) -> color_eyre::Result<Option<crate::cache::CachedResponse>> {
      Ok(None)
    }
    fn delete_cache(&self, _generation: &str) -> color_eyre::Result<bool> {
      Ok(false)
    }
    fn entry_count(&self, _generation: &str) -> color_eyre::Result<usize> {
      Ok(0)
    }
  }

  #[tokio::test]
  async fn test_cache_write_failure_does_not_affect_response() {
    let network = StubNetwork::new().route("https://app.test/api/headcount", Response::new(200, "42"));
    let interceptor = FetchInterceptor::new(
      GEN.to_string(),
      RequestKey::get(&url("/offline.html")),
      Arc::new(FullStorage),
      Arc::new(network) as Arc<dyn Network>,
    );

    let event = ExtendableEvent::new();
    let outcome = interceptor
      .handle(&Request::get(url("/api/headcount")), &event)
      .await;

    assert_eq!(outcome.response().map(|r| r.body.clone()), Some(b"42".to_vec()));
    event.settle().await.unwrap();
  }
}
