//! Request pipeline for every backend call.
//!
//! [`RequestGateway`] attaches the bearer token, collapses identical
//! in-flight requests into one network call, and recovers from a stale
//! access token with exactly one refresh-and-retry.

mod error;
mod key;
mod transport;

#[cfg(test)]
pub(crate) mod testing;
#[cfg(test)]
mod tests;

pub use error::{ApiError, Error};
pub use key::canonical_key;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, Transport, TransportError};

use crate::auth::{SessionContext, SessionRefresher};
use error::is_refreshable;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default lifetime of an unresolved in-flight entry.
pub const DEFAULT_INFLIGHT_TTL: Duration = Duration::from_secs(30);

type SharedResult = Shared<BoxFuture<'static, Result<Value, Error>>>;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Prefix for relative request paths.
    pub base_url: String,
    /// Path (or absolute URL) of the token refresh endpoint.
    pub refresh_path: String,
    /// In-flight entries older than this are evicted even if unresolved.
    pub inflight_ttl: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            refresh_path: "/api/auth/refresh".to_string(),
            inflight_ttl: DEFAULT_INFLIGHT_TTL,
        }
    }
}

struct InFlight {
    id: u64,
    issued_at: Instant,
    /// Callers still awaiting `result`.
    waiters: usize,
    result: SharedResult,
}

struct Inner {
    base_url: String,
    transport: Arc<dyn Transport>,
    session: Arc<SessionContext>,
    refresher: SessionRefresher,
    inflight: Mutex<HashMap<String, InFlight>>,
    inflight_ttl: Duration,
    next_id: AtomicU64,
}

/// Cheap to clone; clones share the dedup map and session.
#[derive(Clone)]
pub struct RequestGateway {
    inner: Arc<Inner>,
}

impl RequestGateway {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn Transport>,
        session: Arc<SessionContext>,
    ) -> Self {
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let refresh_url = resolve_url(&base_url, &config.refresh_path);
        let refresher =
            SessionRefresher::new(Arc::clone(&session), Arc::clone(&transport), refresh_url);

        Self {
            inner: Arc::new(Inner {
                base_url,
                transport,
                session,
                refresher,
                inflight: Mutex::new(HashMap::new()),
                inflight_ttl: config.inflight_ttl,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.inner.session
    }

    /// Number of distinct requests currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock_inflight().len()
    }

    /// Issue a request and return the parsed JSON body.
    ///
    /// A request whose canonical key matches one already in flight does not
    /// reach the network; it resolves with the same result.
    pub async fn issue(&self, request: HttpRequest) -> Result<Value, Error> {
        self.issue_cancellable(request, &CancellationToken::new())
            .await
    }

    /// Like [`issue`](Self::issue), but gives up when `cancel` fires.
    ///
    /// The dedup entry is released once every caller waiting on it has
    /// cancelled, so the next identical request goes to the network again.
    pub async fn issue_cancellable(
        &self,
        mut request: HttpRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, Error> {
        request.url = resolve_url(&self.inner.base_url, &request.url);
        let key = canonical_key(&request);
        let (id, result) = self.register(&key, request);

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(%key, "request cancelled");
                self.inner.abandon(&key, id);
                Err(Error::Cancelled)
            }
            outcome = result => outcome,
        }
    }

    /// Issue a request and decode the body into `T`.
    pub async fn issue_json<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T, Error> {
        let value = self.issue(request).await?;
        serde_json::from_value(value).map_err(|e| Error::Decode(e.to_string()))
    }

    pub async fn get(&self, path: &str) -> Result<Value, Error> {
        self.issue(HttpRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, Error> {
        self.issue(HttpRequest::post(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, Error> {
        self.issue(HttpRequest::delete(path)).await
    }

    /// Join an unexpired in-flight entry or start a new one.
    fn register(&self, key: &str, request: HttpRequest) -> (u64, SharedResult) {
        let mut inflight = self.inner.lock_inflight();

        let ttl = self.inner.inflight_ttl;
        inflight.retain(|stale_key, entry| {
            let fresh = entry.issued_at.elapsed() < ttl;
            if !fresh {
                debug!(key = %stale_key, "evicting stale in-flight request");
            }
            fresh
        });

        if let Some(entry) = inflight.get_mut(key) {
            debug!(%key, method = %request.method, url = %request.url, "joining in-flight request");
            entry.waiters += 1;
            return (entry.id, entry.result.clone());
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();
        let result = async move {
            let result = inner.execute(request).await;
            inner.release(&owned_key, id);
            result
        }
        .boxed()
        .shared();

        inflight.insert(
            key.to_string(),
            InFlight {
                id,
                issued_at: Instant::now(),
                waiters: 1,
                result: result.clone(),
            },
        );
        (id, result)
    }
}

impl Inner {
    fn lock_inflight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inflight.lock().unwrap_or_else(|poisoned| {
            warn!("in-flight map lock poisoned, recovering");
            PoisonError::into_inner(poisoned)
        })
    }

    /// Remove `key` only if it still belongs to request `id`; a newer
    /// request may have replaced an evicted entry.
    fn release(&self, key: &str, id: u64) {
        let mut inflight = self.lock_inflight();
        if inflight.get(key).is_some_and(|entry| entry.id == id) {
            inflight.remove(key);
        }
    }

    /// Drop one waiter from request `id`; the last one out releases it.
    fn abandon(&self, key: &str, id: u64) {
        let mut inflight = self.lock_inflight();
        let Some(entry) = inflight.get_mut(key).filter(|entry| entry.id == id) else {
            return;
        };
        entry.waiters = entry.waiters.saturating_sub(1);
        if entry.waiters == 0 {
            debug!(%key, "last waiter cancelled; releasing in-flight entry");
            inflight.remove(key);
        }
    }

    async fn execute(&self, request: HttpRequest) -> Result<Value, Error> {
        let token = self.session.access_token();
        let response = self.send(&request, token.as_deref()).await?;

        if response.status != 401 || !is_refreshable(&response.body) {
            return finish(response);
        }

        // Someone else already rotated the token while this request was
        // out; retry with the current one instead of refreshing again.
        let current = self.session.access_token();
        let recovered = if current.is_some() && current != token {
            debug!(url = %request.url, "access token changed in flight; retrying");
            true
        } else {
            debug!(url = %request.url, "access token rejected; refreshing session");
            self.refresher.refresh().await
        };

        if !recovered {
            self.session.expire();
            return Err(Error::SessionExpired);
        }

        let token = self.session.access_token();
        let retried = self.send(&request, token.as_deref()).await?;
        finish(retried)
    }

    async fn send(&self, request: &HttpRequest, token: Option<&str>) -> Result<HttpResponse, Error> {
        let mut outgoing = request.clone();
        if let Some(token) = token {
            outgoing = outgoing.with_header("authorization", format!("Bearer {token}"));
        }
        Ok(self.transport.send(outgoing).await?)
    }
}

fn finish(response: HttpResponse) -> Result<Value, Error> {
    if response.is_success() {
        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&response.body).map_err(|e| Error::Decode(e.to_string()));
    }

    let err = Error::from_status(response.status, &response.body);
    if let Error::Server(api) = &err {
        warn!(status = api.status, body = %api.body, "server error");
    }
    Err(err)
}

fn resolve_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        path.to_string()
    } else {
        format!("{base_url}{path}")
    }
}
