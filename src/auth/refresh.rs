//! Single-flight session refresh.

use super::{Session, SessionContext};
use crate::gateway::{HttpRequest, Transport};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

type RefreshFuture = Shared<BoxFuture<'static, bool>>;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Exchanges the refresh token for a new access token.
///
/// Concurrent callers share one underlying request and all observe its
/// result. On failure the session is left untouched; logging out is the
/// caller's decision.
pub struct SessionRefresher {
    session: Arc<SessionContext>,
    transport: Arc<dyn Transport>,
    refresh_url: String,
    in_flight: Arc<Mutex<Option<RefreshFuture>>>,
}

impl SessionRefresher {
    pub fn new(
        session: Arc<SessionContext>,
        transport: Arc<dyn Transport>,
        refresh_url: impl Into<String>,
    ) -> Self {
        Self {
            session,
            transport,
            refresh_url: refresh_url.into(),
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Refresh the session. Returns true when new tokens were stored.
    pub async fn refresh(&self) -> bool {
        let shared = {
            let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = slot.as_ref() {
                debug!("joining in-flight session refresh");
                existing.clone()
            } else {
                let session = Arc::clone(&self.session);
                let transport = Arc::clone(&self.transport);
                let url = self.refresh_url.clone();
                let in_flight = Arc::clone(&self.in_flight);

                let fut = async move {
                    let refreshed = perform_refresh(&session, transport.as_ref(), &url).await;
                    *in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    refreshed
                }
                .boxed()
                .shared();
                *slot = Some(fut.clone());
                fut
            }
        };

        shared.await
    }
}

async fn perform_refresh(session: &SessionContext, transport: &dyn Transport, url: &str) -> bool {
    let Some(refresh_token) = session.refresh_token() else {
        warn!("session refresh skipped: no refresh token");
        return false;
    };

    let request = HttpRequest::post(url, json!({ "refresh_token": refresh_token }));
    let response = match transport.send(request).await {
        Ok(response) => response,
        Err(e) => {
            warn!("session refresh failed: {}", e);
            return false;
        }
    };

    if !response.is_success() {
        warn!(status = response.status, "session refresh rejected");
        return false;
    }

    let tokens: TokenResponse = match serde_json::from_str(&response.body) {
        Ok(tokens) => tokens,
        Err(e) => {
            warn!("session refresh returned malformed body: {}", e);
            return false;
        }
    };

    // Keep the old refresh token if the server doesn't rotate it.
    let mut next = Session::new(
        tokens.access_token,
        tokens.refresh_token.or(Some(refresh_token)),
    );
    if let Some(secs) = tokens.expires_in {
        next = next.expires_in(secs);
    }

    match session.replace_tokens(next) {
        Ok(()) => {
            info!("session refreshed");
            true
        }
        Err(e) => {
            warn!("Failed to persist refreshed session: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::HttpResponse;
    use crate::gateway::testing::ScriptedTransport;
    use std::time::Duration;

    fn refresher(transport: Arc<ScriptedTransport>, session: Arc<SessionContext>) -> SessionRefresher {
        SessionRefresher::new(session, transport, "https://api.test/api/auth/refresh")
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_request() {
        let transport = Arc::new(
            ScriptedTransport::new(|_| {
                Ok(HttpResponse::new(200, r#"{"access_token":"new","refresh_token":"r2"}"#))
            })
            .with_latency(Duration::from_millis(50)),
        );
        let session = Arc::new(SessionContext::in_memory());
        session.login(Session::new("old", Some("r1".into()))).unwrap();
        let refresher = refresher(Arc::clone(&transport), Arc::clone(&session));

        let results = futures::future::join_all((0..5).map(|_| refresher.refresh())).await;

        assert!(results.iter().all(|ok| *ok));
        assert_eq!(transport.call_count(), 1);
        assert_eq!(session.access_token().as_deref(), Some("new"));
        assert_eq!(session.refresh_token().as_deref(), Some("r2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_refreshes_each_hit_the_server() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(HttpResponse::new(200, r#"{"access_token":"new"}"#))
        }));
        let session = Arc::new(SessionContext::in_memory());
        session.login(Session::new("old", Some("r1".into()))).unwrap();
        let refresher = refresher(Arc::clone(&transport), Arc::clone(&session));

        assert!(refresher.refresh().await);
        assert!(refresher.refresh().await);
        assert_eq!(transport.call_count(), 2);
    }

    #[tokio::test]
    async fn test_refresh_keeps_refresh_token_when_not_rotated() {
        let transport = Arc::new(ScriptedTransport::new(|request| {
            assert_eq!(request.body.as_ref().unwrap()["refresh_token"], "r1");
            Ok(HttpResponse::new(200, r#"{"access_token":"new","expires_in":3600}"#))
        }));
        let session = Arc::new(SessionContext::in_memory());
        session.login(Session::new("old", Some("r1".into()))).unwrap();

        assert!(refresher(transport, Arc::clone(&session)).refresh().await);
        let current = session.current().unwrap();
        assert_eq!(current.access_token, "new");
        assert_eq!(current.refresh_token.as_deref(), Some("r1"));
        assert!(current.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_session_untouched() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(HttpResponse::new(401, r#"{"detail":"refresh token revoked"}"#))
        }));
        let session = Arc::new(SessionContext::in_memory());
        session.login(Session::new("old", Some("r1".into()))).unwrap();

        assert!(!refresher(transport, Arc::clone(&session)).refresh().await);
        assert_eq!(session.access_token().as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(HttpResponse::new(200, r#"{"access_token":"new"}"#))
        }));
        let session = Arc::new(SessionContext::in_memory());
        session.login(Session::new("old", None)).unwrap();

        assert!(!refresher(Arc::clone(&transport), session).refresh().await);
        assert_eq!(transport.call_count(), 0);
    }
}
