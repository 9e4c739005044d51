//! Tests for the request gateway.

use super::testing::{ScriptedTransport, json_response};
use super::*;
use crate::auth::Session;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};

const BASE: &str = "https://api.test";

fn gateway(transport: &Arc<ScriptedTransport>, session: &Arc<SessionContext>) -> RequestGateway {
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    RequestGateway::new(
        GatewayConfig {
            base_url: BASE.to_string(),
            ..Default::default()
        },
        transport,
        Arc::clone(session),
    )
}

fn logged_in(access: &str) -> Arc<SessionContext> {
    let session = Arc::new(SessionContext::in_memory());
    session
        .login(Session::new(access, Some("refresh-1".into())))
        .unwrap();
    session
}

/// Backend that rejects `old` with a refreshable 401 and accepts `new`.
fn rotating_backend(latency: Duration) -> Arc<ScriptedTransport> {
    Arc::new(
        ScriptedTransport::new(|request| {
            if request.url.ends_with("/api/auth/refresh") {
                return json_response(200, &json!({"access_token": "new"}));
            }
            match request.bearer_token() {
                Some("new") => json_response(200, &json!({"url": request.url})),
                _ => json_response(401, &json!({"detail": "Token expired"})),
            }
        })
        .with_latency(latency),
    )
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_identical_requests_share_one_call() {
    let transport = Arc::new(
        ScriptedTransport::new(|_| json_response(200, &json!({"chats": []})))
            .with_latency(Duration::from_millis(100)),
    );
    let gw = gateway(&transport, &logged_in("t"));

    let results =
        futures::future::join_all((0..4).map(|_| gw.get("/api/chats/"))).await;

    assert_eq!(transport.call_count(), 1);
    for result in results {
        assert_eq!(result.unwrap(), json!({"chats": []}));
    }
    assert_eq!(gw.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_calls_within_window_issue_one_request() {
    let transport = Arc::new(
        ScriptedTransport::new(|_| json_response(200, &json!([])))
            .with_latency(Duration::from_millis(800)),
    );
    let gw = gateway(&transport, &logged_in("t"));

    let first = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.get("/api/chats/").await })
    };
    tokio::time::sleep(Duration::from_millis(500)).await;
    let second = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.get("/api/chats/").await })
    };

    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_different_bodies_are_not_merged() {
    let transport = Arc::new(
        ScriptedTransport::new(|request| json_response(200, request.body.as_ref().unwrap()))
            .with_latency(Duration::from_millis(50)),
    );
    let gw = gateway(&transport, &logged_in("t"));

    let (a, b) = tokio::join!(
        gw.post("/api/chat", json!({"message": "a"})),
        gw.post("/api/chat", json!({"message": "b"})),
    );

    assert_eq!(transport.call_count(), 2);
    assert_eq!(a.unwrap()["message"], "a");
    assert_eq!(b.unwrap()["message"], "b");
}

#[tokio::test]
async fn test_completed_request_releases_entry() {
    let transport = Arc::new(ScriptedTransport::new(|_| json_response(200, &json!({}))));
    let gw = gateway(&transport, &logged_in("t"));

    gw.get("/api/chats/").await.unwrap();
    assert_eq!(gw.in_flight(), 0);
    gw.get("/api/chats/").await.unwrap();
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stale_entry_is_evicted_after_ttl() {
    let transport = Arc::new(
        ScriptedTransport::new(|_| json_response(200, &json!({})))
            .with_latency(Duration::from_secs(60)),
    );
    let gw = gateway(&transport, &logged_in("t"));

    let first = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.get("/api/slow").await })
    };
    tokio::time::sleep(Duration::from_secs(31)).await;
    let second = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.get("/api/slow").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(transport.call_count(), 2);
    assert!(first.await.unwrap().is_ok());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(gw.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_call_releases_entry() {
    let transport = Arc::new(
        ScriptedTransport::new(|_| json_response(200, &json!({})))
            .with_latency(Duration::from_secs(10)),
    );
    let gw = gateway(&transport, &logged_in("t"));
    let cancel = CancellationToken::new();

    let pending = {
        let gw = gw.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            gw.issue_cancellable(HttpRequest::get("/api/slow"), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gw.in_flight(), 1);

    cancel.cancel();
    assert!(matches!(pending.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(gw.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_joiner_keeps_entry_for_owner() {
    let transport = Arc::new(
        ScriptedTransport::new(|_| json_response(200, &json!({"chats": []})))
            .with_latency(Duration::from_secs(10)),
    );
    let gw = gateway(&transport, &logged_in("t"));

    let owner = {
        let gw = gw.clone();
        tokio::spawn(async move { gw.get("/api/chats/").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let joiner = {
        let gw = gw.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            gw.issue_cancellable(HttpRequest::get("/api/chats/"), &cancel)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    assert!(matches!(joiner.await.unwrap(), Err(Error::Cancelled)));
    assert_eq!(gw.in_flight(), 1);

    let third = gw.get("/api/chats/").await.unwrap();
    assert_eq!(third, json!({"chats": []}));
    assert_eq!(owner.await.unwrap().unwrap(), json!({"chats": []}));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_entry_released_when_every_waiter_cancels() {
    let transport = Arc::new(
        ScriptedTransport::new(|_| json_response(200, &json!({})))
            .with_latency(Duration::from_secs(10)),
    );
    let gw = gateway(&transport, &logged_in("t"));
    let cancel = CancellationToken::new();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let gw = gw.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                gw.issue_cancellable(HttpRequest::get("/api/slow"), &cancel)
                    .await
            })
        })
        .collect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(gw.in_flight(), 1);

    cancel.cancel();
    for waiter in waiters {
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
    }
    assert_eq!(gw.in_flight(), 0);
}

#[tokio::test]
async fn test_bearer_token_attached() {
    let transport = Arc::new(ScriptedTransport::new(|_| json_response(200, &json!({}))));
    let gw = gateway(&transport, &logged_in("abc"));

    gw.get("/api/me").await.unwrap();

    let calls = transport.calls();
    assert_eq!(calls[0].url, "https://api.test/api/me");
    assert_eq!(calls[0].bearer_token(), Some("abc"));
}

#[tokio::test]
async fn test_no_bearer_without_session() {
    let transport = Arc::new(ScriptedTransport::new(|_| json_response(200, &json!({}))));
    let gw = gateway(&transport, &Arc::new(SessionContext::in_memory()));

    gw.get("/api/public").await.unwrap();
    assert!(transport.calls()[0].header("authorization").is_none());
}

#[tokio::test]
async fn test_expired_token_refreshed_and_retried() {
    let transport = rotating_backend(Duration::ZERO);
    let session = logged_in("old");
    let gw = gateway(&transport, &session);

    let body = gw.get("/api/chats/").await.unwrap();

    assert_eq!(body["url"], "https://api.test/api/chats/");
    assert_eq!(transport.calls_to("/api/auth/refresh"), 1);
    assert_eq!(transport.calls_to("/api/chats/"), 2);
    assert_eq!(session.access_token().as_deref(), Some("new"));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_expired_tokens_refresh_once() {
    let transport = rotating_backend(Duration::from_millis(20));
    let session = logged_in("old");
    let gw = gateway(&transport, &session);

    let paths: Vec<String> = (0..5).map(|i| format!("/api/items/{i}")).collect();
    let results = futures::future::join_all(paths.iter().map(|p| gw.get(p))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.calls_to("/api/auth/refresh"), 1);
}

#[tokio::test]
async fn test_permission_401_surfaces_without_refresh() {
    let transport = Arc::new(ScriptedTransport::new(|_| {
        json_response(401, &json!({"detail": "insufficient permission"}))
    }));
    let session = logged_in("t");
    let gw = gateway(&transport, &session);

    let err = gw.get("/api/admin").await.unwrap_err();

    assert!(matches!(err, Error::AuthRejected(ref api) if api.status == 401));
    assert_eq!(err.user_message(), "insufficient permission");
    assert_eq!(transport.calls_to("/api/auth/refresh"), 0);
    assert_eq!(session.access_token().as_deref(), Some("t"));
}

#[tokio::test]
async fn test_forbidden_does_not_log_out() {
    let transport = Arc::new(ScriptedTransport::new(|_| {
        json_response(403, &json!({"detail": "invalid scope for this workspace"}))
    }));
    let session = logged_in("t");
    let gw = gateway(&transport, &session);

    assert!(matches!(gw.get("/api/x").await, Err(Error::AuthRejected(_))));
    assert!(session.is_logged_in());
    assert_eq!(transport.calls_to("/api/auth/refresh"), 0);
}

#[tokio::test]
async fn test_failed_refresh_expires_session() {
    let transport = Arc::new(ScriptedTransport::new(|request| {
        if request.url.ends_with("/api/auth/refresh") {
            return json_response(401, &json!({"detail": "refresh token revoked"}));
        }
        json_response(401, &json!({"detail": "Token expired"}))
    }));
    let session = logged_in("old");
    let expired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&expired);
    session.on_expired(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let gw = gateway(&transport, &session);

    let err = gw.get("/api/chats/").await.unwrap_err();

    assert!(matches!(err, Error::SessionExpired));
    assert!(!session.is_logged_in());
    assert_eq!(expired.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retry_happens_at_most_once() {
    // Refresh "succeeds" but the backend keeps rejecting the new token.
    let transport = Arc::new(ScriptedTransport::new(|request| {
        if request.url.ends_with("/api/auth/refresh") {
            return json_response(200, &json!({"access_token": "new"}));
        }
        json_response(401, &json!({"detail": "Token expired"}))
    }));
    let gw = gateway(&transport, &logged_in("old"));

    let err = gw.get("/api/chats/").await.unwrap_err();

    assert!(matches!(err, Error::AuthRejected(_)));
    assert_eq!(transport.calls_to("/api/chats/"), 2);
    assert_eq!(transport.calls_to("/api/auth/refresh"), 1);
}

#[tokio::test]
async fn test_error_bodies_normalized() {
    let transport = Arc::new(ScriptedTransport::new(|request| {
        if request.url.ends_with("/object") {
            json_response(422, &json!({"detail": [{"msg": "title required"}], "code": 7}))
        } else if request.url.ends_with("/text") {
            Ok(HttpResponse::new(400, "bad things"))
        } else {
            Ok(HttpResponse::new(500, ""))
        }
    }));
    let gw = gateway(&transport, &logged_in("t"));

    let err = gw.get("/object").await.unwrap_err();
    let Error::Validation(api) = &err else {
        panic!("expected validation error, got {err:?}");
    };
    assert_eq!(api.body["code"], 7);

    let err = gw.get("/text").await.unwrap_err();
    assert_eq!(
        err.api_error().unwrap().body,
        json!({"detail": [{"msg": "bad things"}]})
    );

    let err = gw.get("/empty").await.unwrap_err();
    assert!(matches!(err, Error::Server(_)));
    assert_eq!(
        err.api_error().unwrap().body,
        json!({"detail": [{"msg": "Internal Server Error"}]})
    );
}

#[tokio::test]
async fn test_network_error_surfaces() {
    let transport = Arc::new(ScriptedTransport::new(|_| {
        Err(TransportError::Connect("refused".into()))
    }));
    let gw = gateway(&transport, &logged_in("t"));

    assert!(matches!(gw.get("/api/x").await, Err(Error::Network(_))));
    assert_eq!(gw.in_flight(), 0);
}

#[tokio::test]
async fn test_empty_success_body_is_null() {
    let transport = Arc::new(ScriptedTransport::new(|_| Ok(HttpResponse::new(204, ""))));
    let gw = gateway(&transport, &logged_in("t"));

    assert_eq!(gw.delete("/api/chats/c1").await.unwrap(), Value::Null);
}

#[tokio::test]
async fn test_issue_json_decodes() {
    #[derive(Debug, serde::Deserialize)]
    struct Chat {
        id: String,
    }

    let transport = Arc::new(ScriptedTransport::new(|_| json_response(200, &json!({"id": "c1"}))));
    let gw = gateway(&transport, &logged_in("t"));

    let chat: Chat = gw.issue_json(HttpRequest::get("/api/chats/c1")).await.unwrap();
    assert_eq!(chat.id, "c1");

    let err = gw
        .issue_json::<Vec<Chat>>(HttpRequest::get("/api/chats/c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
}
