use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::routing::get;
use axum::Router;
use http::header::{AUTHORIZATION, RETRY_AFTER};
use http::{HeaderMap, Request, Response, StatusCode};
use tower::{service_fn, ServiceBuilder, ServiceExt};
use turnstile::server::{router, SUCCESS_BODY};
use turnstile::{
    ClientIdentity, Config, KeyedTokenBucket, ManualClock, Policy, PolicyTable, RateLimitLayer,
};

fn id(raw: &str) -> ClientIdentity {
    ClientIdentity::new(raw).unwrap()
}

fn policies() -> PolicyTable {
    PolicyTable::new(Policy::new(5, 1.0).unwrap())
        .with_override(id("1"), Policy::new(5, 0.5).unwrap())
        .with_override(id("2"), Policy::new(5, 1.0).unwrap())
}

fn app(clock: &ManualClock) -> Router {
    router(Arc::new(KeyedTokenBucket::new(policies()).with_clock(clock.clone())))
}

struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: String,
}

async fn send(app: &Router, path: &str, auth: Option<&str>) -> Reply {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(auth) = auth {
        builder = builder.header(AUTHORIZATION, auth);
    }
    let response = app.clone().oneshot(builder.body(Body::empty()).unwrap()).await.unwrap();
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

async fn get_foo(app: &Router, client: &str) -> Reply {
    send(app, "/foo", Some(&format!("Bearer {client}"))).await
}

async fn exhaust(app: &Router, client: &str) {
    for i in 0..5 {
        let reply = get_foo(app, client).await;
        assert_eq!(reply.status, StatusCode::OK, "request {i} for client {client}");
        assert_eq!(reply.body, SUCCESS_BODY);
    }
}

#[tokio::test]
async fn five_requests_pass_then_sixth_is_rejected() {
    let clock = ManualClock::new();
    let app = app(&clock);

    exhaust(&app, "2").await;

    let reply = get_foo(&app, "2").await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(reply.body.contains("rate limit exceeded"), "body was {:?}", reply.body);
    assert_eq!(reply.headers[RETRY_AFTER], "1");
}

#[tokio::test]
async fn one_second_refills_one_token_at_one_per_second() {
    let clock = ManualClock::new();
    let app = app(&clock);

    exhaust(&app, "2").await;
    assert_eq!(get_foo(&app, "2").await.status, StatusCode::TOO_MANY_REQUESTS);

    clock.advance(Duration::from_secs(1));
    let reply = get_foo(&app, "2").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, SUCCESS_BODY);
    assert_eq!(get_foo(&app, "2").await.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn exhausting_one_client_leaves_others_untouched() {
    let clock = ManualClock::new();
    let app = app(&clock);

    exhaust(&app, "2").await;
    for _ in 0..2 {
        let reply = get_foo(&app, "1").await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, SUCCESS_BODY);
    }
}

#[tokio::test]
async fn half_token_rate_admits_one_request_after_two_seconds() {
    let clock = ManualClock::new();
    let app = app(&clock);

    exhaust(&app, "1").await;
    clock.advance(Duration::from_secs(2));

    assert_eq!(get_foo(&app, "1").await.status, StatusCode::OK);
    let reply = get_foo(&app, "1").await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    // One whole token at 0.5/s is two seconds away.
    assert_eq!(reply.headers[RETRY_AFTER], "2");
}

#[tokio::test]
async fn unknown_client_starts_with_a_full_default_bucket() {
    let clock = ManualClock::new();
    let app = app(&clock);

    for _ in 0..5 {
        assert_eq!(get_foo(&app, "never-seen-before").await.status, StatusCode::OK);
    }
    assert_eq!(get_foo(&app, "never-seen-before").await.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn long_idle_period_refills_only_to_capacity() {
    let clock = ManualClock::new();
    let app = app(&clock);

    exhaust(&app, "2").await;
    clock.advance(Duration::from_secs(3600));
    exhaust(&app, "2").await;
    assert_eq!(get_foo(&app, "2").await.status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn missing_or_foreign_credentials_are_unauthorized() {
    let clock = ManualClock::new();
    let app = app(&clock);

    for auth in [None, Some("Basic Zm9vOmJhcg=="), Some("Bearer ")] {
        let reply = send(&app, "/foo", auth).await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED, "auth {auth:?}");
        assert!(reply.body.contains("unauthorized"));
    }
}

#[tokio::test]
async fn unknown_routes_are_not_rate_limited() {
    let clock = ManualClock::new();
    let app = app(&clock);

    exhaust(&app, "2").await;
    let reply = send(&app, "/bar", Some("Bearer 2")).await;
    assert_eq!(reply.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn denied_requests_never_reach_the_endpoint() {
    let clock = ManualClock::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let limiter = KeyedTokenBucket::new(PolicyTable::new(Policy::new(2, 1.0).unwrap()))
        .with_clock(clock.clone());
    let app = Router::new()
        .route(
            "/foo",
            get({
                let hits = hits.clone();
                move || {
                    hits.fetch_add(1, Ordering::SeqCst);
                    async { SUCCESS_BODY }
                }
            }),
        )
        .route_layer(RateLimitLayer::new(limiter));

    for _ in 0..10 {
        let _ = get_foo(&app, "9").await;
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn layer_wraps_plain_tower_services() {
    let clock = ManualClock::new();
    let limiter = KeyedTokenBucket::new(PolicyTable::new(Policy::new(1, 1.0).unwrap()))
        .with_clock(clock.clone());
    let svc = ServiceBuilder::new().layer(RateLimitLayer::new(limiter)).service(service_fn(
        |_req: Request<Body>| async { Ok::<_, Infallible>(Response::new(Body::from("inner"))) },
    ));

    let request =
        || Request::builder().header(AUTHORIZATION, "Bearer x").body(Body::empty()).unwrap();

    let first = svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let body = axum::body::to_bytes(first.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"inner");

    let second = svc.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn vanishing_refill_rate_still_answers_429() {
    let config = Config::from_toml_str(
        r#"
        [[clients]]
        id = "2"
        capacity = 1
        refill_rate = 1e-20
        "#,
    )
    .unwrap();
    let limiter = KeyedTokenBucket::new(config.policy_resolver()).with_clock(ManualClock::new());
    let app = router(Arc::new(limiter));

    assert_eq!(get_foo(&app, "2").await.status, StatusCode::OK);
    let reply = get_foo(&app, "2").await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(reply.body.contains("rate limit exceeded"));
    assert_eq!(reply.headers[RETRY_AFTER], u64::MAX.to_string().as_str());
}
