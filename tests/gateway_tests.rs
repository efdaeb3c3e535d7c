//! End-to-end gateway tests against a mock origin.
//!
//! Uses wiremock for the remote side; the gateway runs its real transport,
//! accounting engine, queue and retry loop.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use apigate::{
    Client, ClientConfig, Credentials, Error, GroupQuotas, Interval, Priority, RequestOptions,
};

fn client_with(config: ClientConfig) -> Client {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    Client::new(config).expect("client construction")
}

/// Config whose "orders" group allows a single request per second, forcing
/// follow-up sends into the deferral path.
fn one_per_second_config(max_deferral_ms: u64) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.max_deferral_ms = max_deferral_ms;
    config.group_quotas.insert(
        "orders".to_string(),
        GroupQuotas {
            second: 1,
            ..GroupQuotas::default()
        },
    );
    config
}

#[tokio::test]
async fn test_happy_path_counts_every_window() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders/42"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let response = client
        .get(
            &format!("{}/api/orders/42", server.uri()),
            RequestOptions::new(),
        )
        .await
        .unwrap();

    assert!(response.is_ok());
    assert!(!response.is_error());

    let stats = client.group_stats("orders").expect("group exists");
    for window in &stats.windows {
        assert_eq!(window.count, 1, "window {:?}", window.interval);
    }
}

#[tokio::test]
async fn test_adaptive_limits_throttle_within_second() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-group", "orders")
                .insert_header("x-ratelimit-limit", "5 5;w=1, 100;w=60"),
        )
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let url = format!("{}/api/orders/1", server.uri());

    client.get(&url, RequestOptions::new()).await.unwrap();

    let stats = client.group_stats("orders").unwrap();
    assert_eq!(stats.window(Interval::Burst).unwrap().quota, 5);
    assert_eq!(stats.window(Interval::Second).unwrap().quota, 5);
    assert_eq!(stats.window(Interval::Minute).unwrap().quota, 100);

    // Four more dispatches exhaust the adopted 5/s allowance.
    for _ in 0..4 {
        client.get(&url, RequestOptions::new()).await.unwrap();
    }

    // The sixth send must wait out most of the second, but stays below the
    // deferral threshold, so it dispatches instead of queueing.
    let started = Instant::now();
    let response = client.get(&url, RequestOptions::new()).await.unwrap();
    assert!(response.is_ok());
    assert!(
        started.elapsed() >= Duration::from_millis(300),
        "sixth send returned after {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_announcement_routes_to_named_group() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-group", "billing")
                .insert_header("x-ratelimit-limit", "7 3;w=1"),
        )
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    client
        .get(
            &format!("{}/api/orders/1", server.uri()),
            RequestOptions::new(),
        )
        .await
        .unwrap();

    // The response named a different group; its quotas land there.
    let billing = client.group_stats("billing").expect("billing group created");
    assert_eq!(billing.window(Interval::Burst).unwrap().quota, 7);
    assert_eq!(billing.window(Interval::Second).unwrap().quota, 3);

    let orders = client.group_stats("orders").unwrap();
    assert_eq!(
        orders.window(Interval::Second).unwrap().quota,
        GroupQuotas::default().second
    );
}

#[tokio::test]
async fn test_deferral_enqueues_instead_of_sleeping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_with(one_per_second_config(500));
    let url = format!("{}/api/orders/9", server.uri());

    // Exhausts the 1/s allowance.
    client.get(&url, RequestOptions::new()).await.unwrap();

    let pending = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.get(&url, RequestOptions::new()).await }
    });

    // The follow-up must be parked, not slept: its future stays unresolved
    // while the queue holds it.
    let mut parked = false;
    for _ in 0..25 {
        if client.stats().queued_normal == 1 {
            parked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(parked, "request never reached the retry queue");
    assert!(!pending.is_finished());

    // After the window resets, the pump dispatches it.
    let response = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("queued request should resolve")
        .unwrap()
        .unwrap();
    assert!(response.is_ok());
    assert_eq!(client.stats().queued_normal, 0);
}

#[tokio::test]
async fn test_429_retries_after_server_mandated_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let started = Instant::now();
    let response = client
        .get(
            &format!("{}/api/orders/3", server.uri()),
            RequestOptions::new(),
        )
        .await
        .unwrap();

    assert!(response.is_ok());
    assert!(
        started.elapsed() >= Duration::from_millis(900),
        "retry ignored the mandated wait: {:?}",
        started.elapsed()
    );
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_rate_limited_surfaces_when_retries_disabled() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let err = client
        .get(
            &format!("{}/api/orders/3", server.uri()),
            RequestOptions::new().max_retries(0),
        )
        .await
        .unwrap_err();

    match err {
        Error::RateLimited {
            group,
            retry_after_ms,
        } => {
            assert_eq!(group, "orders");
            assert_eq!(retry_after_ms, 7_000);
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn test_retries_exhausted_carries_last_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let err = client
        .get(
            &format!("{}/api/orders/3", server.uri()),
            RequestOptions::new().max_retries(1),
        )
        .await
        .unwrap_err();

    match err {
        Error::RetriesExhausted { retries, last } => {
            assert_eq!(retries, 1);
            assert_eq!(last.status().as_u16(), 503);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_redirects_followed_to_completion() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders/old"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/api/orders/new"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders/new"))
        .respond_with(ResponseTemplate::new(200).set_body_string("moved"))
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let response = client
        .get(
            &format!("{}/api/orders/old", server.uri()),
            RequestOptions::new(),
        )
        .await
        .unwrap();

    assert!(response.is_ok());
    assert_eq!(response.text(), "moved");
    assert_eq!(response.url().path(), "/api/orders/new");
}

#[tokio::test]
async fn test_redirect_budget_exhausted() {
    let server = MockServer::start().await;
    for hop in 0..4 {
        Mock::given(method("GET"))
            .and(path(format!("/api/hop/{hop}")))
            .respond_with(
                ResponseTemplate::new(302)
                    .insert_header("location", format!("/api/hop/{}", hop + 1)),
            )
            .mount(&server)
            .await;
    }

    let client = client_with(ClientConfig::default());
    let err = client
        .get(
            &format!("{}/api/hop/0", server.uri()),
            RequestOptions::new().max_redirects(3),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RedirectsExhausted(3)));
}

#[tokio::test]
async fn test_self_redirect_detected_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/loop/1"))
        .respond_with(
            ResponseTemplate::new(302).insert_header("location", "/api/loop/1?attempt=2"),
        )
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let err = client
        .get(
            &format!("{}/api/loop/1", server.uri()),
            RequestOptions::new(),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RedirectLoop(_)));
    // Detected on the first response; no second exchange happened.
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_priority_ordering_in_pump() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/orders/warm"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_with(one_per_second_config(100));
    let base = server.uri();

    // The warm request eats a 429 whose mandated wait parks the whole group;
    // everything sent during the penalty defers to the queue.
    let warm = tokio::spawn({
        let client = client.clone();
        let url = format!("{base}/api/orders/warm");
        async move { client.get(&url, RequestOptions::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut pending = Vec::new();
    for (suffix, priority) in [
        ("low", Priority::Low),
        ("normal", Priority::Normal),
        ("high", Priority::High),
    ] {
        pending.push(tokio::spawn({
            let client = client.clone();
            let url = format!("{base}/api/orders/{suffix}");
            async move {
                client
                    .get(&url, RequestOptions::new().priority(priority))
                    .await
            }
        }));
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    for handle in pending {
        let response = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("queued request should resolve")
            .unwrap()
            .unwrap();
        assert!(response.is_ok());
    }
    let _ = tokio::time::timeout(Duration::from_secs(10), warm).await;

    let order: Vec<String> = server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.url.path().to_string())
        .filter(|p| !p.ends_with("/warm"))
        .collect();
    assert_eq!(
        order,
        vec![
            "/api/orders/high".to_string(),
            "/api/orders/normal".to_string(),
            "/api/orders/low".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_backpressure_when_tier_full() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = one_per_second_config(500);
    config.queue_capacity = 1;
    let client = client_with(config);
    let url = format!("{}/api/orders/9", server.uri());

    client.get(&url, RequestOptions::new()).await.unwrap();

    // First follow-up occupies the single queue slot.
    let parked = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        async move { client.get(&url, RequestOptions::new()).await }
    });
    let mut queued = false;
    for _ in 0..25 {
        if client.stats().queued_normal == 1 {
            queued = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(queued);

    // The second one finds the tier full and is rejected immediately.
    let err = client.get(&url, RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, Error::Backpressure(Priority::Normal)));

    let _ = tokio::time::timeout(Duration::from_secs(5), parked).await;
}

#[tokio::test]
async fn test_cancellation_during_admission_sleep() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_with(one_per_second_config(5_000));
    let url = format!("{}/api/orders/9", server.uri());

    client.get(&url, RequestOptions::new()).await.unwrap();

    // The follow-up sleeps out the window (~1s); cancel it mid-sleep.
    let token = CancellationToken::new();
    let pending = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        let options = RequestOptions::new().abort(token.clone());
        async move { client.get(&url, options).await }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    token.cancel();

    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("cancellation should settle promptly")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn test_cancellation_while_queued() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = client_with(one_per_second_config(100));
    let url = format!("{}/api/orders/9", server.uri());

    client.get(&url, RequestOptions::new()).await.unwrap();

    let token = CancellationToken::new();
    let pending = tokio::spawn({
        let client = client.clone();
        let url = url.clone();
        let options = RequestOptions::new().abort(token.clone());
        async move { client.get(&url, options).await }
    });

    let mut queued = false;
    for _ in 0..25 {
        if client.stats().queued_normal == 1 {
            queued = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(queued);

    token.cancel();
    let err = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("cancellation should settle promptly")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(client.stats().queued_normal, 0);
}

#[tokio::test]
async fn test_baseline_headers_and_credentials_attached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("x-app", "gateway-tests"))
        .and(header("x-api-key", "k-123"))
        .and(header("authorization", "Bearer t-456"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let mut config = ClientConfig::default();
    config
        .headers
        .insert("x-app".to_string(), "gateway-tests".to_string());
    config.credentials = Some(Credentials {
        api_key: Some("k-123".to_string()),
        access_token: Some("t-456".to_string()),
        tenant_id: None,
    });

    let client = client_with(config);
    let response = client
        .post(
            &format!("{}/api/orders", server.uri()),
            RequestOptions::new(),
            serde_json::json!({"sku": "a-1", "qty": 2}),
        )
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
}

#[tokio::test]
async fn test_plain_client_errors_complete_normally() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
        .mount(&server)
        .await;

    let client = client_with(ClientConfig::default());
    let response = client
        .get(
            &format!("{}/api/orders/nope", server.uri()),
            RequestOptions::new(),
        )
        .await
        .unwrap();

    // Not retryable, not an error at the gateway boundary.
    assert_eq!(response.status().as_u16(), 404);
    assert!(response.is_error());
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unparseable_url_rejected() {
    let client = client_with(ClientConfig::default());
    let err = client
        .get("not a url", RequestOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}
