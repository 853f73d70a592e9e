//! Metering of billable calls: budgets, rate limits and the response cache.

mod common;

use axum::http::{header::RETRY_AFTER, Method, StatusCode};
use common::{configured, ready_state, send, send_admin, send_as, ADMIN_KEY, TENANT, USER};
use orchestration_service::build_router;
use orchestration_service::models::{ServiceKind, UsageOutcome};
use orchestration_service::services::clients::mock::MockClientFactory;
use orchestration_service::services::clients::ClientError;
use orchestration_service::startup::Backends;
use serde_json::json;
use std::time::Duration;

const USER_BUDGET: &str = "/api/v1/admin/tenants/tenant-a/budgets/user-1";

const SEARCH: &str = "/api/v1/recipes/search";

#[tokio::test]
async fn exhausted_service_budget_refuses_before_calling_upstream() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config
        .budget
        .service_budgets_usd
        .insert(ServiceKind::Nutrition, 0.0);
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    let response = send(&router, Method::POST, SEARCH, Some(json!({ "query": "pasta" }))).await;

    assert_eq!(response.status, StatusCode::PAYMENT_REQUIRED);
    assert!(response.headers.contains_key(RETRY_AFTER));
    assert!(response.body["error"]
        .as_str()
        .unwrap()
        .starts_with("Budget exceeded"));
    assert_eq!(factory.nutrition.behavior.calls(), 0);
    assert_eq!(state.cost_tracker.total_usage_records(), 0);
}

#[tokio::test]
async fn concurrent_identical_searches_share_one_upstream_call() {
    let factory = MockClientFactory::new();
    factory
        .nutrition
        .behavior
        .set_latency(Duration::from_millis(50));
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    let body = json!({ "query": "lentil soup", "number": 5 });
    let (first, second) = tokio::join!(
        send(&router, Method::POST, SEARCH, Some(body.clone())),
        send(&router, Method::POST, SEARCH, Some(body.clone())),
    );

    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(first.body["results"], second.body["results"]);

    let cached: Vec<bool> = [&first, &second]
        .iter()
        .map(|r| r.body["cached"].as_bool().unwrap())
        .collect();
    assert_eq!(cached.iter().filter(|hit| **hit).count(), 1);

    assert_eq!(factory.nutrition.behavior.calls(), 1);
    assert_eq!(state.cost_tracker.usage_records(TENANT, USER).len(), 1);
    assert_eq!(state.recipe_cache.stats().hits, 1);
}

#[tokio::test]
async fn rate_limit_refuses_new_calls_but_cache_hits_still_serve() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config.services.nutrition.requests_per_minute = 1;
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state);

    let pasta = json!({ "query": "pasta" });
    let first = send(&router, Method::POST, SEARCH, Some(pasta.clone())).await;
    assert_eq!(first.status, StatusCode::OK);

    let other = send(&router, Method::POST, SEARCH, Some(json!({ "query": "salad" }))).await;
    assert_eq!(other.status, StatusCode::TOO_MANY_REQUESTS);
    assert!(other.headers.contains_key(RETRY_AFTER));

    let again = send(&router, Method::POST, SEARCH, Some(pasta)).await;
    assert_eq!(again.status, StatusCode::OK);
    assert_eq!(again.body["cached"], true);
    assert_eq!(factory.nutrition.behavior.calls(), 1);
}

#[tokio::test]
async fn failed_upstream_call_is_billed_and_reported_as_bad_gateway() {
    let factory = MockClientFactory::new();
    factory.nutrition.behavior.fail_with(Some(ClientError::Api {
        status: 500,
        message: "upstream exploded".to_string(),
    }));
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    let response = send(&router, Method::POST, SEARCH, Some(json!({ "query": "stew" }))).await;

    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    let usage = state.cost_tracker.usage_records(TENANT, USER);
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].outcome, UsageOutcome::Failed);
    assert!((usage[0].cost_usd - 0.002).abs() < 1e-9);
    assert!(state.recipe_cache.is_empty());
}

#[tokio::test]
async fn budget_status_reflects_recorded_spend() {
    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state);

    send(&router, Method::POST, SEARCH, Some(json!({ "query": "curry" }))).await;
    let status = send(&router, Method::GET, "/api/v1/budget", None).await;

    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["user_id"], USER);
    assert!((status.body["spent_usd"].as_f64().unwrap() - 0.002).abs() < 1e-9);
    assert_eq!(status.body["total_budget_usd"], 50.0);
}

#[tokio::test]
async fn budget_override_and_reset() {
    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    send(&router, Method::POST, SEARCH, Some(json!({ "query": "curry" }))).await;

    let updated = send_admin(
        &router,
        ADMIN_KEY,
        Method::PUT,
        USER_BUDGET,
        Some(json!({ "monthly_budget_usd": 5.0, "service_budgets_usd": { "nutrition": 1.0 } })),
    )
    .await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.body["total_budget_usd"], 5.0);
    assert!((updated.body["spent_usd"].as_f64().unwrap() - 0.002).abs() < 1e-9);

    let reset = send_admin(
        &router,
        ADMIN_KEY,
        Method::POST,
        &format!("{}/reset", USER_BUDGET),
        None,
    )
    .await;
    assert_eq!(reset.status, StatusCode::OK);
    assert_eq!(reset.body["spent_usd"], 0.0);
    assert_eq!(reset.body["total_budget_usd"], 5.0);
    assert_eq!(state.cost_tracker.usage_records(TENANT, USER).len(), 1);

    let rollover = send_admin(&router, ADMIN_KEY, Method::POST, "/api/v1/admin/budgets/reset", None).await;
    assert_eq!(rollover.status, StatusCode::OK);
    assert_eq!(rollover.body["ledgers_reset"], 1);
}

#[tokio::test]
async fn negative_budget_override_is_rejected() {
    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;
    let router = build_router(state);

    let response = send_admin(
        &router,
        ADMIN_KEY,
        Method::PUT,
        USER_BUDGET,
        Some(json!({ "monthly_budget_usd": -1.0 })),
    )
    .await;

    assert_eq!(response.status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn callers_cannot_raise_or_reset_their_own_budget() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config.budget.monthly_budget_usd = 0.002;
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state);

    send(&router, Method::POST, SEARCH, Some(json!({ "query": "a" }))).await;
    let exhausted = send(&router, Method::POST, SEARCH, Some(json!({ "query": "b" }))).await;
    assert_eq!(exhausted.status, StatusCode::PAYMENT_REQUIRED);

    let raise = json!({ "monthly_budget_usd": 1_000_000.0 });
    let as_caller = send(&router, Method::PUT, USER_BUDGET, Some(raise.clone())).await;
    assert_eq!(as_caller.status, StatusCode::FORBIDDEN);

    let wrong_key = send_admin(&router, "guess", Method::PUT, USER_BUDGET, Some(raise)).await;
    assert_eq!(wrong_key.status, StatusCode::FORBIDDEN);

    let reset = send(&router, Method::POST, &format!("{}/reset", USER_BUDGET), None).await;
    assert_eq!(reset.status, StatusCode::FORBIDDEN);

    let still_exhausted = send(&router, Method::POST, SEARCH, Some(json!({ "query": "c" }))).await;
    assert_eq!(still_exhausted.status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(factory.nutrition.behavior.calls(), 1);
}

#[tokio::test]
async fn operator_routes_are_closed_without_a_configured_key() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config.admin_api_key = None;
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state);

    let response = send_admin(&router, ADMIN_KEY, Method::POST, "/api/v1/admin/budgets/reset", None).await;

    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn budgets_are_tracked_per_user() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config.budget.monthly_budget_usd = 0.002;
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state);

    let first = send(&router, Method::POST, SEARCH, Some(json!({ "query": "a" }))).await;
    assert_eq!(first.status, StatusCode::OK);

    let exhausted = send(&router, Method::POST, SEARCH, Some(json!({ "query": "b" }))).await;
    assert_eq!(exhausted.status, StatusCode::PAYMENT_REQUIRED);

    let someone_else = send_as(
        &router,
        TENANT,
        "user-2",
        Method::POST,
        SEARCH,
        Some(json!({ "query": "b" })),
    )
    .await;
    assert_eq!(someone_else.status, StatusCode::OK);
}

#[tokio::test]
async fn missing_caller_headers_are_rejected() {
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    let factory = MockClientFactory::new();
    let state = ready_state(&configured(), &factory, Backends::in_memory()).await;

    let response = build_router(state)
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/api/v1/budget")
                .header("x-tenant-id", "tenant-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn budgets_are_scoped_to_the_tenant() {
    let factory = MockClientFactory::new();
    let mut config = configured();
    config.budget.monthly_budget_usd = 0.002;
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    let spent = send(&router, Method::POST, SEARCH, Some(json!({ "query": "a" }))).await;
    assert_eq!(spent.status, StatusCode::OK);

    let status = send_as(&router, "tenant-b", USER, Method::GET, "/api/v1/budget", None).await;
    assert_eq!(status.status, StatusCode::OK);
    assert_eq!(status.body["spent_usd"], 0.0);

    let search = send_as(
        &router,
        "tenant-b",
        USER,
        Method::POST,
        SEARCH,
        Some(json!({ "query": "b" })),
    )
    .await;
    assert_eq!(search.status, StatusCode::OK);

    assert_eq!(state.cost_tracker.usage_records(TENANT, USER).len(), 1);
    assert_eq!(state.cost_tracker.usage_records("tenant-b", USER).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_searches_cannot_overshoot_the_budget() {
    let factory = MockClientFactory::new();
    factory
        .nutrition
        .behavior
        .set_latency(Duration::from_millis(100));
    let mut config = configured();
    // Room for exactly one search.
    config.budget.monthly_budget_usd = 0.002;
    let state = ready_state(&config, &factory, Backends::in_memory()).await;
    let router = build_router(state.clone());

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let router = router.clone();
            tokio::spawn(async move {
                let body = json!({ "query": format!("dish {}", i) });
                send(&router, Method::POST, SEARCH, Some(body)).await.status
            })
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        statuses.push(handle.await.unwrap());
    }

    let ok = statuses.iter().filter(|s| **s == StatusCode::OK).count();
    let refused = statuses
        .iter()
        .filter(|s| **s == StatusCode::PAYMENT_REQUIRED)
        .count();
    assert_eq!(ok, 1);
    assert_eq!(refused, 9);
    assert_eq!(factory.nutrition.behavior.calls(), 1);

    let budget = state.cost_tracker.get_budget_status(TENANT, USER);
    assert!(budget.spent_usd <= budget.total_budget_usd);
}
