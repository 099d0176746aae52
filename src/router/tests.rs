use super::*;
use crate::circuit_breaker::CircuitState;
use crate::format::WireFormat;
use crate::provider_client::UpstreamError;
use crate::test_support::{text_request, text_response, Fixture, Script};
use std::time::Duration;

fn upstream_5xx() -> Script {
    Script::Fail(UpstreamError::Status { status: 503 })
}

fn ok(id: &str) -> Script {
    Script::Reply(text_response(id, "hi"))
}

fn served_id(routed: &RoutedReply) -> &str {
    match &routed.reply {
        ProviderReply::Complete(response) => &response.id,
        ProviderReply::Stream(_) => panic!("expected a complete reply"),
    }
}

#[tokio::test]
async fn skips_open_breaker_and_failed_candidate() {
    let fixture = Fixture::new()
        .provider("p1", WireFormat::Anthropic, ok("p1"))
        .provider("p2", WireFormat::OpenAi, upstream_5xx())
        .provider("p3", WireFormat::Anthropic, ok("p3"))
        .route("chat", &[("p1", "m1"), ("p2", "m2"), ("p3", "m3")]);
    let router = fixture.router();

    let p1 = router.registry().get("p1").unwrap();
    p1.breaker().record_failure(Instant::now());
    assert_eq!(p1.breaker().snapshot().state, CircuitState::Open);

    let routed = router
        .route("chat", &text_request("chat", "hello"))
        .await
        .unwrap();

    assert_eq!(routed.provider, "p3");
    assert_eq!(routed.backend_model, "m3");
    assert_eq!(served_id(&routed), "p3");
    assert_eq!(fixture.client("p1").calls(), 0);
    assert_eq!(fixture.client("p2").calls(), 1);
    assert_eq!(fixture.client("p3").calls(), 1);

    let kinds: Vec<_> = routed.failures.iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        vec![FailureKind::ProviderUnavailable, FailureKind::Upstream]
    );
    assert_eq!(routed.failures[0].error_code, "GW_PROVIDER_CIRCUIT_OPEN");
    assert_eq!(routed.failures[1].error_code, "GW_UPSTREAM_5XX");
}

#[tokio::test]
async fn exhausted_chain_reports_one_failure_per_candidate_in_order() {
    let fixture = Fixture::new()
        .provider("a", WireFormat::Anthropic, upstream_5xx())
        .provider(
            "b",
            WireFormat::OpenAi,
            Script::Fail(UpstreamError::Timeout(Duration::from_secs(60))),
        )
        .provider(
            "c",
            WireFormat::Anthropic,
            Script::Fail(UpstreamError::Connect("refused".into())),
        )
        .route("chat", &[("a", "ma"), ("b", "mb"), ("c", "mc")]);
    let router = fixture.router();

    let err = router
        .route("chat", &text_request("chat", "hello"))
        .await
        .unwrap_err();

    let RoutingError::ExhaustedFallbacks { failures } = &err else {
        panic!("expected exhausted fallbacks, got {err:?}");
    };
    let order: Vec<_> = failures
        .iter()
        .map(|f| (f.provider.as_str(), f.backend_model.as_str(), f.error_code))
        .collect();
    assert_eq!(
        order,
        vec![
            ("a", "ma", "GW_UPSTREAM_5XX"),
            ("b", "mb", "GW_UPSTREAM_TIMEOUT"),
            ("c", "mc", "GW_UPSTREAM_CONNECT_FAILED"),
        ]
    );
    assert_eq!(err.error_code(), "GW_ALL_PROVIDERS_UNAVAILABLE");
    assert_eq!(err.retry_after_secs(), None);

    // threshold is 1 in fixtures, so every failing provider is now open
    for name in ["a", "b", "c"] {
        let entry = router.registry().get(name).unwrap();
        assert_eq!(entry.breaker().snapshot().state, CircuitState::Open);
    }
}

#[tokio::test]
async fn fast_chat_served_by_first_candidate() {
    let fixture = Fixture::new()
        .provider("providerA", WireFormat::Anthropic, ok("a"))
        .provider("providerB", WireFormat::OpenAi, ok("b"))
        .route(
            "fast-chat",
            &[("providerA", "a-model-1"), ("providerB", "b-model-1")],
        );
    let router = fixture.router();

    let routed = router
        .route("fast-chat", &text_request("fast-chat", "hello"))
        .await
        .unwrap();

    assert_eq!(routed.provider, "providerA");
    assert!(routed.failures.is_empty());
    assert_eq!(fixture.client("providerB").calls(), 0);
    let snapshot = router
        .registry()
        .get("providerA")
        .unwrap()
        .breaker()
        .snapshot();
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);

    let sent = fixture.client("providerA").last_body().unwrap();
    assert_eq!(sent["model"], "a-model-1");
}

#[tokio::test]
async fn unknown_model_makes_no_calls() {
    let fixture = Fixture::new()
        .provider("p", WireFormat::OpenAi, ok("p"))
        .route("chat", &[("p", "m")]);
    let router = fixture.router();

    let err = router
        .route("ghost-model", &text_request("ghost-model", "hi"))
        .await
        .unwrap_err();

    assert!(matches!(err, RoutingError::UnknownModel(ref m) if m == "ghost-model"));
    assert_eq!(err.error_code(), "GW_UNKNOWN_MODEL");
    assert!(err.failures().is_empty());
    assert_eq!(fixture.total_calls(), 0);
}

#[tokio::test]
async fn untranslatable_everywhere_is_a_translation_error() {
    let fixture = Fixture::new()
        .provider("oa", WireFormat::OpenAi, ok("oa"))
        .route("chat", &[("oa", "gpt")]);
    let router = fixture.router();
    let mut request = text_request("chat", "hi");
    request.params.top_k = Some(40);

    let err = router.route("chat", &request).await.unwrap_err();

    assert!(matches!(
        err,
        RoutingError::Translation {
            error: TranslationError::Unsupported { .. },
            ..
        }
    ));
    assert_eq!(err.error_code(), "GW_TRANSLATION_UNSUPPORTED");
    assert_eq!(fixture.total_calls(), 0);
    let snapshot = router.registry().get("oa").unwrap().breaker().snapshot();
    assert_eq!(snapshot.failure_count, 0);
}

#[tokio::test]
async fn untranslatable_candidate_falls_through_to_compatible_one() {
    let fixture = Fixture::new()
        .provider("oa", WireFormat::OpenAi, ok("oa"))
        .provider("an", WireFormat::Anthropic, ok("an"))
        .route("chat", &[("oa", "gpt"), ("an", "claude")]);
    let router = fixture.router();
    let mut request = text_request("chat", "hi");
    request.params.top_k = Some(40);

    let routed = router.route("chat", &request).await.unwrap();

    assert_eq!(routed.provider, "an");
    assert_eq!(routed.failures.len(), 1);
    assert_eq!(routed.failures[0].kind, FailureKind::Translation);
    assert_eq!(fixture.client("oa").calls(), 0);
}

#[tokio::test]
async fn all_open_reports_earliest_retry_after() {
    let fixture = Fixture::new()
        .provider("a", WireFormat::Anthropic, ok("a"))
        .provider("b", WireFormat::Anthropic, ok("b"))
        .route("chat", &[("a", "ma"), ("b", "mb")]);
    let router = fixture.router();
    for name in ["a", "b"] {
        let breaker = router.registry().get(name).unwrap().breaker();
        breaker.record_failure(Instant::now());
    }

    let err = router
        .route("chat", &text_request("chat", "hi"))
        .await
        .unwrap_err();

    assert_eq!(err.failures().len(), 2);
    let retry = err.retry_after_secs().unwrap();
    assert!((1..=30).contains(&retry));
    assert_eq!(fixture.total_calls(), 0);
}

#[test]
fn disabled_providers_leave_routes_and_listing() {
    let mut fixture = Fixture::new()
        .provider("on", WireFormat::Anthropic, ok("on"))
        .provider("off", WireFormat::OpenAi, ok("off"))
        .route("chat", &[("off", "gpt-4o"), ("on", "claude-x")])
        .route("other", &[("on", "claude-x"), ("on", "claude-y")]);
    fixture.config.providers.get_mut("off").unwrap().enabled = false;
    let router = fixture.router();

    assert_eq!(
        router.candidates("chat").unwrap(),
        &[RouteCandidate::new("on", "claude-x")]
    );
    let ids: Vec<_> = router.list_models().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec!["claude-x", "claude-y"]);
}

#[test]
fn new_rejects_candidates_outside_the_registry() {
    let fixture = Fixture::new()
        .provider("p", WireFormat::Anthropic, ok("p"))
        .route("chat", &[("p", "m")]);
    let registry = Arc::new(ProviderRegistry::with_clients(&fixture.config, |p| {
        let client: Arc<dyn crate::provider_client::ProviderClient> =
            fixture.clients[&p.name].clone();
        client
    }));

    let mut routes = BTreeMap::new();
    routes.insert("chat".to_string(), vec![RouteCandidate::new("nope", "m")]);
    assert_eq!(
        ModelRouter::new(routes, registry.clone()).err(),
        Some(ConfigError::UnknownProvider {
            model: "chat".into(),
            provider: "nope".into()
        })
    );

    let mut empty = BTreeMap::new();
    empty.insert("chat".to_string(), Vec::new());
    assert_eq!(
        ModelRouter::new(empty, registry).err(),
        Some(ConfigError::EmptyRoute {
            model: "chat".into()
        })
    );
}
