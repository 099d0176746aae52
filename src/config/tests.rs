use super::*;

const SAMPLE: &str = r#"{
    "providers": {
        "providerA": {
            "format": "anthropic",
            "base_url": "https://api.anthropic.example/",
            "api_key": "sk-ant-secret",
            "circuit_breaker": { "failure_threshold": 3 }
        },
        "providerB": {
            "format": "openai",
            "base_url": "http://127.0.0.1:9000/openai",
            "request_path": "chat/completions",
            "api_key": "sk-b",
            "timeout_secs": 15
        }
    },
    "routes": {
        "fast-chat": [
            { "provider": "providerA", "model": "a-model-1" },
            { "provider": "providerB", "model": "b-model-1" }
        ]
    }
}"#;

#[test]
fn parses_and_applies_defaults() {
    let config = GatewayConfig::from_json_str(SAMPLE).expect("config");
    let a = &config.providers["providerA"];
    assert_eq!(a.name, "providerA");
    assert_eq!(a.format, WireFormat::Anthropic);
    assert_eq!(a.timeout(), Duration::from_secs(60));
    assert_eq!(a.circuit_breaker.failure_threshold, 3);
    assert_eq!(a.circuit_breaker.open_duration_secs, 30);
    assert!(a.enabled);
    assert_eq!(a.endpoint_url(), "https://api.anthropic.example/v1/messages");

    let b = &config.providers["providerB"];
    assert_eq!(b.timeout_secs, 15);
    assert_eq!(b.endpoint_url(), "http://127.0.0.1:9000/openai/chat/completions");

    assert_eq!(
        config.routes["fast-chat"],
        vec![
            RouteCandidate::new("providerA", "a-model-1"),
            RouteCandidate::new("providerB", "b-model-1"),
        ]
    );
}

#[test]
fn debug_output_redacts_credentials() {
    let config = GatewayConfig::from_json_str(SAMPLE).expect("config");
    let rendered = format!("{:?}", config.providers["providerA"]);
    assert!(!rendered.contains("sk-ant-secret"));
    assert!(rendered.contains("<redacted>"));
}

fn minimal() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.providers.insert(
        "p".into(),
        ProviderConfig::new("p", WireFormat::OpenAi, "https://example.com", "k"),
    );
    config
        .routes
        .insert("m".into(), vec![RouteCandidate::new("p", "backend")]);
    config
}

#[test]
fn rejects_empty_configuration() {
    assert_eq!(
        GatewayConfig::default().validate(),
        Err(ConfigError::NoProviders)
    );

    let mut config = minimal();
    config.routes.clear();
    assert_eq!(config.validate(), Err(ConfigError::NoRoutes));

    let mut config = minimal();
    config.routes.insert("empty".into(), Vec::new());
    assert_eq!(
        config.validate(),
        Err(ConfigError::EmptyRoute {
            model: "empty".into()
        })
    );
}

#[test]
fn rejects_undefined_provider_reference() {
    let mut config = minimal();
    config
        .routes
        .insert("x".into(), vec![RouteCandidate::new("ghost", "g")]);
    assert_eq!(
        config.validate(),
        Err(ConfigError::UnknownProvider {
            model: "x".into(),
            provider: "ghost".into(),
        })
    );
}

#[test]
fn rejects_invalid_provider_settings() {
    let cases: Vec<Box<dyn Fn(&mut ProviderConfig)>> = vec![
        Box::new(|p| p.base_url = "not a url".into()),
        Box::new(|p| p.base_url = "ftp://example.com".into()),
        Box::new(|p| p.timeout_secs = 0),
        Box::new(|p| p.circuit_breaker.failure_threshold = 0),
    ];
    for mutate in cases {
        let mut config = minimal();
        if let Some(p) = config.providers.get_mut("p") {
            mutate(p);
        }
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidProvider { .. })
        ));
    }
}

#[test]
fn route_with_only_disabled_providers_is_rejected() {
    let mut config = minimal();
    if let Some(p) = config.providers.get_mut("p") {
        p.enabled = false;
    }
    assert_eq!(
        config.validate(),
        Err(ConfigError::NoEnabledCandidate { model: "m".into() })
    );
}

#[test]
fn reports_parse_errors() {
    assert!(matches!(
        GatewayConfig::from_json_str("{\"providers\": 3}"),
        Err(ConfigError::Parse(_))
    ));
}
