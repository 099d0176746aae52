use super::canonical::{
    CanonicalRequest, ContentBlock, GenerationParams, ImageSource, Message, Role, ToolChoice,
    ToolResultPart, ToolSpec,
};
use super::*;
use serde_json::json;

fn text_and_tool_request(model: &str) -> CanonicalRequest {
    CanonicalRequest {
        model: model.to_string(),
        system: Some("You route weather questions.".into()),
        messages: vec![
            Message {
                role: Role::User,
                content: vec![ContentBlock::text("Weather in Paris?")],
            },
            Message {
                role: Role::Assistant,
                content: vec![
                    ContentBlock::text("Let me check."),
                    ContentBlock::ToolUse {
                        id: "toolu_01".into(),
                        name: "get_weather".into(),
                        input: json!({ "city": "Paris", "unit": "c" }),
                    },
                ],
            },
            Message {
                role: Role::Tool,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id: "toolu_01".into(),
                    content: vec![ToolResultPart::Text("18C, clear".into())],
                    is_error: false,
                }],
            },
            Message {
                role: Role::User,
                content: vec![ContentBlock::text("Thanks!")],
            },
        ],
        params: GenerationParams {
            max_tokens: Some(300),
            temperature: Some(0.5),
            top_p: None,
            top_k: None,
            stop_sequences: vec!["END".into()],
            tools: vec![ToolSpec {
                name: "get_weather".into(),
                description: Some("Current weather".into()),
                input_schema: json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                }),
            }],
            tool_choice: Some(ToolChoice::Auto),
        },
        stream: false,
    }
}

fn reencode(
    request: &CanonicalRequest,
    format: WireFormat,
) -> Result<CanonicalRequest, TranslationError> {
    let bytes = encode_request(format, request, &request.model)?;
    decode_request(format, &bytes)
}

#[test]
fn anthropic_round_trip_preserves_text_and_tool_blocks() {
    let original = CanonicalRequest {
        model: "a-model-1".into(),
        system: None,
        messages: vec![Message {
            role: Role::Assistant,
            content: vec![
                ContentBlock::text("hello"),
                ContentBlock::ToolUse {
                    id: "toolu_x".into(),
                    name: "lookup".into(),
                    input: json!({ "k": [1, 2, 3] }),
                },
            ],
        }],
        params: GenerationParams {
            max_tokens: Some(64),
            ..GenerationParams::default()
        },
        stream: false,
    };

    let decoded = reencode(&original, WireFormat::Anthropic).expect("round trip");
    assert_eq!(decoded, original);
    assert_eq!(decoded.messages[0].content.len(), 2);
}

#[test]
fn same_format_round_trips_are_lossless() {
    let original = text_and_tool_request("fast-chat");
    for format in [WireFormat::Anthropic, WireFormat::OpenAi] {
        let decoded = reencode(&original, format).expect("round trip");
        assert_eq!(decoded, original, "{format}");
    }
}

#[test]
fn anthropic_to_openai_to_anthropic_is_semantically_equal() {
    let original = text_and_tool_request("fast-chat");

    let a1 = reencode(&original, WireFormat::Anthropic).expect("anthropic");
    let b = reencode(&a1, WireFormat::OpenAi).expect("openai");
    let a2 = reencode(&b, WireFormat::Anthropic).expect("anthropic again");

    assert_eq!(a2, original);
}

#[test]
fn construct_without_openai_mapping_is_rejected_not_dropped() {
    let mut request = text_and_tool_request("fast-chat");
    request.messages[2].content = vec![ContentBlock::ToolResult {
        tool_use_id: "toolu_01".into(),
        content: vec![ToolResultPart::Image(ImageSource::Base64 {
            media_type: "image/png".into(),
            data: "iVBO".into(),
        })],
        is_error: false,
    }];

    let err = encode_request(WireFormat::OpenAi, &request, "gpt-backend").unwrap_err();
    match err {
        TranslationError::Unsupported { format, construct } => {
            assert_eq!(format, WireFormat::OpenAi);
            assert!(construct.contains("image"), "{construct}");
        }
        other => panic!("unexpected {other:?}"),
    }

    // The same request is fine for the block-typed protocol.
    assert!(encode_request(WireFormat::Anthropic, &request, "claude").is_ok());
}

#[test]
fn decode_request_reports_malformed_json() {
    for format in [WireFormat::Anthropic, WireFormat::OpenAi] {
        let err = decode_request(format, b"{not json").unwrap_err();
        assert_eq!(err.error_code(), "GW_INVALID_REQUEST");
        assert!(matches!(
            decode_request(format, b"[1,2]"),
            Err(TranslationError::Malformed { .. })
        ));
    }
}

#[test]
fn error_bodies_follow_each_protocol() {
    let a = error_body(WireFormat::Anthropic, ErrorKind::NotFound, "GW_UNKNOWN_MODEL", "nope");
    assert_eq!(a["type"], "error");
    assert_eq!(a["error"]["type"], "not_found_error");

    let b = error_body(WireFormat::OpenAi, ErrorKind::Unavailable, "GW_ALL_PROVIDERS_UNAVAILABLE", "down");
    assert_eq!(b["error"]["code"], "GW_ALL_PROVIDERS_UNAVAILABLE");
    assert_eq!(b["error"]["message"], "down");
}

#[test]
fn wire_format_deserializes_from_config_tags() {
    let formats: Vec<WireFormat> =
        serde_json::from_value(json!(["anthropic", "openai"])).expect("formats");
    assert_eq!(formats, vec![WireFormat::Anthropic, WireFormat::OpenAi]);
}
