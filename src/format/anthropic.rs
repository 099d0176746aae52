//! Usage: Anthropic Messages codec (typed content blocks, `event:`-named SSE stream).

use super::canonical::{
    BlockDelta, BlockStart, CanonicalRequest, CanonicalResponse, ContentBlock, GenerationParams,
    ImageSource, Message, Role, StopReason, StreamEvent, ToolChoice, ToolResultPart, ToolSpec,
    Usage,
};
use super::fields::{
    field, opt_array, opt_bool, opt_f64, opt_str, opt_u32, opt_u64, req_array, req_str,
    u64_or_zero,
};
use super::sse::SseFrame;
use super::{ErrorKind, StreamError, TranslationError, WireFormat};
use serde_json::{json, Map, Value};

const FORMAT: WireFormat = WireFormat::Anthropic;
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;
const MAX_TEMPERATURE: f64 = 1.0;

fn malformed(reason: impl Into<String>) -> TranslationError {
    TranslationError::malformed(FORMAT, reason)
}

fn unsupported(construct: impl Into<String>) -> TranslationError {
    TranslationError::unsupported(FORMAT, construct)
}

pub fn decode_request(root: &Value) -> Result<CanonicalRequest, TranslationError> {
    let model = req_str(FORMAT, root, "model")?.to_string();
    let max_tokens =
        opt_u32(FORMAT, root, "max_tokens")?.ok_or_else(|| malformed("`max_tokens` is required"))?;

    if let Some(thinking) = field(root, "thinking") {
        if opt_str(thinking, "type") != Some("disabled") {
            return Err(unsupported("extended thinking"));
        }
    }

    let system = decode_system(field(root, "system"))?;

    let mut messages = Vec::new();
    for (idx, raw) in req_array(FORMAT, root, "messages")?.iter().enumerate() {
        decode_message(raw, idx, &mut messages)?;
    }

    let stop_sequences = opt_array(FORMAT, root, "stop_sequences")?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| malformed("`stop_sequences` must contain strings"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let tools = opt_array(FORMAT, root, "tools")?
        .iter()
        .map(decode_tool)
        .collect::<Result<Vec<_>, _>>()?;

    let tool_choice = field(root, "tool_choice")
        .map(decode_tool_choice)
        .transpose()?;

    Ok(CanonicalRequest {
        model,
        system,
        messages,
        params: GenerationParams {
            max_tokens: Some(max_tokens),
            temperature: opt_f64(FORMAT, root, "temperature")?,
            top_p: opt_f64(FORMAT, root, "top_p")?,
            top_k: opt_u32(FORMAT, root, "top_k")?,
            stop_sequences,
            tools,
            tool_choice,
        },
        stream: opt_bool(FORMAT, root, "stream")?.unwrap_or(false),
    })
}

fn decode_system(raw: Option<&Value>) -> Result<Option<String>, TranslationError> {
    let text = match raw {
        None => return Ok(None),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => {
            let mut parts = Vec::with_capacity(blocks.len());
            for block in blocks {
                match req_str(FORMAT, block, "type")? {
                    "text" => parts.push(req_str(FORMAT, block, "text")?),
                    other => return Err(unsupported(format!("`{other}` system block"))),
                }
            }
            parts.join("\n\n")
        }
        Some(_) => return Err(malformed("`system` must be a string or an array of blocks")),
    };
    Ok((!text.is_empty()).then_some(text))
}

fn decode_message(
    raw: &Value,
    idx: usize,
    out: &mut Vec<Message>,
) -> Result<(), TranslationError> {
    let role = req_str(FORMAT, raw, "role")?;
    let blocks = match field(raw, "content") {
        Some(Value::String(s)) => vec![ContentBlock::text(s.clone())],
        Some(Value::Array(items)) => items
            .iter()
            .map(decode_block)
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(malformed(format!(
                "messages[{idx}].content must be a string or an array"
            )))
        }
    };

    match role {
        "assistant" => {
            if blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolResult { .. }))
            {
                return Err(malformed(format!(
                    "messages[{idx}]: tool_result is only valid in user messages"
                )));
            }
            out.push(Message {
                role: Role::Assistant,
                content: blocks,
            });
        }
        "user" => {
            if blocks
                .iter()
                .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
            {
                return Err(malformed(format!(
                    "messages[{idx}]: tool_use is only valid in assistant messages"
                )));
            }
            // Tool results become their own `tool` turn, one per contiguous run.
            let mut runs: Vec<Message> = Vec::new();
            for block in blocks {
                let role = match block {
                    ContentBlock::ToolResult { .. } => Role::Tool,
                    _ => Role::User,
                };
                match runs.last_mut() {
                    Some(last) if last.role == role => last.content.push(block),
                    _ => runs.push(Message {
                        role,
                        content: vec![block],
                    }),
                }
            }
            if runs.is_empty() {
                runs.push(Message {
                    role: Role::User,
                    content: Vec::new(),
                });
            }
            out.extend(runs);
        }
        other => {
            return Err(malformed(format!(
                "messages[{idx}]: unknown role `{other}`"
            )))
        }
    }
    Ok(())
}

fn decode_block(raw: &Value) -> Result<ContentBlock, TranslationError> {
    match req_str(FORMAT, raw, "type")? {
        "text" => Ok(ContentBlock::text(req_str(FORMAT, raw, "text")?)),
        "image" => Ok(ContentBlock::Image(decode_image_source(raw)?)),
        "tool_use" => Ok(ContentBlock::ToolUse {
            id: req_str(FORMAT, raw, "id")?.to_string(),
            name: req_str(FORMAT, raw, "name")?.to_string(),
            input: field(raw, "input").cloned().unwrap_or_else(|| json!({})),
        }),
        "tool_result" => Ok(ContentBlock::ToolResult {
            tool_use_id: req_str(FORMAT, raw, "tool_use_id")?.to_string(),
            content: decode_tool_result_content(field(raw, "content"))?,
            is_error: opt_bool(FORMAT, raw, "is_error")?.unwrap_or(false),
        }),
        other => Err(unsupported(format!("`{other}` content block"))),
    }
}

fn decode_image_source(block: &Value) -> Result<ImageSource, TranslationError> {
    let source = field(block, "source").ok_or_else(|| malformed("image block without `source`"))?;
    match req_str(FORMAT, source, "type")? {
        "base64" => Ok(ImageSource::Base64 {
            media_type: req_str(FORMAT, source, "media_type")?.to_string(),
            data: req_str(FORMAT, source, "data")?.to_string(),
        }),
        "url" => Ok(ImageSource::Url {
            url: req_str(FORMAT, source, "url")?.to_string(),
        }),
        other => Err(unsupported(format!("`{other}` image source"))),
    }
}

fn decode_tool_result_content(
    raw: Option<&Value>,
) -> Result<Vec<ToolResultPart>, TranslationError> {
    match raw {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![ToolResultPart::Text(s.clone())]),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match req_str(FORMAT, part, "type")? {
                "text" => Ok(ToolResultPart::Text(
                    req_str(FORMAT, part, "text")?.to_string(),
                )),
                "image" => Ok(ToolResultPart::Image(decode_image_source(part)?)),
                other => Err(unsupported(format!("`{other}` tool result part"))),
            })
            .collect(),
        Some(_) => Err(malformed("tool_result `content` must be a string or an array")),
    }
}

fn decode_tool(raw: &Value) -> Result<ToolSpec, TranslationError> {
    if let Some(kind) = opt_str(raw, "type") {
        if kind != "custom" {
            return Err(unsupported(format!("`{kind}` server tool")));
        }
    }
    Ok(ToolSpec {
        name: req_str(FORMAT, raw, "name")?.to_string(),
        description: opt_str(raw, "description").map(str::to_string),
        input_schema: field(raw, "input_schema")
            .cloned()
            .ok_or_else(|| malformed("tool without `input_schema`"))?,
    })
}

fn decode_tool_choice(raw: &Value) -> Result<ToolChoice, TranslationError> {
    match req_str(FORMAT, raw, "type")? {
        "auto" => Ok(ToolChoice::Auto),
        "any" => Ok(ToolChoice::Any),
        "none" => Ok(ToolChoice::None),
        "tool" => Ok(ToolChoice::Tool {
            name: req_str(FORMAT, raw, "name")?.to_string(),
        }),
        other => Err(malformed(format!("unknown tool_choice `{other}`"))),
    }
}

pub fn encode_request(
    request: &CanonicalRequest,
    backend_model: &str,
) -> Result<Value, TranslationError> {
    let params = &request.params;
    let mut root = Map::new();
    root.insert("model".into(), json!(backend_model));
    root.insert(
        "max_tokens".into(),
        json!(params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        root.insert("system".into(), json!(system));
    }
    root.insert("messages".into(), encode_messages(&request.messages)?);

    if let Some(temperature) = params.temperature {
        if temperature > MAX_TEMPERATURE {
            return Err(unsupported(format!(
                "temperature {temperature} (maximum is {MAX_TEMPERATURE})"
            )));
        }
        root.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        root.insert("top_p".into(), json!(top_p));
    }
    if let Some(top_k) = params.top_k {
        root.insert("top_k".into(), json!(top_k));
    }
    if !params.stop_sequences.is_empty() {
        root.insert("stop_sequences".into(), json!(params.stop_sequences));
    }
    if !params.tools.is_empty() {
        let tools: Vec<Value> = params
            .tools
            .iter()
            .map(|tool| {
                let mut obj = Map::new();
                obj.insert("name".into(), json!(tool.name));
                if let Some(description) = tool.description.as_deref() {
                    obj.insert("description".into(), json!(description));
                }
                obj.insert("input_schema".into(), tool.input_schema.clone());
                Value::Object(obj)
            })
            .collect();
        root.insert("tools".into(), Value::Array(tools));
    }
    if let Some(choice) = params.tool_choice.as_ref() {
        let value = match choice {
            ToolChoice::Auto => json!({ "type": "auto" }),
            ToolChoice::Any => json!({ "type": "any" }),
            ToolChoice::None => json!({ "type": "none" }),
            ToolChoice::Tool { name } => json!({ "type": "tool", "name": name }),
        };
        root.insert("tool_choice".into(), value);
    }
    if request.stream {
        root.insert("stream".into(), json!(true));
    }
    Ok(Value::Object(root))
}

fn encode_messages(messages: &[Message]) -> Result<Value, TranslationError> {
    // (is_user, blocks); `tool` turns fold into the neighbouring user-role message.
    let mut out: Vec<(bool, Vec<Value>)> = Vec::with_capacity(messages.len());
    let mut prev_role: Option<Role> = None;

    for message in messages {
        let blocks = message
            .content
            .iter()
            .map(|block| encode_block(block, message.role))
            .collect::<Result<Vec<_>, _>>()?;
        let is_user = message.role != Role::Assistant;
        let touches_tool = prev_role == Some(Role::Tool) || message.role == Role::Tool;

        match out.last_mut() {
            Some((last_is_user, last_blocks)) if *last_is_user && is_user && touches_tool => {
                last_blocks.extend(blocks);
            }
            _ => out.push((is_user, blocks)),
        }
        prev_role = Some(message.role);
    }

    Ok(Value::Array(
        out.into_iter()
            .map(|(is_user, blocks)| {
                json!({
                    "role": if is_user { "user" } else { "assistant" },
                    "content": blocks,
                })
            })
            .collect(),
    ))
}

fn encode_block(block: &ContentBlock, role: Role) -> Result<Value, TranslationError> {
    match block {
        ContentBlock::Text { text } => Ok(json!({ "type": "text", "text": text })),
        ContentBlock::Image(source) => Ok(json!({
            "type": "image",
            "source": encode_image_source(source),
        })),
        ContentBlock::ToolUse { id, name, input } => {
            if role != Role::Assistant {
                return Err(unsupported("tool invocation outside an assistant message"));
            }
            Ok(json!({ "type": "tool_use", "id": id, "name": name, "input": input }))
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            if role == Role::Assistant {
                return Err(unsupported("tool result inside an assistant message"));
            }
            let mut obj = Map::new();
            obj.insert("type".into(), json!("tool_result"));
            obj.insert("tool_use_id".into(), json!(tool_use_id));
            if let Some(content) = encode_tool_result_content(content) {
                obj.insert("content".into(), content);
            }
            if *is_error {
                obj.insert("is_error".into(), json!(true));
            }
            Ok(Value::Object(obj))
        }
    }
}

fn encode_image_source(source: &ImageSource) -> Value {
    match source {
        ImageSource::Base64 { media_type, data } => json!({
            "type": "base64",
            "media_type": media_type,
            "data": data,
        }),
        ImageSource::Url { url } => json!({ "type": "url", "url": url }),
    }
}

fn encode_tool_result_content(parts: &[ToolResultPart]) -> Option<Value> {
    match parts {
        [] => None,
        [ToolResultPart::Text(text)] => Some(json!(text)),
        parts => Some(Value::Array(
            parts
                .iter()
                .map(|part| match part {
                    ToolResultPart::Text(text) => json!({ "type": "text", "text": text }),
                    ToolResultPart::Image(source) => json!({
                        "type": "image",
                        "source": encode_image_source(source),
                    }),
                })
                .collect(),
        )),
    }
}

pub fn decode_response(root: &Value) -> Result<CanonicalResponse, TranslationError> {
    let content = req_array(FORMAT, root, "content")?
        .iter()
        .map(|block| match req_str(FORMAT, block, "type")? {
            "text" | "tool_use" => decode_block(block),
            other => Err(unsupported(format!("`{other}` content block"))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CanonicalResponse {
        id: req_str(FORMAT, root, "id")?.to_string(),
        model: opt_str(root, "model").unwrap_or_default().to_string(),
        content,
        stop_reason: opt_str(root, "stop_reason").map(decode_stop_reason),
        stop_sequence: opt_str(root, "stop_sequence").map(str::to_string),
        usage: decode_usage(field(root, "usage")),
    })
}

pub fn encode_response(response: &CanonicalResponse) -> Result<Value, TranslationError> {
    let content = response
        .content
        .iter()
        .map(|block| encode_block(block, Role::Assistant))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": content,
        "stop_reason": response.stop_reason.map(stop_reason_str),
        "stop_sequence": response.stop_sequence,
        "usage": encode_usage(&response.usage),
    }))
}

fn decode_stop_reason(raw: &str) -> StopReason {
    match raw {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        "refusal" => StopReason::Refusal,
        other => {
            tracing::debug!(stop_reason = other, "unknown stop reason; treating as end_turn");
            StopReason::EndTurn
        }
    }
}

fn stop_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
        StopReason::Refusal => "refusal",
    }
}

fn decode_usage(raw: Option<&Value>) -> Usage {
    Usage {
        input_tokens: u64_or_zero(raw, "input_tokens"),
        output_tokens: u64_or_zero(raw, "output_tokens"),
        cache_read_tokens: opt_u64(raw, "cache_read_input_tokens"),
        cache_write_tokens: opt_u64(raw, "cache_creation_input_tokens"),
    }
}

fn encode_usage(usage: &Usage) -> Value {
    let mut obj = Map::new();
    obj.insert("input_tokens".into(), json!(usage.input_tokens));
    obj.insert("output_tokens".into(), json!(usage.output_tokens));
    if let Some(n) = usage.cache_read_tokens {
        obj.insert("cache_read_input_tokens".into(), json!(n));
    }
    if let Some(n) = usage.cache_write_tokens {
        obj.insert("cache_creation_input_tokens".into(), json!(n));
    }
    Value::Object(obj)
}

pub fn error_body(kind: ErrorKind, message: &str) -> Value {
    let error_type = match kind {
        ErrorKind::InvalidRequest => "invalid_request_error",
        ErrorKind::NotFound => "not_found_error",
        ErrorKind::Unavailable => "overloaded_error",
        ErrorKind::Upstream => "api_error",
    };
    json!({
        "type": "error",
        "error": { "type": error_type, "message": message },
    })
}

pub fn stream_error_frame(message: &str) -> SseFrame {
    SseFrame::named("error", error_body(ErrorKind::Upstream, message).to_string())
}

/// Decodes `message_start .. message_stop` event streams.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    started: bool,
    finished: bool,
    usage: Usage,
    stop_reason: Option<StopReason>,
    stop_sequence: Option<String>,
}

impl StreamDecoder {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, StreamError> {
        if self.finished {
            return Ok(Vec::new());
        }
        let data: Value = serde_json::from_str(&frame.data)
            .map_err(|e| malformed(format!("stream frame is not JSON: {e}")))?;
        let kind = frame
            .event
            .as_deref()
            .or_else(|| opt_str(&data, "type"))
            .unwrap_or_default();

        if !self.started && !matches!(kind, "message_start" | "ping" | "error") {
            return Err(malformed(format!("`{kind}` event before message_start")).into());
        }

        let events = match kind {
            "message_start" => {
                let message =
                    field(&data, "message").ok_or_else(|| malformed("message_start without `message`"))?;
                self.started = true;
                self.usage = decode_usage(field(message, "usage"));
                vec![StreamEvent::MessageStart {
                    id: opt_str(message, "id").unwrap_or_default().to_string(),
                    model: opt_str(message, "model").unwrap_or_default().to_string(),
                    usage: self.usage,
                }]
            }
            "content_block_start" => {
                let index = block_index(&data)?;
                let block = field(&data, "content_block")
                    .ok_or_else(|| malformed("content_block_start without `content_block`"))?;
                match req_str(FORMAT, block, "type")? {
                    "text" => {
                        let mut events = vec![StreamEvent::BlockStart {
                            index,
                            block: BlockStart::Text,
                        }];
                        if let Some(text) = opt_str(block, "text").filter(|t| !t.is_empty()) {
                            events.push(StreamEvent::BlockDelta {
                                index,
                                delta: BlockDelta::Text(text.to_string()),
                            });
                        }
                        events
                    }
                    "tool_use" => vec![StreamEvent::BlockStart {
                        index,
                        block: BlockStart::ToolUse {
                            id: req_str(FORMAT, block, "id")?.to_string(),
                            name: req_str(FORMAT, block, "name")?.to_string(),
                        },
                    }],
                    other => return Err(unsupported(format!("`{other}` content block")).into()),
                }
            }
            "content_block_delta" => {
                let index = block_index(&data)?;
                let delta =
                    field(&data, "delta").ok_or_else(|| malformed("content_block_delta without `delta`"))?;
                let delta = match req_str(FORMAT, delta, "type")? {
                    "text_delta" => BlockDelta::Text(req_str(FORMAT, delta, "text")?.to_string()),
                    "input_json_delta" => BlockDelta::InputJson(
                        req_str(FORMAT, delta, "partial_json")?.to_string(),
                    ),
                    other => return Err(unsupported(format!("`{other}` stream delta")).into()),
                };
                vec![StreamEvent::BlockDelta { index, delta }]
            }
            "content_block_stop" => vec![StreamEvent::BlockStop {
                index: block_index(&data)?,
            }],
            "message_delta" => {
                if let Some(delta) = field(&data, "delta") {
                    if let Some(reason) = opt_str(delta, "stop_reason") {
                        self.stop_reason = Some(decode_stop_reason(reason));
                    }
                    if let Some(seq) = opt_str(delta, "stop_sequence") {
                        self.stop_sequence = Some(seq.to_string());
                    }
                }
                self.usage.merge(&decode_usage(field(&data, "usage")));
                Vec::new()
            }
            "message_stop" => {
                self.finished = true;
                vec![StreamEvent::MessageStop {
                    stop_reason: self.stop_reason,
                    stop_sequence: self.stop_sequence.take(),
                    usage: self.usage,
                }]
            }
            "ping" => Vec::new(),
            "error" => {
                let message = field(&data, "error")
                    .and_then(|e| opt_str(e, "message"))
                    .unwrap_or("unknown upstream error");
                return Err(StreamError::UpstreamEvent(message.to_string()));
            }
            other => {
                tracing::debug!(event = other, "ignoring unknown stream event");
                Vec::new()
            }
        };
        Ok(events)
    }

    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        if self.finished {
            Ok(Vec::new())
        } else {
            Err(StreamError::Truncated)
        }
    }
}

fn block_index(data: &Value) -> Result<usize, TranslationError> {
    field(data, "index")
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| malformed("stream event without a block `index`"))
}

/// Renders canonical events as Anthropic SSE events.
#[derive(Debug, Default)]
pub struct StreamEncoder;

impl StreamEncoder {
    pub fn encode(&self, event: &StreamEvent) -> Vec<SseFrame> {
        let frame = |name: &str, data: Value| SseFrame::named(name, data.to_string());
        match event {
            StreamEvent::MessageStart { id, model, usage } => vec![frame(
                "message_start",
                json!({
                    "type": "message_start",
                    "message": {
                        "id": id,
                        "type": "message",
                        "role": "assistant",
                        "model": model,
                        "content": [],
                        "stop_reason": null,
                        "stop_sequence": null,
                        "usage": encode_usage(usage),
                    },
                }),
            )],
            StreamEvent::BlockStart { index, block } => {
                let content_block = match block {
                    BlockStart::Text => json!({ "type": "text", "text": "" }),
                    BlockStart::ToolUse { id, name } => {
                        json!({ "type": "tool_use", "id": id, "name": name, "input": {} })
                    }
                };
                vec![frame(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": content_block,
                    }),
                )]
            }
            StreamEvent::BlockDelta { index, delta } => {
                let delta = match delta {
                    BlockDelta::Text(text) => json!({ "type": "text_delta", "text": text }),
                    BlockDelta::InputJson(partial) => {
                        json!({ "type": "input_json_delta", "partial_json": partial })
                    }
                };
                vec![frame(
                    "content_block_delta",
                    json!({ "type": "content_block_delta", "index": index, "delta": delta }),
                )]
            }
            StreamEvent::BlockStop { index } => vec![frame(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            )],
            StreamEvent::MessageStop {
                stop_reason,
                stop_sequence,
                usage,
            } => vec![
                frame(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": stop_reason.map(stop_reason_str),
                            "stop_sequence": stop_sequence,
                        },
                        "usage": encode_usage(usage),
                    }),
                ),
                frame("message_stop", json!({ "type": "message_stop" })),
            ],
        }
    }
}
