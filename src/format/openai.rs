//! Usage: OpenAI Chat Completions codec (role messages + function calls, `data:`-only SSE chunks).

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
use crate::shared::clock::now_unix_seconds;
use serde_json::{json, Map, Value};
use std::collections::HashMap;

const FORMAT: WireFormat = WireFormat::OpenAi;
const MAX_STOP_SEQUENCES: usize = 4;

fn malformed(reason: impl Into<String>) -> TranslationError {
    TranslationError::malformed(FORMAT, reason)
}

fn unsupported(construct: impl Into<String>) -> TranslationError {
    TranslationError::unsupported(FORMAT, construct)
}

/// Request fields that change generation but have no canonical counterpart.
fn reject_unmapped_params(root: &Value) -> Result<(), TranslationError> {
    if opt_u32(FORMAT, root, "n")?.is_some_and(|n| n > 1) {
        return Err(unsupported("multiple choices (`n` > 1)"));
    }
    if opt_bool(FORMAT, root, "logprobs")? == Some(true) || field(root, "top_logprobs").is_some() {
        return Err(unsupported("token log probabilities"));
    }
    if let Some(format) = field(root, "response_format") {
        if opt_str(format, "type") != Some("text") {
            return Err(unsupported("structured `response_format`"));
        }
    }
    if field(root, "functions").is_some() || field(root, "function_call").is_some() {
        return Err(unsupported("legacy `functions`/`function_call`"));
    }
    for key in ["presence_penalty", "frequency_penalty"] {
        if opt_f64(FORMAT, root, key)?.is_some_and(|v| v != 0.0) {
            return Err(unsupported(format!("`{key}`")));
        }
    }
    if field(root, "logit_bias").is_some_and(|v| v.as_object().is_some_and(|m| !m.is_empty())) {
        return Err(unsupported("`logit_bias`"));
    }
    if field(root, "audio").is_some() {
        return Err(unsupported("audio output"));
    }
    Ok(())
}

pub fn decode_request(root: &Value) -> Result<CanonicalRequest, TranslationError> {
    let model = req_str(FORMAT, root, "model")?.to_string();
    reject_unmapped_params(root)?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Message> = Vec::new();

    for (idx, raw) in req_array(FORMAT, root, "messages")?.iter().enumerate() {
        match req_str(FORMAT, raw, "role")? {
            "system" | "developer" => {
                if !messages.is_empty() {
                    return Err(unsupported("system message after the first turn"));
                }
                system_parts.push(decode_text_content(field(raw, "content"), idx)?);
            }
            "user" => messages.push(Message {
                role: Role::User,
                content: decode_user_content(field(raw, "content"), idx)?,
            }),
            "assistant" => messages.push(decode_assistant(raw, idx)?),
            "tool" => {
                let block = ContentBlock::ToolResult {
                    tool_use_id: req_str(FORMAT, raw, "tool_call_id")?.to_string(),
                    content: decode_tool_content(field(raw, "content"), idx)?,
                    is_error: false,
                };
                match messages.last_mut() {
                    Some(last) if last.role == Role::Tool => last.content.push(block),
                    _ => messages.push(Message {
                        role: Role::Tool,
                        content: vec![block],
                    }),
                }
            }
            "function" => return Err(unsupported("`function` role message")),
            other => return Err(malformed(format!("messages[{idx}]: unknown role `{other}`"))),
        }
    }

    let system = system_parts.join("\n\n");

    let max_tokens = match opt_u32(FORMAT, root, "max_completion_tokens")? {
        Some(n) => Some(n),
        None => opt_u32(FORMAT, root, "max_tokens")?,
    };

    let stop_sequences = match field(root, "stop") {
        None => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| malformed("`stop` must contain strings"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => return Err(malformed("`stop` must be a string or an array")),
    };

    let tools = opt_array(FORMAT, root, "tools")?
        .iter()
        .map(decode_tool)
        .collect::<Result<Vec<_>, _>>()?;

    let tool_choice = field(root, "tool_choice")
        .map(decode_tool_choice)
        .transpose()?;

    Ok(CanonicalRequest {
        model,
        system: (!system.is_empty()).then_some(system),
        messages,
        params: GenerationParams {
            max_tokens,
            temperature: opt_f64(FORMAT, root, "temperature")?,
            top_p: opt_f64(FORMAT, root, "top_p")?,
            top_k: None,
            stop_sequences,
            tools,
            tool_choice,
        },
        stream: opt_bool(FORMAT, root, "stream")?.unwrap_or(false),
    })
}

fn decode_text_content(raw: Option<&Value>, idx: usize) -> Result<String, TranslationError> {
    match raw {
        None => Ok(String::new()),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Array(parts)) => {
            let mut texts = Vec::with_capacity(parts.len());
            for part in parts {
                match req_str(FORMAT, part, "type")? {
                    "text" => texts.push(req_str(FORMAT, part, "text")?),
                    other => {
                        return Err(unsupported(format!(
                            "`{other}` part in messages[{idx}]"
                        )))
                    }
                }
            }
            Ok(texts.concat())
        }
        Some(_) => Err(malformed(format!(
            "messages[{idx}].content must be a string or an array"
        ))),
    }
}

fn decode_user_content(
    raw: Option<&Value>,
    idx: usize,
) -> Result<Vec<ContentBlock>, TranslationError> {
    match raw {
        Some(Value::String(s)) => Ok(vec![ContentBlock::text(s.clone())]),
        Some(Value::Array(parts)) => parts
            .iter()
            .map(|part| match req_str(FORMAT, part, "type")? {
                "text" => Ok(ContentBlock::text(req_str(FORMAT, part, "text")?)),
                "image_url" => Ok(ContentBlock::Image(decode_image_url(part)?)),
                other => Err(unsupported(format!("`{other}` content part"))),
            })
            .collect(),
        _ => Err(malformed(format!(
            "messages[{idx}].content must be a string or an array"
        ))),
    }
}

fn decode_image_url(part: &Value) -> Result<ImageSource, TranslationError> {
    let url = match field(part, "image_url") {
        Some(Value::String(url)) => url.as_str(),
        Some(obj) => req_str(FORMAT, obj, "url")?,
        None => return Err(malformed("image_url part without `image_url`")),
    };
    Ok(parse_data_url(url).unwrap_or_else(|| ImageSource::Url {
        url: url.to_string(),
    }))
}

/// `data:<media type>;base64,<payload>` becomes an inline base64 image.
fn parse_data_url(url: &str) -> Option<ImageSource> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let media_type = meta.strip_suffix(";base64")?;
    Some(ImageSource::Base64 {
        media_type: media_type.to_string(),
        data: data.to_string(),
    })
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    }
}

fn decode_assistant(raw: &Value, idx: usize) -> Result<Message, TranslationError> {
    if field(raw, "function_call").is_some() {
        return Err(unsupported("legacy `function_call`"));
    }
    if field(raw, "audio").is_some() {
        return Err(unsupported("assistant audio"));
    }

    let mut content = Vec::new();
    let calls = opt_array(FORMAT, raw, "tool_calls")?;
    match field(raw, "content") {
        None => {}
        Some(Value::String(s)) if s.is_empty() && !calls.is_empty() => {}
        Some(Value::String(s)) => content.push(ContentBlock::text(s.clone())),
        Some(Value::Array(parts)) => {
            for part in parts {
                match req_str(FORMAT, part, "type")? {
                    "text" => content.push(ContentBlock::text(req_str(FORMAT, part, "text")?)),
                    other => {
                        return Err(unsupported(format!(
                            "`{other}` part in assistant messages[{idx}]"
                        )))
                    }
                }
            }
        }
        Some(_) => {
            return Err(malformed(format!(
                "messages[{idx}].content must be a string, an array or null"
            )))
        }
    }

    for call in calls {
        content.push(decode_tool_call(call)?);
    }

    Ok(Message {
        role: Role::Assistant,
        content,
    })
}

fn decode_tool_call(call: &Value) -> Result<ContentBlock, TranslationError> {
    if let Some(kind) = opt_str(call, "type") {
        if kind != "function" {
            return Err(unsupported(format!("`{kind}` tool call")));
        }
    }
    let function =
        field(call, "function").ok_or_else(|| malformed("tool call without `function`"))?;
    Ok(ContentBlock::ToolUse {
        id: req_str(FORMAT, call, "id")?.to_string(),
        name: req_str(FORMAT, function, "name")?.to_string(),
        input: parse_arguments(opt_str(function, "arguments").unwrap_or_default())?,
    })
}

fn parse_arguments(raw: &str) -> Result<Value, TranslationError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
        .map_err(|e| malformed(format!("tool call arguments are not valid JSON: {e}")))
}

fn decode_tool_content(
    raw: Option<&Value>,
    idx: usize,
) -> Result<Vec<ToolResultPart>, TranslationError> {
    let text = decode_text_content(raw, idx)?;
    Ok(if text.is_empty() {
        Vec::new()
    } else {
        vec![ToolResultPart::Text(text)]
    })
}

fn decode_tool(raw: &Value) -> Result<ToolSpec, TranslationError> {
    let kind = req_str(FORMAT, raw, "type")?;
    if kind != "function" {
        return Err(unsupported(format!("`{kind}` tool")));
    }
    let function = field(raw, "function").ok_or_else(|| malformed("tool without `function`"))?;
    Ok(ToolSpec {
        name: req_str(FORMAT, function, "name")?.to_string(),
        description: opt_str(function, "description").map(str::to_string),
        input_schema: field(function, "parameters")
            .cloned()
            .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
    })
}

fn decode_tool_choice(raw: &Value) -> Result<ToolChoice, TranslationError> {
    match raw {
        Value::String(s) => match s.as_str() {
            "auto" => Ok(ToolChoice::Auto),
            "required" => Ok(ToolChoice::Any),
            "none" => Ok(ToolChoice::None),
            other => Err(malformed(format!("unknown tool_choice `{other}`"))),
        },
        Value::Object(_) => {
            let function = field(raw, "function")
                .ok_or_else(|| malformed("tool_choice object without `function`"))?;
            Ok(ToolChoice::Tool {
                name: req_str(FORMAT, function, "name")?.to_string(),
            })
        }
        _ => Err(malformed("`tool_choice` must be a string or an object")),
    }
}

pub fn encode_request(
    request: &CanonicalRequest,
    backend_model: &str,
) -> Result<Value, TranslationError> {
    let params = &request.params;
    if params.top_k.is_some() {
        return Err(unsupported("top_k sampling"));
    }
    if params.stop_sequences.len() > MAX_STOP_SEQUENCES {
        return Err(unsupported(format!(
            "more than {MAX_STOP_SEQUENCES} stop sequences"
        )));
    }

    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = request.system.as_deref().filter(|s| !s.is_empty()) {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        match message.role {
            Role::User => messages.push(encode_user(&message.content)?),
            Role::Assistant => messages.push(encode_assistant(&message.content, true)?),
            Role::Tool => messages.extend(encode_tool_results(&message.content)?),
        }
    }

    let mut root = Map::new();
    root.insert("model".into(), json!(backend_model));
    root.insert("messages".into(), Value::Array(messages));
    if let Some(max_tokens) = params.max_tokens {
        root.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = params.temperature {
        root.insert("temperature".into(), json!(temperature));
    }
    if let Some(top_p) = params.top_p {
        root.insert("top_p".into(), json!(top_p));
    }
    if !params.stop_sequences.is_empty() {
        root.insert("stop".into(), json!(params.stop_sequences));
    }
    if !params.tools.is_empty() {
        let tools: Vec<Value> = params
            .tools
            .iter()
            .map(|tool| {
                let mut function = Map::new();
                function.insert("name".into(), json!(tool.name));
                if let Some(description) = tool.description.as_deref() {
                    function.insert("description".into(), json!(description));
                }
                function.insert("parameters".into(), tool.input_schema.clone());
                json!({ "type": "function", "function": function })
            })
            .collect();
        root.insert("tools".into(), Value::Array(tools));
    }
    if let Some(choice) = params.tool_choice.as_ref() {
        let value = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::None => json!("none"),
            ToolChoice::Tool { name } => json!({ "type": "function", "function": { "name": name } }),
        };
        root.insert("tool_choice".into(), value);
    }
    if request.stream {
        root.insert("stream".into(), json!(true));
        root.insert("stream_options".into(), json!({ "include_usage": true }));
    }
    Ok(Value::Object(root))
}

fn encode_user(blocks: &[ContentBlock]) -> Result<Value, TranslationError> {
    if let [ContentBlock::Text { text }] = blocks {
        return Ok(json!({ "role": "user", "content": text }));
    }
    let parts = blocks
        .iter()
        .map(|block| match block {
            ContentBlock::Text { text } => Ok(json!({ "type": "text", "text": text })),
            ContentBlock::Image(source) => Ok(json!({
                "type": "image_url",
                "image_url": { "url": image_url(source) },
            })),
            other => Err(unsupported(format!("{} block in a user message", other.kind()))),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "role": "user", "content": parts }))
}

/// `as_parts` keeps multiple text blocks apart (requests); responses join them.
fn encode_assistant(blocks: &[ContentBlock], as_parts: bool) -> Result<Value, TranslationError> {
    let mut texts: Vec<&str> = Vec::new();
    let mut calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => {
                if !calls.is_empty() {
                    return Err(unsupported("text after a tool invocation in one assistant turn"));
                }
                texts.push(text);
            }
            ContentBlock::ToolUse { id, name, input } => {
                let arguments = serde_json::to_string(input)
                    .map_err(|e| malformed(format!("tool input not serializable: {e}")))?;
                calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": arguments },
                }));
            }
            ContentBlock::Image(_) => return Err(unsupported("image in an assistant message")),
            ContentBlock::ToolResult { .. } => {
                return Err(unsupported("tool result in an assistant message"))
            }
        }
    }

    let content = match texts.as_slice() {
        [] => Value::Null,
        [single] => json!(single),
        many if as_parts => Value::Array(
            many.iter()
                .map(|text| json!({ "type": "text", "text": text }))
                .collect(),
        ),
        many => json!(many.concat()),
    };

    let mut message = Map::new();
    message.insert("role".into(), json!("assistant"));
    message.insert("content".into(), content);
    if !calls.is_empty() {
        message.insert("tool_calls".into(), Value::Array(calls));
    }
    Ok(Value::Object(message))
}

fn encode_tool_results(blocks: &[ContentBlock]) -> Result<Vec<Value>, TranslationError> {
    blocks
        .iter()
        .map(|block| match block {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                if *is_error {
                    tracing::debug!(tool_use_id = %tool_use_id, "tool result error flag dropped for openai");
                }
                let mut texts = Vec::with_capacity(content.len());
                for part in content {
                    match part {
                        ToolResultPart::Text(text) => texts.push(text.as_str()),
                        ToolResultPart::Image(_) => {
                            return Err(unsupported("image inside a tool result"))
                        }
                    }
                }
                Ok(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": texts.concat(),
                }))
            }
            other => Err(unsupported(format!("{} block in a tool message", other.kind()))),
        })
        .collect()
}

pub fn decode_response(root: &Value) -> Result<CanonicalResponse, TranslationError> {
    let choices = req_array(FORMAT, root, "choices")?;
    let choice = match choices {
        [single] => single,
        [] => return Err(malformed("response without choices")),
        _ => return Err(unsupported("response with multiple choices")),
    };
    let message = field(choice, "message").ok_or_else(|| malformed("choice without `message`"))?;

    let mut content = Vec::new();
    if let Some(text) = opt_str(message, "content").filter(|t| !t.is_empty()) {
        content.push(ContentBlock::text(text));
    }
    let refusal = opt_str(message, "refusal");
    if let Some(text) = refusal {
        content.push(ContentBlock::text(text));
    }
    for call in opt_array(FORMAT, message, "tool_calls")? {
        content.push(decode_tool_call(call)?);
    }

    let stop_reason = match opt_str(choice, "finish_reason") {
        Some(reason) => Some(decode_finish_reason(reason)),
        None if refusal.is_some() => Some(StopReason::Refusal),
        None => None,
    };

    Ok(CanonicalResponse {
        id: opt_str(root, "id").unwrap_or_default().to_string(),
        model: opt_str(root, "model").unwrap_or_default().to_string(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: decode_usage(field(root, "usage")),
    })
}

pub fn encode_response(response: &CanonicalResponse) -> Result<Value, TranslationError> {
    let message = encode_assistant(&response.content, false)?;
    Ok(json!({
        "id": response.id,
        "object": "chat.completion",
        "created": now_unix_seconds(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": response.stop_reason.map(finish_reason_str),
        }],
        "usage": encode_usage(&response.usage),
    }))
}

fn decode_finish_reason(raw: &str) -> StopReason {
    match raw {
        "stop" => StopReason::EndTurn,
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        "content_filter" => StopReason::Refusal,
        other => {
            tracing::debug!(finish_reason = other, "unknown finish reason; treating as stop");
            StopReason::EndTurn
        }
    }
}

fn finish_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
        StopReason::Refusal => "content_filter",
    }
}

/// `prompt_tokens` counts cached tokens too; canonical input excludes them.
fn decode_usage(raw: Option<&Value>) -> Usage {
    let prompt = u64_or_zero(raw, "prompt_tokens");
    let cached = opt_u64(
        raw.and_then(|u| field(u, "prompt_tokens_details")),
        "cached_tokens",
    );
    Usage {
        input_tokens: prompt.saturating_sub(cached.unwrap_or(0)),
        output_tokens: u64_or_zero(raw, "completion_tokens"),
        cache_read_tokens: cached,
        cache_write_tokens: None,
    }
}

fn encode_usage(usage: &Usage) -> Value {
    let cached = usage.cache_read_tokens.unwrap_or(0);
    let prompt = usage
        .input_tokens
        .saturating_add(cached)
        .saturating_add(usage.cache_write_tokens.unwrap_or(0));
    let mut obj = Map::new();
    obj.insert("prompt_tokens".into(), json!(prompt));
    obj.insert("completion_tokens".into(), json!(usage.output_tokens));
    obj.insert(
        "total_tokens".into(),
        json!(prompt.saturating_add(usage.output_tokens)),
    );
    if usage.cache_read_tokens.is_some() {
        obj.insert(
            "prompt_tokens_details".into(),
            json!({ "cached_tokens": cached }),
        );
    }
    Value::Object(obj)
}

pub fn error_body(kind: ErrorKind, code: &str, message: &str) -> Value {
    let error_type = match kind {
        ErrorKind::InvalidRequest | ErrorKind::NotFound => "invalid_request_error",
        ErrorKind::Unavailable | ErrorKind::Upstream => "server_error",
    };
    json!({
        "error": { "message": message, "type": error_type, "code": code },
    })
}

pub fn stream_error_frame(code: &str, message: &str) -> SseFrame {
    SseFrame::data(error_body(ErrorKind::Upstream, code, message).to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(usize),
    Tool { call: u64, index: usize },
}

/// Synthesizes explicit block boundaries from chunked `delta` objects.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    started: bool,
    finished: bool,
    next_index: usize,
    open: Option<OpenBlock>,
    /// Upstream `tool_calls[].index` -> canonical block index.
    tool_blocks: HashMap<u64, usize>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl StreamDecoder {
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push_frame(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, StreamError> {
        if self.finished {
            return Ok(Vec::new());
        }
        if frame.is_done_marker() {
            return self.complete();
        }

        let chunk: Value = serde_json::from_str(&frame.data)
            .map_err(|e| malformed(format!("stream chunk is not JSON: {e}")))?;
        if let Some(error) = field(&chunk, "error") {
            let message = opt_str(error, "message").unwrap_or("unknown upstream error");
            return Err(StreamError::UpstreamEvent(message.to_string()));
        }

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                id: opt_str(&chunk, "id").unwrap_or_default().to_string(),
                model: opt_str(&chunk, "model").unwrap_or_default().to_string(),
                usage: Usage::default(),
            });
        }

        if let Some(usage) = field(&chunk, "usage") {
            self.usage.merge(&decode_usage(Some(usage)));
        }

        let choices = opt_array(FORMAT, &chunk, "choices")?;
        if choices.len() > 1 {
            return Err(unsupported("stream with multiple choices").into());
        }
        let Some(choice) = choices.first() else {
            return Ok(events);
        };

        if let Some(delta) = field(choice, "delta") {
            for key in ["content", "refusal"] {
                if let Some(text) = opt_str(delta, key).filter(|t| !t.is_empty()) {
                    let index = self.ensure_text_block(&mut events);
                    events.push(StreamEvent::BlockDelta {
                        index,
                        delta: BlockDelta::Text(text.to_string()),
                    });
                }
            }
            for call in opt_array(FORMAT, delta, "tool_calls")? {
                self.push_tool_call_delta(call, &mut events)?;
            }
        }

        if let Some(reason) = opt_str(choice, "finish_reason") {
            self.close_open_block(&mut events);
            self.stop_reason = Some(decode_finish_reason(reason));
        }
        Ok(events)
    }

    /// Upstream closed the body. Without `[DONE]` a seen finish reason still completes.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        if self.finished {
            return Ok(Vec::new());
        }
        if self.started && self.stop_reason.is_some() {
            return self.complete();
        }
        Err(StreamError::Truncated)
    }

    fn complete(&mut self) -> Result<Vec<StreamEvent>, StreamError> {
        if !self.started {
            return Err(StreamError::Truncated);
        }
        let mut events = Vec::new();
        self.close_open_block(&mut events);
        self.finished = true;
        events.push(StreamEvent::MessageStop {
            stop_reason: self.stop_reason,
            stop_sequence: None,
            usage: self.usage,
        });
        Ok(events)
    }

    fn ensure_text_block(&mut self, events: &mut Vec<StreamEvent>) -> usize {
        if let Some(OpenBlock::Text(index)) = self.open {
            return index;
        }
        self.close_open_block(events);
        let index = self.allocate_index();
        self.open = Some(OpenBlock::Text(index));
        events.push(StreamEvent::BlockStart {
            index,
            block: BlockStart::Text,
        });
        index
    }

    fn push_tool_call_delta(
        &mut self,
        call: &Value,
        events: &mut Vec<StreamEvent>,
    ) -> Result<(), StreamError> {
        let call_index = field(call, "index").and_then(Value::as_u64).unwrap_or(0);
        let function = field(call, "function");

        let index = match self.tool_blocks.get(&call_index) {
            Some(&index) => {
                if self.open != Some(OpenBlock::Tool { call: call_index, index }) {
                    return Err(malformed("tool call arguments resumed after another block").into());
                }
                index
            }
            None => {
                self.close_open_block(events);
                let index = self.allocate_index();
                self.tool_blocks.insert(call_index, index);
                self.open = Some(OpenBlock::Tool {
                    call: call_index,
                    index,
                });
                events.push(StreamEvent::BlockStart {
                    index,
                    block: BlockStart::ToolUse {
                        id: opt_str(call, "id").unwrap_or_default().to_string(),
                        name: function
                            .and_then(|f| opt_str(f, "name"))
                            .unwrap_or_default()
                            .to_string(),
                    },
                });
                index
            }
        };

        if let Some(arguments) = function
            .and_then(|f| opt_str(f, "arguments"))
            .filter(|a| !a.is_empty())
        {
            events.push(StreamEvent::BlockDelta {
                index,
                delta: BlockDelta::InputJson(arguments.to_string()),
            });
        }
        Ok(())
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        if let Some(open) = self.open.take() {
            let index = match open {
                OpenBlock::Text(index) | OpenBlock::Tool { index, .. } => index,
            };
            events.push(StreamEvent::BlockStop { index });
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

/// Renders canonical events as `chat.completion.chunk` frames ending with `[DONE]`.
#[derive(Debug, Default)]
pub struct StreamEncoder {
    id: String,
    model: String,
    created: u64,
    /// Canonical tool block index -> position in `tool_calls`.
    tool_positions: HashMap<usize, usize>,
}

impl StreamEncoder {
    pub fn encode(&mut self, event: &StreamEvent) -> Result<Vec<SseFrame>, TranslationError> {
        let frames = match event {
            StreamEvent::MessageStart { id, model, .. } => {
                self.id = id.clone();
                self.model = model.clone();
                self.created = now_unix_seconds();
                vec![self.chunk(json!({ "role": "assistant", "content": "" }), None)]
            }
            StreamEvent::BlockStart {
                block: BlockStart::Text,
                ..
            } => {
                self.ensure_no_tool_call_yet()?;
                Vec::new()
            }
            StreamEvent::BlockStart {
                index,
                block: BlockStart::ToolUse { id, name },
            } => {
                let position = self.tool_positions.len();
                self.tool_positions.insert(*index, position);
                vec![self.chunk(
                    json!({
                        "tool_calls": [{
                            "index": position,
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": "" },
                        }],
                    }),
                    None,
                )]
            }
            StreamEvent::BlockDelta {
                delta: BlockDelta::Text(text),
                ..
            } => {
                self.ensure_no_tool_call_yet()?;
                vec![self.chunk(json!({ "content": text }), None)]
            }
            StreamEvent::BlockDelta {
                index,
                delta: BlockDelta::InputJson(partial),
            } => {
                let position = *self
                    .tool_positions
                    .get(index)
                    .ok_or_else(|| malformed("tool input delta for a block that is not a tool call"))?;
                vec![self.chunk(
                    json!({
                        "tool_calls": [{
                            "index": position,
                            "function": { "arguments": partial },
                        }],
                    }),
                    None,
                )]
            }
            StreamEvent::BlockStop { .. } => Vec::new(),
            StreamEvent::MessageStop {
                stop_reason, usage, ..
            } => {
                let finish = stop_reason.unwrap_or(StopReason::EndTurn);
                let mut usage_chunk = self.chunk_envelope(Value::Array(Vec::new()));
                usage_chunk.insert("usage".into(), encode_usage(usage));
                vec![
                    self.chunk(json!({}), Some(finish_reason_str(finish))),
                    SseFrame::data(Value::Object(usage_chunk).to_string()),
                    SseFrame::data("[DONE]"),
                ]
            }
        };
        Ok(frames)
    }

    /// Chunks cannot carry text after `tool_calls`, same as a buffered assistant turn.
    fn ensure_no_tool_call_yet(&self) -> Result<(), TranslationError> {
        if self.tool_positions.is_empty() {
            Ok(())
        } else {
            Err(unsupported("text after a tool invocation in one assistant turn"))
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> SseFrame {
        let choices = json!([{ "index": 0, "delta": delta, "finish_reason": finish_reason }]);
        SseFrame::data(Value::Object(self.chunk_envelope(choices)).to_string())
    }

    fn chunk_envelope(&self, choices: Value) -> Map<String, Value> {
        let mut obj = Map::new();
        obj.insert("id".into(), json!(self.id));
        obj.insert("object".into(), json!("chat.completion.chunk"));
        obj.insert("created".into(), json!(self.created));
        obj.insert("model".into(), json!(self.model));
        obj.insert("choices".into(), choices);
        obj
    }
}
