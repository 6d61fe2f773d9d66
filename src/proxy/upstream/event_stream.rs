// AWS EventStream 二进制帧解析器
//
// 帧结构：
//   [total_len u32be][headers_len u32be][prelude_crc u32be]
//   [headers ...][payload ...][message_crc u32be]
//
// prelude_crc 覆盖前 8 字节，message_crc 覆盖 CRC 之前的全部字节。
// header 编码：name_len u8 / name / value_type u8 / value。
// 语义事件由 `:event-type` 头选出，payload 是 JSON。
//
// 解析是增量的：feed() 吃进字节流，吐出已完整的事件，残帧留在
// 缓冲区等下一个 chunk。坏帧（CRC、长度、JSON）记入错误预算并跳过，
// 预算耗尽后整个解析失败。

use bytes::{Buf, BytesMut};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

/// 帧长度上限。超过按坏帧处理，防止恶意长度导致缓冲区无限增长。
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// prelude 长度（total_len + headers_len + prelude_crc）
const PRELUDE_LEN: usize = 12;
/// 最小合法帧：prelude + message_crc
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;

#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("malformed frame budget exhausted after {0} errors")]
    TooManyErrors(u32),
}

/// 上游语义事件。
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamEvent {
    pub event_type: String,
    pub payload: Value,
}

impl UpstreamEvent {
    /// 转成下游状态机消费的 Anthropic 形态 map。
    ///
    /// 事件名 camelCase → snake_case，payload 字段平铺进 map；
    /// exception 帧额外携带 `exception_type`。
    pub fn to_anthropic_map(&self) -> Value {
        let type_name = match self.event_type.as_str() {
            "messageStart" => "message_start",
            "contentBlockStart" => "content_block_start",
            "contentBlockDelta" => "content_block_delta",
            "contentBlockStop" => "content_block_stop",
            "messageDelta" => "message_delta",
            "messageStop" => "message_stop",
            "exception" => "exception",
            other => other,
        };

        let mut map = match &self.payload {
            Value::Object(obj) => Value::Object(obj.clone()),
            Value::Null => json!({}),
            other => json!({ "payload": other.clone() }),
        };
        map["type"] = Value::String(type_name.to_string());
        map
    }
}

/// 单个 header 的取值。类型字节决定后续编码。
#[derive(Debug, Clone, PartialEq)]
#[allow(dead_code)]
enum HeaderValue {
    Bool(bool),
    Byte(u8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Bytes(Vec<u8>),
    String(String),
    Timestamp(i64),
    Uuid([u8; 16]),
}

impl HeaderValue {
    fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug)]
enum FrameStep {
    /// 还差字节，等下一个 chunk
    NeedMore,
    /// 解析出一帧（可能没有语义事件）
    Frame { event: Option<UpstreamEvent>, consumed: usize },
    /// 坏帧，跳过 `skip` 字节重新同步
    Bad { skip: usize, reason: String },
}

pub struct EventStreamParser {
    buffer: BytesMut,
    error_count: u32,
    max_errors: u32,
}

impl EventStreamParser {
    pub fn new(max_errors: u32) -> Self {
        Self {
            buffer: BytesMut::new(),
            error_count: 0,
            max_errors: max_errors.max(1),
        }
    }

    /// 吃进一段字节，返回其中完整帧的语义事件。
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<UpstreamEvent>, EventStreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        loop {
            match parse_frame(&self.buffer) {
                FrameStep::NeedMore => break,
                FrameStep::Frame { event, consumed } => {
                    self.buffer.advance(consumed);
                    if let Some(event) = event {
                        events.push(event);
                    }
                }
                FrameStep::Bad { skip, reason } => {
                    self.error_count += 1;
                    warn!(
                        error_count = self.error_count,
                        skip_bytes = skip,
                        reason = %reason,
                        "跳过损坏的 EventStream 帧"
                    );
                    if self.error_count >= self.max_errors {
                        return Err(EventStreamError::TooManyErrors(self.error_count));
                    }
                    self.buffer.advance(skip.min(self.buffer.len()));
                }
            }
        }

        Ok(events)
    }

    /// 一次性解析完整响应体（非流式路径）。
    pub fn parse_response(data: &[u8], max_errors: u32) -> Result<Vec<UpstreamEvent>, EventStreamError> {
        let mut parser = Self::new(max_errors);
        parser.feed(data)
    }

    /// 流结束后缓冲区残留的字节数（正常应为 0）。
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

fn parse_frame(buffer: &[u8]) -> FrameStep {
    if buffer.len() < PRELUDE_LEN {
        return FrameStep::NeedMore;
    }

    let total_len = u32::from_be_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;
    let headers_len = u32::from_be_bytes([buffer[4], buffer[5], buffer[6], buffer[7]]) as usize;
    let prelude_crc = u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]);

    let computed_prelude = crc32fast::hash(&buffer[..8]);
    if computed_prelude != prelude_crc {
        // prelude 不可信，total_len 也不可信，只能小步前移重新同步
        return FrameStep::Bad {
            skip: 4,
            reason: format!(
                "prelude CRC mismatch (expected {:08x}, got {:08x})",
                computed_prelude, prelude_crc
            ),
        };
    }

    if total_len < MIN_FRAME_LEN || total_len > MAX_FRAME_LEN || headers_len > total_len - MIN_FRAME_LEN
    {
        return FrameStep::Bad {
            skip: PRELUDE_LEN,
            reason: format!("implausible frame lengths total={} headers={}", total_len, headers_len),
        };
    }

    if buffer.len() < total_len {
        return FrameStep::NeedMore;
    }

    let message_crc = u32::from_be_bytes([
        buffer[total_len - 4],
        buffer[total_len - 3],
        buffer[total_len - 2],
        buffer[total_len - 1],
    ]);
    let computed_message = crc32fast::hash(&buffer[..total_len - 4]);
    if computed_message != message_crc {
        return FrameStep::Bad {
            skip: total_len,
            reason: format!(
                "message CRC mismatch (expected {:08x}, got {:08x})",
                computed_message, message_crc
            ),
        };
    }

    let headers_bytes = &buffer[PRELUDE_LEN..PRELUDE_LEN + headers_len];
    let headers = match parse_headers(headers_bytes) {
        Ok(headers) => headers,
        Err(reason) => {
            return FrameStep::Bad {
                skip: total_len,
                reason,
            }
        }
    };

    let payload = &buffer[PRELUDE_LEN + headers_len..total_len - 4];
    match classify_frame(&headers, payload) {
        Ok(event) => FrameStep::Frame {
            event,
            consumed: total_len,
        },
        Err(reason) => FrameStep::Bad {
            skip: total_len,
            reason,
        },
    }
}

fn parse_headers(mut data: &[u8]) -> Result<Vec<(String, HeaderValue)>, String> {
    let mut headers = Vec::new();

    while !data.is_empty() {
        let name_len = data[0] as usize;
        data = &data[1..];
        if data.len() < name_len + 1 {
            return Err("truncated header name".into());
        }
        let name = String::from_utf8(data[..name_len].to_vec())
            .map_err(|_| "header name is not UTF-8".to_string())?;
        data = &data[name_len..];

        let value_type = data[0];
        data = &data[1..];

        let value = match value_type {
            0 => HeaderValue::Bool(true),
            1 => HeaderValue::Bool(false),
            2 => {
                let v = *data.first().ok_or("truncated byte header")?;
                data = &data[1..];
                HeaderValue::Byte(v)
            }
            3 => {
                if data.len() < 2 {
                    return Err("truncated i16 header".into());
                }
                let v = i16::from_be_bytes([data[0], data[1]]);
                data = &data[2..];
                HeaderValue::Int16(v)
            }
            4 => {
                if data.len() < 4 {
                    return Err("truncated i32 header".into());
                }
                let v = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                data = &data[4..];
                HeaderValue::Int32(v)
            }
            5 | 8 => {
                if data.len() < 8 {
                    return Err("truncated i64 header".into());
                }
                let v = i64::from_be_bytes([
                    data[0], data[1], data[2], data[3], data[4], data[5], data[6], data[7],
                ]);
                data = &data[8..];
                if value_type == 5 {
                    HeaderValue::Int64(v)
                } else {
                    HeaderValue::Timestamp(v)
                }
            }
            6 | 7 => {
                if data.len() < 2 {
                    return Err("truncated length-prefixed header".into());
                }
                let len = u16::from_be_bytes([data[0], data[1]]) as usize;
                data = &data[2..];
                if data.len() < len {
                    return Err("truncated header value".into());
                }
                let bytes = data[..len].to_vec();
                data = &data[len..];
                if value_type == 7 {
                    HeaderValue::String(
                        String::from_utf8(bytes).map_err(|_| "header string is not UTF-8".to_string())?,
                    )
                } else {
                    HeaderValue::Bytes(bytes)
                }
            }
            9 => {
                if data.len() < 16 {
                    return Err("truncated uuid header".into());
                }
                let mut uuid = [0u8; 16];
                uuid.copy_from_slice(&data[..16]);
                data = &data[16..];
                HeaderValue::Uuid(uuid)
            }
            other => return Err(format!("unknown header value type {}", other)),
        };

        headers.push((name, value));
    }

    Ok(headers)
}

fn header_str<'a>(headers: &'a [(String, HeaderValue)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .and_then(|(_, v)| v.as_str())
}

/// 头部 + payload → 语义事件。
///
/// 非 event/exception 的帧（如 ping）没有语义，返回 Ok(None)。
fn classify_frame(
    headers: &[(String, HeaderValue)],
    payload: &[u8],
) -> Result<Option<UpstreamEvent>, String> {
    let message_type = header_str(headers, ":message-type").unwrap_or("event");

    let parse_payload = |payload: &[u8]| -> Result<Value, String> {
        if payload.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_slice(payload).map_err(|e| format!("payload is not JSON: {}", e))
    };

    match message_type {
        "exception" | "error" => {
            let exception_type = header_str(headers, ":exception-type")
                .or_else(|| header_str(headers, ":error-code"))
                .unwrap_or("UnknownException");
            let mut payload = parse_payload(payload)?;
            if payload.get("exception_type").is_none() {
                payload["exception_type"] = Value::String(exception_type.to_string());
            }
            Ok(Some(UpstreamEvent {
                event_type: "exception".to_string(),
                payload,
            }))
        }
        "event" => {
            let Some(event_type) = header_str(headers, ":event-type") else {
                debug!("事件帧缺少 :event-type 头，忽略");
                return Ok(None);
            };
            let payload = parse_payload(payload)?;
            Ok(Some(UpstreamEvent {
                event_type: event_type.to_string(),
                payload,
            }))
        }
        other => {
            debug!(message_type = other, "忽略未知 message-type 帧");
            Ok(None)
        }
    }
}

// ---- 帧编码（测试与 fixture 构造用） ----

fn encode_string_header(name: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + name.len() + value.len());
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
    out.push(7u8);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
    out
}

fn encode_frame(headers: &[(&str, &str)], payload: &[u8]) -> Vec<u8> {
    let mut header_bytes = Vec::new();
    for (name, value) in headers {
        header_bytes.extend_from_slice(&encode_string_header(name, value));
    }

    let total_len = PRELUDE_LEN + header_bytes.len() + payload.len() + 4;
    let mut frame = Vec::with_capacity(total_len);
    frame.extend_from_slice(&(total_len as u32).to_be_bytes());
    frame.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&crc32fast::hash(&frame[..8]).to_be_bytes());
    frame.extend_from_slice(&header_bytes);
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc32fast::hash(&frame).to_be_bytes());
    frame
}

/// 构造一个合法的 event 帧。
pub fn encode_event_frame(event_type: &str, payload: &Value) -> Vec<u8> {
    let payload_bytes = serde_json::to_vec(payload).unwrap_or_default();
    encode_frame(
        &[
            (":message-type", "event"),
            (":event-type", event_type),
            (":content-type", "application/json"),
        ],
        &payload_bytes,
    )
}

/// 构造一个合法的 exception 帧。
pub fn encode_exception_frame(exception_type: &str, payload: &Value) -> Vec<u8> {
    let payload_bytes = serde_json::to_vec(payload).unwrap_or_default();
    encode_frame(
        &[
            (":message-type", "exception"),
            (":exception-type", exception_type),
            (":content-type", "application/json"),
        ],
        &payload_bytes,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_event() {
        let frame = encode_event_frame(
            "contentBlockDelta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": "Hello"}}),
        );
        let events = EventStreamParser::parse_response(&frame, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "contentBlockDelta");
        assert_eq!(events[0].payload["delta"]["text"], "Hello");
    }

    #[test]
    fn incremental_feed_across_chunk_boundary() {
        let frame = encode_event_frame("messageStart", &json!({"role": "assistant"}));
        let mut parser = EventStreamParser::new(10);

        // 一个字节一个字节喂
        let mut all = Vec::new();
        for byte in &frame {
            all.extend(parser.feed(&[*byte]).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].event_type, "messageStart");
        assert_eq!(parser.pending_bytes(), 0);
    }

    #[test]
    fn multiple_frames_in_one_chunk() {
        let mut data = Vec::new();
        data.extend(encode_event_frame("messageStart", &json!({})));
        data.extend(encode_event_frame(
            "contentBlockDelta",
            &json!({"index": 0, "delta": {"type": "text_delta", "text": "a"}}),
        ));
        data.extend(encode_event_frame("messageStop", &json!({})));

        let events = EventStreamParser::parse_response(&data, 10).unwrap();
        let names: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(names, vec!["messageStart", "contentBlockDelta", "messageStop"]);
    }

    #[test]
    fn corrupted_message_crc_is_skipped() {
        let mut bad = encode_event_frame("messageStart", &json!({}));
        let len = bad.len();
        bad[len - 1] ^= 0xFF; // 破坏 message CRC
        let good = encode_event_frame("messageStop", &json!({}));

        let mut data = bad;
        data.extend(&good);

        let events = EventStreamParser::parse_response(&data, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "messageStop");
    }

    #[test]
    fn error_budget_exhaustion_fails() {
        let mut data = Vec::new();
        for _ in 0..3 {
            let mut bad = encode_event_frame("messageStart", &json!({}));
            let len = bad.len();
            bad[len - 1] ^= 0xFF;
            data.extend(bad);
        }

        let err = EventStreamParser::parse_response(&data, 2).unwrap_err();
        assert!(matches!(err, EventStreamError::TooManyErrors(2)));
    }

    #[test]
    fn prelude_corruption_resyncs_to_next_frame() {
        let mut data = vec![0xDE, 0xAD, 0xBE, 0xEF]; // 垃圾前缀
        data.extend(encode_event_frame("messageStop", &json!({})));

        // 垃圾导致 prelude CRC 失配，步进重同步后仍能找到后面的好帧
        let events = EventStreamParser::parse_response(&data, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "messageStop");
    }

    #[test]
    fn exception_frame_carries_type() {
        let frame = encode_exception_frame(
            "ContentLengthExceededException",
            &json!({"message": "too long"}),
        );
        let events = EventStreamParser::parse_response(&frame, 10).unwrap();
        assert_eq!(events[0].event_type, "exception");
        assert_eq!(
            events[0].payload["exception_type"],
            "ContentLengthExceededException"
        );
        assert_eq!(events[0].payload["message"], "too long");
    }

    #[test]
    fn anthropic_map_conversion() {
        let event = UpstreamEvent {
            event_type: "contentBlockDelta".into(),
            payload: json!({"index": 2, "delta": {"type": "text_delta", "text": "x"}}),
        };
        let map = event.to_anthropic_map();
        assert_eq!(map["type"], "content_block_delta");
        assert_eq!(map["index"], 2);
        assert_eq!(map["delta"]["text"], "x");
    }

    #[test]
    fn non_json_payload_counts_as_error() {
        let frame = encode_frame(
            &[(":message-type", "event"), (":event-type", "messageStart")],
            b"{invalid json",
        );
        let err = EventStreamParser::parse_response(&frame, 1).unwrap_err();
        assert!(matches!(err, EventStreamError::TooManyErrors(_)));
    }

    #[test]
    fn unknown_message_type_is_ignored() {
        let frame = encode_frame(&[(":message-type", "ping")], b"");
        let events = EventStreamParser::parse_response(&frame, 10).unwrap();
        assert!(events.is_empty());
    }

    use proptest::prelude::*;

    proptest! {
        /// 任意切分点喂入，结果与整体解析一致。
        #[test]
        fn prop_chunking_invariance(split in 1usize..200, text in "[a-zA-Z0-9 ]{0,40}") {
            let mut data = Vec::new();
            data.extend(encode_event_frame("messageStart", &json!({})));
            data.extend(encode_event_frame(
                "contentBlockDelta",
                &json!({"index": 0, "delta": {"type": "text_delta", "text": text}}),
            ));
            data.extend(encode_event_frame("messageStop", &json!({})));

            let reference = EventStreamParser::parse_response(&data, 10).unwrap();

            let split = split.min(data.len());
            let mut parser = EventStreamParser::new(10);
            let mut events = parser.feed(&data[..split]).unwrap();
            events.extend(parser.feed(&data[split..]).unwrap());

            prop_assert_eq!(reference.len(), events.len());
            for (a, b) in reference.iter().zip(events.iter()) {
                prop_assert_eq!(&a.event_type, &b.event_type);
                prop_assert_eq!(&a.payload, &b.payload);
            }
        }
    }
}
