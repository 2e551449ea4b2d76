//! Wire format of the external agent's stream-json transport.
//!
//! The agent process emits one JSON object per line on stdout and accepts
//! user-turn messages (tool results included) as JSON lines on stdin.
//! Unknown fields are ignored throughout; the transport evolves faster
//! than this crate does.

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WireEvent {
    #[serde(rename = "assistant")]
    Assistant { message: WireMessage },

    #[serde(rename = "user")]
    User { message: WireMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        subtype: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<WireUsage>,
    },

    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        message: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub content: Vec<WireBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum WireBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Render a tool result as the stdin line answering one `tool_use`.
pub fn tool_result_line(tool_use_id: &str, content: &Value, is_error: bool) -> String {
    let body = json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content.to_string(),
                "is_error": is_error,
            }]
        }
    });
    body.to_string()
}

/// Render the opening user prompt as a stdin line.
pub fn user_prompt_line(prompt: &str) -> String {
    let body = json!({
        "type": "user",
        "message": {
            "role": "user",
            "content": [{ "type": "text", "text": prompt }]
        }
    });
    body.to_string()
}

/// Flatten a tool-result content value (string or content-block list) into
/// readable text.
pub fn result_content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Outcome of one capped line read.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    /// The line exceeded the cap; it was discarded up to and including its
    /// newline. `discarded` counts the dropped bytes.
    Overflow { discarded: usize },
    Eof,
}

/// Read one newline-terminated line without ever buffering more than `cap`
/// bytes of it. Oversized lines (tool outputs embedding page snapshots)
/// are skipped in-place so the stream stays alive.
pub async fn read_line_capped<R>(reader: &mut R, cap: usize) -> std::io::Result<LineRead>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line(String::from_utf8_lossy(&line).into_owned())
            });
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if line.len() + pos > cap {
                    let discarded = line.len() + pos;
                    reader.consume(pos + 1);
                    return Ok(LineRead::Overflow { discarded });
                }
                line.extend_from_slice(&available[..pos]);
                reader.consume(pos + 1);
                return Ok(LineRead::Line(String::from_utf8_lossy(&line).into_owned()));
            }
            None => {
                let len = available.len();
                if line.len() + len > cap {
                    reader.consume(len);
                    let skipped = skip_to_newline(reader).await?;
                    return Ok(LineRead::Overflow {
                        discarded: line.len() + len + skipped,
                    });
                }
                line.extend_from_slice(available);
                reader.consume(len);
            }
        }
    }
}

async fn skip_to_newline<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(skipped);
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                skipped += pos;
                reader.consume(pos + 1);
                return Ok(skipped);
            }
            None => {
                skipped += available.len();
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_normal_lines() {
        let data = "first\nsecond\n";
        let mut reader = BufReader::new(Cursor::new(data));
        assert_eq!(
            read_line_capped(&mut reader, 1024).await.unwrap(),
            LineRead::Line("first".into())
        );
        assert_eq!(
            read_line_capped(&mut reader, 1024).await.unwrap(),
            LineRead::Line("second".into())
        );
        assert_eq!(read_line_capped(&mut reader, 1024).await.unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn oversized_line_is_skipped_and_stream_continues() {
        let big = "x".repeat(5000);
        let data = format!("ok\n{}\nafter\n", big);
        let mut reader = BufReader::new(Cursor::new(data));
        assert_eq!(
            read_line_capped(&mut reader, 100).await.unwrap(),
            LineRead::Line("ok".into())
        );
        match read_line_capped(&mut reader, 100).await.unwrap() {
            LineRead::Overflow { discarded } => assert_eq!(discarded, 5000),
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(
            read_line_capped(&mut reader, 100).await.unwrap(),
            LineRead::Line("after".into())
        );
    }

    #[tokio::test]
    async fn final_line_without_newline_is_returned() {
        let mut reader = BufReader::new(Cursor::new("tail"));
        assert_eq!(
            read_line_capped(&mut reader, 1024).await.unwrap(),
            LineRead::Line("tail".into())
        );
    }

    #[test]
    fn parses_assistant_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"t1","name":"get_next_task","input":{}}]}}"#;
        let event: WireEvent = serde_json::from_str(line).unwrap();
        match event {
            WireEvent::Assistant { message } => match &message.content[0] {
                WireBlock::ToolUse { id, name, .. } => {
                    assert_eq!(id, "t1");
                    assert_eq!(name, "get_next_task");
                }
                other => panic!("expected tool_use, got {:?}", other),
            },
            other => panic!("expected assistant, got {:?}", other),
        }
    }

    #[test]
    fn parses_result_with_usage() {
        let line = r#"{"type":"result","subtype":"success","is_error":false,"usage":{"input_tokens":10,"output_tokens":20,"cache_read_input_tokens":5}}"#;
        let event: WireEvent = serde_json::from_str(line).unwrap();
        match event {
            WireEvent::Result { usage, is_error, .. } => {
                assert!(!is_error);
                let usage = usage.unwrap();
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.cache_read_input_tokens, 5);
            }
            other => panic!("expected result, got {:?}", other),
        }
    }

    #[test]
    fn unknown_content_blocks_are_tolerated() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"..."}]}}"#;
        let event: WireEvent = serde_json::from_str(line).unwrap();
        match event {
            WireEvent::Assistant { message } => {
                assert!(matches!(message.content[0], WireBlock::Other));
            }
            other => panic!("expected assistant, got {:?}", other),
        }
    }

    #[test]
    fn tool_result_line_shape() {
        let line = tool_result_line("t1", &json!({"ok": true}), false);
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "user");
        assert_eq!(
            value["message"]["content"][0]["tool_use_id"],
            "t1"
        );
        assert_eq!(value["message"]["content"][0]["is_error"], false);
    }

    #[test]
    fn result_content_flattens_block_lists() {
        let blocks = json!([{"type":"text","text":"one"},{"type":"text","text":"two"}]);
        assert_eq!(result_content_text(&blocks), "one\ntwo");
        assert_eq!(result_content_text(&json!("plain")), "plain");
    }
}
