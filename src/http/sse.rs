//! Server-Sent Events framing.
//!
//! Every frame is written and flushed on its own so the client sees it
//! without buffering delay. A failed write means the peer is gone.

use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::Result;

pub const CONTENT_TYPE: &str = "text/event-stream; charset=utf-8";
pub const CACHE_CONTROL: &str = "no-cache";
pub const CONNECTION: &str = "keep-alive";
pub const X_ACCEL_BUFFERING: &str = "no";

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_ERROR: &str = "error";

/// Replace embedded newlines with a literal `\n` so a payload stays one record.
pub fn escape_json_newlines(json: &str) -> String {
    json.replace('\n', "\\n")
}

/// Render one `event`/`id`/`data` frame, ending with the blank separator line.
pub fn format_event(event_type: &str, event_id: u64, data: &str) -> String {
    let mut frame = format!("event: {}\nid: {}\n", event_type, event_id);
    for line in data.split('\n') {
        frame.push_str("data: ");
        frame.push_str(line);
        frame.push('\n');
    }
    frame.push('\n');
    frame
}

/// Writes SSE frames to an async sink.
pub struct SseEventWriter<W> {
    writer: W,
    retry_timeout_ms: u64,
}

impl<W: AsyncWrite + Unpin> SseEventWriter<W> {
    pub fn new(writer: W, retry_timeout_ms: u64) -> Self {
        Self {
            writer,
            retry_timeout_ms,
        }
    }

    /// Tell the client how long to wait before reconnecting.
    pub async fn send_initial_handshake(&mut self) -> Result<()> {
        let frame = format!("retry: {}\n\n", self.retry_timeout_ms);
        self.write_frame(&frame).await
    }

    pub async fn send_event(&mut self, event_type: &str, event_id: u64, data: &str) -> Result<()> {
        self.write_frame(&format_event(event_type, event_id, data)).await
    }

    /// Comment line; ignored by EventSource, keeps proxies from timing out.
    pub async fn send_keep_alive(&mut self) -> Result<()> {
        self.write_frame(": ping\n\n").await
    }

    /// Send an `error` event carrying `{code, message, details?}`.
    pub async fn send_error(
        &mut self,
        event_id: u64,
        code: i32,
        message: &str,
        details: Option<&str>,
    ) -> Result<()> {
        let mut body = json!({ "code": code, "message": message });
        if let Some(details) = details {
            body["details"] = json!(details);
        }
        let text = serde_json::to_string(&body)?;
        self.send_event(EVENT_ERROR, event_id, &text).await
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    async fn write_frame(&mut self, frame: &str) -> Result<()> {
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer() -> SseEventWriter<Vec<u8>> {
        SseEventWriter::new(Vec::new(), 3000)
    }

    fn output(writer: SseEventWriter<Vec<u8>>) -> String {
        String::from_utf8(writer.into_inner()).unwrap()
    }

    #[tokio::test]
    async fn test_handshake() {
        let mut w = writer();
        w.send_initial_handshake().await.unwrap();
        assert_eq!(output(w), "retry: 3000\n\n");
    }

    #[tokio::test]
    async fn test_single_line_event() {
        let mut w = writer();
        w.send_event(EVENT_MESSAGE, 7, "{\"a\":1}").await.unwrap();
        assert_eq!(output(w), "event: message\nid: 7\ndata: {\"a\":1}\n\n");
    }

    #[tokio::test]
    async fn test_multi_line_data_gets_one_data_line_each() {
        let mut w = writer();
        w.send_event(EVENT_MESSAGE, 1, "line1\nline2").await.unwrap();
        assert_eq!(output(w), "event: message\nid: 1\ndata: line1\ndata: line2\n\n");
    }

    #[tokio::test]
    async fn test_escaped_payload_stays_single_record() {
        let payload = escape_json_newlines("{\n  \"a\": 1\n}");
        assert_eq!(payload, "{\\n  \"a\": 1\\n}");

        let mut w = writer();
        w.send_event(EVENT_MESSAGE, 2, &payload).await.unwrap();
        assert_eq!(output(w).matches("data: ").count(), 1);
    }

    #[tokio::test]
    async fn test_keep_alive() {
        let mut w = writer();
        w.send_keep_alive().await.unwrap();
        assert_eq!(output(w), ": ping\n\n");
    }

    #[tokio::test]
    async fn test_error_event() {
        let mut w = writer();
        w.send_error(4, -32001, "Session expired", None).await.unwrap();
        assert_eq!(
            output(w),
            "event: error\nid: 4\ndata: {\"code\":-32001,\"message\":\"Session expired\"}\n\n"
        );
    }

    #[tokio::test]
    async fn test_error_event_with_details() {
        let mut w = writer();
        w.send_error(
            5,
            -32004,
            "PROJECT_PATH does not match session-bound project",
            Some("Invalid PROJECT_PATH"),
        )
        .await
        .unwrap();
        let out = output(w);
        assert!(out.starts_with("event: error\nid: 5\n"));
        assert!(out.contains("\"details\":\"Invalid PROJECT_PATH\""));
    }

    #[tokio::test]
    async fn test_write_to_closed_sink_fails_as_disconnect() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(rx);
        let mut w = SseEventWriter::new(tx, 3000);
        let err = w.send_keep_alive().await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
