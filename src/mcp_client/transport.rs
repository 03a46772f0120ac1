//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing line-delimited JSON-RPC messages to stdin
//! - Classifying stdout lines as responses or incidental output
//! - Routing responses to the waiting request by id
//!
//! Writing and reading never share a lock: the stdout reader task runs on its
//! own, so a child that blocks on a full stdout pipe cannot stall our writes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::oneshot;

use super::errors::McpError;
use super::types::{JsonRpcRequest, JsonRpcResponse};

// ─── Request ID Sequence ─────────────────────────────────────────────────────

/// Per-server monotonic request id counter, starting at 1.
#[derive(Debug)]
pub struct RequestIdSequence {
    next: AtomicU64,
}

impl RequestIdSequence {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id. Unique for the lifetime of this sequence.
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for RequestIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Inbound Classification ──────────────────────────────────────────────────

/// What a single stdout line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundLine {
    Response(JsonRpcResponse),
    /// Valid JSON that is not a response (notification, echoed request, ...).
    Message(Value),
    /// Plain text or malformed JSON.
    Text,
    Blank,
}

/// Classify one line read from a server's stdout.
pub fn classify_line(line: &str) -> InboundLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return InboundLine::Blank;
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => match JsonRpcResponse::from_value(value.clone()) {
            Some(resp) => InboundLine::Response(resp),
            None => InboundLine::Message(value),
        },
        Err(_) => InboundLine::Text,
    }
}

// ─── Response Channel ────────────────────────────────────────────────────────

/// Per-server mailbox that hands each response to the request with its id.
///
/// Waiters register before their request is written, so a fast reply can
/// never arrive ahead of its receiver. Responses nobody waits for are dropped.
#[derive(Debug)]
pub struct ResponseChannel {
    server_name: String,
    state: Mutex<ChannelState>,
}

#[derive(Debug, Default)]
struct ChannelState {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

impl ResponseChannel {
    pub fn new(server_name: &str) -> Self {
        Self {
            server_name: server_name.to_string(),
            state: Mutex::new(ChannelState::default()),
        }
    }

    /// Register interest in the response with `id`.
    pub fn register(&self, id: u64) -> Result<oneshot::Receiver<JsonRpcResponse>, McpError> {
        let mut state = self.lock();
        if state.closed {
            return Err(McpError::ChannelClosed {
                server: self.server_name.clone(),
            });
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Ok(rx)
    }

    /// Forget a waiter (after a timeout or a failed write).
    pub fn cancel(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    /// Hand a response to its waiter. Returns `false` if nobody was waiting.
    pub fn deliver(&self, response: JsonRpcResponse) -> bool {
        let waiter = response
            .request_id()
            .and_then(|id| self.lock().waiters.remove(&id));

        match waiter {
            Some(tx) => tx.send(response).is_ok(),
            None => {
                tracing::debug!(
                    server = %self.server_name,
                    id = %response.id,
                    "discarding response with no waiting request"
                );
                false
            }
        }
    }

    /// Close the channel: pending waiters wake with an error, new ones are refused.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        // Dropping the senders wakes every receiver
        state.waiters.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Log a stdout line and route it if it is a response.
pub fn route_stdout_line(server_name: &str, line: &str, responses: &ResponseChannel) {
    match classify_line(line) {
        InboundLine::Response(resp) => {
            tracing::trace!(server = %server_name, id = %resp.id, "response received");
            responses.deliver(resp);
        }
        InboundLine::Message(value) => {
            tracing::debug!(server = %server_name, message = %value, "non-response JSON from server");
        }
        InboundLine::Text => {
            tracing::debug!(server = %server_name, line = %line.trim(), "non-JSON output from server");
        }
        InboundLine::Blank => {}
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Write half of a server's stdio plus its correlation state.
pub struct StdioTransport {
    server_name: String,
    writer: tokio::sync::Mutex<ChildStdin>,
    responses: std::sync::Arc<ResponseChannel>,
    ids: RequestIdSequence,
}

impl StdioTransport {
    pub fn new(
        server_name: &str,
        stdin: ChildStdin,
        responses: std::sync::Arc<ResponseChannel>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            writer: tokio::sync::Mutex::new(stdin),
            responses,
            ids: RequestIdSequence::new(),
        }
    }

    pub fn responses(&self) -> &ResponseChannel {
        &self.responses
    }

    /// Serialize `message` as one line and write it to stdin, flushing immediately.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::TransportError {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })?;

        tracing::debug!(server = %self.server_name, message = %json.trim_end(), "sent message");
        Ok(())
    }

    /// Send a request and wait up to `timeout` for the response with its id.
    ///
    /// The deadline covers the write as well: a child that stopped reading
    /// stdin cannot hold the caller past it.
    pub async fn request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let timed_out = || McpError::Timeout {
            server: self.server_name.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };

        let id = self.ids.next_id();
        let rx = self.responses.register(id)?;
        // Unregisters the waiter on every exit path, including a dropped future.
        let _pending = PendingRequest {
            responses: &self.responses,
            id,
        };

        let request = JsonRpcRequest::new(id, method, params);
        // A write cut short here may leave a partial line in the pipe; the
        // server is not draining stdin at that point anyway.
        match tokio::time::timeout_at(deadline, self.send(&request)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(timed_out()),
        }

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::ChannelClosed {
                server: self.server_name.clone(),
            }),
            Err(_) => Err(timed_out()),
        }
    }
}

/// Removes a registered waiter when the request finishes or is dropped.
struct PendingRequest<'a> {
    responses: &'a ResponseChannel,
    id: u64,
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        self.responses.cancel(self.id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn response(id: Value, result: Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: Some("2.0".into()),
            id,
            result: Some(result),
            error: None,
        }
    }

    #[test]
    fn test_request_ids_start_at_one_and_increase() {
        let ids = RequestIdSequence::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
        assert_eq!(ids.next_id(), 3);
    }

    #[test]
    fn test_classify_response_lines() {
        match classify_line(r#"{"jsonrpc":"2.0","id":4,"result":{"ok":true}}"#) {
            InboundLine::Response(resp) => assert_eq!(resp.request_id(), Some(4)),
            other => panic!("expected response, got {other:?}"),
        }
        match classify_line(r#"  {"id":5,"error":{"code":-1,"message":"x"}}  "#) {
            InboundLine::Response(resp) => assert!(resp.is_error()),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_chatter() {
        assert_eq!(classify_line("server listening on stdio"), InboundLine::Text);
        assert_eq!(classify_line("{not json"), InboundLine::Text);
        assert_eq!(classify_line("   "), InboundLine::Blank);
        assert!(matches!(
            classify_line(r#"{"jsonrpc":"2.0","method":"notifications/message","params":{}}"#),
            InboundLine::Message(_)
        ));
        // An echoed request carries an id but is not a response
        assert!(matches!(
            classify_line(r#"{"jsonrpc":"2.0","id":1,"method":"test","params":{}}"#),
            InboundLine::Message(_)
        ));
    }

    #[tokio::test]
    async fn test_deliver_matches_by_id() {
        let channel = ResponseChannel::new("srv");
        let rx1 = channel.register(1).unwrap();
        let rx2 = channel.register(2).unwrap();

        // Out of order on purpose
        assert!(channel.deliver(response(json!(2), json!("second"))));
        assert!(channel.deliver(response(json!(1), json!("first"))));

        assert_eq!(rx1.await.unwrap().result, Some(json!("first")));
        assert_eq!(rx2.await.unwrap().result, Some(json!("second")));
        assert_eq!(channel.pending(), 0);
    }

    #[test]
    fn test_unmatched_response_is_discarded() {
        let channel = ResponseChannel::new("srv");
        let _rx = channel.register(1).unwrap();
        assert!(!channel.deliver(response(json!(99), json!(null))));
        assert!(!channel.deliver(response(Value::Null, json!(null))));
        assert_eq!(channel.pending(), 1);
    }

    #[test]
    fn test_cancel_removes_waiter() {
        let channel = ResponseChannel::new("srv");
        let _rx = channel.register(7).unwrap();
        channel.cancel(7);
        assert_eq!(channel.pending(), 0);
        assert!(!channel.deliver(response(json!(7), json!(1))));
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_refuses_new_ones() {
        let channel = ResponseChannel::new("srv");
        let rx = channel.register(1).unwrap();
        channel.close();

        assert!(rx.await.is_err());
        assert!(channel.is_closed());
        assert!(matches!(
            channel.register(2),
            Err(McpError::ChannelClosed { .. })
        ));
    }

    fn transport_for(command: &str, args: &[&str]) -> (tokio::process::Child, StdioTransport) {
        let mut child = tokio::process::Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let stdin = child.stdin.take().unwrap();
        let transport = StdioTransport::new("srv", stdin, Arc::new(ResponseChannel::new("srv")));
        (child, transport)
    }

    #[tokio::test]
    async fn test_dropped_request_unregisters_waiter() {
        let (_child, transport) = transport_for("cat", &[]);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            transport.request("never/answered", json!({}), Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(transport.responses().pending(), 0);
    }

    #[tokio::test]
    async fn test_request_timeout_covers_blocked_write() {
        // sleep never reads stdin, so the pipe fills and the write stalls
        let (_child, transport) = transport_for("sleep", &["30"]);
        let payload = json!({"blob": "x".repeat(1 << 20)});

        let started = std::time::Instant::now();
        let result = transport
            .request("big", payload, Duration::from_millis(300))
            .await;
        assert!(matches!(result, Err(McpError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(transport.responses().pending(), 0);
    }

    #[test]
    fn test_route_stdout_line_only_delivers_responses() {
        let channel = ResponseChannel::new("srv");
        let mut rx = channel.register(1).unwrap();

        route_stdout_line("srv", "booting...", &channel);
        route_stdout_line("srv", r#"{"jsonrpc":"2.0","id":1,"method":"echo"}"#, &channel);
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.pending(), 1);

        route_stdout_line("srv", r#"{"jsonrpc":"2.0","id":1,"result":[]}"#, &channel);
        assert_eq!(rx.try_recv().unwrap().result, Some(json!([])));
    }
}
