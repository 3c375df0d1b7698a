//! One agent turn: iterate LLM calls and tool executions until the model
//! stops asking for tools, the hook cancels, or the iteration cap hits.
//!
//! Flow per iteration: consult the hook → call the pool (raced against the
//! cancellation token) → no tool calls: guardrail check, pending-interrupt
//! continuation, or done → tool calls: execute in response order, append
//! the assistant turn and a user turn of tool_results, repeat.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::guard::{self, TaskKind, MAX_GUARD_RETRIES};
use crate::pool::EndpointPool;
use crate::protocol::{ChatMessage, ContentBlock, MessagesRequest};
use crate::tools::ToolRegistry;

/// Signal from the interruption source, polled at iteration boundaries.
#[derive(Debug, Clone)]
pub enum HookSignal {
    Continue,
    /// Unwind the turn now; the reason is echoed in the acknowledgement.
    Cancel { reason: String },
}

/// Narrow interface the turn loop uses to talk to its host (the gateway).
/// Keeps the agent crate free of any gateway dependency — the host passes
/// itself in behind this trait.
pub trait TurnHook: Send + Sync {
    /// Polled before each LLM call.
    fn poll(&self) -> HookSignal {
        HookSignal::Continue
    }

    /// Called when the model produced a plain end of turn. A pending
    /// high-priority interrupt returned here rewrites the stop into a
    /// continuation: the text is appended as a user turn and the loop
    /// keeps going.
    fn take_follow_up(&self) -> Option<String> {
        None
    }

    /// Progress chatter (tool names, step notes). Coalesced by the host.
    fn emit_progress(&self, _text: &str) {}
}

/// Hook that never interrupts — CLI paths and tests.
pub struct NullHook;

impl TurnHook for NullHook {}

/// Everything a turn needs as input.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub system: String,
    /// Prior conversation, oldest first.
    pub history: Vec<ChatMessage>,
    pub user_text: String,
    /// Base64 image blocks attached to the user turn (multimodal path).
    pub image_blocks: Vec<ContentBlock>,
    pub max_tokens: u32,
    pub max_iterations: u32,
    pub guard_enabled: bool,
}

impl TurnRequest {
    pub fn simple(system: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            history: Vec::new(),
            user_text: user_text.into(),
            image_blocks: Vec::new(),
            max_tokens: 4096,
            max_iterations: 30,
            guard_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed {
        text: String,
        iterations: u32,
        guard_violations: u32,
    },
    Cancelled {
        reason: String,
    },
}

/// Run one full turn against the pool.
pub async fn run_turn(
    pool: &Arc<EndpointPool>,
    registry: &ToolRegistry,
    hook: &dyn TurnHook,
    cancel: &CancellationToken,
    turn: TurnRequest,
) -> Result<TurnOutcome, AgentError> {
    let kind = guard::classify(&turn.user_text);
    let system = format!("{}{}", turn.system, registry.catalog_text());
    debug!(?kind, "turn starting");

    let mut messages = turn.history.clone();
    if turn.image_blocks.is_empty() {
        messages.push(ChatMessage::user(turn.user_text.clone()));
    } else {
        let mut blocks = turn.image_blocks.clone();
        blocks.push(ContentBlock::text(turn.user_text.clone()));
        messages.push(ChatMessage::user_blocks(blocks));
    }

    let mut violations: u32 = 0;
    let mut last_text = String::new();

    for iteration in 1..=turn.max_iterations {
        match hook.poll() {
            HookSignal::Cancel { reason } => {
                info!(iteration, reason = %reason, "turn cancelled by hook");
                return Ok(TurnOutcome::Cancelled { reason });
            }
            HookSignal::Continue => {}
        }

        let request = MessagesRequest {
            system: Some(system.clone()),
            messages: messages.clone(),
            tools: registry.definitions(),
            max_tokens: turn.max_tokens,
            extras: serde_json::Map::new(),
        };

        let response = tokio::select! {
            _ = cancel.cancelled() => {
                info!(iteration, "in-flight LLM call cancelled");
                return Ok(TurnOutcome::Cancelled { reason: "cancelled".to_string() });
            }
            result = pool.messages_create(&request) => result?,
        };

        let calls = response.tool_calls();
        if calls.is_empty() {
            let text = response.text();
            last_text = text.clone();

            let guard_applies =
                turn.guard_enabled && kind == TaskKind::Action && !registry.is_empty();
            if guard_applies && !guard::response_passes(&response) {
                violations += 1;
                warn!(iteration, violations, "guardrail violation — retrying with hint");
                if violations >= MAX_GUARD_RETRIES {
                    return Err(AgentError::GuardExhausted { violations });
                }
                messages.push(ChatMessage::assistant(text));
                messages.push(ChatMessage::user(format!(
                    "[system hint] {}",
                    guard::retry_hint()
                )));
                continue;
            }

            // A pending high-priority interrupt turns the stop into a
            // continuation of the same turn.
            if let Some(follow_up) = hook.take_follow_up() {
                info!(iteration, "merging pending interrupt into the turn");
                if !text.is_empty() {
                    messages.push(ChatMessage::assistant(text));
                }
                messages.push(ChatMessage::user(follow_up));
                continue;
            }

            info!(iteration, "turn complete");
            return Ok(TurnOutcome::Completed {
                text,
                iterations: iteration,
                guard_violations: violations,
            });
        }

        // Append the assistant turn exactly as returned (text + tool_use).
        messages.push(ChatMessage::assistant_blocks(response.content.clone()));

        // Execute in response order; each failure becomes an error
        // tool_result rather than an exception.
        let mut results: Vec<ContentBlock> = Vec::with_capacity(calls.len());
        for call in &calls {
            hook.emit_progress(&format!("tool: {}", call.name));
            let result = registry.execute(call).await;
            let content = if result.is_error {
                format!("tool error: {}", result.content)
            } else {
                result.content
            };
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content,
                is_error: result.is_error,
            });
        }
        messages.push(ChatMessage::user_blocks(results));
    }

    warn!(max = turn.max_iterations, "turn hit the iteration cap");
    if last_text.is_empty() {
        Err(AgentError::MaxIterations(turn.max_iterations))
    } else {
        Ok(TurnOutcome::Completed {
            text: last_text,
            iterations: turn.max_iterations,
            guard_violations: violations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::endpoint::{EndpointKind, LlmEndpoint};
    use crate::error::WireError;
    use crate::pool::PoolConfig;
    use crate::protocol::{MessageBody, MessagesResponse, StopReason, Usage};
    use crate::tools::{Tool, ToolResult};
    use crate::wire::WireClient;

    /// Returns scripted responses in order and records every request.
    struct SequenceClient {
        responses: Mutex<Vec<MessagesResponse>>,
        requests: Mutex<Vec<MessagesRequest>>,
        cursor: AtomicUsize,
    }

    impl SequenceClient {
        fn new(responses: Vec<MessagesResponse>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
                cursor: AtomicUsize::new(0),
            })
        }

        fn request_log(&self) -> Vec<MessagesRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WireClient for SequenceClient {
        async fn send(
            &self,
            _model: &str,
            req: &MessagesRequest,
            _timeout: Duration,
        ) -> Result<MessagesResponse, WireError> {
            self.requests.lock().unwrap().push(req.clone());
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            let responses = self.responses.lock().unwrap();
            responses
                .get(i)
                .cloned()
                .ok_or_else(|| WireError::Parse("script exhausted".into()))
        }
    }

    struct NeverClient;

    #[async_trait]
    impl WireClient for NeverClient {
        async fn send(
            &self,
            _model: &str,
            _req: &MessagesRequest,
            _timeout: Duration,
        ) -> Result<MessagesResponse, WireError> {
            futures_util::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct BrowserTool {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Tool for BrowserTool {
        fn name(&self) -> &str {
            "browser_open"
        }
        fn description(&self) -> &str {
            "Open a URL in the browser"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"url": {"type": "string"}}})
        }
        async fn execute(&self, _input: serde_json::Value) -> ToolResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ToolResult::success("opened")
        }
    }

    fn text_response(text: &str) -> MessagesResponse {
        MessagesResponse {
            content: vec![ContentBlock::text(text)],
            stop_reason: StopReason::EndTurn,
            model: "test".into(),
            usage: Usage::default(),
        }
    }

    fn tool_response(id: &str, name: &str) -> MessagesResponse {
        MessagesResponse {
            content: vec![
                ContentBlock::text("working on it"),
                ContentBlock::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input: serde_json::json!({"url": "https://example.com"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            model: "test".into(),
            usage: Usage::default(),
        }
    }

    fn pool_with(client: Arc<dyn WireClient>) -> Arc<EndpointPool> {
        EndpointPool::with_clients(
            vec![(
                LlmEndpoint {
                    name: "mock".into(),
                    kind: EndpointKind::Native,
                    base_url: "http://unused".into(),
                    api_key: "k".into(),
                    model: "test".into(),
                    priority: 0,
                    healthy: true,
                    last_probe: None,
                    fail_count: 0,
                    requests_ok: 0,
                    requests_err: 0,
                },
                client,
            )],
            PoolConfig {
                recovery_interval: Duration::from_secs(3600),
                ..PoolConfig::default()
            },
        )
        .expect("pool")
    }

    fn browser_registry() -> (ToolRegistry, Arc<BrowserTool>) {
        let tool = Arc::new(BrowserTool {
            calls: AtomicUsize::new(0),
        });
        let mut registry = ToolRegistry::new();
        registry.register(tool.clone());
        (registry, tool)
    }

    #[tokio::test]
    async fn plain_dialogue_completes_in_one_iteration() {
        let client = SequenceClient::new(vec![text_response("hello!")]);
        let pool = pool_with(client);
        let registry = ToolRegistry::new();

        let outcome = run_turn(
            &pool,
            &registry,
            &NullHook,
            &CancellationToken::new(),
            TurnRequest::simple("sys", "你好"),
        )
        .await
        .expect("turn");

        match outcome {
            TurnOutcome::Completed {
                text, iterations, ..
            } => {
                assert_eq!(text, "hello!");
                assert_eq!(iterations, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tool_loop_appends_results_and_finishes() {
        let client = SequenceClient::new(vec![
            tool_response("t1", "browser_open"),
            text_response("done, the site is open"),
        ]);
        let pool = pool_with(client.clone());
        let (registry, tool) = browser_registry();

        let outcome = run_turn(
            &pool,
            &registry,
            &NullHook,
            &CancellationToken::new(),
            TurnRequest::simple("sys", "打开百度"),
        )
        .await
        .expect("turn");

        assert!(matches!(outcome, TurnOutcome::Completed { iterations: 2, .. }));
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

        // The second request must carry assistant tool_use + user tool_result.
        let log = client.request_log();
        assert_eq!(log.len(), 2);
        let second = &log[1];
        let roles: Vec<_> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles.len(), 3); // user, assistant, user(tool_result)
        match &second.messages[2].content {
            MessageBody::Blocks(blocks) => {
                assert!(matches!(
                    &blocks[0],
                    ContentBlock::ToolResult { tool_use_id, content, .. }
                        if tool_use_id == "t1" && content == "opened"
                ));
            }
            other => panic!("expected blocks, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn guard_violation_injects_hint_then_passes() {
        // S5: action request answered with plain text → hint retry →
        // tool_use → executed → final text.
        let client = SequenceClient::new(vec![
            text_response("好的，我来为你打开百度"),
            tool_response("t1", "browser_open"),
            text_response("已打开"),
        ]);
        let pool = pool_with(client.clone());
        let (registry, tool) = browser_registry();

        let outcome = run_turn(
            &pool,
            &registry,
            &NullHook,
            &CancellationToken::new(),
            TurnRequest::simple("sys", "打开百度"),
        )
        .await
        .expect("turn");

        match outcome {
            TurnOutcome::Completed {
                text,
                guard_violations,
                ..
            } => {
                assert_eq!(text, "已打开");
                assert_eq!(guard_violations, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(tool.calls.load(Ordering::SeqCst), 1);

        // The retry request carries the injected hint.
        let log = client.request_log();
        let retry = &log[1];
        let hint_present = retry.messages.iter().any(|m| match &m.content {
            MessageBody::Text(t) => t.contains("[system hint]"),
            _ => false,
        });
        assert!(hint_present);
    }

    #[tokio::test]
    async fn three_guard_violations_abort_the_turn() {
        let client = SequenceClient::new(vec![
            text_response("我明白了"),
            text_response("我明白了"),
            text_response("我明白了"),
        ]);
        let pool = pool_with(client);
        let (registry, _) = browser_registry();

        let err = run_turn(
            &pool,
            &registry,
            &NullHook,
            &CancellationToken::new(),
            TurnRequest::simple("sys", "打开百度"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, AgentError::GuardExhausted { violations: 3 }));
    }

    #[tokio::test]
    async fn cancel_token_unwinds_inflight_call() {
        let pool = pool_with(Arc::new(NeverClient));
        let registry = ToolRegistry::new();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let outcome = run_turn(
            &pool,
            &registry,
            &NullHook,
            &cancel,
            TurnRequest::simple("sys", "你好"),
        )
        .await
        .expect("turn");

        assert!(matches!(outcome, TurnOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn pending_follow_up_rewrites_end_turn_into_continuation() {
        struct OneFollowUp(Mutex<Option<String>>);
        impl TurnHook for OneFollowUp {
            fn take_follow_up(&self) -> Option<String> {
                self.0.lock().unwrap().take()
            }
        }

        let client = SequenceClient::new(vec![
            text_response("first answer"),
            text_response("second answer"),
        ]);
        let pool = pool_with(client.clone());
        let registry = ToolRegistry::new();
        let hook = OneFollowUp(Mutex::new(Some("also do this".to_string())));

        let outcome = run_turn(
            &pool,
            &registry,
            &hook,
            &CancellationToken::new(),
            TurnRequest::simple("sys", "你好"),
        )
        .await
        .expect("turn");

        match outcome {
            TurnOutcome::Completed {
                text, iterations, ..
            } => {
                assert_eq!(text, "second answer");
                assert_eq!(iterations, 2);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let log = client.request_log();
        let follow_up_present = log[1].messages.iter().any(|m| match &m.content {
            MessageBody::Text(t) => t == "also do this",
            _ => false,
        });
        assert!(follow_up_present);
    }
}
