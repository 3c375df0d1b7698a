//! End-to-end gateway flows over a mock adapter and a scripted LLM pool:
//! per-session serialization, interrupt drain ordering, stop-phrase
//! cancellation, and the system-command shortcut.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use courier_agent::endpoint::{EndpointKind, LlmEndpoint};
use courier_agent::pool::{EndpointPool, PoolConfig};
use courier_agent::protocol::{ContentBlock, MessagesRequest, MessagesResponse, StopReason, Usage};
use courier_agent::tools::ToolRegistry;
use courier_agent::wire::WireClient;
use courier_agent::WireError;
use courier_channels::error::Result as ChannelResult;
use courier_channels::{
    ChannelAdapter, InboundSender, MediaFile, MessageContent, OutgoingMessage, UnifiedMessage,
};
use courier_core::config::CourierConfig;
use courier_gateway::MessageGateway;
use courier_sessions::{Role, SessionStore};

/// Adapter that records every outbound text.
struct RecordingAdapter {
    sent: Mutex<Vec<String>>,
}

impl RecordingAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "mock"
    }
    async fn start(&self) -> ChannelResult<()> {
        Ok(())
    }
    async fn stop(&self) -> ChannelResult<()> {
        Ok(())
    }
    fn register_inbound(&self, _tx: InboundSender) {}
    async fn send_message(&self, message: &OutgoingMessage) -> ChannelResult<String> {
        let text = message.content.text.clone().unwrap_or_default();
        self.sent.lock().unwrap().push(text);
        Ok("sent".into())
    }
    async fn download_media(&self, _media: &MediaFile) -> ChannelResult<PathBuf> {
        Ok(PathBuf::from("/dev/null"))
    }
}

/// Wire client that answers after a configurable delay and tracks how many
/// calls are in flight at once.
struct SlowEchoClient {
    delay: Duration,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    calls: AtomicU32,
}

impl SlowEchoClient {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl WireClient for SlowEchoClient {
    async fn send(
        &self,
        _model: &str,
        req: &MessagesRequest,
        _timeout: Duration,
    ) -> Result<MessagesResponse, WireError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Echo the final user message so replies are traceable.
        let last_user = req
            .messages
            .iter()
            .rev()
            .find_map(|m| match &m.content {
                courier_agent::protocol::MessageBody::Text(t) => Some(t.clone()),
                _ => None,
            })
            .unwrap_or_default();

        Ok(MessagesResponse {
            content: vec![ContentBlock::text(format!("re: {last_user}"))],
            stop_reason: StopReason::EndTurn,
            model: "test".into(),
            usage: Usage::default(),
        })
    }
}

fn endpoint(name: &str) -> LlmEndpoint {
    LlmEndpoint {
        name: name.to_string(),
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
    }
}

fn build_gateway(client: Arc<dyn WireClient>) -> (Arc<MessageGateway>, Arc<RecordingAdapter>) {
    let pool = EndpointPool::with_clients(
        vec![(endpoint("mock"), client)],
        PoolConfig {
            recovery_interval: Duration::from_secs(3600),
            ..PoolConfig::default()
        },
    )
    .expect("pool");

    let mut config = CourierConfig::default();
    config.gateway.report_dir = "/nonexistent/reports".to_string();
    // dialogue/action distinction is not under test here
    config.agent.guard_enabled = false;

    let gateway = MessageGateway::new(
        SessionStore::ephemeral(),
        pool,
        Arc::new(ToolRegistry::new()),
        None,
        config,
    );

    let adapter = RecordingAdapter::new();
    gateway.register_adapter(adapter.clone());
    (gateway, adapter)
}

fn msg(text: &str) -> UnifiedMessage {
    UnifiedMessage::new("mock", "m1", "user-1", "chat-1", MessageContent::text_only(text))
}

async fn wait_until_idle(gateway: &MessageGateway, key: &str) {
    for _ in 0..200 {
        if !gateway.is_processing(key) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("gateway never went idle for {key}");
}

const KEY: &str = "mock:chat-1:mock_user-1";

#[tokio::test]
async fn single_turn_replies_and_records_history() {
    let client = SlowEchoClient::new(Duration::from_millis(10));
    let (gateway, adapter) = build_gateway(client);

    gateway.handle_inbound(msg("hello"));
    tokio::time::sleep(Duration::from_millis(30)).await;
    wait_until_idle(&gateway, KEY).await;

    assert_eq!(adapter.sent(), vec!["re: hello"]);
}

#[tokio::test]
async fn concurrent_messages_for_one_session_never_overlap() {
    let client = SlowEchoClient::new(Duration::from_millis(40));
    let (gateway, adapter) = build_gateway(client.clone());

    for i in 0..3 {
        gateway.handle_inbound(msg(&format!("m{i}")));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    wait_until_idle(&gateway, KEY).await;

    // all three were answered, one at a time
    assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
    assert_eq!(adapter.sent().len(), 3);
}

#[tokio::test]
async fn distinct_sessions_run_in_parallel() {
    let client = SlowEchoClient::new(Duration::from_millis(60));
    let (gateway, _adapter) = build_gateway(client.clone());

    let mut other = msg("from other chat");
    other.chat_id = "chat-2".to_string();

    gateway.handle_inbound(msg("from chat 1"));
    gateway.handle_inbound(other);

    tokio::time::sleep(Duration::from_millis(200)).await;
    wait_until_idle(&gateway, KEY).await;

    assert!(client.max_in_flight.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn high_priority_interrupt_merges_into_running_turn() {
    let client = SlowEchoClient::new(Duration::from_millis(50));
    let (gateway, adapter) = build_gateway(client.clone());

    gateway.handle_inbound(msg("first request"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut urgent_followup = msg("and also this");
    urgent_followup
        .metadata
        .insert("priority".into(), serde_json::json!("high"));
    gateway.handle_inbound(urgent_followup);

    tokio::time::sleep(Duration::from_millis(300)).await;
    wait_until_idle(&gateway, KEY).await;

    // the follow-up was folded into the same turn: one reply, answering
    // the merged continuation
    assert_eq!(adapter.sent(), vec!["re: and also this"]);
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn stop_phrase_cancels_and_acknowledges() {
    let client = SlowEchoClient::new(Duration::from_secs(5));
    let (gateway, adapter) = build_gateway(client);

    gateway.handle_inbound(msg("do something long"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gateway.is_processing(KEY));

    gateway.handle_inbound(msg("停下"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = adapter.sent();
    assert!(
        sent.iter().any(|s| s == "acknowledged: stopped"),
        "expected cancel ack in {sent:?}"
    );
}

#[tokio::test]
async fn system_command_short_circuits_the_agent() {
    let client = SlowEchoClient::new(Duration::from_millis(10));
    let (gateway, adapter) = build_gateway(client.clone());

    gateway.handle_inbound(msg("/model"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    wait_until_idle(&gateway, KEY).await;

    let sent = adapter.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("Endpoints:"));
    // the agent was never called
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_history_has_user_and_assistant_turns() {
    let client = SlowEchoClient::new(Duration::from_millis(10));
    let pool = EndpointPool::with_clients(
        vec![(endpoint("mock"), client as Arc<dyn WireClient>)],
        PoolConfig::default(),
    )
    .expect("pool");

    let store = SessionStore::ephemeral();
    let mut config = CourierConfig::default();
    config.gateway.report_dir = "/nonexistent/reports".to_string();
    config.agent.guard_enabled = false;

    let gateway = MessageGateway::new(store.clone(), pool, Arc::new(ToolRegistry::new()), None, config);
    let adapter = RecordingAdapter::new();
    gateway.register_adapter(adapter.clone());

    gateway.handle_inbound(msg("remember this"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    wait_until_idle(&gateway, KEY).await;

    let session = store.get_or_create("mock", "chat-1", "mock_user-1");
    let session = session.lock().unwrap();
    assert_eq!(session.history.len(), 2);
    assert_eq!(session.history[0].role, Role::User);
    assert_eq!(session.history[0].content, "remember this");
    assert_eq!(session.history[1].role, Role::Assistant);
    assert_eq!(session.history[1].content, "re: remember this");
}
