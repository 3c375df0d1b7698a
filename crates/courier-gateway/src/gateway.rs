//! The message gateway: one intake fan-in for all adapters, at most one
//! turn in flight per session key, interrupt scheduling around running
//! turns, and the outbound send path with split + retry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use courier_agent::{
    split::split_response, tools::ToolRegistry, AgentError, ChatMessage, ContentBlock,
    EndpointPool, HookSignal, PoolError, TurnHook, TurnOutcome, TurnRequest,
};
use courier_agent::protocol::ImageSource;
use courier_channels::{ChannelAdapter, Inbound, Transcriber, UnifiedMessage};
use courier_core::config::{
    CourierConfig, SEND_RETRIES, SEND_RETRY_DELAY_MS, TYPING_INTERVAL_SECS,
};
use courier_sessions::{HistoryEntry, Role, Session, SessionKey, SessionStore};

use crate::commands::CommandInterceptor;
use crate::error::{GatewayError, Result};
use crate::interrupt::{InterruptPriority, InterruptQueue};
use crate::media::preprocess_media;
use crate::progress::{ProgressBatcher, ProgressFlush};
use crate::report::ReportLedger;

/// Plain texts that cancel the running turn for their session.
const STOP_PHRASES: &[&str] = &["stop", "cancel", "取消", "停下"];

/// Fixed acknowledgement for a cancelled turn.
const CANCEL_ACK: &str = "acknowledged: stopped";

fn is_stop_phrase(text: &str) -> bool {
    let lowered = text.trim().to_lowercase();
    STOP_PHRASES.iter().any(|p| lowered == *p)
}

/// Priority of a message that arrived while its session was busy. Plain
/// messages queue silently behind the turn; adapters may tag urgent or
/// high-priority traffic through metadata, and high ones are picked up by
/// the agent's stop hook mid-turn.
fn interrupt_priority(message: &UnifiedMessage) -> InterruptPriority {
    match message
        .metadata
        .get("priority")
        .and_then(|v| v.as_str())
        .unwrap_or("")
    {
        "urgent" => InterruptPriority::Urgent,
        "high" => InterruptPriority::High,
        _ => InterruptPriority::Normal,
    }
}

pub struct MessageGateway {
    adapters: Mutex<HashMap<String, Arc<dyn ChannelAdapter>>>,
    store: Arc<SessionStore>,
    pool: Arc<EndpointPool>,
    registry: Arc<ToolRegistry>,
    transcriber: Option<Arc<dyn Transcriber>>,
    config: CourierConfig,

    /// Session keys with a turn in flight. Guarded by one mutex so intake
    /// observes the flag atomically with enqueueing.
    processing: Mutex<HashSet<String>>,
    interrupts: Mutex<HashMap<String, InterruptQueue>>,
    cancels: DashMap<String, CancellationToken>,
    cancel_reasons: DashMap<String, String>,

    media_semaphore: Arc<Semaphore>,
    progress: Arc<ProgressBatcher>,
    commands: CommandInterceptor,
    reports: ReportLedger,

    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    progress_rx: Mutex<Option<mpsc::UnboundedReceiver<ProgressFlush>>>,
}

impl MessageGateway {
    pub fn new(
        store: Arc<SessionStore>,
        pool: Arc<EndpointPool>,
        registry: Arc<ToolRegistry>,
        transcriber: Option<Arc<dyn Transcriber>>,
        config: CourierConfig,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            adapters: Mutex::new(HashMap::new()),
            store,
            pool: pool.clone(),
            registry,
            transcriber,
            media_semaphore: Arc::new(Semaphore::new(config.gateway.media_concurrency)),
            progress: ProgressBatcher::new(progress_tx),
            commands: CommandInterceptor::new(pool),
            reports: ReportLedger::new(config.gateway.report_dir.clone()),
            config,
            processing: Mutex::new(HashSet::new()),
            interrupts: Mutex::new(HashMap::new()),
            cancels: DashMap::new(),
            cancel_reasons: DashMap::new(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            progress_rx: Mutex::new(Some(progress_rx)),
        })
    }

    /// Register an adapter and hand it the inbound sink.
    pub fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        adapter.register_inbound(self.inbound_tx.clone());
        let name = adapter.name().to_string();
        info!(channel = %name, "adapter registered");
        self.adapters.lock().unwrap().insert(name, adapter);
    }

    /// Drive the intake and progress loops. Runs for the life of the
    /// process; adapters feed the intake queue from their own tasks.
    pub async fn run(self: Arc<Self>) {
        let mut inbound_rx = self
            .inbound_rx
            .lock()
            .unwrap()
            .take()
            .expect("gateway run() called twice");

        if let Some(progress_rx) = self.progress_rx.lock().unwrap().take() {
            let gateway = Arc::clone(&self);
            tokio::spawn(gateway.run_progress_flushes(progress_rx));
        }

        info!("gateway intake loop started");
        while let Some(inbound) = inbound_rx.recv().await {
            match inbound {
                Inbound::Message(msg) => self.handle_inbound(msg),
                Inbound::Event(event) => {
                    debug!(channel = %event.channel, event = %event.event_type, "platform event");
                }
            }
        }
        warn!("gateway intake loop ended (all adapters dropped)");
    }

    /// Intake decision point. Never blocks: either the session is idle and
    /// a turn task is spawned, or the message joins the session's
    /// interrupt queue (stop phrases additionally cancel the in-flight
    /// LLM call).
    pub fn handle_inbound(self: &Arc<Self>, message: UnifiedMessage) {
        let key = SessionKey::new(&message.channel, &message.chat_id, &message.user_id).format();

        let mut processing = self.processing.lock().unwrap();
        if processing.contains(&key) {
            let priority = if is_stop_phrase(message.text()) {
                self.fire_cancel(&key, message.text());
                InterruptPriority::Urgent
            } else {
                interrupt_priority(&message)
            };
            debug!(session = %key, ?priority, "queueing interrupt");
            self.interrupts
                .lock()
                .unwrap()
                .entry(key)
                .or_default()
                .push(message, priority);
            return;
        }

        processing.insert(key.clone());
        drop(processing);

        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            gateway.turn_cycle(key, message).await;
        });
    }

    /// Cancel the running turn for a session, recording why.
    fn fire_cancel(&self, key: &str, text: &str) {
        if let Some(token) = self.cancels.get(key) {
            info!(session = %key, "stop phrase received — cancelling in-flight turn");
            self.cancel_reasons
                .insert(key.to_string(), format!("user sent: {text}"));
            token.cancel();
        }
    }

    /// One processing cycle: the triggering turn plus every interrupt that
    /// queued up behind it, drained highest-priority first.
    async fn turn_cycle(self: Arc<Self>, key: String, first: UnifiedMessage) {
        let session_key = match SessionKey::parse(&key) {
            Ok(k) => k,
            Err(e) => {
                error!(session = %key, err = %e, "unparseable session key");
                self.processing.lock().unwrap().remove(&key);
                return;
            }
        };
        self.store.pin_in_flight(&session_key);

        let mut current = first;
        let mut is_interrupt = false;
        loop {
            if let Err(e) = self.process_one(&key, current, is_interrupt).await {
                error!(session = %key, err = %e, "turn failed");
            }

            // Drain under the processing lock so a message that raced in
            // right as we finish is either picked up here or sees the
            // cleared flag — never lost.
            let mut processing = self.processing.lock().unwrap();
            let next = self
                .interrupts
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(|q| q.pop());
            match next {
                Some(im) => {
                    drop(processing);
                    debug!(session = %key, "draining queued interrupt");
                    current = im.message;
                    is_interrupt = true;
                }
                None => {
                    processing.remove(&key);
                    break;
                }
            }
        }

        self.store.unpin_in_flight(&session_key);
    }

    /// The shape of one turn: command shortcut, typing keepalive, media
    /// preprocess, session bookkeeping, report delivery, agent call,
    /// outbound send.
    async fn process_one(
        self: &Arc<Self>,
        key: &str,
        message: UnifiedMessage,
        is_interrupt: bool,
    ) -> Result<()> {
        let adapter = self.adapter_for(&message.channel)?;
        let chat_id = message.chat_id.clone();

        // System commands never reach the agent.
        if self.commands.wants(key, message.text()) {
            if let Some(reply) = self.commands.handle(key, message.text()) {
                return self.send_with_retry(&adapter, &chat_id, &reply).await;
            }
        }

        let cancel = CancellationToken::new();
        self.cancels.insert(key.to_string(), cancel.clone());
        let typing = TypingHandle::start(Arc::clone(&adapter), chat_id.clone());

        let result = self
            .agent_turn(key, &adapter, message, is_interrupt, &cancel)
            .await;

        typing.stop();
        self.cancels.remove(key);
        self.cancel_reasons.remove(key);
        result
    }

    async fn agent_turn(
        self: &Arc<Self>,
        key: &str,
        adapter: &Arc<dyn ChannelAdapter>,
        mut message: UnifiedMessage,
        is_interrupt: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chat_id = message.chat_id.clone();

        let pending_images = preprocess_media(
            adapter,
            self.transcriber.as_ref(),
            &self.media_semaphore,
            &mut message,
        )
        .await;

        let session =
            self.store
                .get_or_create(&message.channel, &message.chat_id, &message.user_id);

        let plain = message.plain_text();
        let history = {
            let mut s = session.lock().unwrap();
            let history = build_history(&s, 40);
            let mut entry = HistoryEntry::new(Role::User, plain.clone());
            if is_interrupt {
                entry = entry.interrupt();
            }
            s.add_entry(entry);
            if !pending_images.is_empty() {
                let payloads: Vec<serde_json::Value> = pending_images
                    .iter()
                    .map(|img| {
                        serde_json::json!({
                            "media_type": img.media_type,
                            "data": img.data,
                        })
                    })
                    .collect();
                s.set_metadata("pending_images", serde_json::json!(payloads));
            }
            history
        };

        self.deliver_pending_report(adapter, &chat_id).await;

        // Consume the pending images for this turn's multimodal blocks.
        let image_blocks: Vec<ContentBlock> = {
            let mut s = session.lock().unwrap();
            match s.take_metadata("pending_images") {
                Some(serde_json::Value::Array(items)) => items
                    .into_iter()
                    .filter_map(|item| {
                        let media_type = item.get("media_type")?.as_str()?.to_string();
                        let data = item.get("data")?.as_str()?.to_string();
                        Some(ContentBlock::Image {
                            source: ImageSource::base64(media_type, data),
                        })
                    })
                    .collect(),
                _ => Vec::new(),
            }
        };

        let turn = TurnRequest {
            system: self.config.agent.system_prompt.clone(),
            history,
            user_text: plain,
            image_blocks,
            max_tokens: self.config.agent.max_tokens,
            max_iterations: self.config.agent.max_iterations,
            guard_enabled: self.config.agent.guard_enabled,
        };

        let hook = GatewayHook {
            gateway: Arc::clone(self),
            key: key.to_string(),
            session: Arc::clone(&session),
        };

        let outcome =
            courier_agent::turn::run_turn(&self.pool, &self.registry, &hook, cancel, turn).await;

        match outcome {
            Ok(TurnOutcome::Completed { text, .. }) => {
                // Persist optimistically, then send (split + retry).
                session
                    .lock()
                    .unwrap()
                    .add_message(Role::Assistant, text.clone());
                self.send_with_retry(adapter, &chat_id, &text).await
            }
            Ok(TurnOutcome::Cancelled { reason }) => {
                info!(session = %key, reason = %reason, "turn cancelled");
                session.lock().unwrap().add_message(Role::Assistant, CANCEL_ACK);
                self.send_with_retry(adapter, &chat_id, CANCEL_ACK).await
            }
            Err(AgentError::GuardExhausted { violations }) => {
                warn!(session = %key, violations, "guardrail exhausted");
                let notice = "I wasn't able to turn this request into concrete actions. \
                              Please rephrase or narrow it down.";
                session.lock().unwrap().add_message(Role::Assistant, notice);
                self.send_with_retry(adapter, &chat_id, notice).await
            }
            Err(AgentError::Pool(PoolError::AllEndpointsFailed { last })) => {
                error!(session = %key, last = %last, "all endpoints failed");
                let notice = "All language model endpoints are currently unavailable. \
                              Please try again shortly.";
                self.send_with_retry(adapter, &chat_id, notice).await
            }
            Err(e) => {
                error!(session = %key, err = %e, "unexpected turn error");
                let notice = "Something went wrong while handling that message.";
                let _ = self.send_with_retry(adapter, &chat_id, notice).await;
                Err(e.into())
            }
        }
    }

    /// On the first message of a day, deliver yesterday's unreported
    /// self-check report (paged) and flip its flag.
    async fn deliver_pending_report(&self, adapter: &Arc<dyn ChannelAdapter>, chat_id: &str) {
        let today = Utc::now().date_naive();
        let Some(report) = self.reports.pending_before(today) else {
            return;
        };
        info!(date = %report.date, "delivering pending daily report");
        let text = ReportLedger::render(&report);
        if self.send_with_retry(adapter, chat_id, &text).await.is_ok() {
            if let Err(e) = self.reports.mark_reported(&report.date) {
                warn!(date = %report.date, err = %e, "failed to flip reported flag");
            }
        }
    }

    /// Send one logical reply: split into platform-sized chunks, each with
    /// bounded transport retries. After exhaustion one final error notice
    /// is attempted and its own failure dropped.
    pub async fn send_with_retry(
        &self,
        adapter: &Arc<dyn ChannelAdapter>,
        chat_id: &str,
        text: &str,
    ) -> Result<()> {
        for chunk in split_response(text, self.config.gateway.chunk_limit) {
            let mut last_error = String::new();
            let mut sent = false;
            for attempt in 1..=SEND_RETRIES {
                match adapter.send_text(chat_id, &chunk).await {
                    Ok(_) => {
                        sent = true;
                        break;
                    }
                    Err(e) => {
                        warn!(attempt, err = %e, "send failed");
                        last_error = e.to_string();
                        if attempt < SEND_RETRIES {
                            tokio::time::sleep(Duration::from_millis(SEND_RETRY_DELAY_MS)).await;
                        }
                    }
                }
            }
            if !sent {
                let _ = adapter.send_text(chat_id, "(message delivery failed)").await;
                return Err(GatewayError::SendExhausted {
                    attempts: SEND_RETRIES,
                    last: last_error,
                });
            }
        }
        Ok(())
    }

    /// Emit one progress line for a session (agent-internal chatter).
    pub fn progress_event(&self, session_key: &str, text: &str) {
        self.progress.emit(session_key, text);
    }

    async fn run_progress_flushes(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<ProgressFlush>,
    ) {
        while let Some(flush) = rx.recv().await {
            let Ok(key) = SessionKey::parse(&flush.session_key) else {
                continue;
            };
            let Ok(adapter) = self.adapter_for(&key.channel) else {
                continue;
            };
            // Combined progress notice; deliberately not recorded as an
            // assistant turn in the session history.
            if let Err(e) = self.send_with_retry(&adapter, &key.chat_id, &flush.text).await {
                warn!(session = %flush.session_key, err = %e, "progress flush send failed");
            }
        }
    }

    fn adapter_for(&self, channel: &str) -> Result<Arc<dyn ChannelAdapter>> {
        self.adapters
            .lock()
            .unwrap()
            .get(channel)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownAdapter(channel.to_string()))
    }

    /// Test/introspection helper: is a turn currently running for the key?
    pub fn is_processing(&self, key: &str) -> bool {
        self.processing.lock().unwrap().contains(key)
    }
}

/// Snapshot the LLM-facing history: last `limit` turns excluding system
/// notices, as protocol messages.
fn build_history(session: &Session, limit: usize) -> Vec<ChatMessage> {
    session
        .recent_history(limit)
        .iter()
        .filter_map(|entry| match entry.role {
            Role::User => Some(ChatMessage::user(entry.content.clone())),
            Role::Assistant => Some(ChatMessage::assistant(entry.content.clone())),
            Role::System => None,
        })
        .collect()
}

/// The narrow interface the agent loop sees: interrupt polling, pending
/// follow-ups, progress. The agent crate knows only the `TurnHook` trait,
/// never the gateway itself, which keeps the dependency one-directional.
struct GatewayHook {
    gateway: Arc<MessageGateway>,
    key: String,
    session: Arc<Mutex<Session>>,
}

impl TurnHook for GatewayHook {
    fn poll(&self) -> HookSignal {
        let cancelled = self
            .gateway
            .cancels
            .get(&self.key)
            .is_some_and(|token| token.is_cancelled());
        if cancelled {
            let reason = self
                .gateway
                .cancel_reasons
                .get(&self.key)
                .map(|r| r.value().clone())
                .unwrap_or_else(|| "cancelled".to_string());
            return HookSignal::Cancel { reason };
        }
        HookSignal::Continue
    }

    fn take_follow_up(&self) -> Option<String> {
        let next = self
            .gateway
            .interrupts
            .lock()
            .unwrap()
            .get_mut(&self.key)
            .and_then(|q| q.pop_at_least(InterruptPriority::High))?;

        let text = next.message.plain_text();
        self.session
            .lock()
            .unwrap()
            .add_entry(HistoryEntry::new(Role::User, text.clone()).interrupt());
        Some(text)
    }

    fn emit_progress(&self, text: &str) {
        self.gateway.progress.emit(&self.key, text);
    }
}

/// Background typing indicator, refreshed on a fixed cadence while a turn
/// runs. `stop()` aborts the loop immediately.
struct TypingHandle(tokio::task::JoinHandle<()>);

impl TypingHandle {
    fn start(adapter: Arc<dyn ChannelAdapter>, chat_id: String) -> Self {
        let handle = tokio::spawn(async move {
            loop {
                let _ = adapter.send_typing(&chat_id).await;
                tokio::time::sleep(Duration::from_secs(TYPING_INTERVAL_SECS)).await;
            }
        });
        TypingHandle(handle)
    }

    fn stop(self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_phrases_match_trimmed_case_insensitive() {
        assert!(is_stop_phrase("stop"));
        assert!(is_stop_phrase(" STOP "));
        assert!(is_stop_phrase("取消"));
        assert!(is_stop_phrase("停下"));
        assert!(!is_stop_phrase("stop the music"));
        assert!(!is_stop_phrase("please cancel it"));
    }
}
