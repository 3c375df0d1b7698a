//! System command interceptor — a small out-of-band state machine parallel
//! to the gateway. Handles `/model`, `/switch`, `/priority`, `/restore`,
//! `/cancel` plus free-form input while a confirm flow is active. These
//! never reach the agent or the endpoint pool's failover logic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::info;

use courier_agent::EndpointPool;

/// Multi-step flows expire after this much inactivity.
const FLOW_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// A `/switch` pin lasts this long.
const SWITCH_TTL: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
enum FlowKind {
    Switch,
    Priority,
    Restore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FlowStep {
    Select,
    Confirm,
}

struct Flow {
    kind: FlowKind,
    step: FlowStep,
    /// Selected endpoint (switch) or full ordering (priority).
    selection: Vec<String>,
    started_at: Instant,
}

/// Per-session command flows over the shared endpoint pool.
pub struct CommandInterceptor {
    pool: Arc<EndpointPool>,
    flows: Mutex<HashMap<String, Flow>>,
}

impl CommandInterceptor {
    pub fn new(pool: Arc<EndpointPool>) -> Self {
        Self {
            pool,
            flows: Mutex::new(HashMap::new()),
        }
    }

    /// Feed one message. Returns `Some(reply)` when the message was a
    /// system command or flow input and must not reach the agent.
    pub fn handle(&self, session_key: &str, text: &str) -> Option<String> {
        let trimmed = text.trim();

        // Expire a stale flow before doing anything else.
        {
            let mut flows = self.flows.lock().unwrap();
            if let Some(flow) = flows.get(session_key) {
                if flow.started_at.elapsed() >= FLOW_TIMEOUT {
                    flows.remove(session_key);
                }
            }
        }

        match trimmed {
            "/model" => return Some(self.model_listing()),
            "/cancel" => return Some(self.cancel_flow(session_key)),
            "/priority" => return Some(self.start_priority(session_key)),
            "/restore" => return Some(self.start_restore(session_key)),
            _ => {}
        }

        if trimmed == "/switch" {
            return Some(self.start_switch(session_key, None));
        }
        if let Some(arg) = trimmed.strip_prefix("/switch ") {
            return Some(self.start_switch(session_key, Some(arg.trim())));
        }

        // Free-form input only matters while a flow is active.
        if self.flows.lock().unwrap().contains_key(session_key) {
            return Some(self.feed_flow(session_key, trimmed));
        }

        None
    }

    /// Whether this message would be consumed by the interceptor.
    pub fn wants(&self, session_key: &str, text: &str) -> bool {
        let trimmed = text.trim();
        matches!(trimmed, "/model" | "/switch" | "/priority" | "/restore" | "/cancel")
            || trimmed.starts_with("/switch ")
            || self.flows.lock().unwrap().contains_key(session_key)
    }

    fn model_listing(&self) -> String {
        let mut out = String::from("Endpoints:\n");
        for (i, ep) in self.pool.snapshot().iter().enumerate() {
            let health = if ep.healthy { "ok" } else { "down" };
            let mut marks = String::new();
            if ep.current {
                marks.push_str(" ← current");
            }
            if ep.pinned {
                marks.push_str(" (pinned)");
            }
            out.push_str(&format!(
                "{}. {} [{}] {}{}\n",
                i + 1,
                ep.name,
                health,
                ep.model,
                marks
            ));
        }
        out.push_str("\nUse /switch [name] to pin an endpoint, /priority to reorder.");
        out
    }

    fn start_switch(&self, session_key: &str, arg: Option<&str>) -> String {
        let names = self.pool.endpoint_names();

        if let Some(arg) = arg {
            match resolve_endpoint(&names, arg) {
                Some(name) => {
                    self.set_flow(session_key, FlowKind::Switch, FlowStep::Confirm, vec![name.clone()]);
                    format!("Switch to {name} for 12 hours? Reply `yes` to confirm.")
                }
                None => format!("Unknown endpoint: {arg}. Options: {}", names.join(", ")),
            }
        } else {
            self.set_flow(session_key, FlowKind::Switch, FlowStep::Select, Vec::new());
            let mut out = String::from("Which endpoint? Reply with a name or number:\n");
            for (i, name) in names.iter().enumerate() {
                out.push_str(&format!("{}. {}\n", i + 1, name));
            }
            out
        }
    }

    fn start_priority(&self, session_key: &str) -> String {
        self.set_flow(session_key, FlowKind::Priority, FlowStep::Select, Vec::new());
        format!(
            "Current order: {}\nReply with all names space-separated in the new order.",
            self.pool.endpoint_names().join(" ")
        )
    }

    fn start_restore(&self, session_key: &str) -> String {
        match self.pool.pinned_endpoint() {
            Some(name) => {
                self.set_flow(session_key, FlowKind::Restore, FlowStep::Confirm, Vec::new());
                format!("Clear the pin on {name}? Reply `yes` to confirm.")
            }
            None => "No endpoint override is active.".to_string(),
        }
    }

    fn cancel_flow(&self, session_key: &str) -> String {
        if self.flows.lock().unwrap().remove(session_key).is_some() {
            "Command flow cancelled.".to_string()
        } else {
            "No active command flow.".to_string()
        }
    }

    fn feed_flow(&self, session_key: &str, input: &str) -> String {
        let Some(mut flow) = self.flows.lock().unwrap().remove(session_key) else {
            return "No active command flow.".to_string();
        };

        match (&flow.kind, &flow.step) {
            (FlowKind::Switch, FlowStep::Select) => {
                let names = self.pool.endpoint_names();
                match resolve_endpoint(&names, input) {
                    Some(name) => {
                        flow.selection = vec![name.clone()];
                        flow.step = FlowStep::Confirm;
                        self.put_flow(session_key, flow);
                        format!("Switch to {name} for 12 hours? Reply `yes` to confirm.")
                    }
                    None => {
                        self.put_flow(session_key, flow);
                        format!("Unknown endpoint: {input}. Options: {}", names.join(", "))
                    }
                }
            }
            (FlowKind::Switch, FlowStep::Confirm) => {
                if input.eq_ignore_ascii_case("yes") {
                    let name = flow.selection[0].clone();
                    match self.pool.pin(&name, SWITCH_TTL) {
                        Ok(()) => {
                            info!(endpoint = %name, "endpoint pinned via /switch");
                            format!("Pinned to {name} for 12 hours. Use /restore to undo.")
                        }
                        Err(e) => format!("Switch failed: {e}"),
                    }
                } else {
                    self.put_flow(session_key, flow);
                    "Reply `yes` to confirm, or /cancel to abort.".to_string()
                }
            }
            (FlowKind::Priority, FlowStep::Select) => {
                let order: Vec<String> = input.split_whitespace().map(String::from).collect();
                flow.selection = order;
                flow.step = FlowStep::Confirm;
                let preview = flow.selection.join(" > ");
                self.put_flow(session_key, flow);
                format!("New order: {preview}\nReply `yes` to confirm.")
            }
            (FlowKind::Priority, FlowStep::Confirm) => {
                if input.eq_ignore_ascii_case("yes") {
                    match self.pool.set_priority_order(&flow.selection) {
                        Ok(()) => {
                            info!(order = ?flow.selection, "priority order set via /priority");
                            format!("Priority order updated: {}", flow.selection.join(" > "))
                        }
                        Err(e) => format!("Priority update failed: {e}"),
                    }
                } else {
                    self.put_flow(session_key, flow);
                    "Reply `yes` to confirm, or /cancel to abort.".to_string()
                }
            }
            (FlowKind::Restore, _) => {
                if input.eq_ignore_ascii_case("yes") {
                    if self.pool.clear_pin() {
                        "Override cleared; back to priority order.".to_string()
                    } else {
                        "No endpoint override was active.".to_string()
                    }
                } else {
                    self.put_flow(session_key, flow);
                    "Reply `yes` to confirm, or /cancel to abort.".to_string()
                }
            }
        }
    }

    fn set_flow(&self, session_key: &str, kind: FlowKind, step: FlowStep, selection: Vec<String>) {
        self.flows.lock().unwrap().insert(
            session_key.to_string(),
            Flow {
                kind,
                step,
                selection,
                started_at: Instant::now(),
            },
        );
    }

    fn put_flow(&self, session_key: &str, flow: Flow) {
        self.flows
            .lock()
            .unwrap()
            .insert(session_key.to_string(), flow);
    }
}

/// Resolve a name or 1-based index against the endpoint list.
fn resolve_endpoint(names: &[String], input: &str) -> Option<String> {
    if let Ok(index) = input.parse::<usize>() {
        if index >= 1 && index <= names.len() {
            return Some(names[index - 1].clone());
        }
        return None;
    }
    names.iter().find(|n| n.as_str() == input).cloned()
}
