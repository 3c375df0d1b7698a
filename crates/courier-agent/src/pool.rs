//! Multi-endpoint LLM pool with parallel startup probing, sticky failover
//! and background primary recovery.
//!
//! Scheduling rules:
//! - endpoints are tried in a round starting at the current one, each at
//!   most once per call; the first success wins and becomes current
//! - a success on a lower-priority endpoint sticks — priority is not
//!   re-asserted per request, which keeps a flapping primary from thrashing
//! - while current is not the primary, an out-of-band recovery probe runs
//!   at most every `recovery_interval`; success flips current back
//! - three consecutive failures mark an endpoint unhealthy (probing can
//!   revive it); health only affects probe selection, not the dispatch
//!   round, which always tries every endpoint once before giving up

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use courier_core::config::EndpointEntry;

use crate::endpoint::{EndpointKind, EndpointSnapshot, LlmEndpoint};
use crate::error::PoolError;
use crate::protocol::{MessagesRequest, MessagesResponse};
use crate::wire::{NativeClient, OpenAiCompatClient, WireClient};

/// Consecutive failures before an endpoint is flagged unhealthy.
const FAIL_THRESHOLD: u32 = 3;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub recovery_probe_timeout: Duration,
    pub recovery_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(15),
            recovery_probe_timeout: Duration::from_secs(10),
            recovery_interval: Duration::from_secs(60),
        }
    }
}

struct Pinned {
    index: usize,
    expires_at: Instant,
}

struct PoolState {
    endpoints: Vec<LlmEndpoint>,
    clients: Vec<Arc<dyn WireClient>>,
    current: usize,
    recovery_in_flight: bool,
    pinned: Option<Pinned>,
}

pub struct EndpointPool {
    state: Mutex<PoolState>,
    config: PoolConfig,
}

impl EndpointPool {
    /// Build the pool from config entries. Entries without credentials are
    /// skipped; at least one usable endpoint is required.
    pub fn from_config(entries: &[EndpointEntry]) -> Result<Arc<Self>, PoolError> {
        let mut slots: Vec<(LlmEndpoint, Arc<dyn WireClient>)> = Vec::new();
        for entry in entries {
            let Some(endpoint) = LlmEndpoint::from_entry(entry) else {
                warn!(endpoint = %entry.name, "skipping endpoint without credentials");
                continue;
            };
            let client: Arc<dyn WireClient> = match endpoint.kind {
                EndpointKind::Native => Arc::new(NativeClient::new(
                    endpoint.base_url.clone(),
                    endpoint.api_key.clone(),
                    entry.extras.clone(),
                )),
                EndpointKind::OpenAiCompat => Arc::new(OpenAiCompatClient::new(
                    endpoint.base_url.clone(),
                    endpoint.api_key.clone(),
                    entry.extras.clone(),
                )),
            };
            slots.push((endpoint, client));
        }
        Self::with_clients(slots, PoolConfig::default())
    }

    /// Build from pre-constructed wire clients. Public for tests and
    /// embedders with custom transports.
    pub fn with_clients(
        mut slots: Vec<(LlmEndpoint, Arc<dyn WireClient>)>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, PoolError> {
        if slots.is_empty() {
            return Err(PoolError::NoEndpoints);
        }
        slots.sort_by_key(|(ep, _)| ep.priority);

        let (endpoints, clients): (Vec<_>, Vec<_>) = slots.into_iter().unzip();
        for ep in &endpoints {
            info!(endpoint = %ep.name, model = %ep.model, priority = ep.priority, "pool endpoint");
        }

        Ok(Arc::new(Self {
            state: Mutex::new(PoolState {
                endpoints,
                clients,
                current: 0,
                recovery_in_flight: false,
                pinned: None,
            }),
            config,
        }))
    }

    /// Probe every endpoint in parallel and pick the best healthy one as
    /// current. Called once at startup; if everything fails the pool still
    /// serves from the first endpoint and relies on lazy re-probing.
    pub async fn probe_all(&self) {
        let probes: Vec<(usize, String, Arc<dyn WireClient>, String)> = {
            let state = self.state.lock().unwrap();
            state
                .endpoints
                .iter()
                .enumerate()
                .map(|(i, ep)| (i, ep.name.clone(), state.clients[i].clone(), ep.model.clone()))
                .collect()
        };

        info!(count = probes.len(), "startup health probe");
        let timeout = self.config.probe_timeout;
        let results = join_all(probes.into_iter().map(|(i, name, client, model)| async move {
            let outcome = client.send(&model, &MessagesRequest::probe(), timeout).await;
            (i, name, outcome.map(|_| ()))
        }))
        .await;

        let mut state = self.state.lock().unwrap();
        for (i, name, outcome) in results {
            let ep = &mut state.endpoints[i];
            ep.last_probe = Some(Instant::now());
            match outcome {
                Ok(()) => {
                    ep.healthy = true;
                    ep.fail_count = 0;
                    info!(endpoint = %name, "probe ok");
                }
                Err(e) => {
                    ep.healthy = false;
                    ep.fail_count = FAIL_THRESHOLD;
                    warn!(endpoint = %name, err = %e, "probe failed");
                }
            }
        }

        state.current = state
            .endpoints
            .iter()
            .position(|ep| ep.healthy)
            .unwrap_or(0);
        let chosen = &state.endpoints[state.current];
        info!(endpoint = %chosen.name, model = %chosen.model, "current endpoint selected");
    }

    /// Send one request, failing over across endpoints within the call.
    ///
    /// Exactly one endpoint is charged a success per successful call; every
    /// endpoint attempted before it is charged a failure.
    pub async fn messages_create(
        self: &Arc<Self>,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, PoolError> {
        self.maybe_recover_primary();

        let plan: Vec<(usize, String, String, Arc<dyn WireClient>)> = {
            let mut state = self.state.lock().unwrap();
            let len = state.endpoints.len();
            let start = state.start_index();
            (0..len)
                .map(|offset| {
                    let i = (start + offset) % len;
                    let ep = &state.endpoints[i];
                    (i, ep.name.clone(), ep.model.clone(), state.clients[i].clone())
                })
                .collect()
        };

        let mut last_error = String::from("no endpoints attempted");
        for (index, name, model, client) in plan {
            debug!(endpoint = %name, model = %model, "dispatching request");
            match client.send(&model, req, self.config.request_timeout).await {
                Ok(resp) => {
                    let mut state = self.state.lock().unwrap();
                    let ep = &mut state.endpoints[index];
                    ep.healthy = true;
                    ep.fail_count = 0;
                    ep.requests_ok += 1;
                    if state.current != index {
                        info!(endpoint = %name, "switching current endpoint");
                        state.current = index;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    warn!(endpoint = %name, err = %e, "request failed, trying next endpoint");
                    last_error = format!("{name}: {e}");
                    let mut state = self.state.lock().unwrap();
                    let ep = &mut state.endpoints[index];
                    ep.fail_count += 1;
                    ep.requests_err += 1;
                    if ep.fail_count >= FAIL_THRESHOLD && ep.healthy {
                        warn!(endpoint = %name, fails = ep.fail_count, "endpoint marked unhealthy");
                        ep.healthy = false;
                    }
                }
            }
        }

        Err(PoolError::AllEndpointsFailed { last: last_error })
    }

    /// While serving from a backup, occasionally probe the primary in the
    /// background; a successful probe flips current back to it. Never
    /// blocks the in-flight request. At most one probe runs at a time.
    fn maybe_recover_primary(self: &Arc<Self>) {
        let probe: Option<(Arc<dyn WireClient>, String)> = {
            let mut state = self.state.lock().unwrap();
            if state.current == 0 || state.recovery_in_flight {
                return;
            }
            if state.pinned_index().is_some() {
                return;
            }
            let primary = &state.endpoints[0];
            let due = match primary.last_probe {
                Some(at) => at.elapsed() >= self.config.recovery_interval,
                None => true,
            };
            if !due {
                return;
            }
            state.recovery_in_flight = true;
            Some((state.clients[0].clone(), state.endpoints[0].model.clone()))
        };

        let Some((client, model)) = probe else { return };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            debug!("recovery probe to primary endpoint");
            let outcome = client
                .send(&model, &MessagesRequest::probe(), pool.config.recovery_probe_timeout)
                .await;

            let mut state = pool.state.lock().unwrap();
            state.endpoints[0].last_probe = Some(Instant::now());
            state.recovery_in_flight = false;
            match outcome {
                Ok(_) => {
                    info!("primary endpoint recovered, switching back");
                    state.endpoints[0].healthy = true;
                    state.endpoints[0].fail_count = 0;
                    state.current = 0;
                }
                Err(e) => {
                    debug!(err = %e, "primary endpoint still down");
                }
            }
        });
    }

    // -----------------------------------------------------------------------
    // Control surface for the command interceptor and status displays
    // -----------------------------------------------------------------------

    /// Temporarily pin dispatch to one endpoint. Expires after `ttl`.
    pub fn pin(&self, name: &str, ttl: Duration) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap();
        let index = state
            .endpoints
            .iter()
            .position(|ep| ep.name == name)
            .ok_or_else(|| PoolError::UnknownEndpoint(name.to_string()))?;
        info!(endpoint = %name, ttl_secs = ttl.as_secs(), "pinning endpoint");
        state.pinned = Some(Pinned {
            index,
            expires_at: Instant::now() + ttl,
        });
        Ok(())
    }

    /// Clear a temporary pin. Returns whether one was active.
    pub fn clear_pin(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.pinned.take().is_some()
    }

    pub fn pinned_endpoint(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let index = state.pinned_index()?;
        Some(state.endpoints[index].name.clone())
    }

    /// Apply a new priority ordering. `names` must be a permutation of all
    /// endpoint names; position becomes the new priority. Clears any pin
    /// and resets current to the first healthy endpoint.
    pub fn set_priority_order(&self, names: &[String]) -> Result<(), PoolError> {
        let mut state = self.state.lock().unwrap();
        if names.len() != state.endpoints.len() {
            return Err(PoolError::InvalidPriorityOrder(format!(
                "expected {} names, got {}",
                state.endpoints.len(),
                names.len()
            )));
        }

        let mut order = Vec::with_capacity(names.len());
        for name in names {
            let index = state
                .endpoints
                .iter()
                .position(|ep| &ep.name == name)
                .ok_or_else(|| PoolError::UnknownEndpoint(name.clone()))?;
            if order.contains(&index) {
                return Err(PoolError::InvalidPriorityOrder(format!(
                    "duplicate name: {name}"
                )));
            }
            order.push(index);
        }

        let mut endpoints = Vec::with_capacity(order.len());
        let mut clients = Vec::with_capacity(order.len());
        for (new_priority, &old_index) in order.iter().enumerate() {
            let mut ep = state.endpoints[old_index].clone();
            ep.priority = new_priority as u32;
            endpoints.push(ep);
            clients.push(state.clients[old_index].clone());
        }

        state.endpoints = endpoints;
        state.clients = clients;
        state.pinned = None;
        state.current = state
            .endpoints
            .iter()
            .position(|ep| ep.healthy)
            .unwrap_or(0);
        info!(order = ?names, "priority order updated");
        Ok(())
    }

    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let mut state = self.state.lock().unwrap();
        let pinned = state.pinned_index();
        let current = state.current;
        state
            .endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| EndpointSnapshot {
                name: ep.name.clone(),
                model: ep.model.clone(),
                priority: ep.priority,
                healthy: ep.healthy,
                current: i == current,
                pinned: Some(i) == pinned,
                requests_ok: ep.requests_ok,
                requests_err: ep.requests_err,
            })
            .collect()
    }

    /// Names in current priority order.
    pub fn endpoint_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.endpoints.iter().map(|ep| ep.name.clone()).collect()
    }

    pub fn current_endpoint(&self) -> String {
        let state = self.state.lock().unwrap();
        state.endpoints[state.current].name.clone()
    }
}

impl PoolState {
    /// Where a dispatch round starts: a live pin wins, else current.
    fn start_index(&mut self) -> usize {
        self.pinned_index().unwrap_or(self.current)
    }

    /// Index of the pinned endpoint, dropping an expired pin lazily.
    fn pinned_index(&mut self) -> Option<usize> {
        match &self.pinned {
            Some(pin) if pin.expires_at > Instant::now() => Some(pin.index),
            Some(_) => {
                debug!("endpoint pin expired");
                self.pinned = None;
                None
            }
            None => None,
        }
    }
}
