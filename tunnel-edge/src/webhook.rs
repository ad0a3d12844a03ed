//! Webhook router (spec.md §4.9): subdomain parsing, the route cache, the
//! per-tunnel circuit breaker, and the bounded-worker-pool broadcast that
//! fans one inbound request out to every enabled route of an app.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use tunnel_protocol::{HttpPayload, Payload, RequestFrame};

use crate::error::EdgeError;
use crate::events::{BroadcastOutcome as EventOutcome, EventBus, WebhookEvent};
use crate::registry::{MailboxKind, Manager};
use crate::store::{unix_now, RouteHealth, TunnelStore, WebhookEventRow, WebhookRouteRow};

const ROUTE_CACHE_TTL: Duration = Duration::from_secs(30);
const POSITIVE_RESOLVE_CACHE_TTL: Duration = Duration::from_secs(300);
const BROADCAST_WORKER_PERMITS: usize = 10;
const BROADCAST_DEADLINE: Duration = Duration::from_secs(30);
const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);
const CIRCUIT_HALF_OPEN_SUCCESSES: u32 = 2;

// ── Circuit breaker ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

/// Per-tunnel circuit breaker (spec.md §4.9). Opens after 5 consecutive
/// failures, stays open for a 30s cooldown, then allows one trial request;
/// 2 consecutive successes in the half-open trial state close it again.
pub struct CircuitBreaker {
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }
}

impl CircuitBreaker {
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn can_attempt(&self) -> bool {
        let inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => inner
                .opened_at
                .map(|at| at.elapsed() >= CIRCUIT_COOLDOWN)
                .unwrap_or(false),
        }
    }

    pub fn record(&self, success: bool) {
        let mut inner = self.inner.lock();
        match (inner.state, success) {
            (CircuitState::Closed, true) => {
                inner.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    inner.consecutive_failures = 0;
                }
            }
            (CircuitState::Open, true) => {
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 1;
            }
            (CircuitState::Open, false) => {
                // Stays open; restart the cooldown for the next trial.
                inner.opened_at = Some(Instant::now());
            }
            (CircuitState::HalfOpen, true) => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= CIRCUIT_HALF_OPEN_SUCCESSES {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                }
            }
            (CircuitState::HalfOpen, false) => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                inner.consecutive_failures = 0;
            }
        }
    }
}

// ── Route cache ──────────────────────────────────────────────────────────

struct CachedRoutes {
    app_id: Uuid,
    routes: Vec<WebhookRouteRow>,
    fetched_at: Instant,
}

struct ResolvedHost {
    org_subdomain: String,
    app_name: String,
    resolved_at: Instant,
}

/// Fans a single inbound webhook request out across an app's enabled
/// routes, respecting each tunnel's circuit breaker and a bounded worker
/// pool so a bursty fan-out cannot exhaust memory (spec.md §4.9, §5).
pub struct WebhookRouter {
    store: Arc<dyn TunnelStore>,
    manager: Arc<Manager>,
    events: EventBus,
    base_domain: String,
    route_cache: DashMap<(String, String), CachedRoutes>,
    resolve_cache: DashMap<String, ResolvedHost>,
    breakers: DashMap<Uuid, Arc<CircuitBreaker>>,
    permits: Arc<Semaphore>,
}

#[derive(Debug, Clone)]
pub struct TunnelResponse {
    pub tunnel_id: Uuid,
    pub success: bool,
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BroadcastResult {
    pub webhook_app_id: Uuid,
    pub responses: Vec<TunnelResponse>,
    pub first_success: Option<usize>,
}

impl WebhookRouter {
    pub fn new(store: Arc<dyn TunnelStore>, manager: Arc<Manager>, events: EventBus, base_domain: String) -> Self {
        Self {
            store,
            manager,
            events,
            base_domain,
            route_cache: DashMap::new(),
            resolve_cache: DashMap::new(),
            breakers: DashMap::new(),
            permits: Arc::new(Semaphore::new(BROADCAST_WORKER_PERMITS)),
        }
    }

    fn subdomain_label(host: &str) -> Option<&str> {
        host.split(':').next()?.split('.').next()
    }

    /// `true` iff the request's Host subdomain label ends in `-webhook`.
    pub fn is_webhook_request(host: &str) -> bool {
        Self::subdomain_label(host)
            .map(|label| label.ends_with("-webhook"))
            .unwrap_or(false)
    }

    /// Strips the `-webhook` suffix, resolves the remaining
    /// `{app_name}-{org_subdomain}` composite against storage (trying each
    /// hyphen split point), and returns `(org_subdomain, app_name,
    /// user_path)`. Positive resolutions are cached for 5 minutes.
    pub async fn extract_components(
        &self,
        host: &str,
        path: &str,
    ) -> Result<(String, String, String), EdgeError> {
        let label = Self::subdomain_label(host)
            .ok_or_else(|| EdgeError::InvalidArgument("missing host".into()))?;
        let composite = label
            .strip_suffix("-webhook")
            .ok_or_else(|| EdgeError::InvalidArgument("not a webhook host".into()))?;

        if let Some(cached) = self.resolve_cache.get(composite) {
            if cached.resolved_at.elapsed() < POSITIVE_RESOLVE_CACHE_TTL {
                let user_path = if path.is_empty() { "/".to_string() } else { path.to_string() };
                return Ok((cached.org_subdomain.clone(), cached.app_name.clone(), user_path));
            }
        }

        let parts: Vec<&str> = composite.split('-').collect();
        if parts.len() < 2 {
            return Err(EdgeError::InvalidArgument(format!(
                "webhook host {host} does not encode an app and organization"
            )));
        }
        for split in 1..parts.len() {
            let app_name = parts[..split].join("-");
            let org_subdomain = parts[split..].join("-");
            if self
                .store
                .find_webhook_app(&org_subdomain, &app_name)
                .await
                .map_err(|e| EdgeError::Internal(e.to_string()))?
                .is_some()
            {
                self.resolve_cache.insert(
                    composite.to_string(),
                    ResolvedHost {
                        org_subdomain: org_subdomain.clone(),
                        app_name: app_name.clone(),
                        resolved_at: Instant::now(),
                    },
                );
                let user_path = if path.is_empty() { "/".to_string() } else { path.to_string() };
                return Ok((org_subdomain, app_name, user_path));
            }
        }
        Err(EdgeError::Unavailable(format!("unknown webhook app for host {host}")))
    }

    async fn load_routes(&self, org_subdomain: &str, app_name: &str) -> Result<(Uuid, Vec<WebhookRouteRow>), EdgeError> {
        let key = (org_subdomain.to_string(), app_name.to_string());
        if let Some(cached) = self.route_cache.get(&key) {
            if cached.fetched_at.elapsed() < ROUTE_CACHE_TTL {
                return Ok((cached.app_id, cached.routes.clone()));
            }
        }
        let app = self
            .store
            .find_webhook_app(org_subdomain, app_name)
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))?
            .ok_or_else(|| EdgeError::Unavailable(format!("unknown webhook app {app_name}")))?;
        let mut routes = self
            .store
            .list_webhook_routes(app.id)
            .await
            .map_err(|e| EdgeError::Internal(e.to_string()))?;
        routes.sort_by_key(|r| r.priority);
        self.route_cache.insert(
            key,
            CachedRoutes {
                app_id: app.id,
                routes: routes.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok((app.id, routes))
    }

    fn breaker_for(&self, tunnel_id: Uuid) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(tunnel_id)
            .or_insert_with(|| Arc::new(CircuitBreaker::default()))
            .clone()
    }

    pub fn circuit_state(&self, tunnel_id: Uuid) -> CircuitState {
        self.breaker_for(tunnel_id).state()
    }

    /// Fans `payload` out to every enabled, non-unhealthy route of
    /// `{app_name}@{org_subdomain}`, in parallel bounded by a 10-permit
    /// semaphore, and aggregates the outcomes.
    pub async fn broadcast(
        &self,
        org_subdomain: &str,
        app_name: &str,
        payload: HttpPayload,
    ) -> Result<BroadcastResult, EdgeError> {
        let (app_id, routes) = self.load_routes(org_subdomain, app_name).await?;
        let selected: Vec<WebhookRouteRow> = routes
            .into_iter()
            .filter(|r| r.is_enabled && r.health_status != RouteHealth::Unhealthy)
            .collect();
        if selected.is_empty() {
            return Err(EdgeError::Unavailable("no healthy tunnels for this app".into()));
        }

        let mut handles = Vec::with_capacity(selected.len());
        for route in selected {
            let permits = self.permits.clone();
            let manager = self.manager.clone();
            let breaker = self.breaker_for(route.tunnel_id);
            let store = self.store.clone();
            let payload = payload.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore is never closed");
                dispatch_one(manager, store, breaker, route, payload).await
            }));
        }

        let mut responses = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(response) => responses.push(response),
                Err(e) => warn!(error = %e, "webhook dispatch task panicked"),
            }
        }

        let first_success = responses.iter().position(|r| r.success);
        let any_success = first_success.is_some();

        let event_outcomes: Vec<EventOutcome> = responses
            .iter()
            .map(|r| EventOutcome {
                tunnel_id: r.tunnel_id,
                success: r.success,
            })
            .collect();
        let success_count = event_outcomes.iter().filter(|o| o.success).count() as u32;

        let _ = self
            .store
            .insert_webhook_event(WebhookEventRow {
                id: Uuid::new_v4(),
                webhook_app_id: app_id,
                success: any_success,
                tunnel_count: responses.len() as u32,
                success_count,
                created_at: unix_now(),
            })
            .await;

        self.events.emit_webhook(WebhookEvent::Broadcast {
            webhook_app_id: app_id,
            success: any_success,
            outcomes: event_outcomes,
        });

        Ok(BroadcastResult {
            webhook_app_id: app_id,
            responses,
            first_success,
        })
    }
}

async fn dispatch_one(
    manager: Arc<Manager>,
    store: Arc<dyn TunnelStore>,
    breaker: Arc<CircuitBreaker>,
    route: WebhookRouteRow,
    payload: HttpPayload,
) -> TunnelResponse {
    if !breaker.can_attempt() {
        return TunnelResponse {
            tunnel_id: route.tunnel_id,
            success: false,
            status: None,
            headers: Vec::new(),
            body: Vec::new(),
            error: Some("circuit breaker open".to_string()),
        };
    }

    let outcome = dispatch_via_tunnel(&manager, route.tunnel_id, payload).await;
    // A dispatch that reaches the tunnel but comes back as e.g. HTTP 500 is
    // still a failed delivery for breaker/route-health purposes, not merely
    // a transport failure — both must agree with `TunnelResponse.success`.
    let success = outcome.as_ref().map(|r| r.success).unwrap_or(false);
    breaker.record(success);
    let _ = store
        .update_route_health(
            route.id,
            if success { RouteHealth::Healthy } else { RouteHealth::Unhealthy },
            if success { 0 } else { route.failure_count + 1 },
        )
        .await;

    match outcome {
        Ok(response) => response,
        Err(message) => TunnelResponse {
            tunnel_id: route.tunnel_id,
            success: false,
            status: None,
            headers: Vec::new(),
            body: Vec::new(),
            error: Some(message),
        },
    }
}

/// Sends one request frame to a tunnel via the shared request-queue path
/// (the only correct path per spec.md §9 — never a side-channel direct
/// send) and awaits a single response within the broadcast deadline.
async fn dispatch_via_tunnel(
    manager: &Arc<Manager>,
    tunnel_id: Uuid,
    payload: HttpPayload,
) -> Result<TunnelResponse, String> {
    let tunnel = manager
        .lookup_by_id(tunnel_id)
        .ok_or_else(|| "tunnel is not active".to_string())?;

    let request_id = Uuid::new_v4();
    let mut rx = tunnel.register_pending(request_id, MailboxKind::Http, 4);
    let frame = RequestFrame {
        request_id,
        tunnel_id,
        payload: Payload::Http(payload),
    };
    if tunnel.enqueue_request(frame).await.is_err() {
        tunnel.remove_pending(request_id, MailboxKind::Http);
        return Err("failed to enqueue request on tunnel".to_string());
    }

    let result = timeout(BROADCAST_DEADLINE, rx.recv()).await;
    tunnel.remove_pending(request_id, MailboxKind::Http);

    match result {
        Ok(Some(crate::registry::MailboxMessage::Response(frame))) => {
            if let Payload::Http(http) = frame.payload {
                Ok(TunnelResponse {
                    tunnel_id,
                    success: http.status.map(|s| s < 500).unwrap_or(true),
                    status: http.status,
                    headers: http.headers.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                    body: http.body,
                    error: None,
                })
            } else {
                Err("tunnel returned a non-HTTP payload for a webhook request".to_string())
            }
        }
        Ok(Some(crate::registry::MailboxMessage::Error(err))) => Err(err.message),
        Ok(None) => Err("tunnel closed the response mailbox".to_string()),
        Err(_elapsed) => Err("tunnel dispatch timed out".to_string()),
    }
}

/// Convenience lookup table some callers (e.g. a JSON audit export) may
/// want without importing the store row type directly.
pub type HeaderList = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_webhook_request_matches_suffix() {
        assert!(WebhookRouter::is_webhook_request("myapp-acme-webhook.tunnel.dev"));
        assert!(!WebhookRouter::is_webhook_request("myapp.tunnel.dev"));
    }

    #[test]
    fn circuit_opens_after_five_consecutive_failures() {
        let breaker = CircuitBreaker::default();
        for _ in 0..4 {
            breaker.record(false);
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn half_open_needs_two_consecutive_successes_to_close() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            breaker.record(false);
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        // Force the cooldown to have elapsed.
        {
            let mut inner = breaker.inner.lock();
            inner.opened_at = Some(Instant::now() - CIRCUIT_COOLDOWN - Duration::from_secs(1));
        }
        assert!(breaker.can_attempt());
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn failure_in_half_open_reopens() {
        let breaker = CircuitBreaker::default();
        for _ in 0..5 {
            breaker.record(false);
        }
        {
            let mut inner = breaker.inner.lock();
            inner.opened_at = Some(Instant::now() - CIRCUIT_COOLDOWN - Duration::from_secs(1));
        }
        breaker.record(true);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record(false);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
