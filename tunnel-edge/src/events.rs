//! Event bus (spec.md §4.10): fan-out of tunnel and webhook lifecycle
//! events to subscribers, with panic isolation and a per-handler timeout.
//! Emission snapshots the subscriber list under a read lock, releases it,
//! then dispatches each handler on its own task — no ordering guarantee
//! between handlers (spec.md §5).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::registry::tunnel::TunnelStats;

const HANDLER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum TunnelEvent {
    Connected(TunnelStats),
    Disconnected { tunnel_id: Uuid, reason: String },
    StatsUpdated(TunnelStats),
}

#[derive(Debug, Clone)]
pub struct BroadcastOutcome {
    pub tunnel_id: Uuid,
    pub success: bool,
}

#[derive(Debug, Clone)]
pub enum WebhookEvent {
    Broadcast {
        webhook_app_id: Uuid,
        success: bool,
        outcomes: Vec<BroadcastOutcome>,
    },
}

type TunnelHandler = Arc<dyn Fn(TunnelEvent) -> BoxFuture + Send + Sync>;
type WebhookHandler = Arc<dyn Fn(WebhookEvent) -> BoxFuture + Send + Sync>;
type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Subscriber list + dispatch for both event streams. `Clone`d freely
/// (cheap `Arc` internals) so every component holding a handle shares one
/// subscriber registry.
#[derive(Clone, Default)]
pub struct EventBus {
    tunnel_subscribers: Arc<RwLock<Vec<TunnelHandler>>>,
    webhook_subscribers: Arc<RwLock<Vec<WebhookHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tunnel_event<F, Fut>(&self, handler: F)
    where
        F: Fn(TunnelEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tunnel_subscribers
            .write()
            .push(Arc::new(move |ev| Box::pin(handler(ev))));
    }

    pub fn on_webhook_event<F, Fut>(&self, handler: F)
    where
        F: Fn(WebhookEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.webhook_subscribers
            .write()
            .push(Arc::new(move |ev| Box::pin(handler(ev))));
    }

    pub fn emit_tunnel(&self, event: TunnelEvent) {
        let subscribers = self.tunnel_subscribers.read().clone();
        for handler in subscribers {
            let event = event.clone();
            tokio::spawn(async move {
                dispatch("tunnel", handler(event)).await;
            });
        }
    }

    pub fn emit_webhook(&self, event: WebhookEvent) {
        let subscribers = self.webhook_subscribers.read().clone();
        for handler in subscribers {
            let event = event.clone();
            tokio::spawn(async move {
                dispatch("webhook", handler(event)).await;
            });
        }
    }
}

/// Runs one handler invocation with a deadline and panic isolation —
/// a handler panicking or hanging must never affect the emitting caller
/// (spec.md §4.9 "Event handlers").
async fn dispatch(stream: &'static str, fut: BoxFuture) {
    let guarded = std::panic::AssertUnwindSafe(fut).catch_unwind();
    match timeout(HANDLER_TIMEOUT, guarded).await {
        Ok(Ok(())) => {}
        Ok(Err(_panic)) => warn!(stream, "event handler panicked"),
        Err(_elapsed) => warn!(stream, "event handler exceeded its deadline"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn dispatches_to_all_subscribers() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.on_tunnel_event(move |_ev| {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        bus.emit_tunnel(TunnelEvent::Disconnected {
            tunnel_id: Uuid::new_v4(),
            reason: "test".into(),
        });
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn a_panicking_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        bus.on_tunnel_event(|_ev| async move {
            panic!("boom");
        });
        let ran2 = ran.clone();
        bus.on_tunnel_event(move |_ev| {
            let ran2 = ran2.clone();
            async move {
                ran2.fetch_add(1, Ordering::SeqCst);
            }
        });
        bus.emit_tunnel(TunnelEvent::Disconnected {
            tunnel_id: Uuid::new_v4(),
            reason: "test".into(),
        });
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
