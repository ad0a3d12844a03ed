//! Integration test for the webhook router (C9) fanning a broadcast out
//! across the registry (C5) — spec.md §8 "Boundary scenarios" #4, adapted so
//! the failing route fails immediately (tunnel never registered) rather than
//! exercising the full 30s dispatch deadline, which would make this test
//! slow without adding coverage beyond what `webhook::tests` already proves
//! about the circuit-breaker's own timing.

use std::sync::Arc;

use tunnel_edge::config::EdgeConfig;
use tunnel_edge::events::EventBus;
use tunnel_edge::registry::{Manager, MailboxMessage, NullTcpListenerController, PortPool, RegisterRequest};
use tunnel_edge::store::{MemoryStore, RouteHealth, TunnelProtocol, TunnelStore, WebhookAppRow, WebhookRouteRow};
use tunnel_edge::webhook::WebhookRouter;
use tunnel_protocol::{HeaderMultiMap, HttpPayload, Payload, ResponseFrame};
use uuid::Uuid;

#[tokio::test]
async fn broadcast_reports_partial_success_with_first_successful_body() {
    let memory_store = Arc::new(MemoryStore::new());
    let store: Arc<dyn TunnelStore> = memory_store.clone();

    let config = Arc::new(EdgeConfig::default());
    let ports = Arc::new(PortPool::new(23000, 23010, store.clone()));
    let events = EventBus::new();
    let manager = Manager::new(
        config,
        store.clone(),
        ports,
        Arc::new(NullTcpListenerController),
        events.clone(),
        false,
    )
    .await
    .unwrap();

    let user_id = Uuid::new_v4();
    let (subdomain, _) = manager.allocate_subdomain(user_id, None, "worker").await.unwrap();
    let (healthy_tunnel, mut request_rx) = manager
        .register(RegisterRequest {
            user_id,
            token_id: Uuid::new_v4(),
            organization_id: None,
            subdomain,
            protocol: TunnelProtocol::Http,
            local_addr: "localhost:4000".to_string(),
            saved_name: None,
        })
        .await
        .unwrap();

    // Stand in for the connected client: answer every request this tunnel
    // receives with a single 200 "OK" response frame.
    let responder_tunnel = healthy_tunnel.clone();
    tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            let Payload::Http(_) = &request.payload else { continue };
            let response = ResponseFrame {
                request_id: request.request_id,
                tunnel_id: request.tunnel_id,
                payload: Payload::Http(HttpPayload {
                    method: String::new(),
                    path: String::new(),
                    query: String::new(),
                    headers: HeaderMultiMap::new(),
                    body: b"OK".to_vec(),
                    remote_addr: String::new(),
                    status: Some(200),
                }),
                end_of_stream: true,
            };
            responder_tunnel
                .deliver_response(request.request_id, MailboxMessage::Response(response))
                .await;
        }
    });

    // The second route points at a tunnel ID that never registered — its
    // dispatch fails immediately with "tunnel is not active", giving the
    // partial-failure shape the assertions below check for.
    let failing_tunnel_id = Uuid::new_v4();
    let app_id = Uuid::new_v4();
    memory_store.seed_webhook_app(
        "acme",
        WebhookAppRow {
            id: app_id,
            organization_id: Uuid::new_v4(),
            user_id,
            name: "relay".to_string(),
            is_active: true,
        },
        vec![
            WebhookRouteRow {
                id: Uuid::new_v4(),
                webhook_app_id: app_id,
                tunnel_id: healthy_tunnel.id,
                priority: 0,
                is_enabled: true,
                health_status: RouteHealth::Healthy,
                failure_count: 0,
            },
            WebhookRouteRow {
                id: Uuid::new_v4(),
                webhook_app_id: app_id,
                tunnel_id: failing_tunnel_id,
                priority: 1,
                is_enabled: true,
                health_status: RouteHealth::Healthy,
                failure_count: 0,
            },
        ],
    );

    let webhook = WebhookRouter::new(store, manager, events, "tunnel.dev".to_string());
    let payload = HttpPayload::request("GET", "/", "", HeaderMultiMap::new(), Vec::new(), "1.2.3.4");
    let result = webhook.broadcast("acme", "relay", payload).await.unwrap();

    assert_eq!(result.responses.len(), 2);
    assert!(result.first_success.is_some(), "the healthy tunnel's response must win");
    let winner = &result.responses[result.first_success.unwrap()];
    assert!(winner.success);
    assert_eq!(winner.body, b"OK".to_vec());
    assert!(
        result.responses.iter().any(|r| !r.success),
        "the unregistered tunnel's route must fail"
    );
}
