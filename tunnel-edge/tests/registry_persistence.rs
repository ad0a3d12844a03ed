//! Integration tests for reconnection scenarios spanning the registry (C5),
//! the tunnel record (C3), and the port pool (C4) — spec.md §8 "Boundary
//! scenarios" #2 and #6.

use std::sync::Arc;

use tunnel_edge::config::EdgeConfig;
use tunnel_edge::events::EventBus;
use tunnel_edge::registry::{Manager, NullTcpListenerController, PortPool, RegisterRequest};
use tunnel_edge::store::{MemoryStore, TunnelProtocol, TunnelStore};
use uuid::Uuid;

async fn manager_with_ports(low: u16, high: u16) -> Arc<Manager> {
    let config = Arc::new(EdgeConfig::default());
    let store: Arc<dyn TunnelStore> = Arc::new(MemoryStore::new());
    let ports = Arc::new(PortPool::new(low, high, store.clone()));
    Manager::new(
        config,
        store,
        ports,
        Arc::new(NullTcpListenerController),
        EventBus::new(),
        false,
    )
    .await
    .unwrap()
}

/// Scenario 2: a saved-name tunnel reconnects with a different local
/// address. The second session must receive the same subdomain, the same
/// tunnel ID, and cumulative `bytes_in` carried over from before the
/// disconnect.
#[tokio::test]
async fn persistent_reconnect_preserves_identity_and_cumulative_stats() {
    let manager = manager_with_ports(21000, 21010).await;
    let user_id = Uuid::new_v4();

    let (first_custom, _) = manager
        .allocate_subdomain(user_id, None, "web-dev")
        .await
        .unwrap();
    let (tunnel, _rx) = manager
        .register(RegisterRequest {
            user_id,
            token_id: Uuid::new_v4(),
            organization_id: None,
            subdomain: first_custom.clone(),
            protocol: TunnelProtocol::Http,
            local_addr: "localhost:3000".to_string(),
            saved_name: Some("web-dev".to_string()),
        })
        .await
        .unwrap();

    let first_id = tunnel.id;
    tunnel.update_stats(512, 1024);
    manager.unregister(tunnel.id, "client disconnected").await.unwrap();

    let offline = manager
        .find_offline_by_saved_name(user_id, "web-dev")
        .await
        .unwrap()
        .expect("the disconnected tunnel row must still be offline, not deleted");
    assert_eq!(offline.bytes_in, 512);
    assert_eq!(offline.subdomain, first_custom);

    let (reconnected, _rx2) = manager
        .reactivate(offline, "localhost:3001".to_string())
        .await
        .unwrap();

    assert_eq!(reconnected.id, first_id, "reconnection must preserve the tunnel id");
    assert_eq!(reconnected.subdomain, first_custom, "reconnection must preserve the subdomain");
    assert_eq!(
        reconnected.get_stats().bytes_in,
        512,
        "cumulative bytes_in must survive the disconnect/reconnect cycle"
    );
    assert_eq!(reconnected.local_addr(), "localhost:3001");
    assert!(manager.lookup_by_subdomain(&first_custom).is_some());
}

/// Scenario 6: a named TCP tunnel holds its port across a disconnect; an
/// unrelated tunnel must not receive it, and the same named tunnel
/// reconnecting reacquires the exact port.
#[tokio::test]
async fn tcp_port_persists_across_disconnect_and_is_withheld_from_others() {
    let manager = manager_with_ports(22000, 22001).await;
    let user_id = Uuid::new_v4();

    let (subdomain, _) = manager.allocate_subdomain(user_id, None, "shell").await.unwrap();
    let (tunnel, _rx) = manager
        .register(RegisterRequest {
            user_id,
            token_id: Uuid::new_v4(),
            organization_id: None,
            subdomain,
            protocol: TunnelProtocol::Tcp,
            local_addr: "localhost:22".to_string(),
            saved_name: Some("ssh-box".to_string()),
        })
        .await
        .unwrap();
    let held_port = tunnel.port().expect("tcp tunnels always carry an allocated port");

    manager.unregister(tunnel.id, "client disconnected").await.unwrap();

    // A second, unrelated user's TCP tunnel must not receive the held port —
    // only one other port exists in this pool's range, so it gets that one.
    let other_user = Uuid::new_v4();
    let (other_subdomain, _) = manager.allocate_subdomain(other_user, None, "other").await.unwrap();
    let (other_tunnel, _rx3) = manager
        .register(RegisterRequest {
            user_id: other_user,
            token_id: Uuid::new_v4(),
            organization_id: None,
            subdomain: other_subdomain,
            protocol: TunnelProtocol::Tcp,
            local_addr: "localhost:9999".to_string(),
            saved_name: None,
        })
        .await
        .unwrap();
    assert_ne!(other_tunnel.port(), Some(held_port));

    let offline = manager
        .find_offline_by_saved_name(user_id, "ssh-box")
        .await
        .unwrap()
        .expect("the named tcp tunnel must still be offline with its port reservation intact");
    assert_eq!(offline.remote_port, Some(held_port));

    let (reconnected, _rx2) = manager.reactivate(offline, "localhost:22".to_string()).await.unwrap();
    assert_eq!(reconnected.port(), Some(held_port));
}
