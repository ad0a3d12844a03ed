//! Duplex-stream service (spec.md §4.6): the per-connection QUIC server
//! loop — registration handshake, request dispatch, response routing, and
//! heartbeat — carried over a `quinn::Connection` (SPEC_FULL §"Transport").
//!
//! One client connection maps to one [`quinn::Connection`]. The first
//! bidirectional stream the client opens carries registration plus the
//! request/response traffic for that tunnel's whole lifetime; any further
//! bidirectional stream opened on the same connection is treated as a
//! heartbeat stream and simply echoes each probe back (spec.md §4.6
//! "Heartbeat", §6 "dedicated bidirectional heartbeat stream").

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quinn::{Connection, Endpoint, RecvStream, SendStream, ServerConfig as QuinnServerConfig};
use tracing::{info, warn};
use uuid::Uuid;

use tunnel_protocol::{
    read_frame, reply_frame, write_frame, ErrorCode, ErrorFrame, Frame, Registration, RequestFrame,
};

use crate::error::EdgeError;
use crate::registry::{Manager, MailboxMessage, RegisterRequest, Tunnel};
use crate::store::{TokenValidator, TunnelProtocol, TunnelStore};

/// Server-side endpoint accepting client connections and running the C6
/// loop for each. Holds the registry, store, and token validator it needs
/// to complete a registration handshake without reaching back into `main`.
pub struct DuplexService {
    manager: Arc<Manager>,
    store: Arc<dyn TunnelStore>,
    validator: Arc<dyn TokenValidator>,
}

impl DuplexService {
    pub fn new(
        manager: Arc<Manager>,
        store: Arc<dyn TunnelStore>,
        validator: Arc<dyn TokenValidator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            manager,
            store,
            validator,
        })
    }

    /// Binds a QUIC endpoint on `addr` with `server_config` and runs the
    /// accept loop until the process is torn down. Each accepted connection
    /// is handled on its own task so one slow/misbehaving client never
    /// blocks another's registration.
    pub async fn run(self: Arc<Self>, addr: SocketAddr, server_config: QuinnServerConfig) -> Result<(), EdgeError> {
        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| EdgeError::Internal(format!("failed to bind QUIC endpoint on {addr}: {e}")))?;
        info!(%addr, "duplex service listening");

        while let Some(incoming) = endpoint.accept().await {
            let service = self.clone();
            tokio::spawn(async move {
                let remote = incoming.remote_address();
                match incoming.await {
                    Ok(conn) => service.handle_connection(conn).await,
                    Err(e) => warn!(%remote, error = %e, "failed to establish quic connection"),
                }
            });
        }
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, conn: Connection) {
        let remote = conn.remote_address();
        loop {
            match conn.accept_bi().await {
                Ok((send, recv)) => {
                    let service = self.clone();
                    tokio::spawn(async move {
                        service.handle_stream(send, recv).await;
                    });
                }
                Err(e) => {
                    info!(%remote, error = %e, "quic connection closed");
                    break;
                }
            }
        }
    }

    /// Dispatches a freshly-opened bidirectional stream: the first one a
    /// connection opens must register; any later one is a heartbeat probe.
    async fn handle_stream(self: Arc<Self>, mut send: SendStream, mut recv: RecvStream) {
        let first_frame = match read_frame(&mut recv).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to read the opening frame of a new stream");
                return;
            }
        };

        match first_frame {
            Frame::Control(control) => match Registration::from_control_frame(&control) {
                Ok(registration) => self.handle_registration(send, recv, registration).await,
                Err(e) => {
                    warn!(error = %e, "first control frame on a new stream was not a registration");
                    let _ = send.finish();
                }
            },
            Frame::Heartbeat(probe) => {
                self.run_heartbeat_stream(send, recv, probe.tunnel_id).await;
            }
            _ => {
                warn!("first frame on a new stream was neither a registration nor a heartbeat probe");
                let _ = send.finish();
            }
        }
    }

    /// Registration handshake (spec.md §4.6 "Registration"): validates the
    /// token, infers the protocol from the public URL scheme, reactivates
    /// an offline persistent tunnel by saved name or registers a new one,
    /// then replies with the canonical public URL and runs the tunnel's
    /// writer + response-routing loop for the rest of the connection.
    async fn handle_registration(&self, mut send: SendStream, mut recv: RecvStream, registration: Registration) {
        let identity = match self.validator.validate_token(&registration.auth_token).await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "registration rejected: invalid token");
                let _ = send.finish();
                return;
            }
        };

        let protocol = match TunnelProtocol::from_public_url_scheme(&registration.public_url) {
            Some(p) => p,
            None => {
                warn!(public_url = %registration.public_url, "registration rejected: unrecognized scheme");
                let _ = send.finish();
                return;
            }
        };

        let saved_name = registration
            .saved_name
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("auto-{}", crate::ids::random_subdomain(8)));

        let org = match identity.organization_id {
            Some(org_id) => match self.store.organization_subdomain(org_id).await {
                Ok(Some(subdomain)) => Some((org_id, subdomain)),
                Ok(None) => None,
                Err(e) => {
                    warn!(error = %e, "failed to resolve organization subdomain");
                    let _ = send.finish();
                    return;
                }
            },
            None => None,
        };

        let offline = match self
            .manager
            .find_offline_by_saved_name(identity.user_id, &saved_name)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                warn!(error = %e, "failed to look up offline tunnel by saved name");
                let _ = send.finish();
                return;
            }
        };

        let outcome = match offline {
            Some(row) => self.manager.reactivate(row, registration.local_addr.clone()).await,
            None => {
                match self
                    .manager
                    .allocate_subdomain(
                        identity.user_id,
                        org.as_ref().map(|(id, s)| (*id, s.as_str())),
                        &registration.subdomain,
                    )
                    .await
                {
                    Ok((full_subdomain, _custom)) => {
                        self.manager
                            .register(RegisterRequest {
                                user_id: identity.user_id,
                                token_id: identity.token_id,
                                organization_id: org.map(|(id, _)| id),
                                subdomain: full_subdomain,
                                protocol,
                                local_addr: registration.local_addr.clone(),
                                saved_name: Some(saved_name),
                            })
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let (tunnel, request_rx) = match outcome {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "registration failed");
                let _ = send.finish();
                return;
            }
        };

        let reply = reply_frame(&tunnel.id.to_string(), &tunnel.public_url());
        if let Err(e) = write_frame(&mut send, &Frame::Control(reply)).await {
            warn!(tunnel_id = %tunnel.id, error = %e, "failed to send registration reply");
            let _ = self.manager.unregister(tunnel.id, "reply send failed").await;
            return;
        }

        info!(tunnel_id = %tunnel.id, subdomain = %tunnel.subdomain, "tunnel stream registered");

        let writer = tokio::spawn(run_writer(send, request_rx, tunnel.clone()));
        self.run_receiver(recv, tunnel.clone()).await;
        writer.abort();

        let _ = self.manager.unregister(tunnel.id, "stream closed").await;
    }

    /// Response routing (spec.md §4.6 "Response routing", "Error frames",
    /// "Teardown"): reads frames off the main stream until EOF or error,
    /// delivering each response/error to its pending mailbox. Runs until
    /// the stream closes, at which point the caller unregisters the tunnel.
    async fn run_receiver(&self, mut recv: RecvStream, tunnel: Arc<Tunnel>) {
        loop {
            match read_frame(&mut recv).await {
                Ok(Some(Frame::Response(frame))) => {
                    let request_id = frame.request_id;
                    let end_of_stream = frame.end_of_stream;
                    let delivered = tunnel
                        .deliver_response(request_id, MailboxMessage::Response(frame))
                        .await;
                    if !delivered {
                        warn!(tunnel_id = %tunnel.id, %request_id, "response frame for an unknown or closed request");
                    }
                    let _ = end_of_stream;
                    tunnel.update_activity(unix_now_ms());
                }
                Ok(Some(Frame::Error(err))) => {
                    // Propagated per spec.md §9's redesign note: close the
                    // mailbox with an error indicator instead of only logging.
                    let request_id = err.request_id;
                    let delivered = tunnel
                        .deliver_response(request_id, MailboxMessage::Error(err))
                        .await;
                    if !delivered {
                        warn!(tunnel_id = %tunnel.id, %request_id, "error frame for an unknown or closed request");
                    }
                }
                Ok(Some(Frame::Control(_))) => {
                    // A second registration-shaped frame on an already-live
                    // stream is a protocol violation; log and keep going.
                    warn!(tunnel_id = %tunnel.id, "unexpected control frame on an active tunnel stream");
                }
                Ok(Some(Frame::Heartbeat(_))) | Ok(Some(Frame::Request(_))) => {
                    warn!(tunnel_id = %tunnel.id, "unexpected frame kind on the main tunnel stream");
                }
                Ok(None) => {
                    info!(tunnel_id = %tunnel.id, "tunnel stream reached eof");
                    break;
                }
                Err(e) => {
                    warn!(tunnel_id = %tunnel.id, error = %e, "tunnel stream read error");
                    break;
                }
            }
        }
    }

    /// Dedicated heartbeat stream (spec.md §4.6, §6): echoes
    /// `{tunnel_id, server_timestamp, healthy=true}` for each probe the
    /// client sends, until the stream closes.
    async fn run_heartbeat_stream(&self, mut send: SendStream, mut recv: RecvStream, tunnel_id: Option<Uuid>) {
        loop {
            match read_frame(&mut recv).await {
                Ok(Some(Frame::Heartbeat(probe))) => {
                    let reply = Frame::Heartbeat(tunnel_protocol::HeartbeatFrame {
                        tunnel_id: probe.tunnel_id.or(tunnel_id),
                        server_timestamp_unix_ms: unix_now_ms(),
                        healthy: true,
                    });
                    if write_frame(&mut send, &reply).await.is_err() {
                        break;
                    }
                    if let Some(id) = probe.tunnel_id {
                        if let Some(tunnel) = self.manager.lookup_by_id(id) {
                            tunnel.update_activity(unix_now_ms());
                        }
                    }
                }
                Ok(Some(_)) | Ok(None) => break,
                Err(_) => break,
            }
        }
    }
}

/// Writer loop (spec.md §4.6 "Writer loop"): the single task allowed to
/// write request frames to the stream, consuming the tunnel's bounded
/// request queue. A write failure closes that request's own pending
/// mailbox and the loop continues; only queue close ends it.
async fn run_writer(mut send: SendStream, mut request_rx: tokio::sync::mpsc::Receiver<RequestFrame>, tunnel: Arc<Tunnel>) {
    while let Some(request) = request_rx.recv().await {
        let request_id = request.request_id;
        if let Err(e) = write_frame(&mut send, &Frame::Request(request)).await {
            warn!(tunnel_id = %tunnel.id, %request_id, error = %e, "failed to write a request frame");
            tunnel
                .deliver_response(
                    request_id,
                    MailboxMessage::Error(ErrorFrame {
                        request_id,
                        code: ErrorCode::Unavailable,
                        message: format!("failed to forward request to tunnel: {e}"),
                    }),
                )
                .await;
            continue;
        }
    }
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
