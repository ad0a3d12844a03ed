//! Tunnel registry: the in-memory [`tunnel::Tunnel`] record (C3), the
//! [`port_pool::PortPool`] (C4), and the [`manager::Manager`] that ties
//! them to persistent storage (C5).

pub mod manager;
pub mod port_pool;
pub mod tunnel;

pub use manager::{Manager, NullTcpListenerController, RegisterRequest, TcpListenerController};
pub use port_pool::PortPool;
pub use tunnel::{MailboxKind, MailboxMessage, Tunnel, TunnelStats, TunnelStatus};
