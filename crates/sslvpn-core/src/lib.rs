//! Data-plane of an SSL VPN gateway.
//!
//! Each connected client gets its own point-to-point TUN interface. Two
//! tasks per interface move packets between the kernel and the client's
//! session; the gateway masquerades client traffic behind its egress
//! interface with a pair of tagged iptables rules.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  inbound queue   ┌────────────┐   write    ┌──────────┐
//! │              │ ───────────────► │ write loop │ ─────────► │          │
//! │  session     │                  └────────────┘            │ tunN     │
//! │  (transport) │  OutboundDispatch ┌───────────┐   read     │ (kernel) │
//! │              │ ◄──────────────── │ read loop │ ◄───────── │          │
//! └──────────────┘                   └───────────┘            └──────────┘
//!          payloads come from and return to the shared PayloadPool
//! ```
//!
//! - [`buffer`]: pooled packet buffers
//! - [`link`]: interface setup and the forwarding loops
//! - [`firewall`]: NAT/FORWARD rule reconcile and tagged cleanup
//! - [`ipmap`]: IP/MAC reservation table
//! - [`gateway`]: startup diagnostic, NAT toggle, shutdown

pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod ipmap;
pub mod kmod;
pub mod link;
pub mod session;

// Re-exports for convenience
pub use buffer::{Payload, PayloadPool};
pub use command::{CommandRunner, SystemCommand};
pub use config::{ConfigValue, GatewayConfig, LinkMode};
pub use device::{KernelTun, TunDevice, TunProvider};
pub use error::{GatewayError, GatewayResult};
pub use firewall::{FirewallManager, Iptables, RuleTable};
pub use gateway::{Gateway, KernelGateway};
pub use ipmap::{IpMap, IpMapStore, IpMapTable, JsonIpMapStore, MacAddr};
pub use link::{LinkHandle, LinkManager, TunLink};
pub use session::{ConnSession, OutboundDispatch, SessionInfo, SessionOutbound, TunnelSession};
