//! Network layer for parley: WebSocket connection gateway, per-room presence
//! broadcast, the room membership coordinator, and the RPC surface.

pub mod client;
pub mod coordinator;
pub mod handlers;
pub mod presence;
pub mod rpc;
pub mod server;

pub use coordinator::{RoomCoordinator, SwitchOutcome};
pub use presence::PresenceBroadcaster;
pub use server::{start, ServerConfig, ServerHandle};
