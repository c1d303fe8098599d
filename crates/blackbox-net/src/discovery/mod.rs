mod client;
mod server;

pub use client::{DiscoveryParams, ServerEndpoint, client_start};
pub use server::{DiscoveryServer, PendingConnection, ResponseKind};
