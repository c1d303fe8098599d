mod client;
mod ids;
mod macros;
mod spill;
mod trace;

pub use blackbox_protocol::{Color, InitFlags, LogLevel, Packet, PacketKind};
pub use client::{
    Client, FlushCallback, IncomingPacketHandler, InitConfig, SendCallback, WriteCallback,
    current_thread_id, echo_to_stdout,
};
use once_cell::sync::Lazy;

/// The process-wide client behind the logging macros. Embedders that want
/// more than one capture context construct [`Client`] values directly.
pub fn global() -> &'static Client {
    static GLOBAL: Lazy<Client> = Lazy::new(Client::new);
    &GLOBAL
}
