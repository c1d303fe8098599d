mod conn;
pub mod discovery;
mod sockets;

pub use conn::{
    ConnState, Connection, RECV_BUFFER_SIZE, SEND_BUFFER_SIZE, bind_ephemeral_listener,
};
pub use sockets::bind_udp_reuse;
