mod app;
mod discovery;
mod packet;
mod serialize;

pub use app::{Color, Colors, InitFlags, LogLevel, Platform};
pub use discovery::{
    DISCOVERY_PORT, DiscoveryPacket, DiscoveryPacketType, DiscoveryRequest, DiscoveryResponse,
    MAX_DISCOVERY_PACKET_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use packet::{
    AppInfo, ConsoleAutocompleteEntry, ConsoleAutocompleteHeader, ConsoleAutocompleteRequest,
    FrameEnd, FrameNumber, LogText, Packet, PacketHeader, PacketKind, PacketType, RecordingInfo,
    RegisterId, Text, UserData, decode_frame, encode_frame,
};
pub use serialize::{CodecError, Reader, Writer};

// Buffer sizes, including the nul terminator the wire format implies.
pub const APPLICATION_NAME_SIZE: usize = 64;
pub const THREAD_NAME_SIZE: usize = 64;
pub const CATEGORY_SIZE: usize = 128;
pub const CONSOLE_AUTOCOMPLETE_TEXT_SIZE: usize = 512;
pub const CONSOLE_AUTOCOMPLETE_DESC_SIZE: usize = 1544;
pub const USER_DATA_SIZE: usize = 2040;
pub const MAX_PATH_SIZE: usize = 2048;
pub const LOG_TEXT_SIZE: usize = 2048;
pub const MACHINE_NAME_SIZE: usize = 256;
pub const RECORDING_NAME_SIZE: usize = 256;

/// Upper bound on any serialized packet, frame prefix included.
pub const MAX_PACKET_BUFFER_SIZE: usize = 4096;

/// Size of the big-endian inclusive length prefix on every TCP frame.
pub const FRAME_PREFIX_SIZE: usize = 2;
