use strum::FromRepr;

use crate::{
    APPLICATION_NAME_SIZE, CONSOLE_AUTOCOMPLETE_DESC_SIZE, CONSOLE_AUTOCOMPLETE_TEXT_SIZE,
    FRAME_PREFIX_SIZE, LOG_TEXT_SIZE, MACHINE_NAME_SIZE, MAX_PATH_SIZE, RECORDING_NAME_SIZE,
    USER_DATA_SIZE,
    app::{Color, Colors},
    serialize::{CodecError, Reader, Writer},
};

/// Wire type codes. New variants append only; the numeric values are shared
/// with every recording ever written.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum PacketType {
    Invalid = 0,
    AppInfoV1 = 1,
    ThreadStart = 2,
    ThreadName = 3,
    ThreadEnd = 4,
    FileId = 5,
    CategoryId = 6,
    FrameEnd = 7,
    LogTextV1 = 8,
    UserToServer = 9,
    ConsoleCommand = 10,
    UserToClient = 11,
    AppInfoV2 = 12,
    AppInfoV3 = 13,
    LogTextV2 = 14,
    LogText = 15,
    AppInfoV4 = 16,
    LogTextPartial = 17,
    Restart = 18,
    StopRecording = 19,
    RecordingInfo = 20,
    ConsoleAutocompleteRequest = 21,
    ConsoleAutocompleteResponseHeader = 22,
    ConsoleAutocompleteResponseEntry = 23,
    AppInfoV5 = 24,
    FrameNumber = 25,
    AppInfoV6 = 26,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::from_repr(v).filter(|ty| *ty != Self::Invalid)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketHeader {
    pub timestamp: u64,
    pub thread_id: u64,
    pub file_id: u32,
    pub line: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AppInfo {
    pub initial_timestamp: u64,
    pub millis_per_tick: f64,
    pub application_name: String,
    pub application_group: String,
    pub init_flags: u32,
    pub platform: u32,
    pub micros_from_epoch: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Text {
    pub text: String,
}

impl Text {
    pub fn new<S: Into<String>>(text: S) -> Self {
        Self { text: text.into() }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterId {
    pub id: u32,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogText {
    pub category_id: u32,
    pub level: u32,
    pub pie_instance: i32,
    pub colors: Colors,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserData {
    pub data: Vec<u8>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct FrameEnd {
    pub milliseconds: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameNumber {
    pub frame_number: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordingInfo {
    pub machine_name: String,
    pub recording_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsoleAutocompleteRequest {
    pub id: u32,
    pub text: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsoleAutocompleteHeader {
    pub id: u32,
    pub total: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsoleAutocompleteEntry {
    pub id: u32,
    pub command: i32,
    pub flags: u32,
    pub text: String,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PacketKind {
    AppInfo(AppInfo),
    ThreadStart(Text),
    ThreadName(Text),
    ThreadEnd,
    FileId(RegisterId),
    CategoryId(RegisterId),
    FrameEnd(FrameEnd),
    FrameNumber(FrameNumber),
    LogText(LogText),
    LogTextPartial(LogText),
    UserToServer(UserData),
    UserToClient(UserData),
    ConsoleCommand(Text),
    RecordingInfo(RecordingInfo),
    ConsoleAutocompleteRequest(ConsoleAutocompleteRequest),
    ConsoleAutocompleteResponseHeader(ConsoleAutocompleteHeader),
    ConsoleAutocompleteResponseEntry(ConsoleAutocompleteEntry),
    /// Internal only, never on the wire.
    Restart,
    /// Internal only, never on the wire.
    StopRecording,
}

impl PacketKind {
    #[inline]
    pub fn is_app_info(&self) -> bool {
        matches!(self, PacketKind::AppInfo(_))
    }

    #[inline]
    pub fn is_log_text(&self) -> bool {
        matches!(self, PacketKind::LogText(_) | PacketKind::LogTextPartial(_))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub kind: PacketKind,
}

impl Packet {
    pub fn new(header: PacketHeader, kind: PacketKind) -> Self {
        Self { header, kind }
    }

    /// Serializes `[type][header][body]` into `buf`, returning the payload
    /// length. Encoders always emit the newest variant of each record;
    /// AppInfo drops to the group-less variant when no group is set.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = Writer::new(buf);
        w.u8(self.type_code()? as u8)?;
        serialize_header(&mut w, &self.header)?;
        match &self.kind {
            PacketKind::AppInfo(info) => {
                w.u64(info.initial_timestamp)?;
                w.f64(info.millis_per_tick)?;
                w.u32(info.init_flags)?;
                w.u32(info.platform)?;
                w.u64(info.micros_from_epoch)?;
                if info.application_group.is_empty() {
                    w.str_remaining(&info.application_name, APPLICATION_NAME_SIZE)?;
                } else {
                    w.str_prefixed(&info.application_name, APPLICATION_NAME_SIZE)?;
                    w.str_remaining(&info.application_group, APPLICATION_NAME_SIZE)?;
                }
            }
            PacketKind::ThreadStart(t) | PacketKind::ThreadName(t) | PacketKind::ConsoleCommand(t) => {
                w.str_remaining(&t.text, LOG_TEXT_SIZE)?;
            }
            PacketKind::ThreadEnd => {}
            PacketKind::FileId(r) | PacketKind::CategoryId(r) => {
                w.u32(r.id)?;
                w.str_remaining(&r.name, MAX_PATH_SIZE)?;
            }
            PacketKind::FrameEnd(f) => w.f64(f.milliseconds)?,
            PacketKind::FrameNumber(f) => w.u64(f.frame_number)?,
            PacketKind::LogText(t) | PacketKind::LogTextPartial(t) => {
                w.u32(t.category_id)?;
                w.u32(t.level)?;
                w.i32(t.pie_instance)?;
                w.i32(t.colors.fg as i32)?;
                w.i32(t.colors.bg as i32)?;
                w.str_remaining(&t.text, LOG_TEXT_SIZE)?;
            }
            PacketKind::UserToServer(u) | PacketKind::UserToClient(u) => {
                if u.data.len() > USER_DATA_SIZE {
                    return Err(CodecError::OutOfSpace);
                }
                w.bytes(&u.data)?;
            }
            PacketKind::RecordingInfo(r) => {
                w.str_prefixed(&r.machine_name, MACHINE_NAME_SIZE)?;
                w.str_prefixed(&r.recording_name, RECORDING_NAME_SIZE)?;
            }
            PacketKind::ConsoleAutocompleteRequest(r) => {
                w.u32(r.id)?;
                w.str_remaining(&r.text, CONSOLE_AUTOCOMPLETE_TEXT_SIZE)?;
            }
            PacketKind::ConsoleAutocompleteResponseHeader(h) => {
                w.u32(h.id)?;
                w.u32(h.total)?;
            }
            PacketKind::ConsoleAutocompleteResponseEntry(e) => {
                w.u32(e.id)?;
                w.i32(e.command)?;
                w.u32(e.flags)?;
                w.str_prefixed(&e.text, CONSOLE_AUTOCOMPLETE_TEXT_SIZE)?;
                w.str_prefixed(&e.description, CONSOLE_AUTOCOMPLETE_DESC_SIZE)?;
            }
            PacketKind::Restart | PacketKind::StopRecording => unreachable!(),
        }
        Ok(w.cursor())
    }

    fn type_code(&self) -> Result<PacketType, CodecError> {
        Ok(match &self.kind {
            PacketKind::AppInfo(info) => {
                if info.application_group.is_empty() {
                    PacketType::AppInfoV4
                } else {
                    PacketType::AppInfoV6
                }
            }
            PacketKind::ThreadStart(_) => PacketType::ThreadStart,
            PacketKind::ThreadName(_) => PacketType::ThreadName,
            PacketKind::ThreadEnd => PacketType::ThreadEnd,
            PacketKind::FileId(_) => PacketType::FileId,
            PacketKind::CategoryId(_) => PacketType::CategoryId,
            PacketKind::FrameEnd(_) => PacketType::FrameEnd,
            PacketKind::FrameNumber(_) => PacketType::FrameNumber,
            PacketKind::LogText(_) => PacketType::LogText,
            PacketKind::LogTextPartial(_) => PacketType::LogTextPartial,
            PacketKind::UserToServer(_) => PacketType::UserToServer,
            PacketKind::UserToClient(_) => PacketType::UserToClient,
            PacketKind::ConsoleCommand(_) => PacketType::ConsoleCommand,
            PacketKind::RecordingInfo(_) => PacketType::RecordingInfo,
            PacketKind::ConsoleAutocompleteRequest(_) => PacketType::ConsoleAutocompleteRequest,
            PacketKind::ConsoleAutocompleteResponseHeader(_) => {
                PacketType::ConsoleAutocompleteResponseHeader
            }
            PacketKind::ConsoleAutocompleteResponseEntry(_) => {
                PacketType::ConsoleAutocompleteResponseEntry
            }
            PacketKind::Restart => return Err(CodecError::NotSerializable(PacketType::Restart as u8)),
            PacketKind::StopRecording => {
                return Err(CodecError::NotSerializable(PacketType::StopRecording as u8));
            }
        })
    }

    /// Decodes a payload (`[type][header][body]`, no length prefix). Legacy
    /// variants decode into the canonical records with absent fields zeroed.
    pub fn deserialize(payload: &[u8]) -> Result<Packet, CodecError> {
        let mut r = Reader::new(payload);
        let raw_type = r.u8()?;
        let ty = PacketType::from_u8(raw_type).ok_or(CodecError::UnknownType(raw_type))?;
        let header = deserialize_header(&mut r)?;
        let kind = match ty {
            PacketType::AppInfoV1 => PacketKind::AppInfo(AppInfo {
                initial_timestamp: r.u64()?,
                millis_per_tick: r.f64()?,
                application_name: r.str_remaining(APPLICATION_NAME_SIZE)?,
                ..AppInfo::default()
            }),
            PacketType::AppInfoV2 => PacketKind::AppInfo(AppInfo {
                initial_timestamp: r.u64()?,
                millis_per_tick: r.f64()?,
                init_flags: r.u32()?,
                application_name: r.str_remaining(APPLICATION_NAME_SIZE)?,
                ..AppInfo::default()
            }),
            PacketType::AppInfoV3 => PacketKind::AppInfo(AppInfo {
                initial_timestamp: r.u64()?,
                millis_per_tick: r.f64()?,
                init_flags: r.u32()?,
                micros_from_epoch: r.u64()?,
                application_name: r.str_remaining(APPLICATION_NAME_SIZE)?,
                ..AppInfo::default()
            }),
            PacketType::AppInfoV4 => PacketKind::AppInfo(AppInfo {
                initial_timestamp: r.u64()?,
                millis_per_tick: r.f64()?,
                init_flags: r.u32()?,
                platform: r.u32()?,
                micros_from_epoch: r.u64()?,
                application_name: r.str_remaining(APPLICATION_NAME_SIZE)?,
                ..AppInfo::default()
            }),
            PacketType::AppInfoV5 | PacketType::AppInfoV6 => PacketKind::AppInfo(AppInfo {
                initial_timestamp: r.u64()?,
                millis_per_tick: r.f64()?,
                init_flags: r.u32()?,
                platform: r.u32()?,
                micros_from_epoch: r.u64()?,
                application_name: r.str_prefixed(APPLICATION_NAME_SIZE)?,
                application_group: r.str_remaining(APPLICATION_NAME_SIZE)?,
            }),
            PacketType::ThreadStart => {
                PacketKind::ThreadStart(Text { text: r.str_remaining(LOG_TEXT_SIZE)? })
            }
            PacketType::ThreadName => {
                PacketKind::ThreadName(Text { text: r.str_remaining(LOG_TEXT_SIZE)? })
            }
            PacketType::ConsoleCommand => {
                PacketKind::ConsoleCommand(Text { text: r.str_remaining(LOG_TEXT_SIZE)? })
            }
            PacketType::ThreadEnd => PacketKind::ThreadEnd,
            PacketType::FileId => PacketKind::FileId(RegisterId {
                id: r.u32()?,
                name: r.str_remaining(MAX_PATH_SIZE)?,
            }),
            PacketType::CategoryId => PacketKind::CategoryId(RegisterId {
                id: r.u32()?,
                name: r.str_remaining(MAX_PATH_SIZE)?,
            }),
            PacketType::FrameEnd => PacketKind::FrameEnd(FrameEnd { milliseconds: r.f64()? }),
            PacketType::FrameNumber => {
                PacketKind::FrameNumber(FrameNumber { frame_number: r.u64()? })
            }
            PacketType::LogTextV1 => PacketKind::LogText(LogText {
                category_id: r.u32()?,
                level: r.u32()?,
                pie_instance: 0,
                colors: Colors::default(),
                text: r.str_remaining(LOG_TEXT_SIZE)?,
            }),
            PacketType::LogTextV2 => {
                let category_id = r.u32()?;
                let level = r.u32()?;
                let fg = Color::from_u32(r.i32()? as u32);
                let bg = Color::from_u32(r.i32()? as u32);
                PacketKind::LogText(LogText {
                    category_id,
                    level,
                    pie_instance: 0,
                    colors: Colors { fg, bg },
                    text: r.str_remaining(LOG_TEXT_SIZE)?,
                })
            }
            PacketType::LogText | PacketType::LogTextPartial => {
                let category_id = r.u32()?;
                let level = r.u32()?;
                let pie_instance = r.i32()?;
                let fg = Color::from_u32(r.i32()? as u32);
                let bg = Color::from_u32(r.i32()? as u32);
                let text = LogText {
                    category_id,
                    level,
                    pie_instance,
                    colors: Colors { fg, bg },
                    text: r.str_remaining(LOG_TEXT_SIZE)?,
                };
                if ty == PacketType::LogText {
                    PacketKind::LogText(text)
                } else {
                    PacketKind::LogTextPartial(text)
                }
            }
            PacketType::UserToServer => PacketKind::UserToServer(UserData {
                data: r.bytes_remaining(USER_DATA_SIZE)?.to_vec(),
            }),
            PacketType::UserToClient => PacketKind::UserToClient(UserData {
                data: r.bytes_remaining(USER_DATA_SIZE)?.to_vec(),
            }),
            PacketType::RecordingInfo => PacketKind::RecordingInfo(RecordingInfo {
                machine_name: r.str_prefixed(MACHINE_NAME_SIZE)?,
                recording_name: r.str_prefixed(RECORDING_NAME_SIZE)?,
            }),
            PacketType::ConsoleAutocompleteRequest => {
                PacketKind::ConsoleAutocompleteRequest(ConsoleAutocompleteRequest {
                    id: r.u32()?,
                    text: r.str_remaining(CONSOLE_AUTOCOMPLETE_TEXT_SIZE)?,
                })
            }
            PacketType::ConsoleAutocompleteResponseHeader => {
                PacketKind::ConsoleAutocompleteResponseHeader(ConsoleAutocompleteHeader {
                    id: r.u32()?,
                    total: r.u32()?,
                })
            }
            PacketType::ConsoleAutocompleteResponseEntry => {
                PacketKind::ConsoleAutocompleteResponseEntry(ConsoleAutocompleteEntry {
                    id: r.u32()?,
                    command: r.i32()?,
                    flags: r.u32()?,
                    text: r.str_prefixed(CONSOLE_AUTOCOMPLETE_TEXT_SIZE)?,
                    description: r.str_prefixed(CONSOLE_AUTOCOMPLETE_DESC_SIZE)?,
                })
            }
            PacketType::Invalid | PacketType::Restart | PacketType::StopRecording => {
                return Err(CodecError::UnknownType(raw_type));
            }
        };
        Ok(Packet { header, kind })
    }
}

fn serialize_header(w: &mut Writer, header: &PacketHeader) -> Result<(), CodecError> {
    w.u64(header.timestamp)?;
    w.u64(header.thread_id)?;
    w.u32(header.file_id)?;
    w.u32(header.line)
}

fn deserialize_header(r: &mut Reader) -> Result<PacketHeader, CodecError> {
    Ok(PacketHeader {
        timestamp: r.u64()?,
        thread_id: r.u64()?,
        file_id: r.u32()?,
        line: r.u32()?,
    })
}

/// Serializes a packet with its `[u16 BE inclusive length]` frame prefix.
/// Returns the total frame length.
pub fn encode_frame(packet: &Packet, buf: &mut [u8]) -> Result<usize, CodecError> {
    if buf.len() < FRAME_PREFIX_SIZE {
        return Err(CodecError::OutOfSpace);
    }
    let payload_len = packet.serialize(&mut buf[FRAME_PREFIX_SIZE..])?;
    let frame_len = payload_len + FRAME_PREFIX_SIZE;
    buf[0] = (frame_len >> 8) as u8;
    buf[1] = (frame_len & 0xff) as u8;
    Ok(frame_len)
}

/// Decodes one complete frame (prefix included). The frame length must match
/// the prefix exactly; truncation is a decode failure, not a partial read.
pub fn decode_frame(frame: &[u8]) -> Result<Packet, CodecError> {
    if frame.len() < FRAME_PREFIX_SIZE + 1 {
        return Err(CodecError::OutOfSpace);
    }
    let frame_len = ((frame[0] as usize) << 8) + frame[1] as usize;
    if frame_len < FRAME_PREFIX_SIZE || frame_len > frame.len() {
        return Err(CodecError::OutOfSpace);
    }
    Packet::deserialize(&frame[FRAME_PREFIX_SIZE..frame_len])
}
