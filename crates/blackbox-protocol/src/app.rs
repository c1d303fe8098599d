use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, FromRepr};

/// Log severities, in the wire's historical order. `SetColor` is a
/// pseudo-level: the text carries an encoded color pair instead of a line.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(ascii_case_insensitive)]
#[repr(u32)]
pub enum LogLevel {
    #[default]
    Log = 0,
    Warning = 1,
    Error = 2,
    Display = 3,
    SetColor = 4,
    VeryVerbose = 5,
    Verbose = 6,
    Fatal = 7,
}

impl LogLevel {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Log),
            1 => Some(Self::Warning),
            2 => Some(Self::Error),
            3 => Some(Self::Display),
            4 => Some(Self::SetColor),
            5 => Some(Self::VeryVerbose),
            6 => Some(Self::Verbose),
            7 => Some(Self::Fatal),
            _ => None,
        }
    }
}

/// Viewer palette indices. The numeric values are wire format; only append.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, FromRepr)]
#[repr(u32)]
pub enum Color {
    #[default]
    Default = 0,
    EvergreenBlack = 1,
    EvergreenRed = 2,
    EvergreenGreen = 3,
    EvergreenYellow = 4,
    EvergreenBlue = 5,
    EvergreenCyan = 6,
    EvergreenPink = 7,
    EvergreenWhite = 8,
    EvergreenLightBlue = 9,
    EvergreenOrange = 10,
    EvergreenLightBlueAlt = 11,
    EvergreenOrangeAlt = 12,
    EvergreenMediumBlue = 13,
    EvergreenAmber = 14,
    Ue4Black = 15,
    Ue4DarkRed = 16,
    Ue4DarkGreen = 17,
    Ue4DarkBlue = 18,
    Ue4DarkYellow = 19,
    Ue4DarkCyan = 20,
    Ue4DarkPurple = 21,
    Ue4DarkWhite = 22,
    Ue4Red = 23,
    Ue4Green = 24,
    Ue4Blue = 25,
    Ue4Yellow = 26,
    Ue4Cyan = 27,
    Ue4Purple = 28,
    Ue4White = 29,
}

impl Color {
    /// Unknown values map to `Default` so newer peers stay readable.
    pub fn from_u32(v: u32) -> Self {
        Self::from_repr(v).unwrap_or(Self::Default)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Colors {
    pub fg: Color,
    pub bg: Color,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[repr(u32)]
pub enum Platform {
    #[default]
    Unknown = 0,
    Windows = 1,
    Linux = 2,
    Android = 3,
    #[strum(serialize = "PS4")]
    Orbis = 4,
    #[strum(serialize = "Xbox One")]
    Durango = 5,
    #[strum(serialize = "Switch")]
    Nx = 6,
    Prospero = 7,
    Scarlett = 8,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Self::Windows
        } else if cfg!(target_os = "android") {
            Self::Android
        } else if cfg!(target_os = "linux") {
            Self::Linux
        } else {
            Self::Unknown
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Windows,
            2 => Self::Linux,
            3 => Self::Android,
            4 => Self::Orbis,
            5 => Self::Durango,
            6 => Self::Nx,
            7 => Self::Prospero,
            8 => Self::Scarlett,
            _ => Self::Unknown,
        }
    }
}

bitflags! {
    /// Client init flags carried in AppInfo and echoed by the server.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct InitFlags: u32 {
        const NO_OPEN_VIEW = 0x1;
        const DEBUG_INIT = 0x2;
        const CONSOLE_COMMANDS = 0x4;
        const NO_DISCOVERY = 0x8;
        const RECORDING_INFO = 0x10;
        const CONSOLE_AUTOCOMPLETE = 0x20;
        const NO_CONNECT = 0x40;
    }
}
