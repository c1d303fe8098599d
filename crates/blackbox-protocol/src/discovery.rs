use strum::FromRepr;

use crate::{
    APPLICATION_NAME_SIZE,
    serialize::{CodecError, Reader, Writer},
};

pub const DISCOVERY_PORT: u16 = 1492;
pub const PROTOCOL_VERSION: u32 = 0x0003_0000;
/// Includes the trailing nul, which is on the wire.
pub const PROTOCOL_MAGIC: &[u8; 5] = b"BBX2\0";
pub const MAX_DISCOVERY_PACKET_SIZE: usize = 512;

/// Datagram type codes. Historical; append only. Decline variants exist in
/// the numbering but are neither sent nor decoded.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromRepr)]
#[repr(u8)]
pub enum DiscoveryPacketType {
    RequestDiscoveryV1 = 0,
    RequestReservationV1 = 1,
    DeclineReservationV1 = 2,
    AnnouncePresence = 3,
    ReservationAccept = 4,
    ReservationRefuse = 5,
    RequestDiscoveryV2 = 6,
    RequestReservationV2 = 7,
    DeclineReservation = 8,
    RequestDiscovery = 9,
    RequestReservation = 10,
}

impl DiscoveryPacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Self::from_repr(v)
    }

    #[inline]
    pub fn is_request_discovery(self) -> bool {
        matches!(
            self,
            Self::RequestDiscovery | Self::RequestDiscoveryV1 | Self::RequestDiscoveryV2
        )
    }

    #[inline]
    pub fn is_request_reservation(self) -> bool {
        matches!(
            self,
            Self::RequestReservation | Self::RequestReservationV1 | Self::RequestReservationV2
        )
    }

    #[inline]
    pub fn is_response(self) -> bool {
        matches!(self, Self::AnnouncePresence | Self::ReservationAccept | Self::ReservationRefuse)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryRequest {
    pub protocol_version: u32,
    pub source_ip: u32,
    pub platform: u32,
    pub device_code: String,
    pub source_application_name: String,
    pub application_name: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryResponse {
    pub protocol_version: u32,
    pub port: u16,
}

#[derive(Clone, Debug, PartialEq)]
pub enum DiscoveryPacket {
    Request { ty: DiscoveryPacketType, request: DiscoveryRequest },
    Response { ty: DiscoveryPacketType, response: DiscoveryResponse },
}

impl DiscoveryPacket {
    pub fn request(ty: DiscoveryPacketType, request: DiscoveryRequest) -> Self {
        Self::Request { ty, request }
    }

    pub fn response(ty: DiscoveryPacketType, port: u16) -> Self {
        Self::Response { ty, response: DiscoveryResponse { protocol_version: PROTOCOL_VERSION, port } }
    }

    pub fn ty(&self) -> DiscoveryPacketType {
        match self {
            Self::Request { ty, .. } | Self::Response { ty, .. } => *ty,
        }
    }

    /// Serializes a datagram, stamping the current protocol version.
    pub fn serialize(&self, buf: &mut [u8]) -> Result<usize, CodecError> {
        let mut w = Writer::new(buf);
        let ty = self.ty();
        w.u8(ty as u8)?;
        match self {
            Self::Request { request, .. } => {
                w.bytes(PROTOCOL_MAGIC)?;
                w.u32(PROTOCOL_VERSION)?;
                w.u32(request.source_ip)?;
                // platform and device code joined the request over time; the
                // field set depends on the exact type code
                if matches!(ty, DiscoveryPacketType::RequestDiscovery | DiscoveryPacketType::RequestDiscoveryV1)
                {
                    w.u32(request.platform)?;
                }
                if matches!(
                    ty,
                    DiscoveryPacketType::RequestDiscovery | DiscoveryPacketType::RequestReservation
                ) {
                    w.str_prefixed(&request.device_code, APPLICATION_NAME_SIZE)?;
                }
                w.str_prefixed(&request.source_application_name, APPLICATION_NAME_SIZE)?;
                w.str_remaining(&request.application_name, APPLICATION_NAME_SIZE)?;
            }
            Self::Response { response, .. } => {
                if !ty.is_response() {
                    return Err(CodecError::NotSerializable(ty as u8));
                }
                w.bytes(PROTOCOL_MAGIC)?;
                w.u32(PROTOCOL_VERSION)?;
                w.u16(response.port)?;
            }
        }
        Ok(w.cursor())
    }

    pub fn deserialize(datagram: &[u8]) -> Result<Self, CodecError> {
        let mut r = Reader::new(datagram);
        let raw_type = r.u8()?;
        let ty =
            DiscoveryPacketType::from_u8(raw_type).ok_or(CodecError::UnknownType(raw_type))?;
        if r.bytes(PROTOCOL_MAGIC.len())? != PROTOCOL_MAGIC.as_slice() {
            return Err(CodecError::BadMagic);
        }
        if ty.is_response() {
            let protocol_version = r.u32()?;
            let port = r.u16()?;
            return Ok(Self::Response { ty, response: DiscoveryResponse { protocol_version, port } });
        }
        if !ty.is_request_discovery() && !ty.is_request_reservation() {
            return Err(CodecError::UnknownType(raw_type));
        }

        let protocol_version = r.u32()?;
        let source_ip = r.u32()?;
        let platform = if matches!(
            ty,
            DiscoveryPacketType::RequestDiscovery | DiscoveryPacketType::RequestDiscoveryV1
        ) {
            r.u32()?
        } else {
            0
        };
        let device_code = if matches!(
            ty,
            DiscoveryPacketType::RequestDiscovery | DiscoveryPacketType::RequestReservation
        ) {
            r.str_prefixed(APPLICATION_NAME_SIZE)?
        } else {
            String::new()
        };
        let source_application_name = r.str_prefixed(APPLICATION_NAME_SIZE)?;
        let application_name = r.str_remaining(APPLICATION_NAME_SIZE)?;
        Ok(Self::Request {
            ty,
            request: DiscoveryRequest {
                protocol_version,
                source_ip,
                platform,
                device_code,
                source_application_name,
                application_name,
            },
        })
    }
}
