// Network frame format
//
//   network      4 bytes   MAIN | TEST
//   request      4 bytes   GDAT | RDAT | GADD | RADD | PING | PONG | WVTO | WVBK
//   payloadSize  VarInt
//   payload      payloadSize bytes
//   checksum     32 bytes  SHA3-256(payload)

use std::io::{Cursor, Read};

use serde::{Deserialize, Serialize};

use crate::core::{checksum, read_code, read_length, write_varint, Checksum, CHECKSUM_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::ProtocolError;
use crate::network::Payload;

/// Fixed part of a frame before the size VarInt
pub const FRAME_PREFIX_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Main,
    Test,
}

impl NetworkType {
    pub fn code(&self) -> [u8; 4] {
        match self {
            NetworkType::Main => *b"MAIN",
            NetworkType::Test => *b"TEST",
        }
    }

    pub fn from_code(code: [u8; 4]) -> Result<Self, ProtocolError> {
        match &code {
            b"MAIN" => Ok(NetworkType::Main),
            b"TEST" => Ok(NetworkType::Test),
            _ => Err(ProtocolError::UnknownNetwork(code)),
        }
    }
}

/// Request codes; the payload variant follows from the code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    GetData,
    DataResponse,
    GetAddresses,
    AddressResponse,
    Ping,
    Pong,
    HandshakeOffer,
    HandshakeResponse,
}

impl RequestType {
    pub fn code(&self) -> [u8; 4] {
        match self {
            RequestType::GetData => *b"GDAT",
            RequestType::DataResponse => *b"RDAT",
            RequestType::GetAddresses => *b"GADD",
            RequestType::AddressResponse => *b"RADD",
            RequestType::Ping => *b"PING",
            RequestType::Pong => *b"PONG",
            RequestType::HandshakeOffer => *b"WVTO",
            RequestType::HandshakeResponse => *b"WVBK",
        }
    }

    pub fn from_code(code: [u8; 4]) -> Result<Self, ProtocolError> {
        match &code {
            b"GDAT" => Ok(RequestType::GetData),
            b"RDAT" => Ok(RequestType::DataResponse),
            b"GADD" => Ok(RequestType::GetAddresses),
            b"RADD" => Ok(RequestType::AddressResponse),
            b"PING" => Ok(RequestType::Ping),
            b"PONG" => Ok(RequestType::Pong),
            b"WVTO" => Ok(RequestType::HandshakeOffer),
            b"WVBK" => Ok(RequestType::HandshakeResponse),
            _ => Err(ProtocolError::UnknownRequest(code)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestType::GetData => "GDAT",
            RequestType::DataResponse => "RDAT",
            RequestType::GetAddresses => "GADD",
            RequestType::AddressResponse => "RADD",
            RequestType::Ping => "PING",
            RequestType::Pong => "PONG",
            RequestType::HandshakeOffer => "WVTO",
            RequestType::HandshakeResponse => "WVBK",
        }
    }

    /// Requests whose payload must be non-empty; the rest must be empty
    pub fn requires_payload(&self) -> bool {
        !matches!(
            self,
            RequestType::GetAddresses | RequestType::Ping | RequestType::Pong
        )
    }
}

/// Undecoded frame as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub network: [u8; 4],
    pub request: [u8; 4],
    pub payload: Vec<u8>,
    pub checksum: Checksum,
}

impl Frame {
    /// Split a complete frame into its fields. Trailing bytes are an error.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(bytes);
        let network = read_code(&mut cursor)?;
        let request = read_code(&mut cursor)?;
        let size = read_length(&mut cursor)?;

        let mut payload = Vec::new();
        (&mut cursor).take(size as u64).read_to_end(&mut payload)?;
        if payload.len() != size {
            return Err(ProtocolError::Truncated);
        }

        let mut sum = [0u8; CHECKSUM_SIZE];
        cursor.read_exact(&mut sum)?;

        if cursor.position() as usize != bytes.len() {
            return Err(ProtocolError::InvalidMessage("bytes after checksum".to_string()));
        }

        Ok(Self {
            network,
            request,
            payload,
            checksum: Checksum(sum),
        })
    }

    /// Check codes, checksum and payload presence without interpreting the payload
    pub fn validate(&self) -> Result<(NetworkType, RequestType), ProtocolError> {
        let network = NetworkType::from_code(self.network)?;
        let request = RequestType::from_code(self.request)?;

        if checksum(&self.payload) != self.checksum {
            return Err(ProtocolError::ChecksumMismatch);
        }
        match (request.requires_payload(), self.payload.is_empty()) {
            (true, true) => Err(ProtocolError::InvalidMessage(format!(
                "{} requires a payload",
                request.name()
            ))),
            (false, false) => Err(ProtocolError::InvalidMessage(format!(
                "{} carries no payload",
                request.name()
            ))),
            _ => Ok((network, request)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_PREFIX_SIZE + 9 + self.payload.len() + CHECKSUM_SIZE);
        buf.extend_from_slice(&self.network);
        buf.extend_from_slice(&self.request);
        write_varint(&mut buf, self.payload.len() as u64);
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(self.checksum.as_bytes());
        buf
    }
}

/// Decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub network: NetworkType,
    pub payload: Payload,
}

impl Message {
    pub fn new(network: NetworkType, payload: Payload) -> Self {
        Self { network, payload }
    }

    pub fn request_type(&self) -> RequestType {
        self.payload.request_type()
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let payload = self.payload.serialize();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len() as u64,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Frame {
            network: self.network.code(),
            request: self.request_type().code(),
            checksum: checksum(&payload),
            payload,
        })
    }

    /// Validate a frame, then decode its payload
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let (network, request) = frame.validate()?;
        let payload = Payload::decode(request, &frame.payload)?;
        Ok(Self { network, payload })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.to_frame()?.encode())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_frame(&Frame::parse(bytes)?)
    }
}
