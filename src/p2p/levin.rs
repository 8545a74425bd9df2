//! Levin transport framing.
//!
//! Every packet is a fixed 33-byte header followed by the payload. The
//! header carries the payload length, the command id, whether a response is
//! expected, a return code, and request/response flags. Packets over
//! `P2P_PACKET_MAX_SIZE` are rejected before any allocation.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants;

/// Protocol magic ("signature") leading every frame.
pub const LEVIN_SIGNATURE: u64 = 0x0101010101012101;
/// Header flag: packet is a request.
pub const LEVIN_PACKET_REQUEST: u32 = 0x0000_0001;
/// Header flag: packet is a response.
pub const LEVIN_PACKET_RESPONSE: u32 = 0x0000_0002;
/// Framing protocol version.
pub const LEVIN_PROTOCOL_VER_1: u32 = 1;
/// Success return code.
pub const LEVIN_OK: i32 = 0;

/// Byte length of the fixed header.
pub const HEADER_SIZE: usize = 33;

/// Errors from the framed transport.
#[derive(Debug, thiserror::Error)]
pub enum LevinError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bad signature: {0:#x}")]
    BadSignature(u64),
    #[error("packet size {0} exceeds the maximum")]
    PacketTooLarge(u64),
}

/// A decoded frame header plus its payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: u32,
    pub have_to_return_data: bool,
    pub return_code: i32,
    pub flags: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn request(command: u32, payload: Vec<u8>, expect_response: bool) -> Self {
        Frame {
            command,
            have_to_return_data: expect_response,
            return_code: LEVIN_OK,
            flags: LEVIN_PACKET_REQUEST,
            payload,
        }
    }

    pub fn response(command: u32, payload: Vec<u8>, return_code: i32) -> Self {
        Frame {
            command,
            have_to_return_data: false,
            return_code,
            flags: LEVIN_PACKET_RESPONSE,
            payload,
        }
    }

    /// One-way notification: a request that expects no response.
    pub fn notify(command: u32, payload: Vec<u8>) -> Self {
        Self::request(command, payload, false)
    }

    pub fn is_request(&self) -> bool {
        self.flags & LEVIN_PACKET_REQUEST != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & LEVIN_PACKET_RESPONSE != 0
    }

    /// Serialize to header + payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&LEVIN_SIGNATURE.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u64).to_le_bytes());
        buf.push(self.have_to_return_data as u8);
        buf.extend_from_slice(&self.command.to_le_bytes());
        buf.extend_from_slice(&self.return_code.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&LEVIN_PROTOCOL_VER_1.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Write a frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), LevinError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read one frame, enforcing the packet size cap before allocating.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, LevinError> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;

    let signature = u64::from_le_bytes(header[0..8].try_into().expect("fixed slice"));
    if signature != LEVIN_SIGNATURE {
        return Err(LevinError::BadSignature(signature));
    }
    let length = u64::from_le_bytes(header[8..16].try_into().expect("fixed slice"));
    if length > constants::P2P_PACKET_MAX_SIZE {
        return Err(LevinError::PacketTooLarge(length));
    }
    let have_to_return_data = header[16] != 0;
    let command = u32::from_le_bytes(header[17..21].try_into().expect("fixed slice"));
    let return_code = i32::from_le_bytes(header[21..25].try_into().expect("fixed slice"));
    let flags = u32::from_le_bytes(header[25..29].try_into().expect("fixed slice"));

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        command,
        have_to_return_data,
        return_code,
        flags,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_roundtrip() {
        let frame = Frame::request(1001, vec![1, 2, 3], true);
        let bytes = frame.encode();
        assert_eq!(bytes.len(), HEADER_SIZE + 3);
        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
        assert!(decoded.is_request());
        assert!(!decoded.is_response());
    }

    #[tokio::test]
    async fn response_flags() {
        let frame = Frame::response(2001, vec![], LEVIN_OK);
        let mut cursor = std::io::Cursor::new(frame.encode());
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert!(decoded.is_response());
        assert!(!decoded.have_to_return_data);
    }

    #[tokio::test]
    async fn bad_signature_rejected() {
        let mut bytes = Frame::notify(2002, vec![]).encode();
        bytes[0] = 0xFF;
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(LevinError::BadSignature(_))
        ));
    }

    #[tokio::test]
    async fn oversized_packet_rejected() {
        let mut bytes = Frame::notify(2002, vec![]).encode();
        // Forge a length beyond the cap.
        bytes[8..16].copy_from_slice(&(constants::P2P_PACKET_MAX_SIZE + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(LevinError::PacketTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn truncated_header_errors() {
        let mut cursor = std::io::Cursor::new(vec![0u8; 10]);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(LevinError::Io(_))
        ));
    }
}
