//! CRC8-framed binary protocol.
//!
//! Frame layout (all single bytes):
//!
//! ```text
//! A5 | len | data[len-1] | crc | 5A
//! ```
//!
//! `len` counts itself plus the data bytes. The checksum is CRC-8/MAXIM
//! (polynomial 0x31 reflected, init 0, no final XOR) over `len` and the data.
//! In replies the first data byte is the code (0x06 ACK, 0x15 NAK) and the
//! second echoes the command byte.
//!
//! [`FrameDecoder`] resynchronises on garbage: a checksum mismatch or a bad
//! end marker drops back to waiting for the start marker.

use crate::error::{ProtocolError, TransportError};
use crate::transport::Transport;
use crc::{Crc, CRC_8_MAXIM_DOW};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Start of frame.
pub const STX: u8 = 0xA5;
/// End of frame.
pub const ETX: u8 = 0x5A;
/// Positive acknowledgement code.
pub const ACK: u8 = 0x06;
/// Negative acknowledgement code.
pub const NAK: u8 = 0x15;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_MAXIM_DOW);

/// CRC-8/MAXIM checksum of `data`.
pub fn crc8_maxim(data: &[u8]) -> u8 {
    CRC8.checksum(data)
}

/// Build the wire frame for a command.
///
/// Fails if the command does not fit a single length byte.
pub fn encode_command(command: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u8::try_from(command.len() + 1).map_err(|_| ProtocolError::BadLength {
        expected: 254,
        actual: command.len(),
    })?;

    let mut buffer = Vec::with_capacity(command.len() + 4);
    buffer.push(STX);
    buffer.push(len);
    buffer.extend_from_slice(command);
    buffer.push(crc8_maxim(&buffer[1..]));
    buffer.push(ETX);
    Ok(buffer)
}

// =============================================================================
// Decoding
// =============================================================================

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Length byte followed by the data bytes, as covered by the checksum.
    data: Vec<u8>,
}

impl Frame {
    /// Data bytes after the length byte.
    pub fn body(&self) -> &[u8] {
        self.data.get(1..).unwrap_or(&[])
    }

    /// Interpret the frame as a reply.
    pub fn reply(&self) -> Result<FrameReply, ProtocolError> {
        let body = self.body();
        match body.first() {
            None => Ok(FrameReply::Ack(Vec::new())),
            Some(&ACK) => Ok(FrameReply::Ack(body[1..].to_vec())),
            Some(&NAK) => Ok(FrameReply::Nak(body.get(2..).unwrap_or(&[]).to_vec())),
            Some(&code) => Err(ProtocolError::UnsupportedCode(code)),
        }
    }
}

/// Reply classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameReply {
    /// Everything after the ACK code, starting with the command echo.
    Ack(Vec<u8>),
    /// NAK detail bytes.
    Nak(Vec<u8>),
}

impl FrameReply {
    /// Check the command echo and return the payload after it.
    pub fn expect_echo(self, command: u8) -> Result<Vec<u8>, ProtocolError> {
        match self {
            FrameReply::Nak(detail) => Err(ProtocolError::Nak { detail }),
            FrameReply::Ack(payload) => match payload.split_first() {
                None => Err(ProtocolError::ReplyTooShort),
                Some((&echo, _)) if echo != command => Err(ProtocolError::OutOfBand {
                    received: echo,
                    expected: command,
                }),
                Some((_, rest)) => Ok(rest.to_vec()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    Start,
    Length,
    Data { remaining: usize },
    Checksum,
    End,
}

/// Byte-at-a-time frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    state: DecodeState,
    data: Vec<u8>,
    discarded: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Decoder waiting for a start marker.
    pub fn new() -> Self {
        Self {
            state: DecodeState::Start,
            data: Vec::new(),
            discarded: 0,
        }
    }

    /// Frames dropped because of a bad checksum or end marker.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Feed one byte; returns a frame when one completes.
    pub fn push(&mut self, byte: u8) -> Option<Frame> {
        match self.state {
            DecodeState::Start => {
                if byte == STX {
                    self.state = DecodeState::Length;
                }
            }
            DecodeState::Length => {
                self.data.clear();
                self.data.push(byte);
                // zero and one both mean "no data bytes"
                self.state = match byte {
                    0 | 1 => DecodeState::Checksum,
                    n => DecodeState::Data {
                        remaining: n as usize - 1,
                    },
                };
            }
            DecodeState::Data { remaining } => {
                self.data.push(byte);
                self.state = if remaining == 1 {
                    DecodeState::Checksum
                } else {
                    DecodeState::Data {
                        remaining: remaining - 1,
                    }
                };
            }
            DecodeState::Checksum => {
                if crc8_maxim(&self.data) == byte {
                    self.state = DecodeState::End;
                } else {
                    tracing::debug!(
                        expected = crc8_maxim(&self.data),
                        received = byte,
                        "Frame checksum mismatch, resynchronising"
                    );
                    self.resync();
                }
            }
            DecodeState::End => {
                if byte == ETX {
                    self.state = DecodeState::Start;
                    return Some(Frame {
                        data: std::mem::take(&mut self.data),
                    });
                }
                tracing::debug!(received = byte, "Bad frame end marker, resynchronising");
                self.resync();
            }
        }
        None
    }

    fn resync(&mut self) {
        self.discarded += 1;
        self.data.clear();
        self.state = DecodeState::Start;
    }
}

/// Read bytes until a complete frame arrives.
///
/// Every byte read is appended to `seen`, including discarded garbage, so the
/// caller can log exactly what came over the wire. End of stream is reported
/// as [`TransportError::Disconnected`].
pub fn read_frame(
    port: &mut dyn Transport,
    deadline: Instant,
    cancel: &CancellationToken,
    seen: &mut Vec<u8>,
) -> Result<Frame, TransportError> {
    let mut decoder = FrameDecoder::new();
    loop {
        let byte = port
            .raw_read(deadline, cancel)?
            .ok_or(TransportError::Disconnected)?;
        seen.push(byte);
        if let Some(frame) = decoder.push(byte) {
            return Ok(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        bytes.iter().filter_map(|b| decoder.push(*b)).collect()
    }

    #[test]
    fn test_crc8_maxim_known_vectors() {
        assert_eq!(crc8_maxim(b"123456789"), 0xA1);
        assert_eq!(crc8_maxim(&[0x02, 0x06]), 0x4C);
        assert_eq!(crc8_maxim(&[]), 0x00);
    }

    #[test]
    fn test_encode_command() {
        assert_eq!(
            encode_command(&[0xC2]).unwrap(),
            vec![0xA5, 0x02, 0xC2, 0xE7, 0x5A]
        );
        assert_eq!(
            encode_command(&[0x8D, 0x01]).unwrap(),
            vec![0xA5, 0x03, 0x8D, 0x01, 0x1C, 0x5A]
        );
    }

    #[test]
    fn test_encode_rejects_oversized_command() {
        assert!(encode_command(&[0u8; 255]).is_err());
    }

    #[test]
    fn test_ack_without_payload() {
        let frames = decode_all(&[0xA5, 0x02, 0x06, 0x4C, 0x5A]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].reply().unwrap(), FrameReply::Ack(vec![]));
    }

    #[test]
    fn test_zero_length_frame_is_empty_ack() {
        let frames = decode_all(&[0xA5, 0x00, 0x00, 0x5A]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].body().is_empty());
        assert_eq!(frames[0].reply().unwrap(), FrameReply::Ack(vec![]));
    }

    #[test]
    fn test_bad_crc_resyncs_to_next_frame() {
        let mut bytes = vec![0xA5, 0x02, 0x06, 0x4D, 0x5A];
        bytes.extend(encode_command(&[ACK, 0xC1, 0x12, 0x34]).unwrap());

        let mut decoder = FrameDecoder::new();
        let frames: Vec<Frame> = bytes.iter().filter_map(|b| decoder.push(*b)).collect();

        assert_eq!(frames.len(), 1);
        assert_eq!(decoder.discarded(), 1);
        assert_eq!(
            frames[0].reply().unwrap().expect_echo(0xC1).unwrap(),
            vec![0x12, 0x34]
        );
    }

    #[test]
    fn test_bad_end_marker_resyncs() {
        let mut bytes = vec![0xFF, 0xA5, 0x02, 0x06, 0x4C, 0x00];
        bytes.extend([0xA5, 0x02, 0x06, 0x4C, 0x5A]);
        assert_eq!(decode_all(&bytes).len(), 1);
    }

    #[test]
    fn test_reply_classification() {
        let ack = decode_all(&encode_command(&[ACK, 0xC4, 0x03]).unwrap()).remove(0);
        assert_eq!(ack.reply().unwrap().expect_echo(0xC4).unwrap(), vec![0x03]);

        let out_of_band = ack.reply().unwrap().expect_echo(0xC2).unwrap_err();
        assert_eq!(
            out_of_band,
            ProtocolError::OutOfBand {
                received: 0xC4,
                expected: 0xC2
            }
        );

        let nak = decode_all(&encode_command(&[NAK, 0xC4, 0x09]).unwrap()).remove(0);
        assert_eq!(
            nak.reply().unwrap().expect_echo(0xC4).unwrap_err(),
            ProtocolError::Nak { detail: vec![0x09] }
        );

        let odd = decode_all(&encode_command(&[0x42]).unwrap()).remove(0);
        assert_eq!(odd.reply().unwrap_err(), ProtocolError::UnsupportedCode(0x42));
    }

    #[test]
    fn test_short_ack_is_rejected_by_echo_check() {
        let frame = decode_all(&[0xA5, 0x02, 0x06, 0x4C, 0x5A]).remove(0);
        assert_eq!(
            frame.reply().unwrap().expect_echo(0xC2).unwrap_err(),
            ProtocolError::ReplyTooShort
        );
    }
}
