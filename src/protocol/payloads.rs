//! Typed payload encodings for the application packet types dispatched by
//! the receive worker (spec §4.8).

use crate::buffers::{PcmFrame, RgbImage};
use crate::error::{AsciiChatError, Result};

/// `IMAGE_FRAME` payload: a decoded RGB8 image. Header is
/// `width(4B) | height(4B) | pixel_format(1B)` followed by raw RGB8 bytes;
/// `pixel_format` is reserved for future formats and currently always 0
/// (RGB8).
pub const PIXEL_FORMAT_RGB8: u8 = 0;

pub fn encode_image_frame(image: &RgbImage) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + image.pixels.len());
    out.extend_from_slice(&image.width.to_le_bytes());
    out.extend_from_slice(&image.height.to_le_bytes());
    out.push(PIXEL_FORMAT_RGB8);
    out.extend_from_slice(&image.pixels);
    out
}

pub fn decode_image_frame(buf: &[u8]) -> Result<RgbImage> {
    if buf.len() < 9 {
        return Err(AsciiChatError::Truncated { expected: 9, actual: buf.len() });
    }
    let width = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let height = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let pixel_format = buf[8];
    if pixel_format != PIXEL_FORMAT_RGB8 {
        return Err(AsciiChatError::HandshakeViolation("unsupported image pixel format"));
    }
    let expected = (width as usize)
        .checked_mul(height as usize)
        .and_then(|px| px.checked_mul(3))
        .ok_or(AsciiChatError::TooLarge(u32::MAX, crate::protocol::packet::MAX_PAYLOAD))?;
    let pixels = &buf[9..];
    if pixels.len() != expected {
        return Err(AsciiChatError::Truncated { expected: 9 + expected, actual: buf.len() });
    }
    Ok(RgbImage::new(width, height, pixels.to_vec()))
}

/// `AUDIO_BATCH` payload: one or more fixed-size PCM frames back to back,
/// each prefixed by its sample count (so a batch can carry a short final
/// frame) as `u32` little-endian followed by that many `f32` samples.
pub fn encode_audio_batch(frames: &[PcmFrame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        for sample in frame {
            out.extend_from_slice(&sample.to_le_bytes());
        }
    }
    out
}

pub fn decode_audio_batch(buf: &[u8]) -> Result<Vec<PcmFrame>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        if buf.len() - offset < 4 {
            return Err(AsciiChatError::Truncated { expected: offset + 4, actual: buf.len() });
        }
        let count = u32::from_le_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        let needed = count * 4;
        if buf.len() - offset < needed {
            return Err(AsciiChatError::Truncated { expected: offset + needed, actual: buf.len() });
        }
        let mut frame = Vec::with_capacity(count);
        for i in 0..count {
            let start = offset + i * 4;
            frame.push(f32::from_le_bytes(buf[start..start + 4].try_into().unwrap()));
        }
        offset += needed;
        frames.push(frame);
    }
    Ok(frames)
}

/// `TERMINAL_SIZE` payload: `width(2B) | height(2B)` plus terminal
/// capability flags (spec §3 `terminal_caps`): `color_depth(1B)` (0=mono,
/// 1=ansi16, 2=ansi256, 3=truecolor), `background_color(1B bool)`.
pub struct TerminalSizePayload {
    pub width: u16,
    pub height: u16,
    pub color_depth: u8,
    pub background_color: bool,
}

impl TerminalSizePayload {
    pub fn encode(&self) -> Vec<u8> {
        vec![
            (self.width & 0xFF) as u8,
            (self.width >> 8) as u8,
            (self.height & 0xFF) as u8,
            (self.height >> 8) as u8,
            self.color_depth,
            self.background_color as u8,
        ]
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 6 {
            return Err(AsciiChatError::Truncated { expected: 6, actual: buf.len() });
        }
        Ok(Self {
            width: u16::from_le_bytes([buf[0], buf[1]]),
            height: u16::from_le_bytes([buf[2], buf[3]]),
            color_depth: buf[4],
            background_color: buf[5] != 0,
        })
    }
}

/// `STREAM_START`/`STREAM_STOP` payload: which media kind the flag applies
/// to, since both packet types are shared between the video and audio
/// streams (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

pub fn encode_stream_kind(kind: StreamKind) -> Vec<u8> {
    vec![match kind {
        StreamKind::Video => 0,
        StreamKind::Audio => 1,
    }]
}

pub fn decode_stream_kind(buf: &[u8]) -> Result<StreamKind> {
    match buf.first() {
        Some(0) => Ok(StreamKind::Video),
        Some(1) => Ok(StreamKind::Audio),
        _ => Err(AsciiChatError::Truncated { expected: 1, actual: buf.len() }),
    }
}

/// `PING`/`PONG` payload: an opaque 8-byte token echoed back verbatim.
pub fn encode_ping_token(token: u64) -> Vec<u8> {
    token.to_le_bytes().to_vec()
}

pub fn decode_ping_token(buf: &[u8]) -> Result<u64> {
    if buf.len() < 8 {
        return Err(AsciiChatError::Truncated { expected: 8, actual: buf.len() });
    }
    Ok(u64::from_le_bytes(buf[0..8].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_frame_round_trips() {
        let img = RgbImage::solid(4, 4, [1, 2, 3]);
        let encoded = encode_image_frame(&img);
        let decoded = decode_image_frame(&encoded).unwrap();
        assert_eq!(decoded, img);
    }

    #[test]
    fn image_frame_rejects_overflowing_dimensions_instead_of_wrapping() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf.extend_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        buf.push(PIXEL_FORMAT_RGB8);
        assert!(matches!(decode_image_frame(&buf), Err(AsciiChatError::TooLarge(_, _))));
    }

    #[test]
    fn audio_batch_round_trips_multiple_frames() {
        let frames = vec![vec![0.1, 0.2], vec![0.3, 0.4, 0.5]];
        let encoded = encode_audio_batch(&frames);
        let decoded = decode_audio_batch(&encoded).unwrap();
        assert_eq!(decoded, frames);
    }

    #[test]
    fn terminal_size_round_trips() {
        let payload = TerminalSizePayload { width: 80, height: 24, color_depth: 3, background_color: true };
        let encoded = payload.encode();
        let decoded = TerminalSizePayload::decode(&encoded).unwrap();
        assert_eq!(decoded.width, 80);
        assert_eq!(decoded.height, 24);
        assert_eq!(decoded.color_depth, 3);
        assert!(decoded.background_color);
    }

    #[test]
    fn ping_token_round_trips() {
        let encoded = encode_ping_token(0xDEADBEEF);
        assert_eq!(decode_ping_token(&encoded).unwrap(), 0xDEADBEEF);
    }

    #[test]
    fn stream_kind_round_trips() {
        assert_eq!(decode_stream_kind(&encode_stream_kind(StreamKind::Video)).unwrap(), StreamKind::Video);
        assert_eq!(decode_stream_kind(&encode_stream_kind(StreamKind::Audio)).unwrap(), StreamKind::Audio);
    }
}
