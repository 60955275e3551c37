use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single frame: 10MB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// How JSON messages are delimited on a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One JSON document per line.
    #[default]
    NewlineDelimited,
    /// 4-byte big-endian length, then the JSON document.
    LengthPrefixed,
}

/// Length-prefixed JSON frames.
#[derive(Debug, Clone)]
pub struct LengthPrefixedCodec {
    max_frame_size: usize,
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for LengthPrefixedCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = JsonValue;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(frame_len));
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(frame_len);
        let message = serde_json::from_slice(&frame)?;
        Ok(Some(message))
    }
}

impl Encoder<JsonValue> for LengthPrefixedCodec {
    type Error = FrameError;

    fn encode(&mut self, item: JsonValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = serde_json::to_vec(&item)?;
        if bytes.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge(bytes.len()));
        }
        let length = u32::try_from(bytes.len()).map_err(|_| FrameError::FrameTooLarge(bytes.len()))?;

        dst.reserve(4 + bytes.len());
        dst.put_u32(length);
        dst.put_slice(&bytes);
        Ok(())
    }
}

/// Newline-delimited JSON. Blank lines are skipped.
#[derive(Debug, Clone)]
pub struct JsonLinesCodec {
    max_line_length: usize,
    /// Bytes already scanned for a newline.
    scanned: usize,
}

impl JsonLinesCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            scanned: 0,
        }
    }
}

impl Default for JsonLinesCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLinesCodec {
    type Item = JsonValue;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let newline = src[self.scanned..].iter().position(|&b| b == b'\n');
            let Some(offset) = newline else {
                self.scanned = src.len();
                if src.len() > self.max_line_length {
                    return Err(FrameError::LineTooLong(src.len()));
                }
                return Ok(None);
            };

            let pos = self.scanned + offset;
            self.scanned = 0;
            if pos > self.max_line_length {
                return Err(FrameError::LineTooLong(pos));
            }

            let line = src.split_to(pos);
            src.advance(1);
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let message = serde_json::from_slice(&line)?;
            return Ok(Some(message));
        }
    }
}

impl Encoder<JsonValue> for JsonLinesCodec {
    type Error = FrameError;

    fn encode(&mut self, item: JsonValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // serde_json never emits a raw newline, so one document is one line.
        let bytes = serde_json::to_vec(&item)?;
        if bytes.len() > self.max_line_length {
            return Err(FrameError::LineTooLong(bytes.len()));
        }

        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(b'\n');
        Ok(())
    }
}

/// Either framing, chosen at runtime.
#[derive(Debug, Clone)]
pub enum FrameCodec {
    Lines(JsonLinesCodec),
    Prefixed(LengthPrefixedCodec),
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        match framing {
            Framing::NewlineDelimited => {
                FrameCodec::Lines(JsonLinesCodec::with_max_line_length(max_frame_size))
            }
            Framing::LengthPrefixed => {
                FrameCodec::Prefixed(LengthPrefixedCodec::with_max_frame_size(max_frame_size))
            }
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(Framing::default(), DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = JsonValue;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            FrameCodec::Lines(codec) => codec.decode(src),
            FrameCodec::Prefixed(codec) => codec.decode(src),
        }
    }
}

impl Encoder<JsonValue> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: JsonValue, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self {
            FrameCodec::Lines(codec) => codec.encode(item, dst),
            FrameCodec::Prefixed(codec) => codec.encode(item, dst),
        }
    }
}

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Line too long: {0} bytes")]
    LineTooLong(usize),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
