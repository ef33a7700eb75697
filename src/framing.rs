//! Framed answer stream.
//!
//! Each frame is a header line `<kind> <len>\n` followed by exactly `len`
//! payload bytes. `data` frames carry answer text, one `meta` frame carries
//! the JSON usage trailer, and an `error` frame reports a failure mid-stream.
//! Payloads are never scanned, so answer text may contain anything.

use axum::body::Bytes;
use thiserror::Error;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::models::UsageReport;

pub const CONTENT_TYPE: &str = "application/x-pro-search-frames";

const MAX_HEADER_LEN: usize = 32;
/// Largest accepted payload, matching `LengthDelimitedCodec`'s default.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Data(String),
    Meta(UsageReport),
    Error(String),
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame header: {0}")]
    Header(String),

    #[error("unknown frame kind `{0}`")]
    Kind(String),

    #[error("frame payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("malformed trailer metadata: {0}")]
    Meta(#[from] serde_json::Error),

    #[error("stream ended inside a frame")]
    Truncated,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn encode_to_bytes(frame: Frame) -> Result<Bytes, FrameError> {
        let mut buffer = BytesMut::new();
        FrameCodec.encode(frame, &mut buffer)?;
        Ok(buffer.freeze())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (kind, payload) = match frame {
            Frame::Data(text) => ("data", text.into_bytes()),
            Frame::Meta(usage) => ("meta", serde_json::to_vec(&usage)?),
            Frame::Error(message) => ("error", message.into_bytes()),
        };
        let header = format!("{kind} {}\n", payload.len());
        dst.reserve(header.len() + payload.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(newline) = src.iter().take(MAX_HEADER_LEN).position(|b| *b == b'\n') else {
            if src.len() >= MAX_HEADER_LEN {
                return Err(FrameError::Header(format!(
                    "no newline within {MAX_HEADER_LEN} bytes"
                )));
            }
            return Ok(None);
        };

        let header = std::str::from_utf8(&src[..newline])
            .map_err(|_| FrameError::Header("header is not UTF-8".to_string()))?;
        let (kind, len) = header
            .split_once(' ')
            .ok_or_else(|| FrameError::Header(header.to_string()))?;
        let len: usize = len
            .parse()
            .map_err(|_| FrameError::Header(header.to_string()))?;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Header(format!(
                "payload of {len} bytes exceeds {MAX_FRAME_LEN}"
            )));
        }
        let kind = kind.to_string();

        let total = (newline + 1)
            .checked_add(len)
            .ok_or_else(|| FrameError::Header(header.to_string()))?;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(newline + 1);
        let payload = src.split_to(len).to_vec();
        let frame = match kind.as_str() {
            "data" => Frame::Data(String::from_utf8(payload)?),
            "meta" => Frame::Meta(serde_json::from_slice(&payload)?),
            "error" => Frame::Error(String::from_utf8(payload)?),
            _ => return Err(FrameError::Kind(kind)),
        };
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated),
        }
    }
}

/// What a consumer ends up with once the stream is fully read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledAnswer {
    pub text: String,
    pub usage: Option<UsageReport>,
    pub error: Option<String>,
}

/// Incrementally rebuilds an answer from arbitrarily chunked frame bytes.
#[derive(Debug, Default)]
pub struct AnswerAssembler {
    codec: FrameCodec,
    buffer: BytesMut,
    answer: AssembledAnswer,
}

impl AnswerAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<(), FrameError> {
        self.buffer.extend_from_slice(chunk);
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            self.apply(frame);
        }
        Ok(())
    }

    /// Answer text received so far.
    pub fn text(&self) -> &str {
        &self.answer.text
    }

    pub fn finish(mut self) -> Result<AssembledAnswer, FrameError> {
        while let Some(frame) = self.codec.decode_eof(&mut self.buffer)? {
            self.apply(frame);
        }
        Ok(self.answer)
    }

    fn apply(&mut self, frame: Frame) {
        match frame {
            Frame::Data(text) => self.answer.text.push_str(&text),
            Frame::Meta(usage) => self.answer.usage = Some(usage),
            Frame::Error(message) => self.answer.error = Some(message),
        }
    }
}
