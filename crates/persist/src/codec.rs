//! Payload framing: `[format tag: u8][length: u32 BE][bytes]`.

use std::io::{Read, Write};
use strata_common::CompressionKind;

/// Bytes preceding the payload in a frame.
pub const FRAME_HEADER_BYTES: usize = 5;

/// Format tag of a framed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Zstd,
    Uncompressed,
}

impl PayloadFormat {
    pub fn tag(self) -> u8 {
        match self {
            PayloadFormat::Zstd => 1,
            PayloadFormat::Uncompressed => 3,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PayloadFormat::Zstd),
            3 => Some(PayloadFormat::Uncompressed),
            _ => None,
        }
    }
}

impl From<CompressionKind> for PayloadFormat {
    fn from(kind: CompressionKind) -> Self {
        match kind {
            CompressionKind::Zstd => PayloadFormat::Zstd,
            CompressionKind::None => PayloadFormat::Uncompressed,
        }
    }
}

/// Errors from framing or (de)compressing a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown payload format tag {0}")]
    UnknownFormat(u8),
    #[error("frame truncated: declares {declared} bytes, {available} available")]
    Truncated { declared: usize, available: usize },
    #[error("frame header missing")]
    MissingHeader,
    #[error("payload of {0} bytes does not fit a u32 length")]
    TooLong(usize),
}

/// Compress `data` and prepend the frame header.
pub fn encode_frame(data: &[u8], format: PayloadFormat, level: i32) -> Result<Vec<u8>, CodecError> {
    let body = match format {
        PayloadFormat::Zstd => zstd_compress(data, level)?,
        PayloadFormat::Uncompressed => data.to_vec(),
    };
    let len = u32::try_from(body.len()).map_err(|_| CodecError::TooLong(body.len()))?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    frame.push(format.tag());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parse a frame (trailing sector padding is ignored) and inflate its payload.
pub fn decode_frame(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    let (format, body) = split_frame(bytes)?;
    match format {
        PayloadFormat::Zstd => zstd_decompress(body),
        PayloadFormat::Uncompressed => Ok(body.to_vec()),
    }
}

/// Validate the header and return the format and the payload slice.
pub fn split_frame(bytes: &[u8]) -> Result<(PayloadFormat, &[u8]), CodecError> {
    if bytes.len() < FRAME_HEADER_BYTES {
        return Err(CodecError::MissingHeader);
    }
    let format = PayloadFormat::from_tag(bytes[0]).ok_or(CodecError::UnknownFormat(bytes[0]))?;
    let declared = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    let available = bytes.len() - FRAME_HEADER_BYTES;
    if declared > available {
        return Err(CodecError::Truncated {
            declared,
            available,
        });
    }
    Ok((
        format,
        &bytes[FRAME_HEADER_BYTES..FRAME_HEADER_BYTES + declared],
    ))
}

fn zstd_compress(data: &[u8], level: i32) -> Result<Vec<u8>, CodecError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zstd_frame_roundtrip_ignores_padding() {
        let data = b"section payload ".repeat(100);
        let mut frame = encode_frame(&data, PayloadFormat::Zstd, 3).unwrap();
        assert_eq!(frame[0], 1);
        frame.resize(4096, 0);
        assert_eq!(decode_frame(&frame).unwrap(), data);
    }

    #[test]
    fn uncompressed_frame_keeps_bytes() {
        let frame = encode_frame(b"abc", PayloadFormat::Uncompressed, 0).unwrap();
        assert_eq!(frame, vec![3, 0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn unknown_tag_rejected() {
        let frame = [9u8, 0, 0, 0, 0];
        assert!(matches!(
            decode_frame(&frame),
            Err(CodecError::UnknownFormat(9))
        ));
    }

    #[test]
    fn truncated_frame_rejected() {
        let frame = [3u8, 0, 0, 0, 10, 1, 2];
        assert!(matches!(
            decode_frame(&frame),
            Err(CodecError::Truncated {
                declared: 10,
                available: 2
            })
        ));
        assert!(matches!(
            decode_frame(&[1, 0]),
            Err(CodecError::MissingHeader)
        ));
    }
}
