//! Wire shapes exchanged over the fabric.
//!
//! Frames travel as a length-prefixed JSON header followed by the raw
//! row-major pixel bytes. Identity, transcription and prompt messages are
//! plain JSON values.

use serde::{Deserialize, Serialize};

use crate::error::{KairaError, KairaResult};

pub const DTYPE_UINT8: &str = "uint8";

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct FrameHeader {
    pub dtype: String,
    pub shape: [usize; 3],
    pub send_time: f64,
}

/// A raw image buffer in row-major `[height, width, channels]` layout.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub dtype: String,
    pub shape: [usize; 3],
    pub data: Vec<u8>,
}

impl Frame {
    pub fn rgb8(width: usize, height: usize, data: Vec<u8>) -> Frame {
        Frame {
            dtype: DTYPE_UINT8.to_owned(),
            shape: [height, width, 3],
            data,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct IdentityMessage {
    pub identity: String,
    pub timestamp: f64,
}

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionKind {
    Chunk,
    Final,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TranscriptionMessage {
    #[serde(rename = "type")]
    pub kind: TranscriptionKind,
    pub text: String,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub prompt: String,
    pub timestamp: f64,
}

fn dtype_size(dtype: &str) -> Option<usize> {
    match dtype {
        "uint8" | "int8" => Some(1),
        "uint16" | "int16" => Some(2),
        "float32" => Some(4),
        _ => None,
    }
}

fn expected_payload_len(header: &FrameHeader) -> KairaResult<usize> {
    let element_size = dtype_size(&header.dtype)
        .ok_or_else(|| KairaError::MalformedEnvelope(format!("unknown dtype {}", header.dtype)))?;
    Ok(header.shape.iter().product::<usize>() * element_size)
}

pub fn encode_frame(frame: &Frame, send_time: f64) -> KairaResult<Vec<u8>> {
    let header = FrameHeader {
        dtype: frame.dtype.clone(),
        shape: frame.shape,
        send_time,
    };
    if frame.data.len() != expected_payload_len(&header)? {
        return Err(KairaError::MalformedEnvelope(format!(
            "frame data is {} bytes but shape {:?} requires {}",
            frame.data.len(),
            frame.shape,
            expected_payload_len(&header)?
        )));
    }
    let header_bytes = serde_json::to_vec(&header)?;
    let mut wire = Vec::with_capacity(4 + header_bytes.len() + frame.data.len());
    wire.extend_from_slice(&(header_bytes.len() as u32).to_be_bytes());
    wire.extend_from_slice(&header_bytes);
    wire.extend_from_slice(&frame.data);
    Ok(wire)
}

pub fn decode_frame(wire: &[u8]) -> KairaResult<(FrameHeader, Frame)> {
    if wire.len() < 4 {
        return Err(KairaError::MalformedEnvelope(
            "frame message shorter than length prefix".to_owned(),
        ));
    }
    let header_len = u32::from_be_bytes([wire[0], wire[1], wire[2], wire[3]]) as usize;
    if wire.len() < 4 + header_len {
        return Err(KairaError::MalformedEnvelope(
            "frame header truncated".to_owned(),
        ));
    }
    let header: FrameHeader = serde_json::from_slice(&wire[4..4 + header_len])?;
    let payload = &wire[4 + header_len..];
    if payload.len() != expected_payload_len(&header)? {
        return Err(KairaError::MalformedEnvelope(format!(
            "frame payload is {} bytes but shape {:?} requires {}",
            payload.len(),
            header.shape,
            expected_payload_len(&header)?
        )));
    }
    let frame = Frame {
        dtype: header.dtype.clone(),
        shape: header.shape,
        data: payload.to_vec(),
    };
    Ok((header, frame))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip_is_lossless() {
        let data: Vec<u8> = (0..2 * 3 * 3).map(|byte| byte as u8).collect();
        let frame = Frame::rgb8(3, 2, data);
        let wire = encode_frame(&frame, 1234.5).unwrap();

        let (header, decoded) = decode_frame(&wire).unwrap();
        assert_eq!(header.dtype, "uint8");
        assert_eq!(header.shape, [2, 3, 3]);
        assert_eq!(header.send_time, 1234.5);
        assert_eq!(decoded, frame);

        // re-encoding reproduces the exact wire bytes
        let wire_again = encode_frame(&decoded, header.send_time).unwrap();
        assert_eq!(wire_again, wire);
    }

    #[test]
    fn truncated_wire_is_rejected() {
        let frame = Frame::rgb8(4, 4, vec![0; 4 * 4 * 3]);
        let wire = encode_frame(&frame, 0.0).unwrap();
        assert!(decode_frame(&wire[..2]).is_err());
        assert!(decode_frame(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn shape_and_payload_must_agree() {
        let frame = Frame {
            dtype: DTYPE_UINT8.to_owned(),
            shape: [2, 2, 3],
            data: vec![0; 5],
        };
        assert!(encode_frame(&frame, 0.0).is_err());
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let frame = Frame {
            dtype: "complex128".to_owned(),
            shape: [1, 1, 1],
            data: vec![0; 16],
        };
        assert!(encode_frame(&frame, 0.0).is_err());
    }

    #[test]
    fn transcription_kind_uses_lowercase_type_field() {
        let message = TranscriptionMessage {
            kind: TranscriptionKind::Chunk,
            text: "hello".to_owned(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"type":"chunk","text":"hello"}"#);

        let parsed: TranscriptionMessage =
            serde_json::from_str(r#"{"type":"final","text":""}"#).unwrap();
        assert_eq!(parsed.kind, TranscriptionKind::Final);
    }
}
