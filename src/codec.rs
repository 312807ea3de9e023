//! Multi-part frame codec (spec §4.A).
//!
//! A frame is an ordered sequence of opaque byte parts. Encoding accepts a
//! heterogeneous list of [`Part`]s; each part except the last is marked
//! "more follows" on the wire. Decoding only ever hands the caller the raw
//! byte parts — semantic interpretation (e.g. "part 0 is the client id")
//! belongs to the pipeline, not the codec.
//!
//! The wire format is a thin length-prefixed framing over a byte stream:
//! `u32 part_count`, then for each part `u32 len` followed by `len` bytes.
//! This plays the role the original implementation gave to raw ZMQ
//! multi-part messages; the messaging library itself is treated as an
//! external collaborator (spec §1), so this module owns only the framing,
//! not transport or polling (that's 4.H, `sockets.rs`).

use crate::error::CodecError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Maximum size of a single part, guarding against a malformed length
/// prefix causing an unbounded allocation.
pub const MAX_PART_LEN: usize = 64 * 1024 * 1024;

/// One logical piece of an outbound frame before encoding.
#[derive(Debug, Clone)]
pub enum Part {
    /// Raw bytes, copied as-is.
    Bytes(Vec<u8>),
    /// A UTF-8 string, encoded as its raw bytes.
    Str(String),
    /// A vector of strings, each emitted as its own successive wire part.
    StrList(Vec<String>),
    /// A fixed-width primitive, copied by value in native-endian... no —
    /// big-endian, so frames are portable across hosts.
    U32(u32),
}

impl From<&str> for Part {
    fn from(s: &str) -> Self {
        Part::Str(s.to_owned())
    }
}

impl From<String> for Part {
    fn from(s: String) -> Self {
        Part::Str(s)
    }
}

impl From<u32> for Part {
    fn from(v: u32) -> Self {
        Part::U32(v)
    }
}

impl From<Vec<u8>> for Part {
    fn from(v: Vec<u8>) -> Self {
        Part::Bytes(v)
    }
}

/// Flatten a heterogeneous part list into the raw byte parts that go on the
/// wire. `StrList` expands into one wire part per string.
pub fn flatten_parts(parts: &[Part]) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        match part {
            Part::Bytes(b) => out.push(b.clone()),
            Part::Str(s) => out.push(s.clone().into_bytes()),
            Part::StrList(list) => {
                for s in list {
                    out.push(s.clone().into_bytes());
                }
            }
            Part::U32(v) => out.push(v.to_be_bytes().to_vec()),
        }
    }
    out
}

/// Write a frame to an async byte stream. Aborts (returns `Err`) on the
/// first part that fails to send; the spec does not retry partial frames
/// at the codec layer — that's the pipeline's job (4.F step 10).
pub async fn write_frame<W>(writer: &mut W, parts: &[Part]) -> Result<(), CodecError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let raw = flatten_parts(parts);
    if raw.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    writer.write_u32(raw.len() as u32).await?;
    for part in &raw {
        if part.len() > MAX_PART_LEN {
            return Err(CodecError::PartTooLarge(part.len()));
        }
        writer.write_u32(part.len() as u32).await?;
        writer.write_all(part).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async byte stream, returning the raw opaque parts.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<Vec<u8>>, CodecError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let count = reader.read_u32().await?;
    if count == 0 {
        return Err(CodecError::EmptyFrame);
    }
    let mut parts = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_PART_LEN {
            return Err(CodecError::PartTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        reader.read_exact(&mut buf).await?;
        parts.push(buf);
    }
    Ok(parts)
}

/// Decode a raw part as a big-endian `u32`; used by the pipeline to pull
/// `msg-id` / `severity` / `status-code` out of a decoded frame.
pub fn part_as_u32(part: &[u8]) -> Result<u32, CodecError> {
    let arr: [u8; 4] = part
        .try_into()
        .map_err(|_| CodecError::PartTooLarge(part.len()))?;
    Ok(u32::from_be_bytes(arr))
}

/// Decode a raw part as a UTF-8 string.
pub fn part_as_string(part: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(part.to_vec()).map_err(CodecError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encode_decode_round_trip_is_identity() {
        let parts = vec![
            Part::from("client-1"),
            Part::from(42u32),
            Part::from("SELECT 1".to_owned()),
        ];

        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &parts).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();

        assert_eq!(decoded.len(), 3);
        assert_eq!(part_as_string(&decoded[0]).unwrap(), "client-1");
        assert_eq!(part_as_u32(&decoded[1]).unwrap(), 42);
        assert_eq!(part_as_string(&decoded[2]).unwrap(), "SELECT 1");
    }

    #[tokio::test]
    async fn str_list_expands_into_successive_parts() {
        let parts = vec![Part::StrList(vec![
            "a".to_owned(),
            "b".to_owned(),
            "c".to_owned(),
        ])];
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, &parts).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_frame(&mut cursor).await.unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(part_as_string(&decoded[0]).unwrap(), "a");
        assert_eq!(part_as_string(&decoded[1]).unwrap(), "b");
        assert_eq!(part_as_string(&decoded[2]).unwrap(), "c");
    }

    #[tokio::test]
    async fn empty_frame_is_rejected() {
        let mut buf: Vec<u8> = Vec::new();
        let err = write_frame(&mut buf, &[]).await.unwrap_err();
        assert!(matches!(err, CodecError::EmptyFrame));
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_on_read() {
        let mut buf: Vec<u8> = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&(MAX_PART_LEN as u32 + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, CodecError::PartTooLarge(_)));
    }
}
