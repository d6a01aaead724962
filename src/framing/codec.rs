//! Encode/decode of the textual frame shape `SIGN@ADDR:L1:L2:...:LN:+F1F2...FN`
//! and the timed read/write helpers transports build on.

use super::RawFrame;
use crate::error::FrameError;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames above this size are rejected rather than parsed; guards against a
/// bad length prefix driving an unbounded allocation.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Encodes `fields` into one frame for `signature`, addressed to `address`
/// (or the wire literal `none` when `address` is `None`).
pub fn encode(signature: &str, address: Option<&str>, fields: &[Vec<u8>]) -> Vec<u8> {
    let addr = address.unwrap_or("none");
    let mut header = format!("{signature}@{addr}:");
    for f in fields {
        header.push_str(&f.len().to_string());
        header.push(':');
    }
    header.push('+');

    let mut out = Vec::with_capacity(header.len() + fields.iter().map(|f| f.len()).sum::<usize>());
    out.extend_from_slice(header.as_bytes());
    for f in fields {
        out.extend_from_slice(f);
    }
    out
}

/// Parses a complete frame body (header plus concatenated field bytes)
/// already known to belong to `signature`. Callers that read frames
/// directly off a byte stream should use [`read_frame`] instead, which
/// performs the length-aware read.
pub fn decode(signature: &str, buf: &[u8]) -> Result<RawFrame, FrameError> {
    let plus = find_header_end(buf)?;
    let header = std::str::from_utf8(&buf[..plus])
        .map_err(|_| FrameError::Malformed("header is not valid UTF-8".into()))?;

    let mut parts = header.splitn(2, '@');
    let sign = parts.next().unwrap_or("");
    let rest = parts
        .next()
        .ok_or_else(|| FrameError::Malformed("missing '@' in header".into()))?;

    if sign != signature {
        return Err(FrameError::BadSignature {
            expected: signature.to_string(),
            got: sign.to_string(),
        });
    }

    let mut colon_parts = rest.split(':');
    let addr = colon_parts
        .next()
        .ok_or_else(|| FrameError::Malformed("missing address".into()))?;
    let lengths: Vec<usize> = colon_parts
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| FrameError::BadLength))
        .collect::<Result<_, _>>()?;

    let body = &buf[plus + 1..];
    let total: usize = lengths.iter().sum();
    if total != body.len() {
        return Err(FrameError::BadLength);
    }

    let mut fields = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for len in lengths {
        fields.push(body[offset..offset + len].to_vec());
        offset += len;
    }

    Ok(RawFrame {
        address: if addr == "none" { None } else { Some(addr.to_string()) },
        fields,
    })
}

fn find_header_end(buf: &[u8]) -> Result<usize, FrameError> {
    buf.iter()
        .position(|&b| b == b'+')
        .ok_or_else(|| FrameError::Malformed("missing '+' terminator".into()))
}

/// Writes one frame to `stream`, length-prefixed so the reader can find the
/// frame boundary without scanning for an unescaped delimiter inside binary
/// field data.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    signature: &str,
    address: Option<&str>,
    fields: &[Vec<u8>],
) -> Result<(), FrameError> {
    let bytes = encode(signature, address, fields);
    let len = bytes.len() as u32;

    let write_fut = async {
        stream.write_all(&len.to_le_bytes()).await?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;
        Ok(()) as std::io::Result<()>
    };

    match timeout(WRITE_TIMEOUT, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(FrameError::Io(e)),
        Err(_) => Err(FrameError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "write timed out, peer is not reading",
        ))),
    }
}

/// Reads one length-prefixed frame from `stream` and decodes it against
/// `signature`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    signature: &str,
) -> Result<RawFrame, FrameError> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::Malformed(format!("frame too large: {len} bytes")));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    decode(signature, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_simple() {
        let fields = vec![b"HOWDY".to_vec(), b"sysadmin".to_vec(), b"1".to_vec(), b"0".to_vec()];
        let bytes = encode("APPCTL", None, &fields);
        let frame = decode("APPCTL", &bytes).unwrap();
        assert_eq!(frame.address, None);
        assert_eq!(frame.fields, fields);
    }

    #[test]
    fn round_trip_with_address_and_binary_field() {
        let fields = vec![b"CHUNK".to_vec(), b"1".to_vec(), vec![0u8, 1, 2, 255, 254]];
        let bytes = encode("APPCTL", Some("client-7"), &fields);
        let frame = decode("APPCTL", &bytes).unwrap();
        assert_eq!(frame.address.as_deref(), Some("client-7"));
        assert_eq!(frame.fields, fields);
    }

    #[test]
    fn rejects_wrong_signature() {
        let bytes = encode("APPCTL", None, &[b"HOWDY".to_vec()]);
        let err = decode("OTHER", &bytes).unwrap_err();
        assert!(matches!(err, FrameError::BadSignature { .. }));
    }

    #[test]
    fn rejects_bad_length_prefix() {
        let mut bytes = encode("APPCTL", None, &[b"HOWDY".to_vec()]);
        // Truncate the body so the length prefix no longer matches.
        bytes.pop();
        let err = decode("APPCTL", &bytes).unwrap_err();
        assert!(matches!(err, FrameError::BadLength));
    }
}
