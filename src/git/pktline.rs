//! Outbound pkt-line framing for service banners and protocol errors.
//!
//! Each line is a 4-hex-digit length (which counts the header itself)
//! followed by the payload.  `0000` is the flush packet.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub const FLUSH: &[u8] = b"0000";

/// Largest payload a single pkt-line may carry.
pub const MAX_PAYLOAD: usize = 65516;

pub fn encode_line(text: &str) -> Bytes {
    let payload = text.as_bytes();
    let payload = &payload[..payload.len().min(MAX_PAYLOAD)];
    let mut buf = BytesMut::with_capacity(payload.len() + 4);
    buf.put_slice(format!("{:04x}", payload.len() + 4).as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

pub fn encode_error(message: &str) -> Bytes {
    encode_line(&format!("ERR {message}"))
}

pub async fn write_line<W>(stream: &mut W, text: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&encode_line(text)).await
}

pub async fn write_flush<W>(stream: &mut W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(FLUSH).await
}

/// Git clients render this as `fatal: remote error: <message>`.
pub async fn write_error<W>(stream: &mut W, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&encode_error(message)).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_length_includes_header() {
        assert_eq!(&encode_line("hello\n")[..], b"000ahello\n");
        assert_eq!(&encode_line("")[..], b"0004");
    }

    #[test]
    fn error_line_has_err_prefix() {
        assert_eq!(
            &encode_error("Repository not found.")[..],
            b"001dERR Repository not found."
        );
    }

    #[tokio::test]
    async fn writers_emit_frames_in_order() {
        let mut out = Vec::new();
        write_line(&mut out, "# service=git-upload-pack\n").await.unwrap();
        write_flush(&mut out).await.unwrap();
        write_error(&mut out, "boom").await.unwrap();
        assert_eq!(out, b"001e# service=git-upload-pack\n0000000cERR boom".to_vec());
    }
}
