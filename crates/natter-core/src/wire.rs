//! Natter wire format — length-prefixed text frames.
//!
//! Every message on a Natter socket is one frame: a 32-bit unsigned
//! length in network byte order followed by exactly that many bytes of
//! UTF-8 text. This module IS the protocol; the framing here is shared
//! by the chat server, the client, and the peer application, and all
//! of them interoperate only because nobody frames bytes any other way.
//!
//! Reads follow a fully-or-fail contract: a frame is returned complete
//! or not at all. There is no resynchronization. Once a peer violates
//! the framing (oversized declared length, non-UTF-8 payload) the only
//! safe move is to close the connection, because the next length word
//! can no longer be located in the stream.

use bytes::{BufMut, BytesMut};
use std::io::{self, ErrorKind};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Size of the length prefix preceding every payload.
pub const LEN_PREFIX_BYTES: usize = 4;

/// Default maximum payload size accepted on decode, in bytes.
///
/// The bound is enforced on the receiving side only. Encoding is
/// deliberately uncapped: the sender writes whatever it was asked to
/// write, and a receiver with a smaller configured limit treats the
/// frame as a protocol violation. Adding a sender-side cap would change
/// observable protocol behavior, so don't.
pub const MAX_FRAME_BYTES: usize = 40960;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise while decoding a frame.
///
/// `Oversize` and `Utf8` are protocol violations: the stream cannot be
/// resynchronized and the caller must close the connection without
/// reading further. `Io` is a transport failure mid-frame. A clean end
/// of stream is not an error; `read_frame` reports it as `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("declared frame length {declared} exceeds maximum {max}")]
    Oversize { declared: usize, max: usize },

    #[error("frame payload is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("transport error while reading frame")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// True for violations of the framing itself, as opposed to the
    /// transport underneath it failing.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FrameError::Oversize { .. } | FrameError::Utf8(_))
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Encode one payload into a ready-to-write frame.
///
/// No length cap is applied here; see [`MAX_FRAME_BYTES`].
pub fn encode_frame(payload: &str) -> BytesMut {
    let bytes = payload.as_bytes();
    let mut buf = BytesMut::with_capacity(LEN_PREFIX_BYTES + bytes.len());
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
    buf
}

/// Encode and write one frame, flushing the stream afterwards.
pub async fn write_frame<W>(writer: &mut W, payload: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload);
    writer.write_all(&frame).await?;
    writer.flush().await
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Read one frame from the stream.
///
/// Returns `Ok(Some(payload))` for a complete frame, `Ok(None)` when the
/// stream ends at a frame boundary or mid-frame (the remote closed; a
/// truncated frame is never surfaced as a partial payload), and `Err`
/// for protocol violations or transport failures.
///
/// The length word is validated against `max_len` before a single
/// payload byte is read, so an oversized declaration never causes an
/// allocation or a read of attacker-chosen size.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<String>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX_BYTES];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    }

    let declared = u32::from_be_bytes(len_buf) as usize;
    if declared > max_len {
        return Err(FrameError::Oversize {
            declared,
            max: max_len,
        });
    }

    let mut payload = vec![0u8; declared];
    match reader.read_exact(&mut payload).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(FrameError::Io(e)),
    }

    Ok(Some(String::from_utf8(payload)?))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
