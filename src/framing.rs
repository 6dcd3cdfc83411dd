//! Length-prefixed bincode framing over any async byte stream.
//!
//! Every message is a 4-byte little-endian length followed by a
//! `bincode::config::standard()` payload. A clean EOF at a frame boundary
//! surfaces as [`RpcError::ConnectionClosed`]; a payload that fails to
//! decode surfaces as [`RpcError::Decode`] and leaves the stream aligned on
//! the next frame. A length above [`MAX_FRAME_LEN`] is a protocol error and
//! the payload is never allocated; the prefix arrives before the peer has
//! authenticated, so it is never trusted.

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::RpcError;

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub struct LengthPrefixedRead<R> {
    inner: R,
}

impl<R> LengthPrefixedRead<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> LengthPrefixedRead<R> {
    pub async fn read_msg<T: Decode<()>>(&mut self) -> Result<T, RpcError> {
        let mut len_buf = [0u8; 4];
        self.inner.read_exact(&mut len_buf).await.map_err(eof_is_closed)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(RpcError::Protocol(format!(
                "frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        let mut msg_buf = vec![0u8; len];
        self.inner.read_exact(&mut msg_buf).await.map_err(eof_is_closed)?;
        let (msg, _): (T, _) =
            bincode::decode_from_slice(&msg_buf, bincode::config::standard())?;
        trace!(event = "framing_read", len, "read length-prefixed message");
        Ok(msg)
    }
}

pub struct LengthPrefixedWrite<W> {
    inner: W,
}

impl<W> LengthPrefixedWrite<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }
}

impl<W: AsyncWrite + Unpin> LengthPrefixedWrite<W> {
    pub async fn write_msg<T: Encode>(&mut self, msg: &T) -> Result<(), RpcError> {
        let bytes = bincode::encode_to_vec(msg, bincode::config::standard())?;
        let len = bytes.len() as u32;
        self.inner.write_all(&len.to_le_bytes()).await?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        trace!(event = "framing_write", len, "wrote length-prefixed message");
        Ok(())
    }
}

fn eof_is_closed(err: std::io::Error) -> RpcError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        RpcError::ConnectionClosed
    } else {
        RpcError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Encode, Decode)]
    struct Msg(u64, String);

    #[tokio::test]
    async fn frame_round_trip() {
        let (client, server) = tokio::io::duplex(256);
        let mut writer = LengthPrefixedWrite::new(client);
        let mut reader = LengthPrefixedRead::new(server);
        writer.write_msg(&Msg(9, "nine".into())).await.unwrap();
        let msg: Msg = reader.read_msg().await.unwrap();
        assert_eq!(msg, Msg(9, "nine".into()));
    }

    #[tokio::test]
    async fn eof_reports_connection_closed() {
        let (client, server) = tokio::io::duplex(256);
        drop(client);
        let mut reader = LengthPrefixedRead::new(server);
        match reader.read_msg::<Msg>().await {
            Err(RpcError::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_before_allocation() {
        let (mut client, server) = tokio::io::duplex(64);
        use tokio::io::AsyncWriteExt;
        client.write_all(&u32::MAX.to_le_bytes()).await.unwrap();
        let mut reader = LengthPrefixedRead::new(server);
        match reader.read_msg::<Msg>().await {
            Err(RpcError::Protocol(msg)) => assert!(msg.contains("exceeds")),
            other => panic!("expected Protocol, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_payload_is_a_decode_error() {
        let (mut client, server) = tokio::io::duplex(256);
        use tokio::io::AsyncWriteExt;
        client.write_all(&3u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        let mut reader = LengthPrefixedRead::new(server);
        match reader.read_msg::<Msg>().await {
            Err(RpcError::Decode(_)) => {}
            other => panic!("expected Decode, got {other:?}"),
        }
    }
}
