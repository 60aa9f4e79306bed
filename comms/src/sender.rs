//! The sending end of the framing protocol.
//!
//! A frame is the `LenType` big-endian length followed by the message. The owned
//! part of the message is encoded into a reused buffer behind the length, the
//! borrowed tail is written straight from the caller's memory.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{LEN_TYPE_SIZE, LenType, Serialize};

/// The sending end handle of the communication.
///
/// Frames are written straight to the writer, which is expected to be
/// unbuffered (a socket or pipe half). Only `shutdown` flushes.
pub struct MsgSender<W>
where
    W: AsyncWrite + Unpin,
{
    tx: W,
    frame: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> MsgSender<W> {
    /// Creates a new `MsgSender` instance.
    ///
    /// # Arguments
    /// * `tx` - The underlying writer.
    pub(super) fn new(tx: W) -> Self {
        Self {
            tx,
            frame: Vec::new(),
        }
    }

    /// Encodes `msg` into the frame buffer.
    ///
    /// # Returns
    /// The borrowed tail that completes the frame, if any.
    fn encode<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<Option<&'a [u8]>> {
        self.frame.clear();
        self.frame.extend_from_slice(&[0; LEN_TYPE_SIZE]);

        let tail = msg.serialize(&mut self.frame);
        let body_len = self.frame.len() - LEN_TYPE_SIZE + tail.map_or(0, <[u8]>::len);
        let body_len = LenType::try_from(body_len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large to frame"))?;

        self.frame[..LEN_TYPE_SIZE].copy_from_slice(&body_len.to_be_bytes());
        Ok(tail)
    }

    /// Sends `msg` as one frame.
    ///
    /// # Arguments
    /// * `msg` - A serializable object.
    ///
    /// # Errors
    /// Returns the writer's error, the peer may have gone away.
    pub async fn send<'a, T: Serialize<'a>>(&mut self, msg: &'a T) -> io::Result<()> {
        let tail = self.encode(msg)?;
        self.tx.write_all(&self.frame).await?;

        match tail {
            Some(data) if !data.is_empty() => self.tx.write_all(data).await,
            _ => Ok(()),
        }
    }

    /// Flushes and shuts down the writing half, the peer will observe end of stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.tx.flush().await?;
        self.tx.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::msg::{Msg, Payload};

    #[tokio::test]
    async fn frame_length_covers_the_borrowed_tail() {
        let (one, mut two) = tokio::io::duplex(1024);
        let mut sender = MsgSender::new(one);

        let mean = [1.0f32, 2.0, 3.0];
        sender.send(&Msg::Data(Payload::ImageMean(&mean))).await.unwrap();
        sender.shutdown().await.unwrap();

        let mut wire = Vec::new();
        two.read_to_end(&mut wire).await.unwrap();

        let len = LenType::from_be_bytes(wire[..LEN_TYPE_SIZE].try_into().unwrap()) as usize;
        assert_eq!(len, wire.len() - LEN_TYPE_SIZE);
        assert!(wire.ends_with(bytemuck::cast_slice(&mean)));
    }
}
