//! Single-slot blocking queues between the trainer and the loader.
//!
//! Each queue rides its own link. The consumer acks every item it takes, so the
//! producer knows when the slot frees up: `put` blocks while the previous item
//! is still untaken and `get` blocks while nothing was put. This bounds the
//! loader to one minibatch of lookahead and gives natural backpressure.

use comms::{
    MsgReceiver, MsgSender,
    msg::{Command, Msg},
    specs::Link,
};
use log::{error, trace};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{PipelineErr, Result};

/// Amount of items that may sit in a queue untaken.
pub const CAPACITY: usize = 1;

/// The producing end of a bounded queue.
pub struct QueueSender<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    link: Link,
    rx: MsgReceiver<R>,
    tx: MsgSender<W>,
    in_flight: usize,
    rx_buf: Vec<u32>,
}

impl<R, W> QueueSender<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates the producing end of the queue carried by `link`.
    ///
    /// # Arguments
    /// * `link` - Which queue this is, used in logs and errors.
    /// * `rx` - Where the consumer's acks arrive.
    /// * `tx` - Where items are sent.
    pub fn new(link: Link, rx: MsgReceiver<R>, tx: MsgSender<W>) -> Self {
        Self {
            link,
            rx,
            tx,
            in_flight: 0,
            rx_buf: Vec::new(),
        }
    }

    /// Puts `cmd` in the queue, waiting for the slot to be free first.
    ///
    /// # Errors
    /// Returns `ChannelClosed` if the consumer is gone or `ProtocolViolation` if it
    /// answers with something else than an ack.
    pub async fn put(&mut self, cmd: Command) -> Result<()> {
        while self.in_flight >= CAPACITY {
            self.wait_ack().await?;
        }

        trace!("{} <- {}", self.link.as_str(), cmd.kind());

        let link = self.link.as_str();
        self.tx
            .send(&Msg::Control(cmd))
            .await
            .map_err(|e| PipelineErr::on_link(link, e))?;

        self.in_flight += 1;
        Ok(())
    }

    async fn wait_ack(&mut self) -> Result<()> {
        let link = self.link.as_str();
        let msg: Msg = self
            .rx
            .recv_into(&mut self.rx_buf)
            .await
            .map_err(|e| PipelineErr::on_link(link, e))?;

        match msg {
            Msg::Control(Command::Ack) => {
                self.in_flight -= 1;
                Ok(())
            }
            Msg::Err(detail) => {
                error!("{link} consumer failed: {detail}");
                Err(PipelineErr::ChannelClosed { link })
            }
            other => Err(PipelineErr::ProtocolViolation {
                state: "waiting for a queue slot",
                expected: "ack",
                got: other.kind(),
            }),
        }
    }

    /// Reports a fatal error to the consumer in place of the next item.
    pub async fn fail(&mut self, detail: &str) -> Result<()> {
        let link = self.link.as_str();
        self.tx
            .send(&Msg::Err(detail.into()))
            .await
            .map_err(|e| PipelineErr::on_link(link, e))
    }

    /// Closes the queue, the consumer observes end of stream once it drains it.
    pub async fn close(&mut self) -> Result<()> {
        let link = self.link.as_str();
        self.tx
            .shutdown()
            .await
            .map_err(|e| PipelineErr::on_link(link, e))
    }
}

/// The consuming end of a bounded queue.
pub struct QueueReceiver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    link: Link,
    rx: MsgReceiver<R>,
    tx: MsgSender<W>,
    rx_buf: Vec<u32>,
}

impl<R, W> QueueReceiver<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates the consuming end of the queue carried by `link`.
    ///
    /// # Arguments
    /// * `link` - Which queue this is, used in logs and errors.
    /// * `rx` - Where items arrive.
    /// * `tx` - Where acks are sent.
    pub fn new(link: Link, rx: MsgReceiver<R>, tx: MsgSender<W>) -> Self {
        Self {
            link,
            rx,
            tx,
            rx_buf: Vec::new(),
        }
    }

    /// Takes the next item, waiting until one is put, and frees the slot.
    ///
    /// # Errors
    /// Returns `ChannelClosed` if the producer is gone or `ProtocolViolation` if
    /// something else than a command arrives.
    pub async fn get(&mut self) -> Result<Command> {
        let link = self.link.as_str();
        let msg: Msg = self
            .rx
            .recv_into(&mut self.rx_buf)
            .await
            .map_err(|e| PipelineErr::on_link(link, e))?;

        let cmd = match msg {
            Msg::Control(Command::Ack) => {
                return Err(PipelineErr::ProtocolViolation {
                    state: "waiting for a queue item",
                    expected: "command",
                    got: "ack",
                });
            }
            Msg::Control(cmd) => cmd,
            Msg::Err(detail) => {
                error!("{link} producer failed: {detail}");
                return Err(PipelineErr::ChannelClosed { link });
            }
            other => {
                return Err(PipelineErr::ProtocolViolation {
                    state: "waiting for a queue item",
                    expected: "command",
                    got: other.kind(),
                });
            }
        };

        trace!("{link} -> {}", cmd.kind());

        self.tx
            .send(&Msg::Control(Command::Ack))
            .await
            .map_err(|e| PipelineErr::on_link(link, e))?;

        Ok(cmd)
    }
}
