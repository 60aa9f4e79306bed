//! Rendezvous between the trainer and the loader.
//!
//! The loader binds the `sock_data` address and the trainer opens three
//! connections to it: the control channel, the load-request queue and the
//! load-ready queue. Each connection starts with a `Hello` naming its link, so
//! the loader doesn't depend on the accept order.

use std::{io, time::Duration};

use comms::{
    MsgReceiver, MsgSender,
    msg::{Command, Msg},
    specs::Link,
};
use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream, ToSocketAddrs,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time,
};

use crate::{
    error::{PipelineErr, Result},
    queue::{QueueReceiver, QueueSender},
};

const CONNECT_ATTEMPTS: usize = 100;
const CONNECT_INTERVAL: Duration = Duration::from_millis(100);

/// Both ends of one framed connection.
pub type Channel<R, W> = (MsgReceiver<R>, MsgSender<W>);

/// The trainer's side of the three links.
pub struct TrainerLinks<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub control: Channel<R, W>,
    pub requests: QueueSender<R, W>,
    pub ready: QueueReceiver<R, W>,
}

impl<R, W> TrainerLinks<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps three already established channels.
    pub fn new(control: Channel<R, W>, requests: Channel<R, W>, ready: Channel<R, W>) -> Self {
        let (req_rx, req_tx) = requests;
        let (ready_rx, ready_tx) = ready;

        Self {
            control,
            requests: QueueSender::new(Link::LoadRequest, req_rx, req_tx),
            ready: QueueReceiver::new(Link::LoadReady, ready_rx, ready_tx),
        }
    }
}

/// The loader's side of the three links.
pub struct LoaderLinks<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub control: Channel<R, W>,
    pub requests: QueueReceiver<R, W>,
    pub ready: QueueSender<R, W>,
}

impl<R, W> LoaderLinks<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps three already established channels.
    pub fn new(control: Channel<R, W>, requests: Channel<R, W>, ready: Channel<R, W>) -> Self {
        let (req_rx, req_tx) = requests;
        let (ready_rx, ready_tx) = ready;

        Self {
            control,
            requests: QueueReceiver::new(Link::LoadRequest, req_rx, req_tx),
            ready: QueueSender::new(Link::LoadReady, ready_rx, ready_tx),
        }
    }
}

/// Connects the three links to the loader listening at `addr`.
///
/// The loader may still be starting up, so every connection is retried a bounded
/// amount of times before giving up.
///
/// # Errors
/// Returns the last connection error once the attempts are exhausted, or a
/// `ChannelClosed` if the hello can't be delivered.
pub async fn connect<A>(addr: A) -> Result<TrainerLinks<OwnedReadHalf, OwnedWriteHalf>>
where
    A: ToSocketAddrs + Clone,
{
    let control = open(addr.clone(), Link::Control).await?;
    let requests = open(addr.clone(), Link::LoadRequest).await?;
    let ready = open(addr, Link::LoadReady).await?;

    info!("connected to the loader");
    Ok(TrainerLinks::new(control, requests, ready))
}

async fn open<A>(addr: A, link: Link) -> Result<Channel<OwnedReadHalf, OwnedWriteHalf>>
where
    A: ToSocketAddrs,
{
    let stream = connect_with_retry(addr).await?;
    stream.set_nodelay(true)?;

    let (rx, tx) = stream.into_split();
    let (rx, mut tx) = comms::channel(rx, tx);

    tx.send(&Msg::Control(Command::Hello(link)))
        .await
        .map_err(|e| PipelineErr::on_link(link.as_str(), e))?;

    debug!(link = link.as_str(); "link established");
    Ok((rx, tx))
}

async fn connect_with_retry<A: ToSocketAddrs>(addr: A) -> io::Result<TcpStream> {
    let mut attempt = 1;

    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                if attempt % 10 == 0 {
                    warn!("loader not reachable yet ({e}), retrying");
                }

                attempt += 1;
                time::sleep(CONNECT_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Accepts the trainer's three links on `listener`.
///
/// # Errors
/// Returns `ProtocolViolation` if a connection doesn't open with a hello or a link
/// is opened twice.
pub async fn accept(listener: &TcpListener) -> Result<LoaderLinks<OwnedReadHalf, OwnedWriteHalf>> {
    let mut slots: [Option<Channel<OwnedReadHalf, OwnedWriteHalf>>; 3] = [None, None, None];
    let mut rx_buf: Vec<u32> = Vec::new();

    while slots.iter().any(Option::is_none) {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = comms::channel(rx, tx);

        let link = match rx.recv_into(&mut rx_buf).await {
            Ok(Msg::Control(Command::Hello(link))) => link,
            Ok(other) => {
                return Err(PipelineErr::ProtocolViolation {
                    state: "accepting links",
                    expected: "hello",
                    got: other.kind(),
                });
            }
            Err(e) => return Err(PipelineErr::on_link("rendezvous", e)),
        };

        let slot = &mut slots[link_index(link)];
        if slot.is_some() {
            return Err(PipelineErr::ProtocolViolation {
                state: "accepting links",
                expected: "a link not yet opened",
                got: link.as_str(),
            });
        }

        debug!("link {} accepted from {peer}", link.as_str());
        *slot = Some((rx, tx));
    }

    let [Some(control), Some(requests), Some(ready)] = slots else {
        return Err(io::Error::other("rendezvous ended with a link missing").into());
    };

    info!("trainer connected");
    Ok(LoaderLinks::new(control, requests, ready))
}

fn link_index(link: Link) -> usize {
    match link {
        Link::Control => 0,
        Link::LoadRequest => 1,
        Link::LoadReady => 2,
    }
}
