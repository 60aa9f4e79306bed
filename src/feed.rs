//! Where the driver gets its minibatches from.
//!
//! `RemoteFeed` talks to a loader process over the queues, `LocalFeed` decodes
//! in the trainer itself when parallel loading is off. The driver issues the
//! same calls either way:
//!
//! ```text
//! prime(0)  ready  [compute]  request(1) calc_finished  ready  [compute]  ...  ready  [compute]
//! ```

use std::{io, mem};

use comms::{
    msg::{Command, Msg, Payload},
    specs::{AugmentParams, MinibatchRequest, Role},
};
use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task,
};

use crate::{
    data::{self, Decoder, ImageMean},
    device::SharedBufferSet,
    error::{PipelineErr, Result},
    link::TrainerLinks,
};

/// The query and positive requests of one minibatch.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestPair {
    pub query: MinibatchRequest,
    pub positive: MinibatchRequest,
}

impl RequestPair {
    /// Builds the pair for the files `a` and `b` with their own crop parameters.
    pub fn new(a: &[String], b: &[String], query: AugmentParams, positive: AugmentParams) -> Self {
        Self {
            query: MinibatchRequest {
                files: a.to_vec(),
                params: query,
                role: Role::Query,
            },
            positive: MinibatchRequest {
                files: b.to_vec(),
                params: positive,
                role: Role::Positive,
            },
        }
    }
}

/// Supplies minibatches into the shared buffers.
#[trait_variant::make(MinibatchFeed: Send)]
pub trait MinibatchFeedTemplate {
    /// Requests the first minibatch of a pass and releases the buffers to be written.
    async fn prime(&mut self, first: RequestPair) -> Result<()>;

    /// Waits until `buffers` hold the last requested minibatch.
    async fn ready(&mut self, buffers: &mut SharedBufferSet) -> Result<()>;

    /// Requests the minibatch following the one being computed.
    ///
    /// Must only be called once the compute reading the buffers was launched.
    async fn request(&mut self, next: RequestPair) -> Result<()>;

    /// Releases the buffers, the compute reading them was launched.
    async fn calc_finished(&mut self) -> Result<()>;

    /// Tells the source no more minibatches will be requested.
    async fn terminate(&mut self) -> Result<()>;
}

/// A feed backed by a loader process.
pub struct RemoteFeed<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    links: TrainerLinks<R, W>,
}

impl<R, W> RemoteFeed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Hands the exported buffers and the image mean to the loader.
    ///
    /// # Arguments
    /// * `links` - The established links to the loader.
    /// * `buffers` - The shared buffers the loader will write.
    /// * `mean` - The image mean the loader subtracts.
    ///
    /// # Errors
    /// Returns `ChannelClosed` if the loader is gone.
    pub async fn handshake(
        mut links: TrainerLinks<R, W>,
        buffers: &SharedBufferSet,
        mean: &ImageMean,
    ) -> Result<Self> {
        let (_, tx) = &mut links.control;

        tx.send(&Msg::Control(Command::Export(buffers.exports())))
            .await
            .map_err(|e| PipelineErr::on_link("control", e))?;

        tx.send(&Msg::Data(Payload::ImageMean(mean.as_slice())))
            .await
            .map_err(|e| PipelineErr::on_link("control", e))?;

        info!("shared buffers exported to the loader");
        Ok(Self { links })
    }

    async fn put_pair(&mut self, pair: RequestPair) -> Result<()> {
        self.links.requests.put(Command::Load(pair.query)).await?;
        self.links.requests.put(Command::Load(pair.positive)).await
    }
}

impl<R, W> MinibatchFeed for RemoteFeed<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn prime(&mut self, first: RequestPair) -> Result<()> {
        self.put_pair(first).await?;
        self.links.requests.put(Command::CalcFinished).await
    }

    async fn ready(&mut self, buffers: &mut SharedBufferSet) -> Result<()> {
        match self.links.ready.get().await? {
            Command::CopyFinished => {
                buffers.acquire();
                Ok(())
            }
            other => Err(PipelineErr::ProtocolViolation {
                state: "waiting for the minibatch",
                expected: "copy_finished",
                got: other.kind(),
            }),
        }
    }

    async fn request(&mut self, next: RequestPair) -> Result<()> {
        self.put_pair(next).await
    }

    async fn calc_finished(&mut self) -> Result<()> {
        self.links.requests.put(Command::CalcFinished).await
    }

    async fn terminate(&mut self) -> Result<()> {
        self.links.requests.put(Command::Terminate).await?;
        self.links.requests.close().await
    }
}

/// A feed decoding in the trainer, used when parallel loading is off.
///
/// The minibatch is decoded when the driver asks for it, so nothing overlaps
/// with compute and no link is ever used.
pub struct LocalFeed {
    decoder: Decoder,
    rng: StdRng,
    pending: Option<RequestPair>,
    query: Vec<f32>,
    positive: Vec<f32>,
    negative: Vec<f32>,
    loaded: usize,
}

impl LocalFeed {
    pub fn new(decoder: Decoder, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            decoder,
            rng,
            pending: None,
            query: Vec::new(),
            positive: Vec::new(),
            negative: Vec::new(),
            loaded: 0,
        }
    }

    /// Amount of minibatches decoded so far.
    #[inline]
    pub fn loaded(&self) -> usize {
        self.loaded
    }

    fn stage(&mut self, pair: RequestPair) -> Result<()> {
        if self.pending.replace(pair).is_some() {
            return Err(PipelineErr::ProtocolViolation {
                state: "loading synchronously",
                expected: "ready",
                got: "load",
            });
        }

        Ok(())
    }
}

impl MinibatchFeed for LocalFeed {
    async fn prime(&mut self, first: RequestPair) -> Result<()> {
        self.stage(first)
    }

    async fn ready(&mut self, buffers: &mut SharedBufferSet) -> Result<()> {
        let Some(pair) = self.pending.take() else {
            return Err(PipelineErr::ProtocolViolation {
                state: "loading synchronously",
                expected: "load",
                got: "ready",
            });
        };

        let decoder = self.decoder.clone();
        let seed = self.rng.random::<u64>();
        let mut query = mem::take(&mut self.query);
        let mut positive = mem::take(&mut self.positive);

        let (query, positive) = task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            decoder.decode_into(&pair.query.files, pair.query.params, &mut rng, &mut query)?;
            decoder.decode_into(&pair.positive.files, pair.positive.params, &mut rng, &mut positive)?;
            Ok::<_, PipelineErr>((query, positive))
        })
        .await
        .map_err(|e| io::Error::other(format!("decode join error: {e}")))??;

        self.query = query;
        self.positive = positive;

        let sample_len = self.decoder.shape().sample_len();
        data::rotate_negatives(&self.positive, sample_len, &mut self.negative);

        buffers.get_mut(Role::Query).write_f32(&self.query)?;
        buffers.get_mut(Role::Positive).write_f32(&self.positive)?;
        buffers.get_mut(Role::Negative).write_f32(&self.negative)?;
        buffers.publish();
        buffers.acquire();

        self.loaded += 1;
        debug!(loaded = self.loaded; "minibatch decoded in place");
        Ok(())
    }

    async fn request(&mut self, next: RequestPair) -> Result<()> {
        self.stage(next)
    }

    async fn calc_finished(&mut self) -> Result<()> {
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        self.pending = None;
        Ok(())
    }
}
