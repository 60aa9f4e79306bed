//! The minibatch loader process.
//!
//! The loader maps the trainer's shared buffers and then serves minibatches one
//! iteration at a time:
//!
//! ```text
//! AwaitHandshake -> AwaitMean -> Ready -> Decode -> AwaitSync -> Copy -> SignalReady
//!                                  ^                                         |
//!                                  +-----------------------------------------+
//! ```
//!
//! Decoding happens into private staging blocks as soon as the request pair
//! arrives, overlapping the trainer's compute. The shared buffers are only
//! written after `calc_finished`, and `copy_finished` hands them back.

use std::{io, mem, path::PathBuf};

use comms::{
    msg::{Command, Msg, Payload},
    specs::{MinibatchRequest, Role},
};
use log::{debug, error, info, trace};
use rand::{Rng, SeedableRng, rngs::StdRng};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    task,
};

use crate::{
    config::TrainConfig,
    data::{self, Decoder, ImageMean},
    device::{DeviceContext, MappedBufferSet},
    error::{PipelineErr, Result},
    link::{self, LoaderLinks},
};

/// The loader's position in its protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderState {
    AwaitHandshake,
    AwaitMean,
    Ready,
    Decode,
    AwaitSync,
    Copy,
    SignalReady,
    Terminated,
}

impl LoaderState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoaderState::AwaitHandshake => "awaiting the handshake",
            LoaderState::AwaitMean => "awaiting the image mean",
            LoaderState::Ready => "awaiting a request",
            LoaderState::Decode => "decoding",
            LoaderState::AwaitSync => "awaiting calc_finished",
            LoaderState::Copy => "copying",
            LoaderState::SignalReady => "signalling copy_finished",
            LoaderState::Terminated => "terminated",
        }
    }

    fn violation(self, expected: &'static str, got: &'static str) -> PipelineErr {
        PipelineErr::ProtocolViolation {
            state: self.as_str(),
            expected,
            got,
        }
    }
}

/// The part of the configuration the loader needs.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub device_id: u32,
    pub shm_dir: PathBuf,
    pub raw_size: usize,
    pub batch_crop_mirror: bool,
    pub seed: Option<u64>,
}

impl From<&TrainConfig> for LoaderConfig {
    fn from(cfg: &TrainConfig) -> Self {
        Self {
            device_id: cfg.gpu_device_id,
            shm_dir: cfg.shm_dir.clone(),
            raw_size: cfg.raw_size,
            batch_crop_mirror: cfg.batch_crop_mirror,
            seed: cfg.seed,
        }
    }
}

/// Binds the rendezvous address, waits for the trainer and serves it to the end.
///
/// # Errors
/// Returns the fatal error that stopped the loader, if any.
pub async fn run_loader(cfg: &TrainConfig) -> Result<()> {
    let addr = cfg
        .sock_data
        .as_deref()
        .ok_or_else(|| PipelineErr::Config("the loader needs sock_data".into()))?;

    let listener = TcpListener::bind(addr).await?;
    info!("loader listening at {addr}");

    let links = link::accept(&listener).await?;
    let lcfg = LoaderConfig::from(cfg);
    let device = DeviceContext::open(lcfg.device_id, &lcfg.shm_dir)?;

    Loader::new(lcfg, device, links).run().await
}

/// Serves minibatch requests into the trainer's shared buffers.
pub struct Loader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    cfg: LoaderConfig,
    device: DeviceContext,
    links: LoaderLinks<R, W>,
    state: LoaderState,
    rng: StdRng,
    rx_buf: Vec<u32>,
    query: Vec<f32>,
    positive: Vec<f32>,
    negative: Vec<f32>,
    served: usize,
}

impl<R, W> Loader<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(cfg: LoaderConfig, device: DeviceContext, links: LoaderLinks<R, W>) -> Self {
        let rng = match cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            cfg,
            device,
            links,
            state: LoaderState::AwaitHandshake,
            rng,
            rx_buf: Vec::new(),
            query: Vec::new(),
            positive: Vec::new(),
            negative: Vec::new(),
            served: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> LoaderState {
        self.state
    }

    /// Runs the loader until the trainer terminates it or a fatal error occurs.
    ///
    /// A fatal error is reported to the trainer on the load-ready queue before
    /// being returned, so the trainer never waits on a `copy_finished` that won't come.
    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        let failed_in = self.state;
        self.state = LoaderState::Terminated;

        match &result {
            Ok(()) => info!("loader done after {} minibatches", self.served),
            Err(e) => {
                error!("loader failed while {}: {e}", failed_in.as_str());
                if let Err(report) = self.links.ready.fail(&e.to_string()).await {
                    debug!("could not report the failure: {report}");
                }
            }
        }

        result
    }

    async fn serve(&mut self) -> Result<()> {
        let mut buffers = self.await_handshake().await?;
        let decoder = self.await_mean(&buffers).await?;

        while let Some((query, positive)) = self.next_pair().await? {
            self.decode(&decoder, query, positive).await?;
            self.await_sync().await?;
            self.copy(&mut buffers)?;
            self.signal_ready().await?;
        }

        Ok(())
    }

    fn enter(&mut self, state: LoaderState) {
        trace!("loader: {} -> {}", self.state.as_str(), state.as_str());
        self.state = state;
    }

    async fn await_handshake(&mut self) -> Result<MappedBufferSet> {
        self.enter(LoaderState::AwaitHandshake);

        let (rx, _) = &mut self.links.control;
        let msg: Msg = rx
            .recv_into(&mut self.rx_buf)
            .await
            .map_err(|e| PipelineErr::on_link("control", e))?;

        let exports = match msg {
            Msg::Control(Command::Export(exports)) => exports,
            other => return Err(self.state.violation("export", other.kind())),
        };

        let buffers = MappedBufferSet::import(&self.device, &exports)?;
        info!("mapped the shared buffers: {:?}", buffers.shape());

        Ok(buffers)
    }

    async fn await_mean(&mut self, buffers: &MappedBufferSet) -> Result<Decoder> {
        self.enter(LoaderState::AwaitMean);

        let shape = buffers.shape();
        let (rx, _) = &mut self.links.control;
        let mut mean_buf: Vec<f32> = Vec::new();
        let msg: Msg = rx
            .recv_into(&mut mean_buf)
            .await
            .map_err(|e| PipelineErr::on_link("control", e))?;

        let mean = match msg {
            Msg::Data(Payload::ImageMean(values)) => {
                ImageMean::from_flat(values, shape.channels, self.cfg.raw_size)?
            }
            other => return Err(self.state.violation("image mean", other.kind())),
        };

        Decoder::new(mean, self.cfg.raw_size, shape, self.cfg.batch_crop_mirror)
    }

    /// Takes the next query/positive request pair, `None` once the trainer is done.
    async fn next_pair(&mut self) -> Result<Option<(MinibatchRequest, MinibatchRequest)>> {
        self.enter(LoaderState::Ready);

        let query = match self.links.requests.get().await {
            Ok(Command::Load(req)) => req,
            Ok(Command::Terminate) => {
                debug!("terminate received");
                return Ok(None);
            }
            Err(PipelineErr::ChannelClosed { .. }) => {
                debug!("request link closed while idle");
                return Ok(None);
            }
            Ok(other) => return Err(self.state.violation("load", other.kind())),
            Err(e) => return Err(e),
        };

        let positive = match self.links.requests.get().await? {
            Command::Load(req) => req,
            other => return Err(self.state.violation("load", other.kind())),
        };

        if query.role != Role::Query {
            return Err(self.state.violation("a query request", query.role.as_str()));
        }

        if positive.role != Role::Positive {
            return Err(self.state.violation("a positive request", positive.role.as_str()));
        }

        Ok(Some((query, positive)))
    }

    async fn decode(
        &mut self,
        decoder: &Decoder,
        query: MinibatchRequest,
        positive: MinibatchRequest,
    ) -> Result<()> {
        self.enter(LoaderState::Decode);

        let decoder = decoder.clone();
        let seed = self.rng.random::<u64>();
        let mut query_buf = mem::take(&mut self.query);
        let mut positive_buf = mem::take(&mut self.positive);

        let (query_buf, positive_buf) = task::spawn_blocking(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            decoder.decode_into(&query.files, query.params, &mut rng, &mut query_buf)?;
            decoder.decode_into(&positive.files, positive.params, &mut rng, &mut positive_buf)?;
            Ok::<_, PipelineErr>((query_buf, positive_buf))
        })
        .await
        .map_err(|e| io::Error::other(format!("decode join error: {e}")))??;

        self.query = query_buf;
        self.positive = positive_buf;
        Ok(())
    }

    async fn await_sync(&mut self) -> Result<()> {
        self.enter(LoaderState::AwaitSync);

        match self.links.requests.get().await? {
            Command::CalcFinished => Ok(()),
            other => Err(self.state.violation("calc_finished", other.kind())),
        }
    }

    fn copy(&mut self, buffers: &mut MappedBufferSet) -> Result<()> {
        self.enter(LoaderState::Copy);

        let sample_len = buffers.shape().sample_len();
        data::rotate_negatives(&self.positive, sample_len, &mut self.negative);

        buffers.get_mut(Role::Query).write_f32(&self.query)?;
        buffers.get_mut(Role::Positive).write_f32(&self.positive)?;
        buffers.get_mut(Role::Negative).write_f32(&self.negative)?;
        buffers.publish();

        Ok(())
    }

    async fn signal_ready(&mut self) -> Result<()> {
        self.enter(LoaderState::SignalReady);

        self.links.ready.put(Command::CopyFinished).await?;
        self.served += 1;
        debug!(served = self.served; "minibatch ready");
        Ok(())
    }
}
