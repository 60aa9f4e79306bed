//! Assembles the trainer and, with parallel loading, its loader child process.

use std::{env, io, path::Path};

use log::{info, warn};
use tokio::process::{Child, Command};

use crate::{
    checkpoint::DirCheckpointStore,
    compute::{EmbeddingSpec, LinearEmbedding},
    config::TrainConfig,
    context::TrainingContext,
    data::{Decoder, ImageMean, TripletFiles},
    device::{DeviceContext, SharedBufferSet},
    driver::Driver,
    error::{PipelineErr, Result},
    feed::{LocalFeed, MinibatchFeed, RemoteFeed},
    link,
};

/// The argument that starts the binary as a loader.
pub const LOADER_MODE: &str = "loader";

/// Runs the whole training described by the configuration at `config_path`.
///
/// With `para_load` a loader child is spawned with the same configuration and
/// joined at the end. On failure the child is killed when dropped.
///
/// # Errors
/// Returns the first fatal error of the trainer or a failed exit of the loader.
pub async fn run_trainer(cfg: TrainConfig, config_path: &Path) -> Result<()> {
    let device = DeviceContext::open(cfg.gpu_device_id, &cfg.shm_dir)?;
    device.reclaim_stale()?;
    let mut ctx = TrainingContext::new(device, cfg.seed);

    let buffers = SharedBufferSet::allocate(ctx.device(), cfg.buffer_shape(), cfg.dtype)?;

    let mean = match &cfg.mean_file {
        Some(path) => ImageMean::load(path, cfg.channels, cfg.raw_size)?,
        None => ImageMean::zeros(cfg.channels, cfg.raw_size),
    };

    let train = TripletFiles::list(&cfg.train_a_dir, &cfg.train_b_dir)?;
    let val = TripletFiles::list(&cfg.val_a_dir, &cfg.val_b_dir)?;
    info!(
        train = train.n_minibatches(cfg.batch_size),
        val = val.n_minibatches(cfg.batch_size);
        "minibatches listed"
    );

    let graph = LinearEmbedding::new(EmbeddingSpec::from_config(&cfg), ctx.rng());
    let store = DirCheckpointStore::open(&cfg.weights_dir)?;

    if !cfg.para_load {
        let decoder = Decoder::new(mean, cfg.raw_size, cfg.buffer_shape(), cfg.batch_crop_mirror)?;
        let feed = LocalFeed::new(decoder, cfg.seed);
        return drive(cfg, ctx, graph, store, feed, buffers, train, val).await;
    }

    let addr = cfg
        .sock_data
        .clone()
        .ok_or_else(|| PipelineErr::Config("para_load needs sock_data".into()))?;

    let mut child = spawn_loader(config_path)?;
    let links = link::connect(addr.as_str()).await?;
    let feed = RemoteFeed::handshake(links, &buffers, &mean).await?;

    drive(cfg, ctx, graph, store, feed, buffers, train, val).await?;

    let status = child.wait().await?;
    if !status.success() {
        return Err(io::Error::other(format!("loader exited with {status}")).into());
    }

    info!("loader joined");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn drive<F: MinibatchFeed>(
    cfg: TrainConfig,
    ctx: TrainingContext,
    graph: LinearEmbedding,
    store: DirCheckpointStore,
    feed: F,
    buffers: SharedBufferSet,
    train: TripletFiles,
    val: TripletFiles,
) -> Result<()> {
    let mut driver = Driver::new(cfg, ctx, graph, store, feed, buffers, train, val)?;
    driver.run().await
}

fn spawn_loader(config_path: &Path) -> Result<Child> {
    let exe = env::current_exe()?;

    let child = Command::new(exe)
        .arg(LOADER_MODE)
        .arg(config_path)
        .kill_on_drop(true)
        .spawn()?;

    match child.id() {
        Some(pid) => info!("spawned the loader, pid {pid}"),
        None => warn!("spawned the loader but it already exited"),
    }

    Ok(child)
}
