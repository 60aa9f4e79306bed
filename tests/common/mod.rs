#![allow(dead_code)]

use std::path::Path;

use comms::{
    MsgReceiver, MsgSender,
    specs::Role,
};
use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};
use tripletrain::{
    Result, TrainConfig,
    compute::ComputeGraph,
    context::TrainingContext,
    device::SharedBufferSet,
    link::{LoaderLinks, TrainerLinks},
    tensor::{self, Tensor},
};

pub type Rx = ReadHalf<DuplexStream>;
pub type Tx = WriteHalf<DuplexStream>;
pub type Half = (MsgReceiver<Rx>, MsgSender<Tx>);

pub const CHANNELS: usize = 1;
pub const RAW: usize = 4;
pub const CROP: usize = 2;

pub fn channel_pair() -> (Half, Half) {
    let (one, two) = io::duplex(1 << 16);
    let (rx1, tx1) = io::split(one);
    let (rx2, tx2) = io::split(two);
    (comms::channel(rx1, tx1), comms::channel(rx2, tx2))
}

/// Both sides of the three links, connected in memory.
pub fn links() -> (TrainerLinks<Rx, Tx>, LoaderLinks<Rx, Tx>) {
    let (c1, c2) = channel_pair();
    let (r1, r2) = channel_pair();
    let (y1, y2) = channel_pair();
    (TrainerLinks::new(c1, r1, y1), LoaderLinks::new(c2, r2, y2))
}

/// Writes `count` constant samples named `{i:03}.safetensors`, sample `i` holds `base + i`.
pub fn write_samples(dir: &Path, count: usize, base: f32) -> Vec<String> {
    std::fs::create_dir_all(dir).unwrap();

    (0..count)
        .map(|i| {
            let path = dir.join(format!("{i:03}.safetensors"));
            let data = vec![base + i as f32; CHANNELS * RAW * RAW];
            tensor::write_all(&path, &[Tensor::new("data", vec![CHANNELS, RAW, RAW], data)])
                .unwrap();
            path.to_str().unwrap().to_string()
        })
        .collect()
}

/// A configuration over the sample dirs of `root`, patched by `extra`.
pub fn config(root: &Path, extra: serde_json::Value) -> TrainConfig {
    let mut json = serde_json::json!({
        "gpu_device_id": 0,
        "n_epochs": 1,
        "para_load": false,
        "batch_size": 2,
        "channels": CHANNELS,
        "raw_size": RAW,
        "crop_size": CROP,
        "train_a_dir": root.join("train_a"),
        "train_b_dir": root.join("train_b"),
        "val_a_dir": root.join("val_a"),
        "val_b_dir": root.join("val_b"),
        "weights_dir": root.join("weights"),
        "shm_dir": root.join("shm"),
        "learning_rate": 0.01,
        "validation_limit": 0,
        "seed": 11
    });

    for (k, v) in extra.as_object().unwrap() {
        json[k] = v.clone();
    }

    TrainConfig::from_json_str(&json.to_string()).unwrap()
}

/// What a compute call found in the buffers, the first value of every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub query: Vec<f32>,
    pub positive: Vec<f32>,
    pub negative: Vec<f32>,
}

fn firsts(buffers: &SharedBufferSet, role: Role) -> Result<Vec<f32>> {
    let sample_len = buffers.shape().sample_len();
    let values = buffers.get(role).read_f32()?;
    Ok(values.chunks_exact(sample_len).map(|s| s[0]).collect())
}

/// A graph that records the minibatches it's given.
#[derive(Debug, Default)]
pub struct RecordingGraph {
    pub trained: Vec<Seen>,
    pub validated: Vec<Seen>,
    pub lr: f32,
}

impl RecordingGraph {
    fn seen(buffers: &SharedBufferSet) -> Result<Seen> {
        Ok(Seen {
            query: firsts(buffers, Role::Query)?,
            positive: firsts(buffers, Role::Positive)?,
            negative: firsts(buffers, Role::Negative)?,
        })
    }
}

impl ComputeGraph for RecordingGraph {
    fn compute_step(&mut self, _: &mut TrainingContext, buffers: &SharedBufferSet) -> Result<f32> {
        self.trained.push(Self::seen(buffers)?);
        Ok(0.0)
    }

    fn train_error(&mut self, _: &SharedBufferSet) -> Result<f32> {
        Ok(0.0)
    }

    fn validation_metrics(&mut self, buffers: &SharedBufferSet) -> Result<(f32, f32)> {
        self.validated.push(Self::seen(buffers)?);
        Ok((0.5, 1.0))
    }

    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.lr = lr;
    }

    fn weights(&self) -> Vec<Tensor> {
        Vec::new()
    }

    fn load_weights(&mut self, _: &[Tensor]) -> Result<()> {
        Ok(())
    }

    fn momentums(&self) -> Vec<Tensor> {
        Vec::new()
    }

    fn load_momentums(&mut self, _: &[Tensor]) -> Result<()> {
        Ok(())
    }
}

/// The samples expected in minibatch `k` of queries `0..` and positives `100..`.
pub fn expected_minibatch(k: usize) -> Seen {
    let q = (2 * k) as f32;
    Seen {
        query: vec![q, q + 1.0],
        positive: vec![100.0 + q, 101.0 + q],
        negative: vec![101.0 + q, 100.0 + q],
    }
}
