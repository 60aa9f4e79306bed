pub mod bootstrap;
pub mod checkpoint;
pub mod compute;
pub mod config;
pub mod context;
pub mod data;
pub mod device;
pub mod driver;
pub mod error;
pub mod feed;
pub mod link;
pub mod loader;
pub mod metrics;
pub mod queue;
pub mod schedule;
pub mod state;
pub mod tensor;

pub use config::TrainConfig;
pub use error::{PipelineErr, Result};
