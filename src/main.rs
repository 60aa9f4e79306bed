use std::{env, path::PathBuf};

use anyhow::{Context, bail};
use log::{error, info};

use tripletrain::{
    TrainConfig,
    bootstrap::{self, LOADER_MODE},
    loader,
};

const USAGE: &str = "usage: tripletrain [loader] <config.json>";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().skip(1).collect();

    let (is_loader, path) = match args.as_slice() {
        [mode, path] if mode == LOADER_MODE => (true, PathBuf::from(path)),
        [path] => (false, PathBuf::from(path)),
        _ => bail!(USAGE),
    };

    let cfg = TrainConfig::load(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    let result = if is_loader {
        loader::run_loader(&cfg).await
    } else {
        info!("training for {} epochs", cfg.n_epochs);
        bootstrap::run_trainer(cfg, &path).await
    };

    if let Err(e) = &result {
        error!("{e}");
    }

    Ok(result?)
}
