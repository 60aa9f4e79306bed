mod common;

use comms::msg::{Command, Msg, Payload};
use tripletrain::{
    PipelineErr,
    device::{DeviceContext, SharedBufferSet},
    loader::{Loader, LoaderConfig, LoaderState},
};

use common::links;

async fn loader_rejects_handshake(loader_device_id: u32, reset_first: bool) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = common::config(dir.path(), serde_json::json!({}));

    let device = DeviceContext::open(0, &cfg.shm_dir).unwrap();
    let buffers = SharedBufferSet::allocate(&device, cfg.buffer_shape(), cfg.dtype).unwrap();
    if reset_first {
        device.reset().unwrap();
    }

    let (mut trainer, loader_links) = links();
    let loader_device = DeviceContext::open(loader_device_id, &cfg.shm_dir).unwrap();
    let loader = Loader::new(LoaderConfig::from(&cfg), loader_device, loader_links);
    assert_eq!(loader.state(), LoaderState::AwaitHandshake);
    let loader = tokio::spawn(loader.run());

    let tx = &mut trainer.control.1;
    tx.send(&Msg::Control(Command::Export(buffers.exports())))
        .await
        .unwrap();
    // The loader may already be gone by now.
    let _ = tx.send(&Msg::Data(Payload::ImageMean(&[0.0]))).await;

    let err = loader.await.unwrap().unwrap_err();
    assert!(matches!(err, PipelineErr::HandleInvalid { .. }), "{err}");

    // The failure is reported in place of a copy_finished.
    let ready = trainer.ready.get().await;
    assert!(matches!(ready, Err(PipelineErr::ChannelClosed { .. })));
}

#[tokio::test]
async fn handle_from_another_device_is_rejected() {
    loader_rejects_handshake(1, false).await;
}

#[tokio::test]
async fn handle_invalidated_by_a_reset_is_rejected() {
    loader_rejects_handshake(0, true).await;
}
