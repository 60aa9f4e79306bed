mod common;

use tripletrain::{
    checkpoint::DirCheckpointStore,
    context::TrainingContext,
    data::{Decoder, ImageMean, TripletFiles},
    device::{DeviceContext, SharedBufferSet},
    driver::Driver,
    feed::LocalFeed,
};

use common::{RecordingGraph, expected_minibatch};

#[tokio::test]
async fn synchronous_loading_decodes_each_minibatch_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    common::write_samples(&root.join("train_a"), 4, 0.0);
    common::write_samples(&root.join("train_b"), 4, 100.0);

    let cfg = common::config(root, serde_json::json!({ "para_load": false }));

    let device = DeviceContext::open(cfg.gpu_device_id, &cfg.shm_dir).unwrap();
    let buffers = SharedBufferSet::allocate(&device, cfg.buffer_shape(), cfg.dtype).unwrap();
    let decoder = Decoder::new(
        ImageMean::zeros(cfg.channels, cfg.raw_size),
        cfg.raw_size,
        cfg.buffer_shape(),
        cfg.batch_crop_mirror,
    )
    .unwrap();

    let feed = LocalFeed::new(decoder, cfg.seed);
    let train = TripletFiles::list(&cfg.train_a_dir, &cfg.train_b_dir).unwrap();
    let ctx = TrainingContext::new(device, cfg.seed);
    let store = DirCheckpointStore::open(&cfg.weights_dir).unwrap();

    let mut driver = Driver::new(
        cfg,
        ctx,
        RecordingGraph::default(),
        store,
        feed,
        buffers,
        train,
        TripletFiles::default(),
    )
    .unwrap();
    driver.run().await.unwrap();

    assert_eq!(driver.feed().loaded(), 2);
    assert_eq!(driver.metrics().steps, 2);
    assert_eq!(
        driver.graph().trained,
        [expected_minibatch(0), expected_minibatch(1)]
    );
    assert_eq!(driver.state().val_record.len(), 1);
}

#[tokio::test]
async fn missing_sample_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    common::write_samples(&root.join("train_a"), 2, 0.0);
    common::write_samples(&root.join("train_b"), 2, 100.0);
    let cfg = common::config(root, serde_json::json!({}));

    let device = DeviceContext::open(cfg.gpu_device_id, &cfg.shm_dir).unwrap();
    let buffers = SharedBufferSet::allocate(&device, cfg.buffer_shape(), cfg.dtype).unwrap();
    let decoder = Decoder::new(
        ImageMean::zeros(cfg.channels, cfg.raw_size),
        cfg.raw_size,
        cfg.buffer_shape(),
        true,
    )
    .unwrap();

    let train = TripletFiles::list(&cfg.train_a_dir, &cfg.train_b_dir).unwrap();
    std::fs::remove_file(root.join("train_b").join("001.safetensors")).unwrap();

    let ctx = TrainingContext::new(device, cfg.seed);
    let store = DirCheckpointStore::open(&cfg.weights_dir).unwrap();
    let mut driver = Driver::new(
        cfg,
        ctx,
        RecordingGraph::default(),
        store,
        LocalFeed::new(decoder, Some(0)),
        buffers,
        train,
        TripletFiles::default(),
    )
    .unwrap();

    let err = driver.run().await.unwrap_err();
    assert!(matches!(err, tripletrain::PipelineErr::Decode { .. }));
    assert!(driver.graph().trained.is_empty());
}
