mod common;

use std::sync::{Arc, Mutex};

use tripletrain::{
    Result,
    checkpoint::CheckpointStore,
    context::TrainingContext,
    data::TripletFiles,
    device::{DeviceContext, SharedBufferSet},
    driver::Driver,
    feed::{MinibatchFeed, RequestPair},
    state::ValidationEntry,
    tensor::Tensor,
};

use common::RecordingGraph;

type Journal = Arc<Mutex<Vec<String>>>;

fn note(journal: &Journal, event: impl Into<String>) {
    journal.lock().unwrap().push(event.into());
}

const SAVED: ValidationEntry = ValidationEntry {
    error: 0.4,
    loss: 2.0,
    training_error: 0.3,
};

struct JournalStore {
    journal: Journal,
}

impl CheckpointStore for JournalStore {
    fn save_weights(&mut self, epoch: usize, _: &[Tensor]) -> Result<()> {
        note(&self.journal, format!("save_weights {epoch}"));
        Ok(())
    }

    fn load_weights(&mut self, epoch: usize) -> Result<Vec<Tensor>> {
        note(&self.journal, format!("load_weights {epoch}"));
        Ok(Vec::new())
    }

    fn save_momentums(&mut self, epoch: usize, _: &[Tensor]) -> Result<()> {
        note(&self.journal, format!("save_momentums {epoch}"));
        Ok(())
    }

    fn load_momentums(&mut self, epoch: usize) -> Result<Vec<Tensor>> {
        note(&self.journal, format!("load_momentums {epoch}"));
        Ok(Vec::new())
    }

    fn save_learning_rate(&mut self, epoch: usize, _: f32) -> Result<()> {
        note(&self.journal, format!("save_lr {epoch}"));
        Ok(())
    }

    fn load_learning_rate(&mut self, epoch: usize) -> Result<f32> {
        note(&self.journal, format!("load_lr {epoch}"));
        Ok(0.05)
    }

    fn save_validation_record(&mut self, record: &[ValidationEntry]) -> Result<()> {
        note(&self.journal, format!("save_val_record {}", record.len()));
        Ok(())
    }

    fn load_validation_record(&mut self) -> Result<Vec<ValidationEntry>> {
        note(&self.journal, "load_val_record");
        Ok(vec![SAVED])
    }
}

struct JournalFeed {
    journal: Journal,
}

impl MinibatchFeed for JournalFeed {
    async fn prime(&mut self, first: RequestPair) -> Result<()> {
        note(&self.journal, format!("prime {}", first.query.files[0]));
        Ok(())
    }

    async fn ready(&mut self, buffers: &mut SharedBufferSet) -> Result<()> {
        buffers.acquire();
        note(&self.journal, "ready");
        Ok(())
    }

    async fn request(&mut self, next: RequestPair) -> Result<()> {
        note(&self.journal, format!("request {}", next.query.files[0]));
        Ok(())
    }

    async fn calc_finished(&mut self) -> Result<()> {
        note(&self.journal, "calc_finished");
        Ok(())
    }

    async fn terminate(&mut self) -> Result<()> {
        note(&self.journal, "terminate");
        Ok(())
    }
}

/// Runs a resumed training and returns the journal with the finished driver.
async fn resume(
    load_epoch: usize,
    n_epochs: usize,
) -> (Vec<String>, Driver<RecordingGraph, JournalStore, JournalFeed>) {
    let dir = tempfile::tempdir().unwrap();
    let cfg = common::config(
        dir.path(),
        serde_json::json!({
            "resume_train": true,
            "load_epoch": load_epoch,
            "n_epochs": n_epochs,
            "snapshot_freq": 1,
        }),
    );

    let names = |p: &str| (0..4).map(|i| format!("{p}{i}")).collect::<Vec<_>>();
    let train = TripletFiles::new(names("a"), names("b")).unwrap();

    let device = DeviceContext::open(0, &cfg.shm_dir).unwrap();
    let buffers = SharedBufferSet::allocate(&device, cfg.buffer_shape(), cfg.dtype).unwrap();
    let ctx = TrainingContext::new(device, cfg.seed);

    let journal = Journal::default();
    let store = JournalStore {
        journal: journal.clone(),
    };
    let feed = JournalFeed {
        journal: journal.clone(),
    };

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

    let journal = journal.lock().unwrap().clone();
    (journal, driver)
}

/// The journal of one training epoch over the 2 minibatches, snapshot included.
///
/// The saved record holds the restored entry plus this epoch's.
fn epoch_events(epoch: usize) -> Vec<String> {
    let events = [
        "prime a0".to_string(),
        "ready".to_string(),
        "request a2".to_string(),
        "calc_finished".to_string(),
        "ready".to_string(),
    ];

    events
        .into_iter()
        .chain([
            "save_val_record 2".to_string(),
            format!("save_weights {epoch}"),
            format!("save_lr {epoch}"),
            format!("save_momentums {epoch}"),
        ])
        .collect()
}

#[tokio::test]
async fn resumed_run_restores_state_before_the_first_load() {
    let (journal, driver) = resume(1, 2).await;

    assert_eq!(
        journal,
        [
            "load_weights 1",
            "load_lr 1",
            "load_val_record",
            "load_momentums 1",
            "prime a0",
            "ready",
            "request a2",
            "calc_finished",
            "ready",
            "save_val_record 2",
            "save_weights 2",
            "save_lr 2",
            "save_momentums 2",
            "terminate",
        ]
    );

    assert_eq!(driver.state().epoch, 2);
    assert_eq!(driver.state().val_record[0], SAVED);
    assert_eq!(driver.graph().trained.len(), 2);
    assert_eq!(driver.graph().lr, 0.05);
}

#[tokio::test]
async fn resuming_at_epoch_five_continues_at_six() {
    let (journal, driver) = resume(5, 6).await;

    let mut expected: Vec<String> = ["load_weights 5", "load_lr 5", "load_val_record", "load_momentums 5"]
        .map(String::from)
        .to_vec();
    expected.extend(epoch_events(6));
    expected.push("terminate".to_string());

    assert_eq!(journal, expected);
    assert_eq!(driver.state().epoch, 6);
    assert_eq!(driver.graph().trained.len(), 2);
    assert_eq!(driver.graph().lr, 0.05);
}
