//! End-to-end pipeline tests.
//!
//! Both workers run on one local bus with mock collaborators:
//! - an ODM order flows through license, downloads, assembly and encoding
//! - a failed part fails the downloads task and a manual replay finishes it
//! - startup recovery re-emits parked orchestrators

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use abd_core::{
    bus::{task_message, LocalBus, MessageBus},
    config::{DownloaderConfig, EncoderConfig},
    orchestration::Orchestrator,
    task::{NewTask, SqliteTaskStore, Task, TaskFilter, TaskPatch, TaskStatus, TaskStore},
    testing::{fixtures, MockLicenseClient, MockMediaFetcher, MockTranscoder, RecordedTranscode},
    workflows::{
        downloader::{self, OdmJob},
        encoder::{self, EncodeJob},
    },
    Downloader, Encoder, Maintenance,
};

struct Pipeline {
    store: Arc<SqliteTaskStore>,
    bus: Arc<LocalBus>,
    licenses: Arc<MockLicenseClient>,
    fetcher: Arc<MockMediaFetcher>,
    transcoder: Arc<MockTranscoder>,
}

impl Pipeline {
    fn new(file_concurrency: usize) -> Self {
        let store = Arc::new(SqliteTaskStore::in_memory().expect("Failed to create store"));
        let bus = Arc::new(LocalBus::new());
        let licenses = Arc::new(MockLicenseClient::new());
        let fetcher = Arc::new(MockMediaFetcher::new());
        let transcoder = Arc::new(MockTranscoder::new());

        let downloader_config = DownloaderConfig {
            file_concurrency,
            ..DownloaderConfig::default()
        };
        let downloads = Downloader::new(licenses.clone(), fetcher.clone()).router(
            &downloader_config,
            store.clone(),
            bus.clone(),
        );
        let encodes = Encoder::new(transcoder.clone()).router(
            &EncoderConfig::default(),
            store.clone(),
            bus.clone(),
        );
        bus.subscribe(downloader::PROCESS_TOPIC, Arc::new(downloads));
        bus.subscribe(encoder::PROCESS_TOPIC, Arc::new(encodes));

        Self {
            store,
            bus,
            licenses,
            fetcher,
            transcoder,
        }
    }

    async fn submit(&self, title: &str, parts: u32) -> Task {
        let job = OdmJob {
            target_directory: PathBuf::from(format!("/books/{}", title.to_lowercase())),
            file_stem: title.to_lowercase(),
            odm: fixtures::odm(title, parts),
        };
        let task = self
            .store
            .create(NewTask::pending(
                downloader::topics::LICENSE,
                serde_json::to_value(&job).unwrap(),
            ))
            .await
            .expect("Failed to create root task");
        self.bus
            .emit(downloader::PROCESS_TOPIC, task_message(&task).unwrap())
            .await
            .unwrap();
        task
    }

    async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.bus.wait_idle())
            .await
            .expect("Pipeline did not settle");
    }

    async fn by_topic(&self, topic: &str) -> Vec<Task> {
        self.store
            .find_all(&TaskFilter::new().with_topic(topic))
            .await
            .unwrap()
    }

    async fn one(&self, topic: &str) -> Task {
        let mut tasks = self.by_topic(topic).await;
        assert_eq!(tasks.len(), 1, "expected one {} task", topic);
        tasks.remove(0)
    }
}

#[tokio::test]
async fn test_order_flows_through_both_workers() {
    let p = Pipeline::new(2);
    p.fetcher.set_delay_ms(20).await;
    let root = p.submit("Hobbit", 4).await;
    p.settle().await;

    let all = p.store.find_all(&TaskFilter::new()).await.unwrap();
    assert!(
        all.iter().all(|t| t.status == TaskStatus::Completed),
        "unfinished tasks: {:?}",
        all.iter()
            .filter(|t| t.status != TaskStatus::Completed)
            .map(|t| (&t.topic, t.status))
            .collect::<Vec<_>>()
    );
    // license, downloads, 4 parts, cover, assemble, book, 4 remux, 4 metadata
    assert_eq!(all.len(), 17);

    assert_eq!(p.licenses.acquisition_count().await, 1);
    assert_eq!(p.fetcher.part_count().await, 4);
    assert!(p.fetcher.max_concurrent() <= 2);
    assert_eq!(p.transcoder.remux_count().await, 4);
    assert_eq!(p.transcoder.metadata_count().await, 4);

    // Lineage: license -> downloads -> assemble -> book.
    let downloads = p.one(downloader::topics::DOWNLOADS).await;
    assert_eq!(downloads.parent_task_id.as_deref(), Some(root.id.as_str()));
    assert_eq!(downloads.payload_at("downloads.total"), Some(&json!(5)));
    assert_eq!(downloads.payload_at("downloads.done"), Some(&json!(true)));
    let assemble = p.one(downloader::topics::ASSEMBLE).await;
    assert_eq!(assemble.parent_task_id.as_deref(), Some(downloads.id.as_str()));
    let book = p.one(encoder::topics::BOOK).await;
    assert_eq!(book.parent_task_id.as_deref(), Some(assemble.id.as_str()));

    let job: EncodeJob = serde_json::from_value(book.payload.clone()).unwrap();
    assert_eq!(
        job.file_parts.iter().map(|f| f.part.number).collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(
        job.file_parts[0].file_path,
        PathBuf::from("/books/hobbit/hobbit-part-01.mp3")
    );
    assert_eq!(job.images.len(), 1);
    assert!(job.remux.done);
    assert!(job.metadata.done);

    let tagged: Vec<(u32, usize)> = p
        .transcoder
        .recorded_calls()
        .await
        .into_iter()
        .filter_map(|call| match call {
            RecordedTranscode::Metadata {
                track, total_parts, ..
            } => Some((track, total_parts)),
            _ => None,
        })
        .collect();
    assert_eq!(tagged.len(), 4);
    assert!(tagged.iter().all(|(_, total)| *total == 4));
}

#[tokio::test]
async fn test_failed_part_fails_downloads_until_replayed() {
    let p = Pipeline::new(1);
    p.fetcher.fail_part(2, "connection reset").await;
    p.submit("Silmarillion", 3).await;
    p.settle().await;

    let failed_part: Vec<Task> = p
        .by_topic(downloader::topics::FILE)
        .await
        .into_iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .collect();
    assert_eq!(failed_part.len(), 1);
    assert_eq!(
        failed_part[0].error.as_ref().unwrap().message,
        "connection reset"
    );

    let downloads = p.one(downloader::topics::DOWNLOADS).await;
    assert_eq!(downloads.status, TaskStatus::Failed);
    assert!(downloads
        .error
        .unwrap()
        .message
        .contains("connection reset"));
    assert!(p.by_topic(encoder::topics::BOOK).await.is_empty());

    p.fetcher.heal_part(2).await;
    let maintenance = Maintenance::new(p.store.clone(), p.bus.clone());
    let report = maintenance
        .replay_failed(downloader::topics::DOWNLOADS, true)
        .await
        .unwrap();
    assert_eq!(report.replayed, vec![downloads.id.clone()]);
    assert_eq!(report.children_reset, 1);
    p.settle().await;

    assert_eq!(
        p.one(downloader::topics::DOWNLOADS).await.status,
        TaskStatus::Completed
    );
    assert_eq!(p.one(encoder::topics::BOOK).await.status, TaskStatus::Completed);
    // Parts 1 and 3 were not downloaded again.
    assert_eq!(p.fetcher.part_count().await, 3);
}

#[tokio::test]
async fn test_transcoder_failure_fails_the_book() {
    let p = Pipeline::new(1);
    p.transcoder.set_next_error("ffmpeg exited with status 1").await;
    p.submit("Hobbit", 2).await;
    p.settle().await;

    let book = p.one(encoder::topics::BOOK).await;
    assert_eq!(book.status, TaskStatus::Failed);
    assert!(book
        .error
        .unwrap()
        .message
        .contains("ffmpeg exited with status 1"));
    // The metadata phase never started.
    assert!(p.by_topic(encoder::topics::METADATA).await.is_empty());
}

#[tokio::test]
async fn test_recover_resumes_parked_orchestrators() {
    let p = Pipeline::new(1);
    let book = p
        .store
        .create(NewTask::pending(
            encoder::topics::BOOK,
            serde_json::to_value(EncodeJob {
                content_directory: PathBuf::from("/books/hobbit"),
                audio_metadata: fixtures::odm("Hobbit", 1).metadata,
                file_parts: vec![encoder::FilePart {
                    file_path: PathBuf::from("/books/hobbit/hobbit-part-01.mp3"),
                    part: fixtures::part(1),
                }],
                images: vec![],
                remux: Default::default(),
                metadata: Default::default(),
            })
            .unwrap(),
        ))
        .await
        .unwrap();

    // A crashed worker left the book parked with one remux child never sent.
    let orchestrator = Orchestrator::new(p.store.clone(), p.bus.clone(), encoder::PROCESS_TOPIC);
    p.store
        .update(&book.id, TaskPatch::status(TaskStatus::InProgress))
        .await
        .unwrap();
    p.store
        .update(&book.id, TaskPatch::status(TaskStatus::ChildPending))
        .await
        .unwrap();
    p.store
        .create(
            NewTask::pending(
                encoder::topics::REMUX,
                json!({ "file_path": "/books/hobbit/hobbit-part-01.mp3" }),
            )
            .with_parent(&book.id),
        )
        .await
        .unwrap();

    let recovered = orchestrator.recover(encoder::ORCHESTRATING_TOPICS).await.unwrap();
    assert_eq!(recovered, 1);
    p.settle().await;

    assert_eq!(
        p.store.get(&book.id).await.unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(p.transcoder.remux_count().await, 1);
    assert_eq!(p.transcoder.metadata_count().await, 1);
}
