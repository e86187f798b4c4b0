//! Data mover behavior against a mock object store: staging, partition
//! fetches, cache hits, output checks and upload retries.


use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use taskmill::data::DataMover;
use taskmill::error::SchedulerError;
use taskmill::model::{Command, PartInfo, Task, Workunit};
use test_harness::*;

const JOB_ID: &str = "0123456789abcdef";

fn mover(store: Arc<MockStore>, root: &std::path::Path) -> DataMover {
    let mut config = test_config(root);
    config.upload_retry_backoff = Duration::from_millis(10);
    DataMover::new(store, &config)
}

fn unit(task: Task) -> Workunit {
    task.expand().remove(0)
}

#[tokio::test]
async fn stage_inputs_fetches_into_work_dir() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new().with_object("node-input1", b"hello"));
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map")).with_input(io("in.dat", "node-input1")),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    let moved = mover.stage_inputs(&work).await.unwrap();

    assert_eq!(moved, 5);
    assert_eq!(
        std::fs::read(work_dir.join("in.dat")).unwrap(),
        b"hello"
    );
    assert_eq!(
        store.fetched(),
        vec!["http://store.test/node/node-input1?download".to_string()]
    );
}

#[tokio::test]
async fn partitioned_rank_fetches_its_slice() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new().with_object("node-input1", b"records"));
    let mover = mover(store.clone(), dir.path());

    let task = Task::new(JOB_ID, "split", Command::shell("split"))
        .with_input(io("in.dat", "node-input1"))
        .with_total_work(4, PartInfo::new("in.dat", "record", 10));
    let work = unit(task);
    assert_eq!(work.id.rank, 1);

    mover.prepare_work_dir(&work).await.unwrap();
    mover.stage_inputs(&work).await.unwrap();

    // rank 1 of 4 over 10 records owns records 1-3
    assert_eq!(
        store.fetched(),
        vec!["http://store.test/node/node-input1?download&index=record&part=1-3".to_string()]
    );
}

#[tokio::test]
async fn attr_file_written_from_node_metadata() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new().with_object("node-input1", b"x"));
    store.node_attrs.lock().unwrap().insert(
        "node-input1".to_string(),
        serde_json::json!({"format": "fasta"}),
    );
    let mover = mover(store, dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_input(io("in.dat", "node-input1").with_attr_file("in.attr")),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    mover.stage_inputs(&work).await.unwrap();

    let attrs: serde_json::Value =
        serde_json::from_slice(&std::fs::read(work_dir.join("in.attr")).unwrap()).unwrap();
    assert_eq!(attrs["format"], "fasta");
}

#[tokio::test]
async fn output_upload_then_cache_hit_on_next_stage() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store.clone(), dir.path());

    // first unit produces the object
    let producer = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("result.out", "node-result1")),
    );
    let work_dir = mover.prepare_work_dir(&producer).await.unwrap();
    std::fs::write(work_dir.join("result.out"), b"payload").unwrap();
    let committed = mover.commit_outputs(&producer).await.unwrap();
    assert_eq!(committed, 7);
    assert_eq!(
        store.objects.lock().unwrap().get("node-result1").unwrap(),
        b"payload"
    );

    // second unit consumes it; the upload left a cache copy behind
    let consumer = unit(
        Task::new(JOB_ID, "reduce", Command::shell("reduce"))
            .with_input(io("result.out", "node-result1")),
    );
    let work_dir = mover.prepare_work_dir(&consumer).await.unwrap();
    let moved = mover.stage_inputs(&consumer).await.unwrap();

    assert_eq!(moved, 0, "cache hit must not touch the network");
    assert!(store.fetched().is_empty());
    assert_eq!(
        std::fs::read(work_dir.join("result.out")).unwrap(),
        b"payload"
    );
}

#[tokio::test]
async fn missing_required_output_is_an_error() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("never-made.out", "node-result1")),
    );
    mover.prepare_work_dir(&work).await.unwrap();

    let err = mover.commit_outputs(&work).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DataIntegrity { .. }));
    assert_eq!(store.put_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_optional_output_is_skipped() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("maybe.out", "node-result1").optional()),
    );
    mover.prepare_work_dir(&work).await.unwrap();

    assert_eq!(mover.commit_outputs(&work).await.unwrap(), 0);
    assert_eq!(store.put_attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_byte_output_fails_nonzero_check() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store, dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("empty.out", "node-result1").nonzero()),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("empty.out"), b"").unwrap();

    let err = mover.commit_outputs(&work).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DataIntegrity { .. }));
}

#[tokio::test]
async fn stage_abort_reports_bytes_already_moved() {
    let dir = TempDir::new().unwrap();
    // only the first input exists, the second fetch fails hard
    let store = Arc::new(MockStore::new().with_object("node-input1", b"hello"));
    let mover = mover(store, dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_input(io("a.dat", "node-input1"))
            .with_input(io("b.dat", "node-gone")),
    );
    mover.prepare_work_dir(&work).await.unwrap();

    let err = mover.stage_inputs(&work).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Transfer { .. }));
    assert_eq!(err.bytes_moved(), 5);
}

#[tokio::test]
async fn commit_abort_reports_bytes_already_committed() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("first.out", "node-result1"))
            .with_output(io("never-made.out", "node-result2")),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("first.out"), b"payload").unwrap();

    let err = mover.commit_outputs(&work).await.unwrap_err();
    assert!(matches!(err, SchedulerError::DataIntegrity { .. }));
    assert_eq!(err.bytes_moved(), 7);
    // the first output still landed in the store before the abort
    assert!(store.objects.lock().unwrap().contains_key("node-result1"));
}

#[tokio::test]
async fn upload_retries_once_then_succeeds() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    store.fail_next_puts(1);
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("result.out", "node-result1")),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("result.out"), b"payload").unwrap();

    mover.commit_outputs(&work).await.unwrap();
    assert_eq!(store.put_attempts.load(Ordering::SeqCst), 2);
    assert!(store.objects.lock().unwrap().contains_key("node-result1"));
}

#[tokio::test]
async fn upload_gives_up_after_second_failure() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    store.fail_next_puts(2);
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("result.out", "node-result1")),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("result.out"), b"payload").unwrap();

    let err = mover.commit_outputs(&work).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Transfer { .. }));
    assert_eq!(store.put_attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn non_retryable_upload_failure_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    store.deny_next_puts(1);
    let mover = mover(store.clone(), dir.path());

    let work = unit(
        Task::new(JOB_ID, "map", Command::shell("map"))
            .with_output(io("result.out", "node-result1")),
    );
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("result.out"), b"payload").unwrap();

    let err = mover.commit_outputs(&work).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Transfer { .. }));
    assert_eq!(store.put_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn store_filename_renames_before_upload() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store.clone(), dir.path());

    let mut out = io("local-name.tmp", "node-result1");
    out.store_filename = Some("final-name.out".to_string());
    let work = unit(Task::new(JOB_ID, "map", Command::shell("map")).with_output(out));
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("local-name.tmp"), b"payload").unwrap();

    mover.commit_outputs(&work).await.unwrap();
    assert!(!work_dir.join("local-name.tmp").exists());
    assert!(store.objects.lock().unwrap().contains_key("node-result1"));
}

#[tokio::test]
async fn index_build_requested_after_upload() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store.clone(), dir.path());

    let mut out = io("result.out", "node-result1");
    out.index = Some("record".to_string());
    let work = unit(Task::new(JOB_ID, "map", Command::shell("map")).with_output(out));
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("result.out"), b"payload").unwrap();

    mover.commit_outputs(&work).await.unwrap();
    assert_eq!(
        store.indexes_built.lock().unwrap().clone(),
        vec!["node-result1:record".to_string()]
    );
}

#[tokio::test]
async fn predata_staged_whole_even_for_partitioned_ranks() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        MockStore::new()
            .with_object("node-input1", b"records")
            .with_object("node-refdb1", b"reference"),
    );
    let mover = mover(store.clone(), dir.path());

    let task = Task::new(JOB_ID, "align", Command::shell("align"))
        .with_input(io("in.dat", "node-input1"))
        .with_predata(io("ref.db", "node-refdb1"))
        .with_total_work(2, PartInfo::new("in.dat", "record", 6));
    let work = unit(task);
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    mover.stage_inputs(&work).await.unwrap();

    // the input is sliced, the reference data is not
    let fetched = store.fetched();
    assert!(fetched
        .iter()
        .any(|u| u.contains("node-input1") && u.contains("&part=")));
    assert!(fetched
        .iter()
        .any(|u| u.ends_with("node-refdb1?download")));
    assert_eq!(
        std::fs::read(work_dir.join("ref.db")).unwrap(),
        b"reference"
    );
}

#[tokio::test]
async fn prepare_work_dir_wipes_previous_attempt() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MockStore::new());
    let mover = mover(store, dir.path());

    let work = unit(Task::new(JOB_ID, "map", Command::shell("map")));
    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    std::fs::write(work_dir.join("leftover"), b"stale").unwrap();

    let work_dir = mover.prepare_work_dir(&work).await.unwrap();
    assert!(!work_dir.join("leftover").exists());
}
