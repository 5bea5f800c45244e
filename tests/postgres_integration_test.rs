//! Postgres-backed integration tests.
//!
//! These are ignored by default and are intended to run in CI (or locally)
//! with `DATABASE_URL` set.

use std::collections::BTreeMap;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

use keytrans_sequencer::clients::{VerifyingLogClient, VerifyingMapClient};
use keytrans_sequencer::crypto::{sha256, SigningKeyPair};
use keytrans_sequencer::infra::{
    InMemoryLogService, InMemoryMapService, PgBatchStore, PgMutationLog, RetryConfig,
};
use keytrans_sequencer::{
    BatchStore, DirectoryId, LogId, LogReader, MapIndex, MapMetadata, MutationQueue, Sequencer,
    SequencerConfig, SequencerError, SourceSlice, StepOutcome, VersionedEntryResolver,
};

async fn connect_db() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&url)
        .await
        .ok()?;
    Some(pool)
}

async fn stores(pool: &sqlx::PgPool) -> (Arc<PgMutationLog>, Arc<PgBatchStore>) {
    let log = Arc::new(PgMutationLog::new(pool.clone()));
    log.initialize().await.unwrap();
    let batches = Arc::new(PgBatchStore::new(pool.clone()));
    batches.initialize().await.unwrap();
    (log, batches)
}

/// Fresh directory per test so runs do not interfere
fn fresh_directory() -> DirectoryId {
    DirectoryId::new(format!("pg-test-{:08x}", rand::random::<u32>()))
}

#[tokio::test]
#[ignore]
async fn postgres_batch_definitions_are_write_once() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let (_, batches) = stores(&pool).await;
    let dir = fresh_directory();

    let meta = MapMetadata::empty(0).next(1, &BTreeMap::from([(LogId(1), 4u64)]));
    batches.write_batch_sources(&dir, 1, &meta).await.unwrap();
    batches.write_batch_sources(&dir, 1, &meta).await.unwrap();
    assert_eq!(batches.read_batch(&dir, 1).await.unwrap(), meta);

    let other = MapMetadata::empty(0).next(1, &BTreeMap::from([(LogId(1), 5u64)]));
    assert!(matches!(
        batches.write_batch_sources(&dir, 1, &other).await,
        Err(SequencerError::BatchConflict { .. })
    ));
    assert_eq!(batches.read_batch(&dir, 1).await.unwrap(), meta);
    assert_eq!(batches.latest_revision(&dir).await.unwrap(), Some(1));

    assert!(matches!(
        batches.read_batch(&dir, 2).await,
        Err(SequencerError::BatchNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn postgres_concurrent_sends_have_no_gaps() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let (log, _) = stores(&pool).await;
    let dir = fresh_directory();
    log.create_log(&dir, LogId(1)).await.unwrap();

    let tasks: usize = 8;
    let per_task: usize = 25;
    let expected_total = (tasks * per_task) as u64;

    let mut handles = Vec::new();
    for t in 0..tasks {
        let log = log.clone();
        let dir = dir.clone();
        handles.push(tokio::spawn(async move {
            let mut watermarks = Vec::new();
            for i in 0..per_task {
                let payload = format!("{t}-{i}").into_bytes();
                watermarks.push(log.send(&dir, LogId(1), payload).await.unwrap());
            }
            watermarks
        }));
    }

    let mut all: Vec<u64> = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    all.sort_unstable();
    assert_eq!(all, (1..=expected_total).collect::<Vec<_>>());

    let (count, high) = log.high_watermark(&dir, LogId(1), 0, 1000).await.unwrap();
    assert_eq!((count, high), (expected_total, expected_total));
    let (count, high) = log.high_watermark(&dir, LogId(1), 10, 5).await.unwrap();
    assert_eq!((count, high), (5, 15));

    let page = log.read_range(&dir, LogId(1), 3, 9, 4).await.unwrap();
    let ids: Vec<u64> = page.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![4, 5, 6, 7]);
}

#[tokio::test]
#[ignore]
async fn postgres_closed_log_rejects_writes_but_stays_readable() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let (log, _) = stores(&pool).await;
    let dir = fresh_directory();
    log.create_log(&dir, LogId(1)).await.unwrap();
    log.create_log(&dir, LogId(2)).await.unwrap();
    log.send(&dir, LogId(2), b"m".to_vec()).await.unwrap();

    log.set_writable(&dir, LogId(2), false).await.unwrap();
    assert_eq!(log.list_sources(&dir).await.unwrap(), vec![LogId(1)]);
    assert!(matches!(
        log.send(&dir, LogId(2), b"late".to_vec()).await,
        Err(SequencerError::FailedPrecondition(_))
    ));
    assert_eq!(log.read_range(&dir, LogId(2), 0, 1, 10).await.unwrap().len(), 1);

    assert!(matches!(
        log.set_writable(&dir, LogId(9), true).await,
        Err(SequencerError::InvalidArgument(_))
    ));
}

#[tokio::test]
#[ignore]
async fn postgres_pipeline_builds_and_publishes() {
    let Some(pool) = connect_db().await else {
        eprintln!("DATABASE_URL not set; skipping");
        return;
    };
    let (log, batches) = stores(&pool).await;
    let dir = fresh_directory();
    log.create_log(&dir, LogId(1)).await.unwrap();

    let map_service = Arc::new(InMemoryMapService::new(SigningKeyPair::generate()));
    map_service.create_directory(&dir).await;
    let log_service = Arc::new(InMemoryLogService::new(SigningKeyPair::generate()));
    log_service.create_directory(&dir).await;
    let log_client = Arc::new(
        VerifyingLogClient::new(log_service.clone(), log_service.verifier())
            .with_poll_config(RetryConfig::fast()),
    );
    let map_client = Arc::new(
        VerifyingMapClient::new(map_service.clone(), map_service.verifier())
            .with_log(log_client.clone()),
    );
    let sequencer = Sequencer::new(
        SequencerConfig::default().with_directories(vec![dir.clone()]),
        log.clone(),
        batches.clone(),
        map_client,
        log_client,
        Arc::new(VersionedEntryResolver::new()),
    );

    let key = SigningKeyPair::generate();
    for (name, version) in [("alice", 1), ("bob", 1), ("alice", 2)] {
        let entry = key.sign_entry(
            MapIndex::from_bytes(sha256(name.as_bytes())),
            name,
            version,
            vec![format!("{name}-{version}")],
        );
        log.send(&dir, LogId(1), entry.to_bytes()).await.unwrap();
    }

    let steps = sequencer.run_batch(&dir, 1, 100).await.unwrap();
    assert_eq!(
        steps,
        vec![
            StepOutcome::Defined {
                revision: 1,
                resumed: false
            },
            StepOutcome::Created {
                revision: 1,
                leaves_written: 2
            },
            StepOutcome::Published {
                revisions: vec![0, 1],
                log_size: 2
            },
        ]
    );
    assert_eq!(
        batches.read_batch(&dir, 1).await.unwrap().sources[&LogId(1)],
        SourceSlice::new(LogId(1), 0, 3)
    );
}
