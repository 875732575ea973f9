mod common;

use std::fs;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use intake_api::EventStage;
use intake_core::{ErrorKind, Identity, RecordStatus, SourceDisposition};
use intake_ingest::{Outcome, PipelineError};

use common::{files_in, Fixture};

const CLAIM: &[u8] = b"claim_001,RO-7731,1450.00\n";

#[tokio::test]
async fn claim_is_stored_under_its_hash_and_announced_once() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let candidate = fx.export("claim_001.csv", CLAIM);
    let h1 = Identity::of_bytes(CLAIM);

    let outcome = pipeline.process(candidate.clone(), &CancellationToken::new()).await.unwrap();

    let expected = fx.storage_root().join(h1.as_str()).join("claim_001.csv");
    assert_eq!(
        outcome,
        Outcome::Acknowledged {
            identity: h1.clone(),
            stored_path: expected.clone(),
            attempts: 1,
        }
    );
    assert_eq!(fs::read(&expected).unwrap(), CLAIM);
    assert!(candidate.source_path.exists(), "leave disposition keeps the source");

    let notices = fx.api.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].identity, h1);
    assert_eq!(notices[0].stored_path, expected.display().to_string());
    assert_eq!(notices[0].metadata.original_name, "claim_001.csv");
    assert_eq!(notices[0].metadata.mime, "text/csv");
    assert_eq!(notices[0].metadata.size, CLAIM.len() as u64);
    assert_eq!(notices[0].metadata.attempt, 1);

    let record = index.get(&h1).unwrap();
    assert_eq!(record.status, RecordStatus::Acknowledged);
    assert!(record.remote_ack);
    assert_eq!(record.remote_id.as_deref(), Some("ing-1"));
    assert_eq!(record.attempts, 1);
    assert_eq!(record.stored_path.as_deref(), Some(expected.as_path()));

    assert_eq!(
        fx.api.wait_for_stages(3).await,
        vec![EventStage::Received, EventStage::Stored, EventStage::Acknowledged]
    );
    assert_eq!(pipeline.counters().acknowledged(), 1);
}

#[tokio::test]
async fn re_export_with_identical_content_writes_and_sends_nothing() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let abort = CancellationToken::new();
    let h1 = Identity::of_bytes(CLAIM);

    pipeline.process(fx.export("claim_001.csv", CLAIM), &abort).await.unwrap();
    let stored = fx.storage_root().join(h1.as_str()).join("claim_001.csv");
    let written_at = fs::metadata(&stored).unwrap().modified().unwrap();

    let again = pipeline
        .process(fx.export("claim_001 (re-export).csv", CLAIM), &abort)
        .await
        .unwrap();

    assert_eq!(again, Outcome::Duplicate { identity: h1.clone() });
    assert_eq!(fx.api.notices().len(), 1);
    assert_eq!(files_in(&fx.storage_root().join(h1.as_str())), vec![stored.clone()]);
    assert_eq!(fs::metadata(&stored).unwrap().modified().unwrap(), written_at);
    assert_eq!(pipeline.counters().duplicates(), 1);
    assert_eq!(fx.api.wait_for_stages(5).await.last(), Some(&EventStage::Duplicate));
}

#[tokio::test]
async fn server_errors_are_retried_with_growing_backoff() {
    let fx = Fixture::new();
    fx.api.script(&[500, 500, 500, 200]);
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let h1 = Identity::of_bytes(CLAIM);

    let outcome = pipeline
        .process(fx.export("claim_001.csv", CLAIM), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Acknowledged { attempts: 4, .. }));

    let notices = fx.api.notices();
    let attempts: Vec<u32> = notices.iter().map(|n| n.metadata.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3, 4]);
    assert!(notices.iter().all(|n| n.identity == h1));

    let record = index.get(&h1).unwrap();
    assert!(record.remote_ack);
    assert_eq!(record.attempts, 4);
    assert_eq!(record.failures.len(), 3);
    assert!(record.failures.iter().all(|f| f.kind == ErrorKind::TransientNetwork));
    let backoffs: Vec<Option<u64>> = record.failures.iter().map(|f| f.backoff_ms).collect();
    assert_eq!(backoffs, vec![Some(10), Some(20), Some(40)]);
}

#[tokio::test]
async fn failing_notification_stops_at_the_ceiling() {
    let fx = Fixture::new();
    fx.api.always(503);
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 3);
    let h1 = Identity::of_bytes(CLAIM);
    let abort = CancellationToken::new();

    let outcome = pipeline.process(fx.export("claim_001.csv", CLAIM), &abort).await.unwrap();
    assert!(matches!(
        outcome,
        Outcome::Failed { kind: ErrorKind::TransientNetwork, .. }
    ));
    assert_eq!(fx.api.notices().len(), 3);

    let record = index.get(&h1).unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.attempts, 3);
    assert!(!record.remote_ack);
    assert_eq!(record.failures.last().unwrap().backoff_ms, None);

    let again = pipeline.process(fx.export("claim_001.csv", CLAIM), &abort).await.unwrap();
    assert_eq!(again, Outcome::PreviouslyFailed { identity: h1 });
    assert_eq!(fx.api.notices().len(), 3);
}

#[tokio::test]
async fn reset_failed_record_gets_a_fresh_ceiling() {
    let fx = Fixture::new();
    fx.api.script(&[503, 503]);
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 2);
    let abort = CancellationToken::new();

    let first = pipeline.process(fx.export("a.csv", CLAIM), &abort).await.unwrap();
    assert!(matches!(first, Outcome::Failed { .. }));

    assert_eq!(index.reset_failed().unwrap(), 1);
    let retried = pipeline.process(fx.export("a.csv", CLAIM), &abort).await.unwrap();
    assert!(matches!(retried, Outcome::Acknowledged { attempts: 1, .. }));
    assert_eq!(fx.api.notices().len(), 3);
}

#[tokio::test]
async fn rejection_is_recorded_without_retry() {
    let fx = Fixture::new();
    fx.api.script(&[422]);
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);

    let outcome = pipeline
        .process(fx.export("estimate.xml", b"<estimate/>"), &CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        Outcome::Failed { kind: ErrorKind::PermanentValidation, .. }
    ));
    assert_eq!(fx.api.notices().len(), 1);
    let record = index.get(&Identity::of_bytes(b"<estimate/>")).unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.last_error, Some(ErrorKind::PermanentValidation));
}

#[tokio::test]
async fn credential_rejection_is_fatal_and_keeps_the_record_open() {
    let fx = Fixture::new();
    fx.api.script(&[401]);
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let h1 = Identity::of_bytes(CLAIM);

    let err = pipeline
        .process(fx.export("claim_001.csv", CLAIM), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Fatal { .. }));
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert_eq!(fx.api.notices().len(), 1);

    let record = index.get(&h1).unwrap();
    assert_eq!(record.status, RecordStatus::Stored);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.last_error, Some(ErrorKind::Auth));
}

#[tokio::test]
async fn unpersisted_attempt_stops_delivery_as_a_crash() {
    let fx = Fixture::new();
    fx.api.always(503);
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let h1 = Identity::of_bytes(CLAIM);

    let records = fx.storage_root().join(".intake-index").join("records");
    fx.api.on_notify(move || {
        fs::remove_dir_all(&records).unwrap();
        fs::write(&records, b"not a directory").unwrap();
    });

    let err = pipeline
        .process(fx.export("claim_001.csv", CLAIM), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Index(_)));
    assert_eq!(err.kind(), ErrorKind::SupervisorCrash);
    assert_eq!(fx.api.notices().len(), 1, "no attempt is sent once persisting fails");
    assert!(!index.get(&h1).unwrap().remote_ack);
}

#[tokio::test]
async fn interrupted_ingestion_resumes_without_duplicates() {
    let fx = Fixture::new();
    let h1 = Identity::of_bytes(CLAIM);
    let candidate = fx.export("claim_001.csv", CLAIM);

    // First process: one failed attempt, then shutdown during the backoff.
    {
        let index = fx.open_index();
        let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
        let abort = CancellationToken::new();
        fx.api.script(&[500]);
        fx.api.cancel_on_notify(abort.clone());

        let outcome = pipeline.process(candidate.clone(), &abort).await.unwrap();
        assert_eq!(outcome, Outcome::Cancelled);
    }

    // Second process: the record is reloaded and the attempt count continues.
    {
        let index = fx.open_index();
        let record = index.get(&h1).unwrap();
        assert_eq!(record.status, RecordStatus::Stored);
        assert_eq!(record.attempts, 1);

        let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
        let outcome = pipeline.process(candidate.clone(), &CancellationToken::new()).await.unwrap();
        assert!(matches!(outcome, Outcome::Acknowledged { attempts: 2, .. }));
    }

    // Third process: already acknowledged.
    {
        let index = fx.open_index();
        let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
        let outcome = pipeline.process(candidate, &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, Outcome::Duplicate { identity: h1.clone() });
    }

    let attempts: Vec<u32> = fx.api.notices().iter().map(|n| n.metadata.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(files_in(&fx.storage_root().join(h1.as_str())).len(), 1);
}

#[tokio::test]
async fn stored_record_is_delivered_after_the_source_disappears() {
    let fx = Fixture::new();
    let h1 = Identity::of_bytes(CLAIM);
    let candidate = fx.export("claim_001.csv", CLAIM);

    {
        let index = fx.open_index();
        let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
        let abort = CancellationToken::new();
        fx.api.script(&[503]);
        fx.api.cancel_on_notify(abort.clone());
        pipeline.process(candidate.clone(), &abort).await.unwrap();
    }
    fs::remove_file(&candidate.source_path).unwrap();

    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let stranded = pipeline.stranded();
    assert_eq!(stranded.len(), 1);

    let outcome = pipeline
        .resume(stranded.into_iter().next().unwrap(), &CancellationToken::new())
        .await
        .unwrap();
    assert!(matches!(outcome, Outcome::Acknowledged { attempts: 2, .. }));
    assert!(index.get(&h1).unwrap().remote_ack);
    assert!(pipeline.stranded().is_empty());
}

#[tokio::test]
async fn archive_moves_settled_sources_aside() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Archive, 1);
    let abort = CancellationToken::new();

    let ok = fx.export("claim_001.csv", CLAIM);
    pipeline.process(ok.clone(), &abort).await.unwrap();
    assert!(!ok.source_path.exists());
    assert!(fx.watch_dir().join("_Processed/claim_001.csv").exists());

    fx.api.script(&[500]);
    let bad = fx.export("claim_002.csv", b"claim_002,RO-7732,80.00\n");
    let outcome = pipeline.process(bad.clone(), &abort).await.unwrap();
    assert!(matches!(outcome, Outcome::Failed { .. }));
    assert!(!bad.source_path.exists());
    assert!(fx.watch_dir().join("_Failed/claim_002.csv").exists());
    let stages = fx.api.wait_for_stages(8).await;
    assert_eq!(stages.iter().filter(|s| **s == EventStage::Archived).count(), 2);
}

#[tokio::test]
async fn delete_removes_source_only_after_acknowledgment() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Delete, 1);
    let abort = CancellationToken::new();

    fx.api.script(&[500]);
    let failed = fx.export("a.csv", b"first");
    pipeline.process(failed.clone(), &abort).await.unwrap();
    assert!(failed.source_path.exists());

    let ok = fx.export("b.csv", b"second");
    pipeline.process(ok.clone(), &abort).await.unwrap();
    assert!(!ok.source_path.exists());
    assert_eq!(files_in(fx.watch_dir()), vec![failed.source_path]);
}

#[tokio::test]
async fn stalled_event_endpoint_does_not_hold_up_ingestion() {
    let fx = Fixture::new();
    fx.api.stall_events();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Archive, 5);

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        pipeline.process(fx.export("claim_001.csv", CLAIM), &CancellationToken::new()),
    )
    .await
    .expect("ingestion waited on event reporting")
    .unwrap();

    assert!(matches!(outcome, Outcome::Acknowledged { .. }));
    assert!(fx.watch_dir().join("_Processed/claim_001.csv").exists());
}

#[tokio::test]
async fn file_changed_after_settling_is_skipped() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);

    let candidate = fx.export("growing.csv", b"partial");
    fs::write(&candidate.source_path, b"partial and then some").unwrap();

    let outcome = pipeline.process(candidate, &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::Skipped { reason: "changed since it settled", .. }));
    assert!(index.is_empty());
    assert!(fx.api.notices().is_empty());
}

#[tokio::test]
async fn vanished_source_is_skipped() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);

    let candidate = fx.export("gone.csv", b"bytes");
    fs::remove_file(&candidate.source_path).unwrap();

    let outcome = pipeline.process(candidate, &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::Skipped { reason: "source vanished", .. }));
    assert_eq!(pipeline.counters().skipped(), 1);
}

#[tokio::test]
async fn unreadable_source_is_reported_and_counted_as_failed() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);

    let dir = fx.watch_dir().join("looks_like_a_file.csv");
    fs::create_dir(&dir).unwrap();
    let candidate = common::candidate_for(&dir);

    let outcome = pipeline.process(candidate, &CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, Outcome::Unreadable { ref path, .. } if *path == dir));
    assert_eq!(pipeline.counters().failed(), 1);
    assert!(index.is_empty());
    assert!(fx.api.notices().is_empty());
    assert_eq!(
        fx.api.wait_for_stages(2).await,
        vec![EventStage::Received, EventStage::Error]
    );
}

#[tokio::test]
async fn aborted_before_start_does_nothing() {
    let fx = Fixture::new();
    let index = fx.open_index();
    let pipeline = fx.pipeline(&index, SourceDisposition::Leave, 5);
    let abort = CancellationToken::new();
    abort.cancel();

    let outcome = pipeline.process(fx.export("a.csv", CLAIM), &abort).await.unwrap();
    assert_eq!(outcome, Outcome::Cancelled);
    assert!(index.is_empty());
    assert!(fx.api.stages().is_empty());
}
