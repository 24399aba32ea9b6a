#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::types::{Priority, VerificationStatus};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::test]
async fn add_and_receive_round_trips_job() {
    let q = Queue::open_in_memory().await.unwrap();
    q.add_file(PathBuf::from("/tmp/a.bin"), 2_250_000)
        .await
        .unwrap();

    let (msg, job) = q
        .receive_file(Duration::from_secs(60))
        .await
        .unwrap()
        .expect("a message should be available");

    assert_eq!(job.path, PathBuf::from("/tmp/a.bin"));
    assert_eq!(job.size, 2_250_000);
    assert_eq!(msg.delivery_count, 1);

    let stats = q.get_queue_stats().await.unwrap();
    assert_eq!(stats.in_progress, 1);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn receive_picks_highest_priority_first() {
    let q = Queue::open_in_memory().await.unwrap();
    q.add_file_with_priority(PathBuf::from("/tmp/low.bin"), 10, Priority(0))
        .await
        .unwrap();
    q.add_file_with_priority(PathBuf::from("/tmp/high.bin"), 10, Priority(5))
        .await
        .unwrap();

    let (_, job) = q
        .receive_file(Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.path, PathBuf::from("/tmp/high.bin"));
}

#[tokio::test]
async fn complete_file_moves_to_completed_items() {
    let q = Queue::open_in_memory().await.unwrap();
    let id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.receive_file(Duration::from_secs(60)).await.unwrap();

    let completed = q
        .complete_file(&id, &PathBuf::from("/out/a.nzb"))
        .await
        .unwrap();
    assert_eq!(completed.nzb_path, PathBuf::from("/out/a.nzb"));

    let stats = q.get_queue_stats().await.unwrap();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.in_progress, 0);

    let nzb = q.get_completed_item_nzb_path(&id).await.unwrap();
    assert_eq!(nzb, Some(PathBuf::from("/out/a.nzb")));
}

#[tokio::test]
async fn mark_as_error_then_retry_errored_job_reenqueues() {
    let q = Queue::open_in_memory().await.unwrap();
    let id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.receive_file(Duration::from_secs(60)).await.unwrap();

    q.mark_as_error(&id, "upload failed").await.unwrap();
    let stats = q.get_queue_stats().await.unwrap();
    assert_eq!(stats.errored, 1);

    q.retry_errored_job(&id).await.unwrap();
    let stats = q.get_queue_stats().await.unwrap();
    assert_eq!(stats.errored, 0);
    assert_eq!(stats.pending, 1);
}

#[tokio::test]
async fn readd_job_increments_retry_count() {
    let q = Queue::open_in_memory().await.unwrap();
    let id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.receive_file(Duration::from_secs(60)).await.unwrap();

    q.readd_job(&id).await.unwrap();
    let (_, job) = q
        .receive_file(Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.retry_count, 1);
}

#[tokio::test]
async fn remove_from_queue_cancels_pending_job() {
    let q = Queue::open_in_memory().await.unwrap();
    let id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.remove_from_queue(&id).await.unwrap();

    let stats = q.get_queue_stats().await.unwrap();
    assert_eq!(stats.pending, 0);
    assert!(q.receive_file(Duration::from_secs(60)).await.unwrap().is_none());
}

#[tokio::test]
async fn set_queue_item_priority_updates_pending_job() {
    let q = Queue::open_in_memory().await.unwrap();
    let id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.set_queue_item_priority(&id, Priority(9)).await.unwrap();

    let items = q.get_queue_items().await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].priority, Priority(9));
}

#[tokio::test]
async fn extend_timeout_pushes_lease_forward() {
    let q = Queue::open_in_memory().await.unwrap();
    let id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    let (msg, _) = q
        .receive_file(Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    q.extend_timeout(&id, Duration::from_secs(3600)).await.unwrap();
    // A second receive should not be able to steal the lease immediately.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(q.receive_file(Duration::from_secs(1)).await.unwrap().is_none());
    assert_eq!(msg.id, id);
}

#[tokio::test]
async fn deferred_check_lifecycle() {
    let q = Queue::open_in_memory().await.unwrap();
    let job_id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.receive_file(Duration::from_secs(60)).await.unwrap();
    let completed = q
        .complete_file(&job_id, &PathBuf::from("/out/a.nzb"))
        .await
        .unwrap();

    let check_id = q
        .add_article_check(
            &completed.id,
            "<abc@example.com>",
            &["alt.binaries.test".to_string()],
            chrono::Utc::now() - chrono::Duration::seconds(1),
        )
        .await
        .unwrap();

    let due = q.get_articles_for_check(50).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].newsgroups, vec!["alt.binaries.test".to_string()]);

    assert_eq!(
        q.get_pending_check_count_for_item(&completed.id).await.unwrap(),
        1
    );

    q.mark_article_verified(&check_id).await.unwrap();
    assert_eq!(
        q.get_pending_check_count_for_item(&completed.id).await.unwrap(),
        0
    );

    q.update_completed_item_verification_status(&completed.id, VerificationStatus::Verified)
        .await
        .unwrap();
}

#[tokio::test]
async fn update_article_check_retry_backs_off_and_stamps_first_failure() {
    let q = Queue::open_in_memory().await.unwrap();
    let job_id = q.add_file(PathBuf::from("/tmp/a.bin"), 100).await.unwrap();
    q.receive_file(Duration::from_secs(60)).await.unwrap();
    let completed = q
        .complete_file(&job_id, &PathBuf::from("/out/a.nzb"))
        .await
        .unwrap();
    let check_id = q
        .add_article_check(
            &completed.id,
            "<abc@example.com>",
            &["alt.binaries.test".to_string()],
            chrono::Utc::now(),
        )
        .await
        .unwrap();

    let next_retry = chrono::Utc::now() + chrono::Duration::minutes(5);
    q.update_article_check_retry(&check_id, next_retry).await.unwrap();

    let due = q.get_articles_for_check(50).await.unwrap();
    assert!(due.is_empty(), "not due yet");

    let all = sqlx::query_as::<_, (i64, Option<String>)>(
        "SELECT retry_count, first_failure_at FROM deferred_article_checks WHERE id = ?",
    )
    .bind(&check_id)
    .fetch_one(&q.pool)
    .await
    .unwrap();
    assert_eq!(all.0, 1);
    assert!(all.1.is_some());
}
