// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Admission and reconciliation tests against the mock worker runtime.

mod common;

use common::{TestContext, write_output};
use precheck_server::scheduler::{AdmitOutcome, CancelOutcome, WORKER_DISAPPEARED};
use precheck_server::store::{JobStore, RunStatus};
use precheck_server::worker::WorkerRuntime;

async fn status_of(ctx: &TestContext, run_id: &str) -> RunStatus {
    ctx.store.get_run(run_id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_single_slot_admits_next_after_exit() {
    let ctx = TestContext::new().await;
    let first = ctx.queue_run("chip_top").await;
    let second = ctx.queue_run("chip_top").await;
    assert_eq!(second.queue.position, Some(2));

    let report = ctx.scheduler.tick().await.unwrap();
    assert_eq!(report.admission, AdmitOutcome::Started(first.id.clone()));
    assert_eq!(status_of(&ctx, &first.id).await, RunStatus::Running);

    let waiting = ctx.store.get_run(&second.id).await.unwrap().unwrap();
    assert_eq!(waiting.status, RunStatus::Queued);
    assert_eq!(waiting.queue_position, Some(1));

    // Slot is taken: nothing else starts
    let report = ctx.scheduler.tick().await.unwrap();
    assert_eq!(report.admission, AdmitOutcome::AtCapacity);
    assert_eq!(ctx.runtime.launches().await.len(), 1);

    // Exit frees the slot and the same tick admits the next run
    let worker = ctx.worker_for(&first.id).await;
    ctx.runtime.exit_worker(&worker, 0).await;

    let report = ctx.scheduler.tick().await.unwrap();
    assert_eq!(report.finalized, 1);
    assert_eq!(report.admission, AdmitOutcome::Started(second.id.clone()));
    assert_eq!(status_of(&ctx, &first.id).await, RunStatus::Completed);
    assert_eq!(status_of(&ctx, &second.id).await, RunStatus::Running);
}

#[tokio::test]
async fn test_fifo_admission_with_two_slots() {
    let ctx = TestContext::with_options(2, None).await;
    let runs = [
        ctx.queue_run("a").await,
        ctx.queue_run("b").await,
        ctx.queue_run("c").await,
    ];

    // One admission per tick, oldest first
    ctx.scheduler.tick().await.unwrap();
    ctx.scheduler.tick().await.unwrap();
    let report = ctx.scheduler.tick().await.unwrap();
    assert_eq!(report.admission, AdmitOutcome::AtCapacity);

    let launched: Vec<String> = ctx
        .runtime
        .launches()
        .await
        .into_iter()
        .map(|request| request.job_id)
        .collect();
    assert_eq!(launched, vec![runs[0].id.clone(), runs[1].id.clone()]);
    assert_eq!(ctx.runtime.count_running().await.unwrap(), 2);

    let last = ctx.store.get_run(&runs[2].id).await.unwrap().unwrap();
    assert_eq!(last.queue_position, Some(1));
}

#[tokio::test]
async fn test_reconciliation_is_idempotent() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let worker = ctx.worker_for(&run.id).await;
    ctx.runtime.exit_worker(&worker, 2).await;

    assert_eq!(ctx.scheduler.reconcile().await.unwrap(), 1);
    assert_eq!(ctx.scheduler.reconcile().await.unwrap(), 0);
    assert_eq!(ctx.runtime.stop_count(&worker).await, 1);

    let failed = ctx.store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.exit_code, Some(2));
    assert_eq!(failed.error.as_deref(), Some("Precheck exited with code 2"));
    assert_eq!(failed.worker_ref, None);
    assert_eq!(failed.last_worker_ref.as_deref(), Some(worker.as_str()));
}

#[tokio::test]
async fn test_completed_run_records_output_checksums() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    write_output(&ctx.run_dir(&run.id), "chip_top", b"final layout");
    let worker = ctx.worker_for(&run.id).await;
    ctx.runtime.exit_worker(&worker, 0).await;
    ctx.scheduler.tick().await.unwrap();

    let done = ctx.store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.exit_code, Some(0));
    let sums = done.output_checksums.expect("output checksums");
    assert_eq!(sums.get("sha256").map(String::len), Some(64));
}

#[tokio::test]
async fn test_completed_without_output_has_no_checksums() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let worker = ctx.worker_for(&run.id).await;
    ctx.runtime.exit_worker(&worker, 0).await;
    ctx.scheduler.tick().await.unwrap();

    let done = ctx.store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert!(done.output_checksums.is_none());
}

#[tokio::test]
async fn test_vanished_worker_fails_run() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let worker = ctx.worker_for(&run.id).await;
    ctx.runtime.vanish_worker(&worker).await;
    ctx.scheduler.tick().await.unwrap();

    let failed = ctx.store.get_run(&run.id).await.unwrap().unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(WORKER_DISAPPEARED));
}

#[tokio::test]
async fn test_cancel_running_frees_slot() {
    let ctx = TestContext::new().await;
    let first = ctx.queue_run("chip_top").await;
    let second = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let worker = ctx.worker_for(&first.id).await;
    let outcome = ctx.scheduler.cancel_run(&first.id).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            previous: RunStatus::Running
        }
    );
    assert_eq!(ctx.runtime.stop_count(&worker).await, 1);

    let report = ctx.scheduler.tick().await.unwrap();
    assert_eq!(report.finalized, 0);
    assert_eq!(report.admission, AdmitOutcome::Started(second.id.clone()));

    // Cancelled stays cancelled
    assert_eq!(status_of(&ctx, &first.id).await, RunStatus::Cancelled);
    let again = ctx.scheduler.cancel_run(&first.id).await.unwrap();
    assert_eq!(again, CancelOutcome::AlreadyTerminal(RunStatus::Cancelled));
}

#[tokio::test]
async fn test_cancelled_queued_run_never_launches() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;

    ctx.scheduler.cancel_run(&run.id).await.unwrap();
    let report = ctx.scheduler.tick().await.unwrap();

    assert_eq!(report.admission, AdmitOutcome::Idle);
    assert!(ctx.runtime.launches().await.is_empty());
}
