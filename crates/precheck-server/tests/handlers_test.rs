// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for precheck handlers.

mod common;

use std::time::Duration;

use common::{TestContext, write_output};
use precheck_server::error::Error;
use precheck_server::handlers::{
    CreateRunRequest, handle_cancel_run, handle_create_run, handle_delete_upload,
    handle_get_logs, handle_get_run, handle_get_stats, handle_get_upload, handle_list_runs,
    handle_list_uploads, handle_output_path, handle_queue_status, handle_wait_run,
};
use precheck_server::reaper::{ExpiryReaper, ReaperConfig};
use precheck_server::scheduler::CancelOutcome;
use precheck_server::store::{ListRunsFilter, RunStatus, UploadState};
use precheck_server::worker::LogOptions;

#[tokio::test]
async fn test_upload_lifecycle() {
    let ctx = TestContext::new().await;
    let id = ctx.upload().await;

    let view = handle_get_upload(&ctx.state, &id).await.unwrap();
    assert_eq!(view.state.status, UploadState::Available);
    assert!(!view.state.expired);
    assert_eq!(view.checksums.len(), 1);

    assert_eq!(handle_list_uploads(&ctx.state).await.unwrap().len(), 1);

    handle_delete_upload(&ctx.state, &id).await.unwrap();
    assert!(!ctx.data_dir.join("uploads").join(&id).exists());

    let err = handle_get_upload(&ctx.state, &id).await.unwrap_err();
    assert!(err.is_not_found());
    let err = handle_delete_upload(&ctx.state, &id).await.unwrap_err();
    assert!(matches!(err, Error::UploadNotFound(_)));
}

#[tokio::test]
async fn test_create_run_copies_input() {
    let ctx = TestContext::new().await;
    let upload_id = ctx.upload().await;
    let upload = handle_get_upload(&ctx.state, &upload_id).await.unwrap();

    let run = handle_create_run(
        &ctx.state,
        CreateRunRequest {
            upload_id: upload_id.clone(),
            top_cell: "chip_top".to_string(),
            die_id: Some("0000002A".to_string()),
        },
    )
    .await
    .unwrap();

    assert_eq!(run.name, format!("precheck-{}", run.id));
    assert_eq!(run.state.status, RunStatus::Queued);
    assert_eq!(run.queue.position, Some(1));
    assert_eq!(run.queue.length, 1);
    assert_eq!(run.config.labels.die_id, "0000002A");
    assert_eq!(run.input.as_ref().unwrap().checksums, upload.checksums);

    let input = ctx.run_dir(&run.id).join("input.gds");
    assert_eq!(std::fs::read(input).unwrap(), b"GDSII layout bytes");

    // The run keeps working after the upload goes away
    handle_delete_upload(&ctx.state, &upload_id).await.unwrap();
    let again = handle_get_run(&ctx.state, &run.id).await.unwrap();
    assert_eq!(again.config.labels.upload_id, upload_id);
}

#[tokio::test]
async fn test_expired_upload_rejected_then_reaped() {
    let ctx = TestContext::with_options(1, Some(Duration::ZERO)).await;
    let upload_id = ctx.upload().await;

    let view = handle_get_upload(&ctx.state, &upload_id).await.unwrap();
    assert!(view.state.expired);

    let err = handle_create_run(
        &ctx.state,
        CreateRunRequest {
            upload_id: upload_id.clone(),
            top_cell: "chip_top".to_string(),
            die_id: None,
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::UploadExpired(_)));
    assert!(handle_list_runs(&ctx.state, &ListRunsFilter::all())
        .await
        .unwrap()
        .is_empty());

    let reaper = ExpiryReaper::new(
        ctx.store.clone(),
        ReaperConfig {
            uploads_dir: ctx.data_dir.join("uploads"),
            ..ReaperConfig::default()
        },
    );
    assert_eq!(reaper.reap_once().await.unwrap(), vec![upload_id.clone()]);
    assert!(!ctx.data_dir.join("uploads").join(&upload_id).exists());
}

#[tokio::test]
async fn test_list_runs_filters_by_status() {
    let ctx = TestContext::new().await;
    let first = ctx.queue_run("a").await;
    let second = ctx.queue_run("b").await;
    ctx.scheduler.tick().await.unwrap();

    let queued = handle_list_runs(
        &ctx.state,
        &ListRunsFilter::with_statuses([RunStatus::Queued]),
    )
    .await
    .unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].id, second.id);
    assert_eq!(queued[0].queue.length, 1);

    let all = handle_list_runs(&ctx.state, &ListRunsFilter::all())
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec![second.id.as_str(), first.id.as_str()]);
    assert!(all[1].state.running);
    assert!(all[1].container_id.is_some());
}

#[tokio::test]
async fn test_queue_status_uses_live_workers() {
    let ctx = TestContext::new().await;
    ctx.queue_run("a").await;
    ctx.queue_run("b").await;
    ctx.scheduler.tick().await.unwrap();

    let status = handle_queue_status(&ctx.state).await.unwrap();
    assert_eq!(status.queued, 1);
    assert_eq!(status.running, 1);
    assert_eq!(status.max_concurrent, 1);
}

#[tokio::test]
async fn test_cancel_unknown_run() {
    let ctx = TestContext::new().await;

    let err = handle_cancel_run(&ctx.state, "missing").await.unwrap_err();
    assert_eq!(err.to_string(), "No such precheck: missing");
}

#[tokio::test]
async fn test_cancel_queued_run() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;

    let outcome = handle_cancel_run(&ctx.state, &run.id).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            previous: RunStatus::Queued
        }
    );

    let view = handle_get_run(&ctx.state, &run.id).await.unwrap();
    assert_eq!(view.state.status, RunStatus::Cancelled);
    assert_eq!(view.queue.position, None);
    assert_ne!(view.state.finished_at, precheck_server::projection::ZERO_TIME);
}

#[tokio::test]
async fn test_logs_follow_timestamps() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let worker = ctx.worker_for(&run.id).await;
    for line in [
        "2025-01-15T10:30:00.000000001Z step 1/3",
        "2025-01-15T10:30:01.000000001Z step 2/3",
        "2025-01-15T10:30:02.500000000Z step 3/3",
    ] {
        ctx.runtime.push_log(&worker, line).await;
    }

    let logs = handle_get_logs(
        &ctx.state,
        &run.id,
        &LogOptions {
            since: None,
            tail: Some(2),
            timestamps: true,
        },
    )
    .await
    .unwrap();

    assert_eq!(logs.lines.len(), 2);
    assert!(logs.has_more);
    let last = logs.last_timestamp.unwrap();
    assert_eq!(last.to_rfc3339(), "2025-01-15T10:30:02.500+00:00");

    let all = handle_get_logs(&ctx.state, &run.id, &LogOptions::default())
        .await
        .unwrap();
    assert_eq!(all.lines.len(), 3);
    assert!(!all.has_more);
    assert_eq!(all.last_timestamp, None);
}

#[tokio::test]
async fn test_stats_for_running_run() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let stats = handle_get_stats(&ctx.state, &run.id).await.unwrap();
    assert_eq!(stats.pids, "1");
}

#[tokio::test]
async fn test_wait_times_out_on_queued_run() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;

    let err = handle_wait_run(&ctx.state, &run.id, Duration::from_millis(30))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WaitTimeout { .. }));

    // The run itself is untouched
    let view = handle_get_run(&ctx.state, &run.id).await.unwrap();
    assert_eq!(view.state.status, RunStatus::Queued);
}

#[tokio::test]
async fn test_wait_without_representable_deadline() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;

    let (waited, cancelled) = tokio::join!(
        handle_wait_run(&ctx.state, &run.id, Duration::MAX),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            handle_cancel_run(&ctx.state, &run.id).await
        }
    );

    assert!(cancelled.is_ok());
    let response = waited.unwrap();
    assert_eq!(response.status_code, 0);
}

#[tokio::test]
async fn test_wait_reports_failure() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;
    ctx.scheduler.tick().await.unwrap();

    let worker = ctx.worker_for(&run.id).await;
    ctx.runtime
        .exit_worker_with_error(&worker, 3, Some("DRC violations"))
        .await;
    ctx.scheduler.tick().await.unwrap();

    let response = handle_wait_run(&ctx.state, &run.id, Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.status_code, 3);
    assert_eq!(response.error.as_deref(), Some("DRC violations"));
}

#[tokio::test]
async fn test_output_path_requires_completion() {
    let ctx = TestContext::new().await;
    let run = ctx.queue_run("chip_top").await;

    let err = handle_output_path(&ctx.state, &run.id).await.unwrap_err();
    assert_eq!(err.to_string(), "Invalid request: Precheck not completed");

    ctx.scheduler.tick().await.unwrap();
    let expected = write_output(&ctx.run_dir(&run.id), "chip_top", b"final");
    let worker = ctx.worker_for(&run.id).await;
    ctx.runtime.exit_worker(&worker, 0).await;
    ctx.scheduler.tick().await.unwrap();

    let path = handle_output_path(&ctx.state, &run.id).await.unwrap();
    assert_eq!(path, expected);

    let view = handle_get_run(&ctx.state, &run.id).await.unwrap();
    let output = view.output.expect("output view");
    assert!(output.available);
    assert_eq!(output.checksums.len(), 1);
}
