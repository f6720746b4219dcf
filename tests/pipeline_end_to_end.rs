//! End-to-end pipeline scenarios over in-memory infrastructure and the
//! scripted orchestrator

mod common;

use common::{
    fast_config, request, start_pipeline, start_pipeline_with, wait_for_job, wait_for_terminal,
    SimOrchestrator, SimOutcome,
};
use evald::evaluation::EvalStatus;
use evald::events::EventKind;
use evald::infra::{EventBus, OrchestratorError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread")]
async fn test_submission_completes_with_captured_output() {
    let sim = SimOrchestrator::new(|_| SimOutcome::succeed("2\n"));
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print(1+1)", 10)).await.unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;

    assert_eq!(eval.status, EvalStatus::Completed);
    assert_eq!(eval.exit_code, Some(0));
    assert_eq!(eval.output.as_deref(), Some("2\n"));
    assert_eq!(eval.retry_count, 0);
    // The record reflects the submission literally.
    assert_eq!(eval.source, "print(1+1)");
    assert_eq!(eval.runtime, "py");
    assert_eq!(eval.timeout_secs, 10);

    // The release continuation returns the sandbox after the terminal
    // event.
    for _ in 0..200 {
        if h.pipeline.pool.available().await.unwrap().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.pipeline.pool.available().await.unwrap().len(), 1);
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deadline_exceeded_reaches_failed() {
    let sim = SimOrchestrator::new(|_| SimOutcome::deadline());
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;

    let id = h
        .pipeline
        .submit(request("import time; time.sleep(999)", 2))
        .await
        .unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;

    assert_eq!(eval.status, EvalStatus::Failed);
    assert!(eval.error.unwrap_or_default().contains("DeadlineExceeded"));
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_nonzero_exit_pinned_to_failed_with_code() {
    // Contract fixture: a snippet exiting non-zero reports job failure
    // with the exit code preserved and stderr captured separately.
    let sim = SimOrchestrator::new(|_| SimOutcome::fail("", 3).with_stderr("SystemExit: 3\n"));
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;

    let id = h
        .pipeline
        .submit(request("raise SystemExit(3)", 10))
        .await
        .unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;

    assert_eq!(eval.status, EvalStatus::Failed);
    assert_eq!(eval.exit_code, Some(3));
    assert_eq!(eval.stderr.as_deref(), Some("SystemExit: 3\n"));
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_logs_extend_terminal_record() {
    // The logs endpoint is down past the retry budget when the job
    // finishes; the terminal event goes out without output and the
    // monitor's late retrieval extends the record with an append event.
    let sim = SimOrchestrator::new(|_| SimOutcome::succeed("late logs\n"));
    for _ in 0..4 {
        sim.inject_log_failure(OrchestratorError::Unavailable("logs not ready".to_string()));
    }
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print('slow io')", 10)).await.unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;
    assert_eq!(eval.status, EvalStatus::Completed);

    // The append lands after the late retrieval succeeds.
    let mut output = None;
    for _ in 0..300 {
        let eval = h.pipeline.read(&id).await.unwrap().unwrap();
        if eval.output.as_deref() == Some("late logs\n") {
            output = eval.output;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(output.as_deref(), Some("late logs\n"));
    assert!(h.pipeline.monitor.stats().late_log_appends() >= 1);
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sub_100ms_execution_completes_without_running() {
    let sim = SimOrchestrator::new(|_| {
        SimOutcome::succeed("fast\n")
            .without_running()
            .with_delay(Duration::from_millis(5))
    });
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print('fast')", 10)).await.unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;

    // The running event was never observable; the evaluation still
    // lands in completed.
    assert_eq!(eval.status, EvalStatus::Completed);
    assert_eq!(eval.output.as_deref(), Some("fast\n"));
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ten_tasks_over_two_sandboxes_never_overbook() {
    let sim = SimOrchestrator::new(|_| {
        SimOutcome::succeed("ok\n").with_delay(Duration::from_millis(40))
    });
    let h = start_pipeline(sim, &["http://sb-1:8000", "http://sb-2:8000"], 3).await;

    // Sample busy counts while the batch drains.
    let max_busy = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let pool = h.pipeline.pool.clone();
        let max_busy = max_busy.clone();
        tokio::spawn(async move {
            loop {
                let busy = pool.busy().await.unwrap_or_default().len();
                max_busy.fetch_max(busy, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let results = h
        .pipeline
        .submit_batch((0..10).map(|i| request(&format!("print({})", i), 10)).collect())
        .await
        .unwrap();
    let ids: Vec<_> = results.into_iter().map(|r| r.unwrap()).collect();

    for id in &ids {
        let eval = wait_for_terminal(&h.pipeline, id, Duration::from_secs(30)).await;
        assert_eq!(eval.status, EvalStatus::Completed);
    }
    sampler.abort();

    assert!(
        max_busy.load(Ordering::SeqCst) <= 2,
        "observed {} busy sandboxes in a pool of 2",
        max_busy.load(Ordering::SeqCst)
    );
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_running_evaluation() {
    let sim = SimOrchestrator::new(|_| {
        SimOutcome::succeed("never\n").with_delay(Duration::from_secs(30))
    });
    let h = start_pipeline(sim.clone(), &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print(1)", 60)).await.unwrap();
    wait_for_job(&h.pipeline, &id, Duration::from_secs(10)).await;

    h.pipeline.cancel(&id).await.unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;

    // Cancellation by the user always results in cancelled, never
    // failed.
    assert_eq!(eval.status, EvalStatus::Cancelled);
    assert!(!sim.has_job_for(&id));
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_before_scheduling_discards_task() {
    // An empty pool keeps the dispatcher waiting in Phase 1.
    let sim = SimOrchestrator::new(|_| SimOutcome::succeed("never\n"));
    let h = start_pipeline(sim.clone(), &[], 1).await;

    let id = h.pipeline.submit(request("print(1)", 10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.pipeline.cancel(&id).await.unwrap();

    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;
    assert_eq!(eval.status, EvalStatus::Cancelled);

    // The dispatcher observes the terminal record and discards the
    // envelope without ever touching the orchestrator.
    for _ in 0..200 {
        if h.pipeline
            .dispatchers
            .iter()
            .map(|d| d.stats().discarded_terminal())
            .sum::<u64>()
            > 0
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!sim.has_job_for(&id));
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forced_double_release_settles_to_pool_size() {
    let sim = SimOrchestrator::new(|_| SimOutcome::succeed("ok\n"));
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;
    let mut events = h.bus.subscribe();

    let id = h.pipeline.submit(request("print(1)", 10)).await.unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;
    assert_eq!(eval.status, EvalStatus::Completed);

    // Recover the assigned sandbox from the provisioning event.
    let mut sandbox = None;
    while let Ok(ev) = events.try_recv() {
        if ev.kind == EventKind::Provisioning && ev.eval_id == id {
            sandbox = ev.sandbox_url;
        }
    }
    let sandbox = sandbox.expect("provisioning event with sandbox url");

    // Wait for the legitimate release, then force a second fire of the
    // continuation.
    for _ in 0..200 {
        if h.pipeline.pool.available().await.unwrap().len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let before = h.pipeline.pool.stats().double_releases;
    h.pipeline.pool.release(&sandbox).await.unwrap();

    assert_eq!(h.pipeline.pool.available().await.unwrap().len(), 1);
    assert_eq!(h.pipeline.pool.stats().double_releases, before + 1);
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_watch_disconnect_synthesizes_terminal_event() {
    // The job finishes silently: no terminal watch event is ever
    // emitted, as if it fired while the watch connection was down.
    let sim = SimOrchestrator::new(|_| {
        SimOutcome::succeed("late\n")
            .silent()
            .with_delay(Duration::from_millis(30))
    });
    let h = start_pipeline(sim.clone(), &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print('late')", 10)).await.unwrap();
    wait_for_job(&h.pipeline, &id, Duration::from_secs(10)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Renewal runs reconciliation, which finds the finished job.
    sim.cut_watch();

    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;
    assert_eq!(eval.status, EvalStatus::Completed);
    assert_eq!(eval.output.as_deref(), Some("late\n"));
    assert!(h.pipeline.monitor.stats().synthesized_terminals() >= 1);
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_orphan_reconciler_deletes_finished_jobs() {
    let sim = SimOrchestrator::new(|_| SimOutcome::succeed("ok\n"));
    let h = start_pipeline(sim.clone(), &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print(1)", 10)).await.unwrap();
    wait_for_terminal(&h.pipeline, &id, Duration::from_secs(10)).await;

    // The simulator keeps finished jobs around until deleted.
    assert!(sim.has_job_for(&id));
    let deleted = h.pipeline.monitor.reconcile_orphans().await.unwrap();
    assert_eq!(deleted, 1);
    assert!(!sim.has_job_for(&id));
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_quota_exhaustion_dead_letters_and_fails() {
    let sim = SimOrchestrator::new(|_| SimOutcome::succeed("never\n"));
    // One more failure than the retry budget.
    for _ in 0..4 {
        sim.inject_submit_failure(OrchestratorError::QuotaExhausted);
    }
    let h = start_pipeline(sim, &["http://sb-1:8000"], 1).await;

    let id = h.pipeline.submit(request("print(1)", 10)).await.unwrap();
    let eval = wait_for_terminal(&h.pipeline, &id, Duration::from_secs(15)).await;

    assert_eq!(eval.status, EvalStatus::Failed);
    assert_eq!(eval.error.as_deref(), Some("quota_exhausted"));
    assert_eq!(h.pipeline.dlq.len().await.unwrap(), 1);
    // The sandbox came back despite every failure path.
    assert_eq!(h.pipeline.pool.available().await.unwrap().len(), 1);
    h.pipeline.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hundred_submissions_over_three_sandboxes() {
    let sim = SimOrchestrator::new(|_| {
        SimOutcome::succeed("ok\n").with_delay(Duration::from_millis(10))
    });
    let h = start_pipeline_with(
        fast_config(),
        sim.clone(),
        &["http://sb-1:8000", "http://sb-2:8000", "http://sb-3:8000"],
        4,
    )
    .await;

    let max_busy = Arc::new(AtomicUsize::new(0));
    let sampler = {
        let pool = h.pipeline.pool.clone();
        let max_busy = max_busy.clone();
        tokio::spawn(async move {
            loop {
                let busy = pool.busy().await.unwrap_or_default().len();
                max_busy.fetch_max(busy, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    };

    let results = h
        .pipeline
        .submit_batch((0..100).map(|i| request(&format!("print({})", i), 10)).collect())
        .await
        .unwrap();

    let mut ids = HashSet::new();
    for result in &results {
        let id = result.as_ref().unwrap();
        assert!(ids.insert(id.clone()), "duplicate evaluation id");
    }

    for id in &ids {
        let eval = wait_for_terminal(&h.pipeline, id, Duration::from_secs(60)).await;
        assert_eq!(eval.status, EvalStatus::Completed);
    }
    sampler.abort();
    assert!(max_busy.load(Ordering::SeqCst) <= 3);

    // No sandbox was double-booked and no job outlives its evaluation
    // past one reconciler pass.
    assert_eq!(h.pipeline.pool.stats().double_releases, 0);
    h.pipeline.monitor.reconcile_orphans().await.unwrap();
    for id in &ids {
        assert!(!sim.has_job_for(id));
    }
    h.pipeline.shutdown().await;
}
