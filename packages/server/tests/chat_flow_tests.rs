//! End-to-end scenarios: ingress → lanes → workers → events.

mod common;

use std::time::Duration;

use common::{teacher_request, text_response, TestApp};
use server_core::kernel::errors::ErrorKind;
use server_core::kernel::event_log::EventType;
use server_core::kernel::jobs::JobStatus;
use server_core::kernel::test_support::MockGateway;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn fresh_request_dispatches_immediately() {
    let mut app = TestApp::new(MockGateway::scripted(vec![Ok(text_response("hello"))]));
    app.start_workers();

    let receipt = app
        .submit(teacher_request("T1", "session_main", "hi", Some("req-1")))
        .await
        .unwrap();
    assert_eq!(receipt.lane_queue_position, 0);
    assert_eq!(receipt.lane_id, "teacher:T1:session_main");

    let job = app
        .wait_for_status(&receipt.job_id, JobStatus::Done, WAIT)
        .await;
    assert_eq!(job.reply.as_deref(), Some("hello"));

    let events = app.events(&receipt.job_id);
    let ids: Vec<u64> = events.iter().map(|e| e.event_id).collect();
    assert_eq!(ids, (1..=ids.len() as u64).collect::<Vec<_>>());

    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::JobQueued,
            EventType::JobProcessing,
            EventType::AssistantDelta,
            EventType::AssistantDone,
            EventType::JobDone,
        ]
    );
}

#[tokio::test]
async fn idempotent_retry_returns_same_job() {
    let mut app = TestApp::new(MockGateway::replies("ok", 2));
    app.start_workers();

    let first = app
        .submit(teacher_request("T1", "session_main", "hi", Some("req-dup")))
        .await
        .unwrap();
    app.wait_for_status(&first.job_id, JobStatus::Done, WAIT)
        .await;

    let second = app
        .submit(teacher_request("T1", "session_main", "hi", Some("req-dup")))
        .await
        .unwrap();
    assert_eq!(second.job_id, first.job_id);

    // Only one lifecycle in the log.
    let events = app.events(&first.job_id);
    let queued = events
        .iter()
        .filter(|e| e.event_type == EventType::JobQueued)
        .count();
    let done = events
        .iter()
        .filter(|e| e.event_type == EventType::JobDone)
        .count();
    assert_eq!(queued, 1);
    assert_eq!(done, 1);
}

#[tokio::test]
async fn debounce_reuses_recent_job() {
    // No request_id on either submission; the fingerprint window catches
    // the double-submit.
    let mut app = TestApp::new(MockGateway::replies("ok", 2));

    let first = app
        .submit(teacher_request("T1", "session_main", "same text", None))
        .await
        .unwrap();
    let second = app
        .submit(teacher_request("T1", "session_main", "same text", None))
        .await
        .unwrap();
    assert_eq!(second.job_id, first.job_id);

    // A different message is a different fingerprint.
    let third = app
        .submit(teacher_request("T1", "session_main", "other text", None))
        .await
        .unwrap();
    assert_ne!(third.job_id, first.job_id);

    app.start_workers();
    app.wait_for_status(&first.job_id, JobStatus::Done, WAIT)
        .await;
}

#[tokio::test]
async fn lane_preserves_fifo_order() {
    let mut app = TestApp::new(MockGateway::scripted(vec![
        Ok(text_response("one")),
        Ok(text_response("two")),
        Ok(text_response("three")),
    ]));

    // Same teacher + session → same lane. Workers are not running yet, so
    // queue positions are observable.
    let a = app
        .submit(teacher_request("T1", "session_main", "first", Some("ra")))
        .await
        .unwrap();
    let b = app
        .submit(teacher_request("T1", "session_main", "second", Some("rb")))
        .await
        .unwrap();
    let c = app
        .submit(teacher_request("T1", "session_main", "third", Some("rc")))
        .await
        .unwrap();

    assert_eq!(a.lane_queue_position, 0);
    assert_eq!(b.lane_queue_position, 1);
    assert_eq!(c.lane_queue_position, 2);

    app.start_workers();
    let job_a = app.wait_for_status(&a.job_id, JobStatus::Done, WAIT).await;
    let job_b = app.wait_for_status(&b.job_id, JobStatus::Done, WAIT).await;
    let job_c = app.wait_for_status(&c.job_id, JobStatus::Done, WAIT).await;

    // The scripted gateway replies in order, so FIFO processing maps the
    // replies A→one, B→two, C→three.
    assert_eq!(job_a.reply.as_deref(), Some("one"));
    assert_eq!(job_b.reply.as_deref(), Some("two"));
    assert_eq!(job_c.reply.as_deref(), Some("three"));

    assert!(job_a.created_at <= job_b.created_at);
    assert!(job_b.created_at <= job_c.created_at);
}

#[tokio::test]
async fn different_lanes_run_concurrently() {
    let mut app = TestApp::new(MockGateway::replies("ok", 2));

    let a = app
        .submit(teacher_request("T1", "session_main", "hi", None))
        .await
        .unwrap();
    let b = app
        .submit(teacher_request("T2", "session_main", "hi", None))
        .await
        .unwrap();
    assert_ne!(a.lane_id, b.lane_id);
    assert_eq!(a.lane_queue_position, 0);
    assert_eq!(b.lane_queue_position, 0);

    app.start_workers();
    app.wait_for_status(&a.job_id, JobStatus::Done, WAIT).await;
    app.wait_for_status(&b.job_id, JobStatus::Done, WAIT).await;
}

#[tokio::test]
async fn saturated_lane_rejects_without_creating_a_job() {
    // Queue cap of 2; workers never start, so the lane stays full.
    let app = TestApp::with_config(MockGateway::scripted(vec![]), |config| {
        config.lane_max_queue = 2;
    });

    let mut job_ids = Vec::new();
    for i in 0..3 {
        let receipt = app
            .submit(teacher_request(
                "T1",
                "session_main",
                &format!("message {i}"),
                None,
            ))
            .await
            .unwrap();
        job_ids.push(receipt.job_id);
    }

    let err = app
        .submit(teacher_request("T1", "session_main", "one too many", None))
        .await
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::LaneSaturated);

    // The three accepted jobs are unaffected and no fourth record exists.
    for job_id in &job_ids {
        assert!(app.kernel.jobs.exists(job_id));
    }
    assert_eq!(app.kernel.jobs.scan_pending().len(), 3);
}

#[tokio::test]
async fn cancel_before_processing() {
    let mut app = TestApp::new(MockGateway::replies("unused", 1));

    let receipt = app
        .submit(teacher_request("T1", "session_main", "hi", None))
        .await
        .unwrap();
    app.kernel
        .jobs
        .set_status(&receipt.job_id, JobStatus::Cancelled)
        .unwrap();

    app.start_workers();
    let job = app
        .wait_for_status(&receipt.job_id, JobStatus::Cancelled, WAIT)
        .await;
    assert_eq!(job.status, JobStatus::Cancelled);

    // The worker appends the terminal event when it touches the job.
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let events = app.events(&receipt.job_id);
        if events
            .iter()
            .any(|e| e.event_type == EventType::JobCancelled)
        {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "job.cancelled never appeared: {events:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn failed_gateway_fails_the_job() {
    let mut app = TestApp::new(MockGateway::scripted(vec![Err(
        llm_client::LlmError::Api {
            status: 500,
            message: "backend down".to_string(),
        },
    )]));
    app.start_workers();

    let receipt = app
        .submit(teacher_request("T1", "session_main", "hi", None))
        .await
        .unwrap();
    let job = app
        .wait_for_status(&receipt.job_id, JobStatus::Failed, WAIT)
        .await;

    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::GatewayFailure);

    let events = app.events(&receipt.job_id);
    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::JobFailed)
        .unwrap();
    assert_eq!(failed.payload["error_kind"], "gateway_failure");
}

#[tokio::test]
async fn reply_is_mirrored_into_session_history() {
    let mut app = TestApp::new(MockGateway::replies("the answer", 1));
    app.start_workers();

    let receipt = app
        .submit(teacher_request("T1", "sess-42", "question?", None))
        .await
        .unwrap();
    app.wait_for_status(&receipt.job_id, JobStatus::Done, WAIT)
        .await;

    let messages = app.kernel.history.load_session(
        server_core::kernel::jobs::Role::Teacher,
        "T1",
        "sess-42",
    );
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[0].content, "question?");
    assert_eq!(messages[1].role, "assistant");
    assert_eq!(messages[1].content, "the answer");

    let index = app
        .kernel
        .history
        .load_index(server_core::kernel::jobs::Role::Teacher, "T1");
    assert_eq!(index.len(), 1);
    assert_eq!(index[0].message_count, 2);
    assert_eq!(index[0].preview, "the answer");
}

#[tokio::test]
async fn validation_errors() {
    let app = TestApp::new(MockGateway::scripted(vec![]));

    let mut bad_role = teacher_request("T1", "s", "hi", None);
    bad_role.role = "admin".to_string();
    assert_eq!(
        app.submit(bad_role).await.unwrap_err().kind,
        ErrorKind::Validation
    );

    let mut empty = teacher_request("T1", "s", "hi", None);
    empty.messages.clear();
    assert_eq!(
        app.submit(empty).await.unwrap_err().kind,
        ErrorKind::Validation
    );

    let mut bad_attachment = teacher_request("T1", "s", "hi", None);
    bad_attachment.attachment_ids = Some(vec!["../escape".to_string()]);
    assert_eq!(
        app.submit(bad_attachment).await.unwrap_err().kind,
        ErrorKind::Validation
    );
}
