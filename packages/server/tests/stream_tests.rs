//! Streaming endpoint scenarios over real HTTP.

mod common;

use std::time::Duration;

use common::{teacher_request, TestApp};
use server_core::kernel::jobs::JobStatus;
use server_core::kernel::test_support::MockGateway;

const WAIT: Duration = Duration::from_secs(5);

fn frame_ids(body: &str) -> Vec<u64> {
    body.lines()
        .filter_map(|line| line.strip_prefix("id: "))
        .filter_map(|id| id.trim().parse().ok())
        .collect()
}

async fn finished_job(app: &mut TestApp) -> String {
    app.start_workers();
    let receipt = app
        .submit(teacher_request("T1", "session_main", "hi", None))
        .await
        .unwrap();
    app.wait_for_status(&receipt.job_id, JobStatus::Done, WAIT)
        .await;
    receipt.job_id
}

#[tokio::test]
async fn stream_replays_full_log_without_cursor() {
    let mut app = TestApp::new(MockGateway::replies("streamed", 1));
    let job_id = finished_job(&mut app).await;
    let base = app.spawn_http().await;

    let body = reqwest::get(format!(
        "{base}/chat/stream?job_id={job_id}&role=teacher&teacher_id=T1"
    ))
    .await
    .unwrap()
    .text()
    .await
    .unwrap();

    // Five lifecycle events, in order, plus the retry hint.
    assert_eq!(frame_ids(&body), vec![1, 2, 3, 4, 5]);
    assert!(body.contains("retry: 1000"));
    assert!(body.contains("event: job.done"));
    assert!(body.contains("\"event_version\":1"));
}

#[tokio::test]
async fn stream_resumes_from_header_cursor() {
    let mut app = TestApp::new(MockGateway::replies("streamed", 1));
    let job_id = finished_job(&mut app).await;
    let base = app.spawn_http().await;

    let client = reqwest::Client::new();
    let body = client
        .get(format!(
            "{base}/chat/stream?job_id={job_id}&role=teacher&teacher_id=T1"
        ))
        .header("Last-Event-ID", "3")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(frame_ids(&body), vec![4, 5]);
}

#[tokio::test]
async fn stream_query_cursor_takes_the_larger_value() {
    let mut app = TestApp::new(MockGateway::replies("streamed", 1));
    let job_id = finished_job(&mut app).await;
    let base = app.spawn_http().await;

    let client = reqwest::Client::new();
    let body = client
        .get(format!(
            "{base}/chat/stream?job_id={job_id}&last_event_id=4&role=teacher&teacher_id=T1"
        ))
        .header("Last-Event-ID", "2")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert_eq!(frame_ids(&body), vec![5]);
}

#[tokio::test]
async fn cursor_beyond_end_of_terminated_job_closes_promptly() {
    let mut app = TestApp::new(MockGateway::replies("streamed", 1));
    let job_id = finished_job(&mut app).await;
    let base = app.spawn_http().await;

    let started = std::time::Instant::now();
    let body = reqwest::get(format!(
        "{base}/chat/stream?job_id={job_id}&last_event_id=100&role=teacher&teacher_id=T1"
    ))
    .await
    .unwrap()
    .text()
    .await
    .unwrap();

    assert!(frame_ids(&body).is_empty());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn stream_rejects_foreign_caller() {
    let mut app = TestApp::new(MockGateway::replies("secret", 1));
    let job_id = finished_job(&mut app).await;
    let base = app.spawn_http().await;

    // Another teacher
    let response = reqwest::get(format!(
        "{base}/chat/stream?job_id={job_id}&role=teacher&teacher_id=T999"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 403);

    // Wrong role
    let response = reqwest::get(format!(
        "{base}/chat/stream?job_id={job_id}&role=student&student_id=T1"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 403);

    // Unknown job
    let response = reqwest::get(format!(
        "{base}/chat/stream?job_id=job_missing&role=teacher&teacher_id=T1"
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn live_stream_receives_events_as_they_happen() {
    let mut app = TestApp::new(MockGateway::replies("late reply", 1));
    let base = app.spawn_http().await;

    // Submit without workers: the stream attaches while the job is queued.
    let receipt = app
        .submit(teacher_request("T1", "session_main", "hi", None))
        .await
        .unwrap();
    let job_id = receipt.job_id.clone();

    let url =
        format!("{base}/chat/stream?job_id={job_id}&role=teacher&teacher_id=T1");
    let reader = tokio::spawn(async move {
        reqwest::get(url).await.unwrap().text().await.unwrap()
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    app.start_workers();
    app.wait_for_status(&job_id, JobStatus::Done, WAIT).await;

    let body = tokio::time::timeout(WAIT, reader).await.unwrap().unwrap();
    assert_eq!(frame_ids(&body), vec![1, 2, 3, 4, 5]);
    assert!(body.contains("event: assistant.done"));
}

#[tokio::test]
async fn events_endpoint_pages_with_offset() {
    let mut app = TestApp::new(MockGateway::replies("paged", 1));
    let job_id = finished_job(&mut app).await;
    let base = app.spawn_http().await;

    let client = reqwest::Client::new();
    let first: serde_json::Value = client
        .get(format!(
            "{base}/chat/events?job_id={job_id}&limit=2&role=teacher&teacher_id=T1"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let events = first["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    let next_offset = first["next_offset"].as_u64().unwrap();
    assert!(next_offset > 0);

    let second: serde_json::Value = client
        .get(format!(
            "{base}/chat/events?job_id={job_id}&after_event_id=2&offset={next_offset}&role=teacher&teacher_id=T1"
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rest = second["events"].as_array().unwrap();
    assert_eq!(rest.len(), 3);
    assert_eq!(rest[0]["event_id"], 3);
}

#[tokio::test]
async fn cancel_endpoint_closes_waiting_stream() {
    let mut app = TestApp::new(MockGateway::scripted(vec![]));
    let base = app.spawn_http().await;

    // Queued job, no workers: a stream attaches and waits.
    let receipt = app
        .submit(teacher_request("T1", "session_main", "hi", None))
        .await
        .unwrap();
    let job_id = receipt.job_id.clone();

    let url =
        format!("{base}/chat/stream?job_id={job_id}&role=teacher&teacher_id=T1");
    let reader = tokio::spawn(async move {
        reqwest::get(url).await.unwrap().text().await.unwrap()
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}/chat/cancel"))
        .json(&serde_json::json!({
            "job_id": job_id,
            "role": "teacher",
            "teacher_id": "T1",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The stream notices the terminal record and closes without a
    // terminal event (no worker ever touched the job).
    let body = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("stream did not close after cancel")
        .unwrap();
    assert_eq!(frame_ids(&body), vec![1]);
}
