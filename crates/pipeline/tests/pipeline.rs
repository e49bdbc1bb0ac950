#![forbid(unsafe_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use herald_core::{Event, NotificationStyle, Policy};
use herald_kubehub::EventDecoder;
use herald_notify::{Delivery, Notifier, NotifyError};
use herald_pipeline::{Pipeline, PipelineError, PipelineOptions, RunSummary, StreamState};

fn fixed_now() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

#[derive(Default)]
struct Recording {
    calls: Mutex<Vec<(String, Option<NotificationStyle>)>>,
}

impl Recording {
    fn calls(&self) -> Vec<(String, Option<NotificationStyle>)> { self.calls.lock().unwrap().clone() }
}

#[async_trait]
impl Notifier for Recording {
    fn name(&self) -> &'static str { "recording" }

    async fn notify(&self, event: &Event, style: Option<&NotificationStyle>) -> Result<Delivery, NotifyError> {
        self.calls.lock().unwrap().push((event.reason.clone(), style.cloned()));
        Ok(Delivery::default())
    }
}

struct Failing;

#[async_trait]
impl Notifier for Failing {
    fn name(&self) -> &'static str { "failing" }

    async fn notify(&self, _event: &Event, _style: Option<&NotificationStyle>) -> Result<Delivery, NotifyError> {
        Err(NotifyError::Api("invalid_auth".to_string()))
    }
}

fn record(kind: &str, reason: &str, count: u32, age_secs: i64) -> String {
    let last = fixed_now() - Duration::seconds(age_secs);
    serde_json::json!({
        "type": kind,
        "object": {
            "metadata": { "name": format!("obj.{}", reason.to_lowercase()), "namespace": "default" },
            "involvedObject": { "kind": "Node" },
            "source": { "component": "node-controller" },
            "reason": reason,
            "message": format!("{} observed", reason),
            "count": count,
            "firstTimestamp": last.to_rfc3339(),
            "lastTimestamp": last.to_rfc3339(),
        }
    })
    .to_string()
}

#[derive(Clone, Default)]
struct LogBuf(Arc<Mutex<Vec<u8>>>);

impl Write for LogBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}

impl LogBuf {
    fn contents(&self) -> String { String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned() }
}

fn capture_logs() -> (LogBuf, tracing::subscriber::DefaultGuard) {
    let buf = LogBuf::default();
    let writer = buf.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    (buf, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn notifies_then_fails_on_malformed_record() {
    let (logs, _guard) = capture_logs();
    let input = format!("{}\n{{not json\n{}\n", record("ADDED", "NodeOutOfDisk", 1, 0), record("ADDED", "NodeReady", 1, 0));
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions::default()).with_clock(fixed_now);

    let err = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap_err();

    assert_eq!(sink.calls(), vec![("NodeOutOfDisk".to_string(), Some(NotificationStyle::Danger))]);
    assert!(matches!(err, PipelineError::Decode(_)));
    assert_eq!(err.raw_record(), Some("{not json"));
    assert_eq!(pipeline.state(), StreamState::Failed);
    assert!(logs.contents().contains("raw={not json"), "{}", logs.contents());
}

#[tokio::test]
async fn skip_malformed_continues_with_next_record() {
    let input = format!("{{not json\n{}\n", record("ADDED", "NodeReady", 1, 0));
    let policy = Policy::default();
    let sink = Recording::default();
    let opts = PipelineOptions { skip_malformed: true };
    let mut pipeline = Pipeline::new(&policy, &sink, opts).with_clock(fixed_now);

    let summary = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap();

    assert_eq!(summary, RunSummary { records: 1, notified: 1, suppressed: 0, skipped_malformed: 1 });
    assert_eq!(sink.calls().len(), 1);
}

#[tokio::test]
async fn stale_event_is_logged_and_not_sent() {
    let (logs, _guard) = capture_logs();
    let input = record("ADDED", "NodeNotReady", 1, 90);
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions::default()).with_clock(fixed_now);

    let summary = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap();

    assert!(sink.calls().is_empty());
    assert_eq!(summary.suppressed, 1);
    let out = logs.contents();
    assert!(out.contains("suppressed stale event"), "{out}");
    assert!(out.contains("age_minutes=1"), "{out}");
}

#[tokio::test]
async fn end_of_stream_drains_cleanly_in_order() {
    let input = [
        record("ADDED", "SuccessfulCreate", 1, 0),
        record("MODIFIED", "SuccessfulCreate", 2, 0),
        record("ADDED", "Pulled", 1, 0),
        record("MODIFIED", "BackOff", 2, 5),
        record("MODIFIED", "BackOff", 3, 5),
        record("MODIFIED", "BackOff", 4, 5),
        record("DELETED", "NodeNotReady", 1, 10),
    ]
    .join("\n");
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions::default()).with_clock(fixed_now);

    let summary = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap();

    assert_eq!(
        sink.calls(),
        vec![
            ("SuccessfulCreate".to_string(), Some(NotificationStyle::Good)),
            ("BackOff".to_string(), Some(NotificationStyle::Danger)),
            ("NodeNotReady".to_string(), Some(NotificationStyle::Warning)),
        ]
    );
    assert_eq!(summary.records, 7);
    assert_eq!(summary.notified, 3);
    assert_eq!(summary.suppressed, 1);
    assert_eq!(pipeline.state(), StreamState::Draining);
}

#[tokio::test]
async fn bookmarks_are_not_events() {
    let input = format!(
        "{}\n{}\n",
        r#"{"type":"BOOKMARK","object":{"kind":"Event","apiVersion":"v1","metadata":{"resourceVersion":"12345"}}}"#,
        record("ADDED", "Pulled", 1, 600)
    );
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions::default()).with_clock(fixed_now);

    let summary = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap();

    assert!(sink.calls().is_empty());
    assert_eq!(summary, RunSummary { records: 1, notified: 0, suppressed: 0, skipped_malformed: 0 });
}

#[tokio::test]
async fn notifier_failure_is_fatal() {
    let input = format!("{}\n{}\n", record("ADDED", "NodeReady", 1, 0), record("ADDED", "NodeReady", 1, 0));
    let policy = Policy::default();
    let mut pipeline = Pipeline::new(&policy, &Failing, PipelineOptions::default()).with_clock(fixed_now);

    let err = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap_err();

    match err {
        PipelineError::Notify { sink, source: NotifyError::Api(code) } => {
            assert_eq!(sink, "failing");
            assert_eq!(code, "invalid_auth");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(pipeline.state(), StreamState::Failed);
}

#[tokio::test]
async fn upstream_status_is_fatal() {
    let input = r#"{"type":"ERROR","object":{"kind":"Status","code":410,"reason":"Expired","message":"too old resource version"}}"#;
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions { skip_malformed: true }).with_clock(fixed_now);

    let err = pipeline.run(EventDecoder::new(input.as_bytes()).into_stream()).await.unwrap_err();
    assert!(err.to_string().contains("410"), "{err}");
    assert!(err.raw_record().is_none());
}

#[tokio::test]
async fn connection_failure_is_fatal() {
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions::default());

    let connect = async { Err::<&[u8], _>(anyhow::anyhow!("connection refused")) };
    let err = pipeline.connect_and_run(connect).await.unwrap_err();

    assert!(matches!(err, PipelineError::Connect(ref m) if m.contains("connection refused")));
    assert_eq!(pipeline.state(), StreamState::Failed);
    assert!(sink.calls().is_empty());
}

#[tokio::test]
async fn connect_and_run_streams_from_reader() {
    let input = record("ADDED", "NodeReady", 1, 0);
    let policy = Policy::default();
    let sink = Recording::default();
    let mut pipeline = Pipeline::new(&policy, &sink, PipelineOptions::default()).with_clock(fixed_now);

    let bytes = input.into_bytes();
    let summary = pipeline.connect_and_run(async { Ok(&bytes[..]) }).await.unwrap();
    assert_eq!(summary.notified, 1);
}
