//! Herald pipeline: one task pulling watch records, running the policy and
//! handing eligible events to the notifier, strictly in arrival order.

#![forbid(unsafe_code)]

use std::future::Future;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use herald_core::{Cause, Policy, WatchEventType};
use herald_kubehub::{DecodeError, DecodedRecord, EventDecoder};
use herald_notify::{Notifier, NotifyError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufRead;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    /// Upstream closed the stream; clean exit.
    Draining,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("connecting to events watch: {0}")]
    Connect(String),
    #[error("decoding watch stream: {0}")]
    Decode(#[from] DecodeError),
    #[error("delivering via {sink}: {source}")]
    Notify {
        sink: &'static str,
        #[source]
        source: NotifyError,
    },
}

impl PipelineError {
    /// Offending bytes when the failure was a malformed record.
    pub fn raw_record(&self) -> Option<&str> {
        match self {
            Self::Decode(e) => e.raw(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Log and drop a malformed record instead of failing the watch.
    pub skip_malformed: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSummary {
    pub records: u64,
    pub notified: u64,
    pub suppressed: u64,
    pub skipped_malformed: u64,
}

pub struct Pipeline<'a, N: Notifier + ?Sized> {
    policy: &'a Policy,
    notifier: &'a N,
    opts: PipelineOptions,
    clock: fn() -> DateTime<Utc>,
    state: StreamState,
}

impl<'a, N: Notifier + ?Sized> Pipeline<'a, N> {
    pub fn new(policy: &'a Policy, notifier: &'a N, opts: PipelineOptions) -> Self {
        Self { policy, notifier, opts, clock: Utc::now, state: StreamState::Idle }
    }

    /// Replace the wall clock used for staleness.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> StreamState { self.state }

    fn transition(&mut self, to: StreamState) {
        debug!(from = ?self.state, to = ?to, "pipeline state");
        self.state = to;
    }

    /// Open the connection, then stream until end-of-stream or the first fatal error.
    pub async fn connect_and_run<F, R>(&mut self, connect: F) -> Result<RunSummary, PipelineError>
    where
        F: Future<Output = anyhow::Result<R>>,
        R: AsyncBufRead + Unpin,
    {
        self.transition(StreamState::Connecting);
        let reader = match connect.await {
            Ok(r) => r,
            Err(e) => {
                self.transition(StreamState::Failed);
                error!(error = %format!("{:#}", e), "events watch connection failed");
                return Err(PipelineError::Connect(format!("{:#}", e)));
            }
        };
        self.run(EventDecoder::new(reader).into_stream()).await
    }

    /// Consume decoded records until the stream ends (`Ok`) or a fatal error (`Err`).
    pub async fn run<S>(&mut self, records: S) -> Result<RunSummary, PipelineError>
    where
        S: Stream<Item = Result<DecodedRecord, DecodeError>>,
    {
        self.transition(StreamState::Streaming);
        let mut summary = RunSummary::default();
        futures::pin_mut!(records);
        while let Some(next) = records.next().await {
            let rec = match next {
                Ok(rec) => rec,
                Err(e) if e.is_malformed() => {
                    error!(raw = %e.raw().unwrap_or_default(), error = %e, "malformed watch record");
                    counter!("herald_malformed_total", 1u64);
                    if self.opts.skip_malformed {
                        warn!("skipping malformed record");
                        summary.skipped_malformed += 1;
                        continue;
                    }
                    self.transition(StreamState::Failed);
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "watch stream failed");
                    self.transition(StreamState::Failed);
                    return Err(e.into());
                }
            };
            if rec.kind == WatchEventType::Bookmark {
                debug!(line = rec.line, "skipping watch bookmark");
                continue;
            }
            summary.records += 1;
            if let Err(e) = self.handle(rec, &mut summary).await {
                self.transition(StreamState::Failed);
                return Err(e);
            }
        }
        self.transition(StreamState::Draining);
        info!(records = summary.records, notified = summary.notified, suppressed = summary.suppressed, "watch stream ended (EOF)");
        Ok(summary)
    }

    async fn handle(&self, rec: DecodedRecord, summary: &mut RunSummary) -> Result<(), PipelineError> {
        let e = &rec.event;
        info!(
            kind = %rec.kind,
            reason = %e.reason,
            message = %e.message,
            count = e.count,
            first_timestamp = %e.first_timestamp,
            last_timestamp = %e.last_timestamp,
            "event"
        );
        counter!("herald_records_total", 1u64, "type" => rec.kind.as_str());

        let decision = self.policy.decide(e, (self.clock)());
        match decision.cause {
            Cause::Stale { age_secs } => {
                info!(age_minutes = age_secs / 60, age_secs, reason = %e.reason, message = %e.message, "suppressed stale event");
            }
            Cause::Repeat { count } => debug!(count, reason = %e.reason, "suppressed repeat event"),
            _ => {}
        }
        if !decision.notify {
            if !matches!(decision.cause, Cause::Unmatched) {
                summary.suppressed += 1;
                counter!("herald_suppressed_total", 1u64, "cause" => decision.cause.as_str());
            }
            return Ok(());
        }

        let started = Instant::now();
        let delivery = self
            .notifier
            .notify(e, decision.style.as_ref())
            .await
            .map_err(|source| {
                error!(sink = self.notifier.name(), reason = %e.reason, error = %source, "notification failed");
                PipelineError::Notify { sink: self.notifier.name(), source }
            })?;
        histogram!("herald_notify_ms", started.elapsed().as_secs_f64() * 1000.0);
        let style = decision.style.as_ref().map(|s| s.color().to_string()).unwrap_or_else(|| "none".to_string());
        counter!("herald_notifications_total", 1u64, "style" => style);
        debug!(channel = ?delivery.channel, ts = ?delivery.ts, cause = decision.cause.as_str(), "notified");
        summary.notified += 1;
        Ok(())
    }
}
