//! Decoder for the newline-framed JSON records of an events watch stream.

use chrono::{DateTime, Utc};
use futures::Stream;
use herald_core::{Event, WatchEventType};
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::trace;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The bytes did not parse into a watch record. `raw` holds the offending chunk.
    #[error("malformed record at line {line}: {source}")]
    Malformed {
        line: usize,
        raw: String,
        #[source]
        source: serde_json::Error,
    },
    /// The server put a `Status` object on the stream instead of an event.
    #[error("upstream status {code} ({reason}): {message}")]
    Upstream { code: u16, reason: String, message: String },
    #[error("reading watch stream: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Raw bytes of a malformed record, for diagnostics.
    pub fn raw(&self) -> Option<&str> {
        match self {
            Self::Malformed { raw, .. } => Some(raw.as_str()),
            _ => None,
        }
    }

    pub fn is_malformed(&self) -> bool { matches!(self, Self::Malformed { .. }) }
}

/// One decoded record in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub kind: WatchEventType,
    pub event: Event,
    /// 1-based line number within the stream.
    pub line: usize,
}

#[derive(Deserialize)]
struct WireRecord {
    #[serde(rename = "type")]
    kind: WatchEventType,
    object: serde_json::Value,
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct WireEvent {
    metadata: WireMeta,
    involved_object: WireInvolvedObject,
    source: WireSource,
    reason: Option<String>,
    message: Option<String>,
    count: Option<u32>,
    first_timestamp: Option<DateTime<Utc>>,
    last_timestamp: Option<DateTime<Utc>>,
    event_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireMeta {
    name: Option<String>,
    namespace: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireInvolvedObject {
    kind: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireSource {
    component: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct WireStatus {
    kind: Option<String>,
    code: Option<u16>,
    reason: Option<String>,
    message: Option<String>,
}

impl WireStatus {
    fn into_error(self) -> DecodeError {
        DecodeError::Upstream {
            code: self.code.unwrap_or(0),
            reason: self.reason.unwrap_or_default(),
            message: self.message.unwrap_or_default(),
        }
    }
}

impl From<WireEvent> for Event {
    fn from(w: WireEvent) -> Self {
        // Null lastTimestamp falls back to firstTimestamp, then eventTime, then the epoch
        // (which any staleness check treats as ancient).
        let last = w
            .last_timestamp
            .or(w.first_timestamp)
            .or(w.event_time)
            .unwrap_or_default();
        let first = w.first_timestamp.or(w.event_time).unwrap_or(last).min(last);
        Event {
            reason: w.reason.unwrap_or_default(),
            message: w.message.unwrap_or_default(),
            count: w.count.unwrap_or(0),
            first_timestamp: first,
            last_timestamp: last,
            involved_object_kind: w.involved_object.kind.unwrap_or_default(),
            name: w.metadata.name.unwrap_or_default(),
            namespace: w.metadata.namespace.filter(|ns| !ns.is_empty()),
            source_component: w.source.component.unwrap_or_default(),
        }
    }
}

/// Parse one framed record. Blank input is the caller's concern.
pub fn decode_record(bytes: &[u8], line: usize) -> Result<DecodedRecord, DecodeError> {
    let malformed = |source| DecodeError::Malformed { line, raw: String::from_utf8_lossy(bytes).into_owned(), source };

    let rec: WireRecord = match serde_json::from_slice(bytes) {
        Ok(r) => r,
        Err(e) => {
            // An error body (401, 403, ...) arrives in place of the stream as a bare Status.
            if let Ok(st) = serde_json::from_slice::<WireStatus>(bytes) {
                if st.kind.as_deref() == Some("Status") {
                    return Err(st.into_error());
                }
            }
            return Err(malformed(e));
        }
    };

    if rec.kind == WatchEventType::Error {
        let st: WireStatus = serde_json::from_value(rec.object).map_err(malformed)?;
        return Err(st.into_error());
    }

    let wire: WireEvent = serde_json::from_value(rec.object).map_err(malformed)?;
    Ok(DecodedRecord { kind: rec.kind, event: wire.into(), line })
}

/// Pulls records off a buffered byte stream, one line at a time.
pub struct EventDecoder<R> {
    reader: R,
    buf: Vec<u8>,
    line: usize,
}

impl<R: AsyncBufRead + Unpin> EventDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, buf: Vec::with_capacity(4096), line: 0 }
    }

    /// Next record, or `Ok(None)` once the upstream closed the stream.
    pub async fn next_record(&mut self) -> Result<Option<DecodedRecord>, DecodeError> {
        loop {
            self.buf.clear();
            let n = self.reader.read_until(b'\n', &mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.line += 1;
            let chunk = self.buf.trim_ascii();
            if chunk.is_empty() {
                continue;
            }
            trace!(line = self.line, bytes = chunk.len(), "record framed");
            return decode_record(chunk, self.line).map(Some);
        }
    }

    /// Lines consumed so far, blank ones included.
    pub fn lines_read(&self) -> usize { self.line }

    /// Adapt into a stream. It ends at end-of-stream; errors are yielded and the
    /// stream may be polled again after one.
    pub fn into_stream(self) -> impl Stream<Item = Result<DecodedRecord, DecodeError>> {
        futures::stream::unfold(self, |mut dec| async move {
            match dec.next_record().await {
                Ok(Some(rec)) => Some((Ok(rec), dec)),
                Ok(None) => None,
                Err(e) => Some((Err(e), dec)),
            }
        })
    }
}
