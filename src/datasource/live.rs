// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared live tails. One upstream subscription per tail URL, fanned out to
//! every consumer and closed when the last consumer goes away.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use url::Url;

use crate::{
    error::DatasourceError,
    frame::{DataFrame, LogRow, streams_to_rows},
    query::LokiQuery,
    transport::Transport,
};

const LIVE_CHANNEL_CAPACITY: usize = 64;
const TAIL_PATH: &str = "loki/api/v1/tail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveTarget {
    pub query: String,
    pub url: Url,
    pub ref_id: String,
    /// Rows kept in the rolling frame.
    pub size: usize,
}

impl LiveTarget {
    /// Tail target for `query` against the datasource base URL, using the
    /// websocket flavour of its scheme.
    pub fn new(base_url: &str, query: &LokiQuery, size: u64) -> Result<Self, DatasourceError> {
        let raw = format!("{}/{TAIL_PATH}", base_url.trim_end_matches('/'));
        let mut url = Url::parse(&raw).map_err(|err| {
            DatasourceError::Config(format!("invalid datasource url {base_url}: {err}"))
        })?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        url.set_scheme(scheme).map_err(|_| {
            DatasourceError::Config(format!("cannot tail datasource url {base_url}"))
        })?;
        url.query_pairs_mut().append_pair("query", &query.expr);
        Ok(Self {
            query: query.expr.clone(),
            url,
            ref_id: query.ref_id.clone(),
            size: usize::try_from(size).unwrap_or(usize::MAX).max(1),
        })
    }

    /// Tails are shared per URL (base plus query). `size` is not part of the
    /// key, so later consumers get the rolling size of the first one.
    fn key(&self) -> String {
        self.url.to_string()
    }
}

#[derive(Debug, Clone)]
enum LiveEvent {
    Frame(DataFrame),
    Failed(String),
    Closed,
}

struct LiveEntry {
    id: u64,
    sender: broadcast::Sender<LiveEvent>,
    task: Option<JoinHandle<()>>,
    consumers: usize,
    latest: Option<DataFrame>,
}

#[derive(Default)]
struct Registry {
    entries: Mutex<HashMap<String, LiveEntry>>,
    next_id: AtomicU64,
}

/// Registry of live tails keyed by tail URL.
///
/// The upstream task runs with the `size` of the subscriber that opened it;
/// consumers joining later share that rolling frame whatever size they ask
/// for. Frames are re-labelled with each consumer's own `ref_id`.
#[derive(Clone, Default)]
pub struct LiveStreams {
    inner: Arc<Registry>,
}

impl LiveStreams {
    /// Number of tails with an open upstream subscription.
    pub fn active_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Consumer stream for `target`. Registration happens on first poll, so
    /// the stream can be created outside the runtime.
    pub fn get_stream(
        &self,
        transport: Arc<dyn Transport>,
        target: LiveTarget,
    ) -> BoxStream<'static, Result<DataFrame, DatasourceError>> {
        let streams = self.clone();
        stream::once(async move { streams.subscribe(transport, target) })
            .flatten()
            .boxed()
    }

    fn subscribe(
        &self,
        transport: Arc<dyn Transport>,
        target: LiveTarget,
    ) -> BoxStream<'static, Result<DataFrame, DatasourceError>> {
        let key = target.key();
        let ref_id = target.ref_id.clone();
        let (receiver, snapshot, id) = {
            let mut entries = self.inner.entries.lock();
            match entries.get_mut(&key) {
                Some(entry) => {
                    entry.consumers += 1;
                    debug!("reusing live tail {key} ({} consumers)", entry.consumers);
                    (entry.sender.subscribe(), entry.latest.clone(), entry.id)
                }
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let (sender, receiver) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
                    info!("opening live tail {key}");
                    let task = tokio::spawn(run_upstream(self.clone(), transport, target, id));
                    entries.insert(
                        key.clone(),
                        LiveEntry {
                            id,
                            sender,
                            task: Some(task),
                            consumers: 1,
                            latest: None,
                        },
                    );
                    (receiver, None, id)
                }
            }
        };

        let guard = LiveSubscription {
            streams: self.clone(),
            key,
            id,
        };
        let snapshot = stream::iter(snapshot.map(LiveEvent::Frame));
        let updates = BroadcastStream::new(receiver).filter_map(|event| {
            future::ready(match event {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!("live consumer lagged behind by {skipped} updates");
                    None
                }
            })
        });
        snapshot
            .chain(updates)
            .scan(false, |failed, event| {
                if *failed {
                    return future::ready(None);
                }
                future::ready(match event {
                    LiveEvent::Frame(frame) => Some(Ok(frame)),
                    LiveEvent::Failed(reason) => {
                        *failed = true;
                        Some(Err(DatasourceError::LiveTail(reason)))
                    }
                    LiveEvent::Closed => None,
                })
            })
            .map(move |item| {
                let _ = &guard;
                item.map(|mut frame| {
                    frame.ref_id = ref_id.clone();
                    frame
                })
            })
            .boxed()
    }

    fn publish(&self, key: &str, id: u64, frame: DataFrame) {
        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(key).filter(|entry| entry.id == id) {
            entry.latest = Some(frame.clone());
            let _ = entry.sender.send(LiveEvent::Frame(frame));
        }
    }

    /// Ends every consumer of the tail and forgets it.
    fn finish(&self, key: &str, id: u64, event: LiveEvent) {
        let mut entries = self.inner.entries.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id)
            && let Some(entry) = entries.remove(key)
        {
            let _ = entry.sender.send(event);
        }
    }

    fn release(&self, key: &str, id: u64) {
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(key).filter(|entry| entry.id == id) else {
            return;
        };
        entry.consumers = entry.consumers.saturating_sub(1);
        if entry.consumers > 0 {
            return;
        }
        if let Some(mut entry) = entries.remove(key) {
            info!("closing live tail {key}");
            if let Some(task) = entry.task.take() {
                task.abort();
            }
        }
    }
}

/// Detaches one consumer when its stream is dropped.
struct LiveSubscription {
    streams: LiveStreams,
    key: String,
    id: u64,
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.streams.release(&self.key, self.id);
    }
}

async fn run_upstream(
    streams: LiveStreams,
    transport: Arc<dyn Transport>,
    target: LiveTarget,
    id: u64,
) {
    let key = target.key();
    let mut upstream = match transport.open_stream(&target.url).await {
        Ok(upstream) => upstream,
        Err(err) => {
            warn!("live tail {key} failed to open: {err}");
            streams.finish(&key, id, LiveEvent::Failed(err.reason()));
            return;
        }
    };
    let mut cursor = TailCursor::default();
    let mut rows: VecDeque<LogRow> = VecDeque::new();
    while let Some(message) = upstream.next().await {
        let payload = match message {
            Ok(payload) => payload,
            Err(err) => {
                warn!("live tail {key} stopped: {err}");
                streams.finish(&key, id, LiveEvent::Failed(err.reason()));
                return;
            }
        };
        if !payload.dropped_entries.is_empty() {
            debug!(
                "live tail {key} dropped {} entries upstream",
                payload.dropped_entries.len()
            );
        }
        let accepted = match streams_to_rows(payload.streams)
            .and_then(|fresh| filter_tail_rows(&mut cursor, fresh))
        {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("live tail {key} sent an unreadable payload: {err}");
                streams.finish(&key, id, LiveEvent::Failed(err.to_string()));
                return;
            }
        };
        if accepted.is_empty() {
            continue;
        }
        rows.extend(accepted);
        while rows.len() > target.size {
            rows.pop_front();
        }
        let frame = DataFrame::logs(target.ref_id.clone(), rows.iter().cloned().collect());
        streams.publish(&key, id, frame);
    }
    debug!("live tail {key} closed upstream");
    streams.finish(&key, id, LiveEvent::Closed);
}

fn filter_tail_rows(
    cursor: &mut TailCursor,
    rows: Vec<LogRow>,
) -> Result<Vec<LogRow>, DatasourceError> {
    let mut accepted = Vec::new();
    for row in rows {
        let fingerprint = row_fingerprint(&row)?;
        if cursor.accept(row.timestamp_ns, fingerprint) {
            accepted.push(row);
        }
    }
    Ok(accepted)
}

fn row_fingerprint(row: &LogRow) -> Result<String, DatasourceError> {
    let labels = serde_json::to_string(&row.labels)?;
    Ok(format!("{}:{labels}:{}", row.timestamp_ns, row.line))
}

/// Drops rows older than the newest timestamp seen, and repeats at that timestamp.
#[derive(Default)]
struct TailCursor {
    last_timestamp_ns: Option<i64>,
    last_fingerprints: HashSet<String>,
}

impl TailCursor {
    fn accept(&mut self, ts: i64, fingerprint: String) -> bool {
        match self.last_timestamp_ns {
            Some(last) if ts < last => return false,
            Some(last) if ts == last => {}
            _ => {
                self.last_timestamp_ns = Some(ts);
                self.last_fingerprints.clear();
            }
        }
        self.last_fingerprints.insert(fingerprint)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::atomic::Ordering, time::Duration};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        frame::{FrameData, LokiStream, TailResponse},
        transport::{TransportError, mock::RecordingTransport},
    };

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn target(size: u64) -> LiveTarget {
        LiveTarget::new(
            "https://loki.example/",
            &LokiQuery::new("A", "{job=\"api\"}"),
            size,
        )
        .unwrap()
    }

    fn payload(entries: &[(&str, &str)]) -> TailResponse {
        TailResponse {
            streams: vec![LokiStream {
                stream: [("job".to_string(), "api".to_string())].into(),
                values: entries
                    .iter()
                    .map(|(ts, line)| [ts.to_string(), line.to_string()])
                    .collect(),
            }],
            dropped_entries: Vec::new(),
        }
    }

    fn lines(frame: &DataFrame) -> Vec<String> {
        match &frame.data {
            FrameData::Logs { rows } => rows.iter().map(|row| row.line.clone()).collect(),
            FrameData::Series { .. } => Vec::new(),
        }
    }

    #[test]
    fn builds_websocket_tail_url() {
        let target = target(10);
        assert_eq!(target.url.scheme(), "wss");
        assert_eq!(target.url.path(), "/loki/api/v1/tail");
        assert_eq!(
            target.url.query_pairs().next().map(|(k, v)| (k.into_owned(), v.into_owned())),
            Some(("query".to_string(), "{job=\"api\"}".to_string()))
        );
        let plain = LiveTarget::new("http://localhost:3100", &LokiQuery::new("A", "{a=\"b\"}"), 0)
            .unwrap();
        assert_eq!(plain.url.scheme(), "ws");
        assert_eq!(plain.size, 1);
    }

    #[test]
    fn tail_cursor_skips_repeats_and_older_rows() {
        let mut cursor = TailCursor::default();
        assert!(cursor.accept(10, "a".into()));
        assert!(cursor.accept(10, "b".into()));
        assert!(!cursor.accept(10, "a".into()));
        assert!(!cursor.accept(5, "c".into()));
        assert!(cursor.accept(11, "a".into()));
    }

    #[tokio::test]
    async fn two_consumers_share_one_upstream() {
        let transport = Arc::new(RecordingTransport::default());
        let streams = LiveStreams::default();
        let mut first = streams.get_stream(transport.clone(), target(2));
        let mut second = streams.get_stream(transport.clone(), target(2));

        let pending = tokio::time::timeout(Duration::from_millis(20), first.next()).await;
        assert!(pending.is_err());
        let pending = tokio::time::timeout(Duration::from_millis(20), second.next()).await;
        assert!(pending.is_err());
        wait_until(|| transport.open_count() == 1).await;
        assert_eq!(streams.active_count(), 1);

        transport.push_tail(0, Ok(payload(&[("1", "one"), ("2", "two"), ("3", "three")])));
        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_eq!(lines(&a), vec!["two", "three"]);
        assert_eq!(a, b);

        drop(first);
        assert_eq!(streams.active_count(), 1);
        drop(second);
        assert_eq!(streams.active_count(), 0);
        wait_until(|| transport.dropped_tails.load(Ordering::SeqCst) == 1).await;
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn later_consumers_share_the_first_rolling_size() {
        let transport = Arc::new(RecordingTransport::default());
        let streams = LiveStreams::default();
        let mut first = streams.get_stream(transport.clone(), target(2));
        let wide = LiveTarget::new(
            "https://loki.example/",
            &LokiQuery::new("B", "{job=\"api\"}"),
            10,
        )
        .unwrap();
        let mut second = streams.get_stream(transport.clone(), wide);

        let pending = tokio::time::timeout(Duration::from_millis(20), first.next()).await;
        assert!(pending.is_err());
        let pending = tokio::time::timeout(Duration::from_millis(20), second.next()).await;
        assert!(pending.is_err());
        wait_until(|| transport.open_count() == 1).await;
        assert_eq!(streams.active_count(), 1);

        transport.push_tail(0, Ok(payload(&[("1", "one"), ("2", "two"), ("3", "three")])));
        let a = first.next().await.unwrap().unwrap();
        let b = second.next().await.unwrap().unwrap();
        assert_eq!(lines(&b), vec!["two", "three"]);
        assert_eq!(a.ref_id, "A");
        assert_eq!(b.ref_id, "B");
    }

    #[tokio::test]
    async fn upstream_failure_ends_every_consumer() {
        let transport = Arc::new(RecordingTransport::default());
        let streams = LiveStreams::default();
        let mut consumer = streams.get_stream(transport.clone(), target(10));
        let pending = tokio::time::timeout(Duration::from_millis(20), consumer.next()).await;
        assert!(pending.is_err());
        wait_until(|| transport.open_count() == 1).await;

        transport.push_tail(0, Err(TransportError::Closed("socket reset".into())));
        let err = consumer.next().await.unwrap().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Live tailing was stopped due to following error: socket reset"
        );
        assert!(consumer.next().await.is_none());
        assert_eq!(streams.active_count(), 0);
    }
}
