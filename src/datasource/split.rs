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

//! Range splitting: a long request is executed as consecutive chunks, newest
//! first, and every partial result is merged into what has been collected.

use std::{
    collections::{BTreeMap, VecDeque},
    time::Instant,
};

use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use log::debug;

use super::{Datasource, ResponseStream};
use crate::{
    error::DatasourceError,
    frame::{DataQueryResponse, LoadingState, merge_responses},
    logql::DurationValue,
    query::{DataQueryRequest, LokiQuery, TimeRange, filter_query},
};

/// Chunks of at most `ideal_ms`, built backwards from `end` so the newest
/// chunk is always full. Returned oldest first.
pub fn split_logs_time_range(start: i64, end: i64, ideal_ms: i64) -> Vec<(i64, i64)> {
    if ideal_ms <= 0 || end - start <= ideal_ms {
        return vec![(start, end)];
    }
    let mut chunks = Vec::new();
    let mut chunk_end = end;
    while chunk_end > start {
        let chunk_start = (chunk_end - ideal_ms).max(start);
        chunks.push((chunk_start, chunk_end));
        chunk_end = chunk_start;
    }
    chunks.reverse();
    chunks
}

/// Chunks aligned to `step`, so no evaluation point is computed twice.
pub fn split_metric_time_range(start: i64, end: i64, step: i64, ideal_ms: i64) -> Vec<(i64, i64)> {
    if step <= 0 || ideal_ms < step {
        return vec![(start, end)];
    }
    let aligned = (ideal_ms / step) * step;
    let mut chunks = Vec::new();
    let mut chunk_start = start - start.rem_euclid(step);
    while chunk_start <= end {
        chunks.push((chunk_start, (chunk_start + aligned - step).min(end)));
        chunk_start += aligned;
    }
    chunks
}

struct SplitStep {
    targets: Vec<LokiQuery>,
    range: TimeRange,
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>, DatasourceError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DatasourceError::InvalidRequest(format!("timestamp {ms} is out of range")))
}

fn chunk_range(start: i64, end: i64) -> Result<TimeRange, DatasourceError> {
    Ok(TimeRange::new(
        millis_to_datetime(start)?,
        millis_to_datetime(end)?,
    ))
}

fn query_step_ms(query: &LokiQuery, interval_ms: i64) -> i64 {
    query
        .step
        .as_deref()
        .and_then(|step| DurationValue::parse_literal(step).ok())
        .map(|step| step.as_millis())
        .filter(|step| *step > 0)
        .unwrap_or(interval_ms)
        .max(1)
}

/// Logs queries form one group; metric queries are grouped by step. Each
/// group contributes its chunks newest first.
fn plan_steps(
    ds: &Datasource,
    request: &DataQueryRequest,
    split_duration_ms: i64,
) -> Result<VecDeque<SplitStep>, DatasourceError> {
    let start = request.range.from.timestamp_millis();
    let end = request.range.to.timestamp_millis();
    let mut logs = Vec::new();
    let mut metrics: BTreeMap<i64, Vec<LokiQuery>> = BTreeMap::new();
    for query in request.targets.iter().filter(|query| filter_query(query)) {
        if ds.is_logs_query(&query.expr) {
            logs.push(query.clone());
        } else {
            metrics
                .entry(query_step_ms(query, request.interval_ms))
                .or_default()
                .push(query.clone());
        }
    }

    let mut groups = Vec::new();
    if !logs.is_empty() {
        groups.push((logs, split_logs_time_range(start, end, split_duration_ms)));
    }
    for (step, targets) in metrics {
        groups.push((
            targets,
            split_metric_time_range(start, end, step, split_duration_ms),
        ));
    }

    let mut steps = VecDeque::new();
    for (targets, chunks) in groups {
        for (chunk_start, chunk_end) in chunks.into_iter().rev() {
            steps.push_back(SplitStep {
                targets: targets.clone(),
                range: chunk_range(chunk_start, chunk_end)?,
            });
        }
    }
    Ok(steps)
}

struct SplitState {
    ds: Datasource,
    request: DataQueryRequest,
    steps: VecDeque<SplitStep>,
    merged: DataQueryResponse,
    started: Instant,
    issued: usize,
    finished: bool,
}

impl SplitState {
    /// Logs targets only ask for the rows still missing; targets that are
    /// already satisfied are dropped.
    fn remaining_targets(&self, targets: &[LokiQuery]) -> Vec<LokiQuery> {
        targets
            .iter()
            .filter_map(|target| {
                if !self.ds.is_logs_query(&target.expr) {
                    return Some(target.clone());
                }
                let limit = target.max_lines.unwrap_or(self.ds.max_lines);
                let collected = self.merged.log_rows_for(&target.ref_id) as u64;
                let remaining = limit.saturating_sub(collected);
                (remaining > 0).then(|| LokiQuery {
                    max_lines: Some(remaining),
                    ..target.clone()
                })
            })
            .collect()
    }

    fn snapshot(&self, state: LoadingState) -> DataQueryResponse {
        DataQueryResponse {
            state,
            ..self.merged.clone()
        }
    }

    fn finish(
        &mut self,
        result: Result<DataQueryResponse, DatasourceError>,
    ) -> Result<DataQueryResponse, DatasourceError> {
        self.finished = true;
        self.ds.track_query(&self.request, self.started, &result);
        result
    }

    async fn next_response(&mut self) -> Option<Result<DataQueryResponse, DatasourceError>> {
        if self.finished {
            return None;
        }
        while let Some(step) = self.steps.pop_front() {
            let targets = self.remaining_targets(&step.targets);
            if targets.is_empty() {
                continue;
            }
            self.issued += 1;
            let chunk = DataQueryRequest {
                request_id: format!("{}_{}", self.request.request_id, self.issued),
                range: step.range,
                ..self.request.with_targets(targets)
            };
            debug!(
                "running chunk {} of request {} ({} to {})",
                self.issued, self.request.request_id, chunk.range.from, chunk.range.to
            );
            match self.ds.run_query(chunk).await {
                Ok(partial) => {
                    merge_responses(&mut self.merged, partial);
                    if self.merged.error.is_some() {
                        let failed = self.snapshot(LoadingState::Error);
                        return Some(self.finish(Ok(failed)));
                    }
                    return Some(Ok(self.snapshot(LoadingState::Streaming)));
                }
                Err(err) => return Some(self.finish(Err(err))),
            }
        }
        let done = self.snapshot(LoadingState::Done);
        Some(self.finish(Ok(done)))
    }
}

/// Executes `request` chunk by chunk. Each merged partial is emitted as
/// `Streaming` and the last emission is `Done`.
pub(crate) fn run_split_query(
    ds: Datasource,
    request: DataQueryRequest,
    split_duration_ms: i64,
) -> ResponseStream {
    let steps = match plan_steps(&ds, &request, split_duration_ms) {
        Ok(steps) => steps,
        Err(err) => return stream::once(async move { Err(err) }).boxed(),
    };
    debug!(
        "splitting request {} into {} chunks",
        request.request_id,
        steps.len()
    );
    let state = SplitState {
        ds,
        request,
        steps,
        merged: DataQueryResponse::default(),
        started: Instant::now(),
        issued: 0,
        finished: false,
    };
    stream::unfold(state, |mut state| async move {
        let item = state.next_response().await?;
        Some((item, state))
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use chrono::Duration;
    use pretty_assertions::assert_eq;

    use super::{super::tests::*, *};
    use crate::{
        frame::{DataFrame, Sample},
        query::CoreApp,
        transport::{TransportError, mock::RecordingTransport},
    };

    const TWENTY_MINUTES: i64 = 20 * 60 * 1000;

    async fn collect(stream: ResponseStream) -> Vec<Result<DataQueryResponse, DatasourceError>> {
        stream.collect().await
    }

    fn states(items: &[Result<DataQueryResponse, DatasourceError>]) -> Vec<Option<LoadingState>> {
        items
            .iter()
            .map(|item| item.as_ref().ok().map(|response| response.state))
            .collect()
    }

    #[test]
    fn logs_chunks_are_built_backwards() {
        assert_eq!(
            split_logs_time_range(0, 100, 30),
            vec![(0, 10), (10, 40), (40, 70), (70, 100)]
        );
        assert_eq!(split_logs_time_range(0, 100, 200), vec![(0, 100)]);
    }

    #[test]
    fn metric_chunks_align_to_the_step() {
        assert_eq!(
            split_metric_time_range(5, 100, 10, 35),
            vec![(0, 20), (30, 50), (60, 80), (90, 100)]
        );
        assert_eq!(split_metric_time_range(0, 100, 50, 30), vec![(0, 100)]);
    }

    #[tokio::test]
    async fn emits_partials_newest_first_then_done() {
        let transport = Arc::new(echo_transport());
        let ds = datasource(transport.clone());
        let items = collect(run_split_query(
            ds,
            request(vec![LokiQuery::new("A", "{a=\"b\"}")]),
            TWENTY_MINUTES,
        ))
        .await;
        assert_eq!(
            states(&items),
            vec![
                Some(LoadingState::Streaming),
                Some(LoadingState::Streaming),
                Some(LoadingState::Streaming),
                Some(LoadingState::Done),
            ]
        );
        let last = items.last().unwrap().as_ref().unwrap();
        assert_eq!(last.log_rows_for("A"), 3);

        let sent = transport.queries.lock().clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].range.to, range().to);
        assert_eq!(sent[2].range.from, range().from);
        assert!(sent[0].range.from > sent[1].range.from);
        assert_eq!(
            sent.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
            vec!["req-1_1", "req-1_2", "req-1_3"]
        );
    }

    #[tokio::test]
    async fn logs_queries_stop_once_max_lines_are_collected() {
        let transport = Arc::new(echo_transport());
        let ds = datasource(transport.clone());
        let mut query = LokiQuery::new("A", "{a=\"b\"}");
        query.max_lines = Some(2);
        let items = collect(run_split_query(ds, request(vec![query]), TWENTY_MINUTES)).await;
        assert_eq!(
            states(&items),
            vec![
                Some(LoadingState::Streaming),
                Some(LoadingState::Streaming),
                Some(LoadingState::Done),
            ]
        );
        let sent = transport.queries.lock().clone();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].targets[0].max_lines, Some(2));
        assert_eq!(sent[1].targets[0].max_lines, Some(1));
    }

    #[tokio::test]
    async fn metric_series_merge_across_chunks() {
        let transport = Arc::new(RecordingTransport::with_query(|request| {
            Ok(DataQueryResponse::done(vec![DataFrame::series(
                "A",
                [("job".to_string(), "api".to_string())].into(),
                vec![Sample {
                    timestamp_ms: request.range.from.timestamp_millis(),
                    value: 1.0,
                }],
            )]))
        }));
        let ds = datasource(transport.clone());
        let mut query = LokiQuery::new("A", "rate({a=\"b\"}[1m])");
        query.step = Some("1m".into());
        let items = collect(run_split_query(ds, request(vec![query]), TWENTY_MINUTES)).await;
        let last = items.last().unwrap().as_ref().unwrap();
        assert_eq!(last.state, LoadingState::Done);
        assert_eq!(last.data.len(), 1);
        assert_eq!(last.data[0].len(), 4);

        let sent = transport.queries.lock().clone();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[1].range.to - sent[1].range.from, Duration::minutes(19));
    }

    #[tokio::test]
    async fn failed_chunk_ends_the_stream() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let transport = Arc::new(RecordingTransport::with_query(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 1 {
                return Err(TransportError::Connection("reset".into()));
            }
            Ok(DataQueryResponse::done(Vec::new()))
        }));
        let ds = datasource(transport);
        let items = collect(run_split_query(
            ds,
            request(vec![LokiQuery::new("A", "{a=\"b\"}")]),
            TWENTY_MINUTES,
        ))
        .await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(DatasourceError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn response_errors_stop_with_error_state() {
        let transport = Arc::new(RecordingTransport::with_query(|_| {
            Ok(DataQueryResponse {
                error: Some("too many outstanding requests".into()),
                ..DataQueryResponse::default()
            })
        }));
        let ds = datasource(transport.clone());
        let items = collect(run_split_query(
            ds,
            request(vec![LokiQuery::new("A", "{a=\"b\"}")]),
            TWENTY_MINUTES,
        ))
        .await;
        assert_eq!(states(&items), vec![Some(LoadingState::Error)]);
        assert_eq!(transport.query_count(), 1);
    }

    #[tokio::test]
    async fn query_dispatches_to_splitting_when_enabled() {
        let transport = Arc::new(echo_transport());
        let mut config = settings();
        config.features.query_splitting = true;
        config.split_duration = "20m".into();
        let ds = Datasource::new(config, transport.clone(), Default::default()).unwrap();
        let mut batch = request(vec![LokiQuery::new("A", "{a=\"b\"}")]);
        batch.app = CoreApp::Dashboard;
        let items = collect(ds.query(&batch).unwrap()).await;
        assert_eq!(items.len(), 4);
        assert_eq!(transport.query_count(), 3);
    }
}
