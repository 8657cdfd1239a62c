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

use std::{
    collections::VecDeque,
    future,
    sync::Arc,
};

use futures::{StreamExt, stream};
use log::debug;
use serde_json::json;

use super::{Datasource, ResponseStream};
use crate::{
    error::DatasourceError,
    frame::{DataFrame, DataQueryResponse, FrameData, LogRow, Sample},
    query::{DataQueryRequest, LokiQuery, filter_query},
    transport::ChannelAddress,
};

const DEFAULT_STREAM_BUFFER: usize = 1000;

/// Channel key for a stream query: the hex encoded JSON of the expression
/// and max lines, identical across processes and builds.
pub fn live_stream_key(query: &LokiQuery) -> String {
    json!({"expr": query.expr, "maxLines": query.max_lines})
        .to_string()
        .bytes()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Accumulates channel frames for one query: logs keep the newest
/// `max_length` rows, series keep samples within `max_delta_ms` of the newest.
struct RollingFrame {
    max_length: usize,
    max_delta_ms: i64,
    current: Option<DataFrame>,
}

impl RollingFrame {
    fn new(max_length: usize, max_delta_ms: i64) -> Self {
        Self {
            max_length: max_length.max(1),
            max_delta_ms,
            current: None,
        }
    }

    fn push(&mut self, frame: DataFrame) -> DataFrame {
        let merged = match self.current.take() {
            Some(mut current) => {
                match (&mut current.data, frame.data) {
                    (FrameData::Logs { rows }, FrameData::Logs { rows: more }) => {
                        *rows = self.trim_rows(rows.drain(..).chain(more).collect());
                    }
                    (
                        FrameData::Series { samples, .. },
                        FrameData::Series { samples: more, .. },
                    ) => {
                        samples.extend(more);
                        *samples = self.trim_samples(std::mem::take(samples));
                    }
                    (_, data) => {
                        current.data = data;
                    }
                }
                current
            }
            None => {
                let mut frame = frame;
                match &mut frame.data {
                    FrameData::Logs { rows } => *rows = self.trim_rows(std::mem::take(rows)),
                    FrameData::Series { samples, .. } => {
                        *samples = self.trim_samples(std::mem::take(samples))
                    }
                }
                frame
            }
        };
        self.current = Some(merged.clone());
        merged
    }

    fn trim_rows(&self, rows: Vec<LogRow>) -> Vec<LogRow> {
        let mut rows: VecDeque<LogRow> = rows.into();
        while rows.len() > self.max_length {
            rows.pop_front();
        }
        rows.into()
    }

    fn trim_samples(&self, samples: Vec<Sample>) -> Vec<Sample> {
        let Some(newest) = samples.iter().map(|sample| sample.timestamp_ms).max() else {
            return samples;
        };
        samples
            .into_iter()
            .filter(|sample| newest - sample.timestamp_ms <= self.max_delta_ms)
            .collect()
    }
}

fn query_stream(ds: &Datasource, query: LokiQuery, max_delta_ms: i64) -> ResponseStream {
    let address = ChannelAddress::datasource(
        ds.config.settings.uid.clone(),
        format!("tail/{}", live_stream_key(&query)),
    );
    let max_length = if ds.is_logs_query(&query.expr) {
        query
            .max_lines
            .and_then(|lines| usize::try_from(lines).ok())
            .unwrap_or(DEFAULT_STREAM_BUFFER)
    } else {
        DEFAULT_STREAM_BUFFER
    };
    let transport = Arc::clone(&ds.transport);
    let ds = ds.clone();
    stream::once(async move {
        debug!("subscribing to {address} for query {}", query.ref_id);
        match transport.subscribe_channel(&address, &query).await {
            Ok(frames) => {
                let mut rolling = RollingFrame::new(max_length, max_delta_ms);
                let targets = vec![query.clone()];
                frames
                    .scan(false, move |failed, item| {
                        if *failed {
                            return future::ready(None);
                        }
                        future::ready(Some(match item {
                            Ok(frame) => {
                                let frame = rolling.push(DataFrame {
                                    ref_id: query.ref_id.clone(),
                                    ..frame
                                });
                                let response = DataQueryResponse::streaming(
                                    vec![frame],
                                    Some(query.ref_id.clone()),
                                );
                                Ok(ds.transform(response, &targets))
                            }
                            Err(err) => {
                                *failed = true;
                                Err(DatasourceError::from(err))
                            }
                        }))
                    })
                    .boxed()
            }
            Err(err) => stream::once(async move { Err(DatasourceError::from(err)) }).boxed(),
        }
    })
    .flatten()
    .boxed()
}

/// One channel subscription per visible query, merged into a single stream.
pub(crate) fn run_stream_queries(ds: &Datasource, request: DataQueryRequest) -> ResponseStream {
    let max_delta_ms = request.range.duration_ms() + 1000;
    let streams: Vec<ResponseStream> = request
        .targets
        .iter()
        .filter(|query| filter_query(query))
        .map(|query| {
            let applied = ds.apply_template_variables(query, &request.scoped_vars);
            query_stream(ds, applied, max_delta_ms)
        })
        .collect();
    if streams.is_empty() {
        return stream::once(async { Ok(DataQueryResponse::done(Vec::new())) }).boxed();
    }
    stream::select_all(streams).boxed()
}
