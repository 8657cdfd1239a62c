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

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::DatasourceError;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingState {
    #[default]
    Done,
    Streaming,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Critical,
    Error,
    Warning,
    Info,
    Debug,
    Trace,
    #[default]
    Unknown,
}

impl LogLevel {
    pub fn from_key(key: &str) -> Self {
        match key.to_ascii_lowercase().as_str() {
            "critical" | "crit" | "fatal" | "emerg" | "alert" => LogLevel::Critical,
            "error" | "err" | "eror" => LogLevel::Error,
            "warning" | "warn" => LogLevel::Warning,
            "info" | "information" | "informational" | "notice" => LogLevel::Info,
            "debug" | "dbug" => LogLevel::Debug,
            "trace" => LogLevel::Trace,
            _ => LogLevel::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visualisation {
    Logs,
    Graph,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_visualisation: Option<Visualisation>,
    /// Set on volume frames once the level has been extracted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_query: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRow {
    pub timestamp_ns: i64,
    pub line: String,
    #[serde(default)]
    pub labels: Labels,
    /// Resolved derived-field values keyed by field name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derived: BTreeMap<String, DerivedValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedValue {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FrameData {
    Logs { rows: Vec<LogRow> },
    Series { labels: Labels, samples: Vec<Sample> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFrame {
    pub ref_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub meta: FrameMeta,
    pub data: FrameData,
}

impl DataFrame {
    pub fn logs(ref_id: impl Into<String>, rows: Vec<LogRow>) -> Self {
        Self {
            ref_id: ref_id.into(),
            name: None,
            meta: FrameMeta {
                preferred_visualisation: Some(Visualisation::Logs),
                ..FrameMeta::default()
            },
            data: FrameData::Logs { rows },
        }
    }

    pub fn series(ref_id: impl Into<String>, labels: Labels, samples: Vec<Sample>) -> Self {
        Self {
            ref_id: ref_id.into(),
            name: None,
            meta: FrameMeta {
                preferred_visualisation: Some(Visualisation::Graph),
                ..FrameMeta::default()
            },
            data: FrameData::Series { labels, samples },
        }
    }

    pub fn is_logs(&self) -> bool {
        matches!(self.data, FrameData::Logs { .. })
    }

    /// Number of log rows, or samples for a series frame.
    pub fn len(&self) -> usize {
        match &self.data {
            FrameData::Logs { rows } => rows.len(),
            FrameData::Series { samples, .. } => samples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQueryResponse {
    pub data: Vec<DataFrame>,
    pub state: LoadingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DataQueryResponse {
    pub fn done(data: Vec<DataFrame>) -> Self {
        Self {
            data,
            state: LoadingState::Done,
            ..Self::default()
        }
    }

    pub fn streaming(data: Vec<DataFrame>, key: Option<String>) -> Self {
        Self {
            data,
            state: LoadingState::Streaming,
            key,
            error: None,
        }
    }

    /// Log rows collected for `ref_id` across all logs frames.
    pub fn log_rows_for(&self, ref_id: &str) -> usize {
        self.data
            .iter()
            .filter(|frame| frame.ref_id == ref_id && frame.is_logs())
            .map(DataFrame::len)
            .sum()
    }
}

/// Folds a partial response into the accumulated one. Logs frames of the same
/// refId are concatenated and series frames are merged by label set, with
/// samples from `partial` replacing accumulated samples at equal timestamps.
pub fn merge_responses(acc: &mut DataQueryResponse, partial: DataQueryResponse) {
    for frame in partial.data {
        merge_frame(&mut acc.data, frame);
    }
    if partial.error.is_some() {
        acc.error = partial.error;
    }
}

fn merge_frame(frames: &mut Vec<DataFrame>, frame: DataFrame) {
    let existing = frames.iter_mut().find(|candidate| {
        candidate.ref_id == frame.ref_id
            && match (&candidate.data, &frame.data) {
                (FrameData::Logs { .. }, FrameData::Logs { .. }) => true,
                (
                    FrameData::Series { labels: left, .. },
                    FrameData::Series { labels: right, .. },
                ) => left == right,
                _ => false,
            }
    });
    let Some(existing) = existing else {
        frames.push(frame);
        return;
    };
    match (&mut existing.data, frame.data) {
        (FrameData::Logs { rows }, FrameData::Logs { rows: more }) => rows.extend(more),
        (FrameData::Series { samples, .. }, FrameData::Series { samples: more, .. }) => {
            let mut by_time: BTreeMap<i64, f64> = samples
                .iter()
                .map(|sample| (sample.timestamp_ms, sample.value))
                .collect();
            for sample in more {
                by_time.insert(sample.timestamp_ms, sample.value);
            }
            *samples = by_time
                .into_iter()
                .map(|(timestamp_ms, value)| Sample {
                    timestamp_ms,
                    value,
                })
                .collect();
        }
        _ => {}
    }
}

/// One stream of the Loki push/tail payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LokiStream {
    pub stream: Labels,
    pub values: Vec<[String; 2]>,
}

impl LokiStream {
    pub fn into_rows(self) -> Result<Vec<LogRow>, DatasourceError> {
        let mut rows = Vec::with_capacity(self.values.len());
        for [ts, line] in self.values {
            let timestamp_ns = ts.parse::<i64>().map_err(|err| {
                DatasourceError::InvalidResponse(format!("invalid stream timestamp {ts}: {err}"))
            })?;
            rows.push(LogRow {
                timestamp_ns,
                line,
                labels: self.stream.clone(),
                derived: BTreeMap::new(),
            });
        }
        Ok(rows)
    }
}

/// Payload of one live-tail message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailResponse {
    #[serde(default)]
    pub streams: Vec<LokiStream>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dropped_entries: Vec<DroppedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedEntry {
    pub labels: Labels,
    pub timestamp: String,
}

/// Flattens tail streams into rows ordered by timestamp, oldest first.
pub fn streams_to_rows(streams: Vec<LokiStream>) -> Result<Vec<LogRow>, DatasourceError> {
    let mut rows = Vec::new();
    for stream in streams {
        rows.extend(stream.into_rows()?);
    }
    rows.sort_by_key(|row| row.timestamp_ns);
    Ok(rows)
}
