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

use std::{ops::Add, sync::LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{
    logql::{AstOracle, DurationValue, NodeKind},
    query::{LokiQuery, LokiQueryType, TimeRange},
};

pub const STATS_UNAVAILABLE_MESSAGE: &str = "Query size estimate not available.";

static RANGE_MACRO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$__auto|\$__range").expect("macro pattern is valid"));

/// Index statistics for one or more stream selectors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStats {
    #[serde(default)]
    pub streams: u64,
    #[serde(default)]
    pub chunks: u64,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub entries: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl QueryStats {
    pub fn unavailable() -> Self {
        Self {
            message: Some(STATS_UNAVAILABLE_MESSAGE.to_string()),
            ..Self::default()
        }
    }

    pub fn is_zero(&self) -> bool {
        self.streams == 0 && self.chunks == 0 && self.bytes == 0 && self.entries == 0
    }
}

impl Add for QueryStats {
    type Output = QueryStats;

    fn add(self, other: QueryStats) -> QueryStats {
        QueryStats {
            streams: self.streams + other.streams,
            chunks: self.chunks + other.chunks,
            bytes: self.bytes + other.bytes,
            entries: self.entries + other.entries,
            message: None,
        }
    }
}

/// How an all-zero statistics result is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZeroStatsPolicy {
    /// Treat it as "no data".
    #[default]
    Unavailable,
    /// Report it as a valid zero-cost result.
    Keep,
}

impl ZeroStatsPolicy {
    pub fn apply(self, stats: QueryStats) -> Option<QueryStats> {
        match self {
            ZeroStatsPolicy::Unavailable if stats.is_zero() && stats.message.is_none() => None,
            _ => Some(stats),
        }
    }
}

/// Window, in nanoseconds, that a stats lookup should cover. Both ends are
/// `None` when the query cannot be estimated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsTimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl StatsTimeRange {
    pub fn unavailable() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    fn full(range: &TimeRange) -> Self {
        let (start, end) = range.to_nanos();
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn bounds(&self) -> Option<(i64, i64)> {
        self.start.zip(self.end)
    }
}

pub fn has_range_macro(expr: &str) -> bool {
    RANGE_MACRO_RE.is_match(expr)
}

/// Window for the `idx`-th stream selector of `query`.
///
/// Logs queries cover the whole range unless they are instant. Instant metric
/// queries end at the range end and reach back by the literal window at `idx`;
/// without one they fall back to the whole range only when an auto-range
/// macro is present. Range metric queries always cover the whole range.
pub fn stats_time_range(
    oracle: &dyn AstOracle,
    query: &LokiQuery,
    idx: usize,
    range: &TimeRange,
) -> StatsTimeRange {
    let query_type = query.resolved_type();
    if oracle.classify(&query.expr).is_logs_query {
        if query_type == LokiQueryType::Instant {
            return StatsTimeRange::unavailable();
        }
        return StatsTimeRange::full(range);
    }
    if query_type != LokiQueryType::Instant {
        return StatsTimeRange::full(range);
    }

    let durations = oracle.find_nodes(&query.expr, NodeKind::Duration);
    let window = durations
        .get(idx)
        .and_then(|position| DurationValue::parse_literal(position.text(&query.expr)).ok());
    match window {
        Some(window) => {
            let (_, end) = range.to_nanos();
            StatsTimeRange {
                start: Some(end - window.as_millis() * 1_000_000),
                end: Some(end),
            }
        }
        None if has_range_macro(&query.expr) => StatsTimeRange::full(range),
        None => StatsTimeRange::unavailable(),
    }
}
