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

use std::fmt::{self, Display};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::DatasourceError,
    interpolate::ScopedVars,
    logql::{AstOracle, LabelOp, LineFilterOp, NodeKind},
    modify::{ExpressionEditor, LabelFilter, add_filter_as_label_filter},
};

pub const DEFAULT_MAX_LINES: u64 = 1000;
pub const DEFAULT_MAX_LINES_SAMPLE: u64 = 10;
pub const REF_ID_DATA_SAMPLES: &str = "loki-data-samples";
pub const REF_ID_STARTER_ANNOTATION: &str = "annotation-";
pub const REF_ID_STARTER_LOG_VOLUME: &str = "log-volume-";
pub const REF_ID_STARTER_LOG_SAMPLE: &str = "log-sample-";
/// Queries whose refId contains this marker are never split.
pub const DO_NOT_CHUNK: &str = "do-not-chunk";

const NS_IN_MS: i64 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LokiQueryType {
    Range,
    Instant,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupportingQueryType {
    LogsVolume,
    LogsSample,
    DataSample,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LokiQuery {
    pub ref_id: String,
    #[serde(default)]
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<LokiQueryType>,
    /// Deprecated flag kept for stored queries; see [`LokiQuery::normalized`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instant: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<u64>,
    #[serde(default)]
    pub hide: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legend_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_query_type: Option<SupportingQueryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

impl LokiQuery {
    pub fn new(ref_id: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            expr: expr.into(),
            ..Self::default()
        }
    }

    pub fn with_query_type(mut self, query_type: LokiQueryType) -> Self {
        self.query_type = Some(query_type);
        self
    }

    /// Resolves the query type: an explicit type wins, then the deprecated
    /// `instant` flag, then `Range`. The deprecated flag is cleared.
    pub fn normalized(&self) -> Self {
        let query_type = match (self.query_type, self.instant) {
            (Some(query_type), _) => query_type,
            (None, Some(true)) => LokiQueryType::Instant,
            (None, _) => LokiQueryType::Range,
        };
        Self {
            query_type: Some(query_type),
            instant: None,
            ..self.clone()
        }
    }

    /// The resolved type; unnormalized queries fall back the same way
    /// [`LokiQuery::normalized`] does.
    pub fn resolved_type(&self) -> LokiQueryType {
        self.normalized().query_type.unwrap_or(LokiQueryType::Range)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CoreApp {
    Explore,
    Dashboard,
    UnifiedAlerting,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTimeRange {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub raw: RawTimeRange,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            raw: RawTimeRange {
                from: from.to_rfc3339(),
                to: to.to_rfc3339(),
            },
        }
    }

    /// A range ending at the live edge.
    pub fn last(span: Duration, now: DateTime<Utc>) -> Self {
        Self {
            from: now - span,
            to: now,
            raw: RawTimeRange {
                from: format!("now-{}s", span.num_seconds()),
                to: "now".to_string(),
            },
        }
    }

    pub fn is_live_edge(&self) -> bool {
        self.raw.to == "now"
    }

    /// `(start, end)` in nanoseconds, computed from millisecond precision.
    pub fn to_nanos(&self) -> (i64, i64) {
        (
            self.from.timestamp_millis() * NS_IN_MS,
            self.to.timestamp_millis() * NS_IN_MS,
        )
    }

    pub fn duration_ms(&self) -> i64 {
        (self.to - self.from).num_milliseconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQueryRequest {
    pub request_id: String,
    pub targets: Vec<LokiQuery>,
    pub range: TimeRange,
    pub interval: String,
    pub interval_ms: i64,
    #[serde(default)]
    pub scoped_vars: ScopedVars,
    #[serde(default)]
    pub app: CoreApp,
    #[serde(default)]
    pub live_streaming: bool,
    #[serde(default)]
    pub hide_from_inspector: bool,
}

impl DataQueryRequest {
    /// Single-target request whose interval spans the whole range.
    pub fn for_query(
        query: LokiQuery,
        range: TimeRange,
        app: CoreApp,
        request_id: impl Into<String>,
        hide_from_inspector: bool,
    ) -> Self {
        let interval_ms = range.duration_ms().max(1);
        Self {
            request_id: request_id.into(),
            targets: vec![query],
            interval: format_interval(interval_ms),
            interval_ms,
            range,
            scoped_vars: ScopedVars::new(),
            app,
            live_streaming: false,
            hide_from_inspector,
        }
    }

    pub fn with_targets(&self, targets: Vec<LokiQuery>) -> Self {
        Self {
            targets,
            ..self.clone()
        }
    }
}

fn format_interval(ms: i64) -> String {
    const UNITS: &[(i64, &str)] = &[
        (86_400_000, "d"),
        (3_600_000, "h"),
        (60_000, "m"),
        (1_000, "s"),
    ];
    UNITS
        .iter()
        .find(|(size, _)| ms % size == 0)
        .map(|(size, unit)| format!("{}{unit}", ms / size))
        .unwrap_or_else(|| format!("{ms}ms"))
}

/// Hidden and empty queries are kept for display but never executed.
pub fn filter_query(query: &LokiQuery) -> bool {
    !(query.hide || query.expr.is_empty())
}

pub fn is_splittable(query: &LokiQuery) -> bool {
    filter_query(query)
        && query.resolved_type() == LokiQueryType::Range
        && !query.ref_id.contains(DO_NOT_CHUNK)
}

/// True when the batch has a visible query and every visible query can be split.
pub fn request_supports_splitting(targets: &[LokiQuery]) -> bool {
    let visible: Vec<&LokiQuery> = targets.iter().filter(|query| !query.hide).collect();
    !visible.is_empty() && visible.into_iter().all(is_splittable)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeEstimate {
    pub estimable: bool,
}

/// Instant logs queries and instant metric queries with neither a literal
/// window nor an interval macro cannot be sized.
pub fn classify_for_size_estimate(oracle: &dyn AstOracle, query: &LokiQuery) -> SizeEstimate {
    let instant = query.resolved_type() == LokiQueryType::Instant;
    if !instant {
        return SizeEstimate { estimable: true };
    }
    if oracle.classify(&query.expr).is_logs_query {
        return SizeEstimate { estimable: false };
    }
    let has_duration = !oracle.find_nodes(&query.expr, NodeKind::Duration).is_empty();
    SizeEstimate {
        estimable: has_duration || crate::stats::has_range_macro(&query.expr),
    }
}

/// Every modification `modify_query` understands. [`QueryModificationKind::ALL`]
/// is the advertised list, so the two cannot drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryModificationKind {
    AddFilter,
    AddFilterOut,
    AddLogfmtParser,
    AddJsonParser,
    AddUnpackParser,
    AddNoPipelineError,
    AddLevelLabelFormat,
    AddLabelFilter,
    AddStringFilter,
    AddStringFilterOut,
}

impl QueryModificationKind {
    pub const ALL: [QueryModificationKind; 10] = [
        QueryModificationKind::AddFilter,
        QueryModificationKind::AddFilterOut,
        QueryModificationKind::AddLogfmtParser,
        QueryModificationKind::AddJsonParser,
        QueryModificationKind::AddUnpackParser,
        QueryModificationKind::AddNoPipelineError,
        QueryModificationKind::AddLevelLabelFormat,
        QueryModificationKind::AddLabelFilter,
        QueryModificationKind::AddStringFilter,
        QueryModificationKind::AddStringFilterOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueryModificationKind::AddFilter => "ADD_FILTER",
            QueryModificationKind::AddFilterOut => "ADD_FILTER_OUT",
            QueryModificationKind::AddLogfmtParser => "ADD_LOGFMT_PARSER",
            QueryModificationKind::AddJsonParser => "ADD_JSON_PARSER",
            QueryModificationKind::AddUnpackParser => "ADD_UNPACK_PARSER",
            QueryModificationKind::AddNoPipelineError => "ADD_NO_PIPELINE_ERROR",
            QueryModificationKind::AddLevelLabelFormat => "ADD_LEVEL_LABEL_FORMAT",
            QueryModificationKind::AddLabelFilter => "ADD_LABEL_FILTER",
            QueryModificationKind::AddStringFilter => "ADD_STRING_FILTER",
            QueryModificationKind::AddStringFilterOut => "ADD_STRING_FILTER_OUT",
        }
    }

    /// Accepts the advertised names plus the older line-filter aliases.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ADD_LINE_FILTER" => return Some(QueryModificationKind::AddStringFilter),
            "ADD_LINE_FILTER_OUT" => return Some(QueryModificationKind::AddStringFilterOut),
            _ => {}
        }
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl Display for QueryModificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn supported_query_modifications() -> Vec<&'static str> {
    QueryModificationKind::ALL
        .iter()
        .map(|kind| kind.as_str())
        .collect()
}

/// Wire shape of a modification request: `{"type": "...", "options": {...}}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFixAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<ModificationOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModificationOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryModification {
    AddFilter { key: String, value: String },
    AddFilterOut { key: String, value: String },
    AddLogfmtParser,
    AddJsonParser,
    AddUnpackParser,
    AddNoPipelineError,
    AddLevelLabelFormat { original_label: String, rename_to: String },
    AddLabelFilter,
    AddStringFilter { value: String },
    AddStringFilterOut { value: String },
}

impl QueryModification {
    pub fn kind(&self) -> QueryModificationKind {
        match self {
            QueryModification::AddFilter { .. } => QueryModificationKind::AddFilter,
            QueryModification::AddFilterOut { .. } => QueryModificationKind::AddFilterOut,
            QueryModification::AddLogfmtParser => QueryModificationKind::AddLogfmtParser,
            QueryModification::AddJsonParser => QueryModificationKind::AddJsonParser,
            QueryModification::AddUnpackParser => QueryModificationKind::AddUnpackParser,
            QueryModification::AddNoPipelineError => QueryModificationKind::AddNoPipelineError,
            QueryModification::AddLevelLabelFormat { .. } => {
                QueryModificationKind::AddLevelLabelFormat
            }
            QueryModification::AddLabelFilter => QueryModificationKind::AddLabelFilter,
            QueryModification::AddStringFilter { .. } => QueryModificationKind::AddStringFilter,
            QueryModification::AddStringFilterOut { .. } => {
                QueryModificationKind::AddStringFilterOut
            }
        }
    }

    /// Applies the modification to `expr`. Filters on keys outside
    /// `stream_labels` are written as label filters rather than matchers.
    /// Filters with an empty key or value leave the query untouched.
    pub fn apply(&self, editor: &ExpressionEditor<'_>, expr: &str, stream_labels: &[String]) -> String {
        let is_parsed_label = |key: &str| !stream_labels.iter().any(|label| label == key);
        match self {
            QueryModification::AddFilter { key, value }
            | QueryModification::AddFilterOut { key, value } => {
                if key.is_empty() || value.is_empty() {
                    return expr.to_string();
                }
                let operator = match self {
                    QueryModification::AddFilterOut { .. } => LabelOp::NotEq,
                    _ => LabelOp::Eq,
                };
                let value = crate::escape::escape_label_value_in_selector(value, None);
                let filter = LabelFilter::new(key.as_str(), operator, value);
                editor.add_label_to_query(expr, &filter, is_parsed_label(key))
            }
            QueryModification::AddLogfmtParser => editor.add_parser_to_query(expr, "logfmt"),
            QueryModification::AddJsonParser => editor.add_parser_to_query(expr, "json"),
            QueryModification::AddUnpackParser => editor.add_parser_to_query(expr, "unpack"),
            QueryModification::AddNoPipelineError => editor.add_no_pipeline_error_to_query(expr),
            QueryModification::AddLevelLabelFormat {
                original_label,
                rename_to,
            } => {
                if original_label.is_empty() || rename_to.is_empty() {
                    return expr.to_string();
                }
                editor.add_label_format_to_query(expr, original_label, rename_to)
            }
            QueryModification::AddLabelFilter => match editor.last_clause_position(expr) {
                Some(last) => {
                    add_filter_as_label_filter(expr, &[last], &LabelFilter::new("", LabelOp::Eq, ""))
                }
                None => expr.to_string(),
            },
            QueryModification::AddStringFilter { value } => {
                editor.add_line_filter(expr, value, LineFilterOp::Contains)
            }
            QueryModification::AddStringFilterOut { value } => {
                editor.add_line_filter(expr, value, LineFilterOp::NotContains)
            }
        }
    }
}

impl TryFrom<&QueryFixAction> for QueryModification {
    type Error = DatasourceError;

    fn try_from(action: &QueryFixAction) -> Result<Self, Self::Error> {
        let kind = QueryModificationKind::parse(&action.kind).ok_or_else(|| {
            DatasourceError::InvalidInput(format!("unsupported query modification: {}", action.kind))
        })?;
        let options = action.options.clone().unwrap_or_default();
        let key = || options.key.clone().unwrap_or_default();
        let value = || options.value.clone().unwrap_or_default();
        let modification = match kind {
            QueryModificationKind::AddFilter => QueryModification::AddFilter {
                key: key(),
                value: value(),
            },
            QueryModificationKind::AddFilterOut => QueryModification::AddFilterOut {
                key: key(),
                value: value(),
            },
            QueryModificationKind::AddLogfmtParser => QueryModification::AddLogfmtParser,
            QueryModificationKind::AddJsonParser => QueryModification::AddJsonParser,
            QueryModificationKind::AddUnpackParser => QueryModification::AddUnpackParser,
            QueryModificationKind::AddNoPipelineError => QueryModification::AddNoPipelineError,
            QueryModificationKind::AddLevelLabelFormat => QueryModification::AddLevelLabelFormat {
                original_label: options.original_label.clone().unwrap_or_default(),
                rename_to: options.rename_to.clone().unwrap_or_default(),
            },
            QueryModificationKind::AddLabelFilter => QueryModification::AddLabelFilter,
            QueryModificationKind::AddStringFilter => {
                QueryModification::AddStringFilter { value: value() }
            }
            QueryModificationKind::AddStringFilterOut => {
                QueryModification::AddStringFilterOut { value: value() }
            }
        };
        Ok(modification)
    }
}
