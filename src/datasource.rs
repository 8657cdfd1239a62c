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

use std::{collections::HashSet, sync::Arc, time::Instant};

use futures::{
    StreamExt,
    stream::{self, BoxStream},
};
use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::OrchestratorConfig,
    error::DatasourceError,
    escape::{escape_label_value_in_selector, interpolate_query_expr, is_regex_selector, plain_escape},
    frame::{DataFrame, DataQueryResponse},
    interpolate::{
        ScopedVars, TemplateSrv, placeholder_scoped_vars, replace_variables, return_variables,
        strip_builtin_interval_vars,
    },
    logql::{AstOracle, LabelOp, LogqlParser, is_query_with_error, stream_selectors},
    modify::{ExpressionEditor, LabelFilter, ToggleFilterKind},
    query::{
        CoreApp, DataQueryRequest, LokiQuery, LokiQueryType, QueryFixAction, QueryModification,
        TimeRange, filter_query, request_supports_splitting,
    },
    stats::{QueryStats, stats_time_range},
    supplementary::{
        LOGS_SAMPLE_PROVIDER_LIMIT, SupplementaryQueryOptions, SupplementaryQueryType,
        data_sample_query, supplementary_query, supported_supplementary_query_types,
    },
    transform::transform_backend_result,
    transport::Transport,
};

mod annotations;
mod live;
mod split;
mod streaming;
mod variables;

pub use annotations::{AnnotationEvent, AnnotationQueryOptions, LokiAnnotation};
pub use live::{LiveStreams, LiveTarget};
pub use streaming::live_stream_key;
pub use variables::{LokiVariableQuery, LokiVariableQueryType, MetricFindQuery, MetricFindValue};

pub type ResponseStream = BoxStream<'static, Result<DataQueryResponse, DatasourceError>>;

/// Toggle request coming from log details: `{"type": "FILTER_FOR", "options": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToggleFilterAction {
    #[serde(rename = "type")]
    pub kind: ToggleFilterKind,
    pub options: QueryFilterOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFilterOptions {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: String,
}

/// Query orchestration for one Loki datasource.
#[derive(Clone)]
pub struct Datasource {
    transport: Arc<dyn Transport>,
    oracle: Arc<dyn AstOracle>,
    config: Arc<OrchestratorConfig>,
    templates: Arc<TemplateSrv>,
    streams: LiveStreams,
    label_keys: Arc<RwLock<Vec<String>>>,
    max_lines: u64,
    split_duration_ms: i64,
}

impl Datasource {
    pub fn new(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        templates: TemplateSrv,
    ) -> Result<Self, DatasourceError> {
        Self::with_oracle(config, transport, templates, Arc::new(LogqlParser))
    }

    pub fn with_oracle(
        config: OrchestratorConfig,
        transport: Arc<dyn Transport>,
        templates: TemplateSrv,
        oracle: Arc<dyn AstOracle>,
    ) -> Result<Self, DatasourceError> {
        config.validate()?;
        let max_lines = config.settings.json_data.max_lines();
        let split_duration_ms = config.split_duration_ms()?;
        info!(
            "loki datasource `{}` ready (url={}, max_lines={}, streaming={}, splitting={})",
            config.settings.uid,
            config.settings.url,
            max_lines,
            config.features.streaming,
            config.features.query_splitting
        );
        Ok(Self {
            transport,
            oracle,
            config: Arc::new(config),
            templates: Arc::new(templates),
            streams: LiveStreams::default(),
            label_keys: Arc::new(RwLock::new(Vec::new())),
            max_lines,
            split_duration_ms,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn max_lines(&self) -> u64 {
        self.max_lines
    }

    pub fn live_streams(&self) -> &LiveStreams {
        &self.streams
    }

    fn editor(&self) -> ExpressionEditor<'_> {
        ExpressionEditor::new(self.oracle.as_ref())
    }

    fn is_logs_query(&self, expr: &str) -> bool {
        self.oracle.classify(expr).is_logs_query
    }

    /// Executes a batch. Duplicate refIds are rejected before anything runs.
    pub fn query(&self, request: &DataQueryRequest) -> Result<ResponseStream, DatasourceError> {
        let mut seen = HashSet::new();
        for target in &request.targets {
            if !seen.insert(target.ref_id.as_str()) {
                return Err(DatasourceError::InvalidRequest(format!(
                    "duplicate refId `{}` in batch",
                    target.ref_id
                )));
            }
        }

        let targets: Vec<LokiQuery> = request
            .targets
            .iter()
            .map(|target| {
                let mut query = target.normalized();
                query.max_lines.get_or_insert(self.max_lines);
                query
            })
            .collect();
        let fixed = request.with_targets(targets);

        let stream_queries: Vec<LokiQuery> = fixed
            .targets
            .iter()
            .filter(|query| query.query_type == Some(LokiQueryType::Stream))
            .cloned()
            .collect();
        if self.config.features.streaming
            && !stream_queries.is_empty()
            && fixed.range.is_live_edge()
        {
            let dropped = fixed.targets.len() - stream_queries.len();
            if dropped > 0 {
                warn!(
                    "request {} mixes stream and non-stream queries; dropping {dropped} non-stream queries",
                    fixed.request_id
                );
            }
            let stream_request = fixed.with_targets(stream_queries);
            return Ok(streaming::run_stream_queries(self, stream_request));
        }

        if fixed.live_streaming {
            return Ok(self.run_live_queries(&fixed));
        }

        if self.config.features.query_splitting && request_supports_splitting(&fixed.targets) {
            return Ok(split::run_split_query(self.clone(), fixed, self.split_duration_ms));
        }

        let ds = self.clone();
        Ok(stream::once(async move {
            let started = Instant::now();
            let result = ds.run_query(fixed.clone()).await;
            ds.track_query(&fixed, started, &result);
            result
        })
        .boxed())
    }

    /// One backend round trip: hidden and empty targets are dropped, template
    /// variables and ad-hoc filters applied, and the result transformed.
    pub(crate) async fn run_query(
        &self,
        request: DataQueryRequest,
    ) -> Result<DataQueryResponse, DatasourceError> {
        let targets: Vec<LokiQuery> = request
            .targets
            .iter()
            .filter(|query| filter_query(query))
            .map(|query| self.apply_template_variables(query, &request.scoped_vars))
            .collect();
        if targets.is_empty() {
            debug!("request {} has no runnable queries", request.request_id);
            return Ok(DataQueryResponse::done(Vec::new()));
        }
        let backend_request = request.with_targets(targets);
        let response = self.transport.query(&backend_request).await?;
        Ok(self.transform(response, &backend_request.targets))
    }

    pub(crate) fn transform(
        &self,
        response: DataQueryResponse,
        targets: &[LokiQuery],
    ) -> DataQueryResponse {
        transform_backend_result(
            response,
            targets,
            &self.config.settings.json_data.derived_fields,
        )
    }

    pub(crate) fn track_query(
        &self,
        request: &DataQueryRequest,
        started: Instant,
        result: &Result<DataQueryResponse, DatasourceError>,
    ) {
        let outcome = match result {
            Ok(response) if response.error.is_some() => "error",
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        debug!(
            "loki query finished (request_id={}, app={:?}, queries={}, outcome={}, duration_ms={:.3}, predefined_operations={:?})",
            request.request_id,
            request.app,
            request.targets.len(),
            outcome,
            started.elapsed().as_secs_f64() * 1000.0,
            self.config.settings.json_data.predefined_operations
        );
    }

    fn run_live_queries(&self, request: &DataQueryRequest) -> ResponseStream {
        let logs_queries: Vec<&LokiQuery> = request
            .targets
            .iter()
            .filter(|query| !query.expr.is_empty() && self.is_logs_query(&query.expr))
            .collect();
        if logs_queries.is_empty() {
            return stream::once(async { Ok(DataQueryResponse::done(Vec::new())) }).boxed();
        }

        let mut streams: Vec<ResponseStream> = Vec::with_capacity(logs_queries.len());
        for query in logs_queries {
            let size = query.max_lines.filter(|lines| *lines > 0).unwrap_or(self.max_lines);
            let target = match LiveTarget::new(&self.config.settings.url, query, size) {
                Ok(target) => target,
                Err(err) => {
                    streams.push(stream::once(async move { Err(err) }).boxed());
                    continue;
                }
            };
            let key = format!("loki-{}", target.ref_id);
            let targets = vec![query.clone()];
            let ds = self.clone();
            let live = self
                .streams
                .get_stream(self.transport.clone(), target)
                .map(move |frame| {
                    frame.map(|frame| {
                        let response = DataQueryResponse::streaming(vec![frame], Some(key.clone()));
                        ds.transform(response, &targets)
                    })
                });
            streams.push(live.boxed());
        }
        stream::select_all(streams).boxed()
    }

    pub fn modify_query(&self, query: &LokiQuery, modification: &QueryModification) -> LokiQuery {
        let known_labels = self.label_keys.read().clone();
        LokiQuery {
            expr: modification.apply(&self.editor(), &query.expr, &known_labels),
            ..query.clone()
        }
    }

    /// Applies a wire-format action; unknown action names are rejected.
    pub fn modify_query_action(
        &self,
        query: &LokiQuery,
        action: &QueryFixAction,
    ) -> Result<LokiQuery, DatasourceError> {
        let modification = QueryModification::try_from(action)?;
        Ok(self.modify_query(query, &modification))
    }

    pub fn supported_query_modifications(&self) -> Vec<&'static str> {
        crate::query::supported_query_modifications()
    }

    pub fn toggle_query_filter(&self, query: &LokiQuery, action: &ToggleFilterAction) -> LokiQuery {
        let QueryFilterOptions { key, value } = &action.options;
        if key.is_empty() || value.is_empty() {
            return query.clone();
        }
        LokiQuery {
            expr: self
                .editor()
                .toggle_label_filter(&query.expr, key, value, action.kind),
            ..query.clone()
        }
    }

    pub fn query_has_filter(&self, query: &LokiQuery, filter: &QueryFilterOptions) -> bool {
        let filter = LabelFilter::new(filter.key.as_str(), LabelOp::Eq, filter.value.as_str());
        self.editor().query_has_filter(&query.expr, &filter)
    }

    pub fn interpolate_variables_in_queries(
        &self,
        queries: &[LokiQuery],
        scoped: &ScopedVars,
    ) -> Vec<LokiQuery> {
        queries
            .iter()
            .map(|query| LokiQuery {
                expr: self.add_ad_hoc_filters(&self.templates.replace(
                    &query.expr,
                    scoped,
                    Some(interpolate_query_expr),
                )),
                ..query.clone()
            })
            .collect()
    }

    /// Adds every ad-hoc filter to the expression. Regex operators keep the
    /// value as a pattern; other operators escape it for an exact selector.
    pub fn add_ad_hoc_filters(&self, expr: &str) -> String {
        let filters = self.templates.ad_hoc_filters();
        if filters.is_empty() {
            return expr.to_string();
        }
        let editor = self.editor();
        let mut out = replace_variables(expr);
        for filter in filters {
            let Some(operator) = LabelOp::parse(&filter.operator) else {
                warn!(
                    "ignoring ad-hoc filter on `{}` with unsupported operator `{}`",
                    filter.key, filter.operator
                );
                continue;
            };
            let value = if is_regex_selector(&filter.operator) {
                plain_escape(&filter.value)
            } else {
                escape_label_value_in_selector(&filter.value, Some(&filter.operator))
            };
            let label = LabelFilter::new(filter.key.as_str(), operator, value);
            out = editor.add_label_to_query(&out, &label, false);
        }
        return_variables(&out)
    }

    /// Interval and range macros are left for the backend in `expr`; the
    /// legend keeps access to every scoped variable.
    pub fn apply_template_variables(&self, query: &LokiQuery, scoped: &ScopedVars) -> LokiQuery {
        let rest = strip_builtin_interval_vars(scoped);
        let expr_with_ad_hoc = self.add_ad_hoc_filters(&query.expr);
        LokiQuery {
            expr: self
                .templates
                .replace(&expr_with_ad_hoc, &rest, Some(interpolate_query_expr)),
            legend_format: query
                .legend_format
                .as_ref()
                .map(|legend| self.templates.replace(legend, scoped, None)),
            ..query.clone()
        }
    }

    pub fn interpolate_string(&self, text: &str, scoped: &ScopedVars) -> String {
        self.templates.replace(text, scoped, Some(interpolate_query_expr))
    }

    pub fn filter_query(&self, query: &LokiQuery) -> bool {
        filter_query(query)
    }

    pub fn default_query(&self, app: CoreApp) -> LokiQuery {
        let query_type = match app {
            CoreApp::UnifiedAlerting => LokiQueryType::Instant,
            _ => LokiQueryType::Range,
        };
        LokiQuery::new("A", "").with_query_type(query_type)
    }

    pub fn get_query_display_text(&self, query: &LokiQuery) -> String {
        query.expr.clone()
    }

    pub fn get_variables(&self) -> Vec<String> {
        self.templates
            .variable_names()
            .map(|name| format!("${name}"))
            .collect()
    }

    /// Resource GET that unwraps the `data` member. Paths starting with `/`
    /// are rejected before reaching the transport.
    pub async fn metadata_request(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<Value, DatasourceError> {
        if url.starts_with('/') {
            return Err(DatasourceError::invalid_metadata_url(url));
        }
        let mut response = self.transport.get_resource(url, params).await?;
        match response.get_mut("data").map(Value::take) {
            Some(data) if !data.is_null() => Ok(data),
            _ => Ok(Value::Array(Vec::new())),
        }
    }

    /// Stats endpoints return the counters at the top level.
    pub async fn stats_metadata_request(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<QueryStats, DatasourceError> {
        if url.starts_with('/') {
            return Err(DatasourceError::invalid_metadata_url(url));
        }
        let response = self.transport.get_resource(url, params).await?;
        Ok(serde_json::from_value(response)?)
    }

    /// Sums index stats over every stream selector. A failed lookup stops the
    /// aggregation and the partial sum is returned.
    pub async fn get_query_stats(&self, query: &LokiQuery, range: &TimeRange) -> Option<QueryStats> {
        if is_query_with_error(&self.interpolate_string(&query.expr, &placeholder_scoped_vars())) {
            return None;
        }
        let mut total = QueryStats::default();
        for (idx, selector) in stream_selectors(&query.expr).into_iter().enumerate() {
            let Some((start, end)) =
                stats_time_range(self.oracle.as_ref(), query, idx, range).bounds()
            else {
                return Some(QueryStats::unavailable());
            };
            let params = vec![
                ("query".to_string(), selector),
                ("start".to_string(), start.to_string()),
                ("end".to_string(), end.to_string()),
            ];
            match self.stats_metadata_request("index/stats", &params).await {
                Ok(stats) => total = total + stats,
                Err(err) => {
                    debug!("stopping stats aggregation for `{}`: {err}", query.expr);
                    break;
                }
            }
        }
        Some(total)
    }

    pub async fn get_stats(&self, query: &LokiQuery, range: &TimeRange) -> Option<QueryStats> {
        let stats = self.get_query_stats(query, range).await?;
        self.config.zero_stats.apply(stats)
    }

    pub fn supported_supplementary_query_types(&self) -> &'static [SupplementaryQueryType] {
        supported_supplementary_query_types()
    }

    pub fn get_supplementary_query(
        &self,
        kind: SupplementaryQueryType,
        options: SupplementaryQueryOptions,
        query: &LokiQuery,
    ) -> Option<LokiQuery> {
        supplementary_query(self.oracle.as_ref(), kind, query, options, self.max_lines)
    }

    /// Response stream for a supplementary query type, or `None` when no
    /// target of the request qualifies.
    pub fn get_data_provider(
        &self,
        kind: SupplementaryQueryType,
        request: &DataQueryRequest,
    ) -> Result<Option<ResponseStream>, DatasourceError> {
        let options = match kind {
            SupplementaryQueryType::LogsVolume => SupplementaryQueryOptions::default(),
            SupplementaryQueryType::LogsSample => SupplementaryQueryOptions {
                limit: Some(LOGS_SAMPLE_PROVIDER_LIMIT),
            },
        };
        let targets: Vec<LokiQuery> = request
            .targets
            .iter()
            .filter_map(|query| self.get_supplementary_query(kind, options, query))
            .collect();
        if targets.is_empty() {
            return Ok(None);
        }
        self.query(&request.with_targets(targets)).map(Some)
    }

    /// Sample rows for a logs query; other queries yield no frames.
    pub async fn get_data_samples(
        &self,
        query: &LokiQuery,
        range: &TimeRange,
    ) -> Result<Vec<DataFrame>, DatasourceError> {
        if !self.is_logs_query(&query.expr)
            || is_query_with_error(&self.interpolate_string(&query.expr, &placeholder_scoped_vars()))
        {
            return Ok(Vec::new());
        }
        let sample = data_sample_query(query);
        let ref_id = sample.ref_id.clone();
        let request =
            DataQueryRequest::for_query(sample, range.clone(), CoreApp::Unknown, ref_id, true);
        let response = last_response(self.query(&request)?).await?;
        Ok(response.map(|response| response.data).unwrap_or_default())
    }

    pub(crate) fn time_range_params(range: &TimeRange) -> Vec<(String, String)> {
        let (start, end) = range.to_nanos();
        vec![
            ("start".to_string(), start.to_string()),
            ("end".to_string(), end.to_string()),
        ]
    }
}

/// Drains a response stream and keeps the final emission.
pub(crate) async fn last_response(
    mut responses: ResponseStream,
) -> Result<Option<DataQueryResponse>, DatasourceError> {
    let mut last = None;
    while let Some(response) = responses.next().await {
        last = Some(response?);
    }
    Ok(last)
}
