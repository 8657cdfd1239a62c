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

//! Template variable and ad-hoc filter lookups against the label endpoints.

use std::{collections::HashSet, sync::LazyLock};

use log::debug;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Datasource;
use crate::{error::DatasourceError, interpolate::ScopedVars, query::TimeRange};

static LABEL_NAMES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^label_names\(\)\s*$").expect("valid label_names regex"));
static LABEL_VALUES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^label_values\((?:(.+),\s*)?([a-zA-Z_$][a-zA-Z0-9_]*)\)\s*$")
        .expect("valid label_values regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LokiVariableQueryType {
    LabelNames,
    LabelValues,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LokiVariableQuery {
    #[serde(rename = "type")]
    pub kind: LokiVariableQueryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Stream selector; when present values come from the series endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<String>,
}

/// A variable query as stored in dashboards: the legacy string form or the
/// structured form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricFindQuery {
    Legacy(String),
    Structured(LokiVariableQuery),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricFindValue {
    pub text: String,
}

fn text_values(value: Value) -> Vec<MetricFindValue> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(MetricFindValue { text }),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

impl Datasource {
    pub async fn metric_find_query(
        &self,
        query: &MetricFindQuery,
        scoped: &ScopedVars,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        match query {
            MetricFindQuery::Legacy(raw) if raw.is_empty() => Ok(Vec::new()),
            MetricFindQuery::Legacy(raw) => {
                let interpolated = self.interpolate_string(raw, scoped);
                self.legacy_process_metric_find_query(&interpolated, range)
                    .await
            }
            MetricFindQuery::Structured(query) => {
                let label = self.interpolate_string(query.label.as_deref().unwrap_or(""), scoped);
                let stream =
                    self.interpolate_string(query.stream.as_deref().unwrap_or(""), scoped);
                match query.kind {
                    LokiVariableQueryType::LabelNames => self.label_names_query(range).await,
                    _ if label.is_empty() => Ok(Vec::new()),
                    _ if !stream.is_empty() => {
                        self.label_values_series_query(&stream, &label, range)
                            .await
                    }
                    _ => self.label_values_query(&label, range).await,
                }
            }
        }
    }

    /// `label_names()` and `label_values([selector,] label)`; anything else
    /// yields no values.
    pub async fn legacy_process_metric_find_query(
        &self,
        query: &str,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        if LABEL_NAMES_RE.is_match(query) {
            return self.label_names_query(range).await;
        }
        let Some(caps) = LABEL_VALUES_RE.captures(query) else {
            debug!("unrecognised variable query `{query}`");
            return Ok(Vec::new());
        };
        let label = caps.get(2).map_or("", |m| m.as_str());
        match caps.get(1) {
            Some(selector) => {
                self.label_values_series_query(selector.as_str(), label, range)
                    .await
            }
            None => self.label_values_query(label, range).await,
        }
    }

    /// Label names in `range`. The result also refreshes the label key cache
    /// used by query modifications.
    pub async fn label_names_query(
        &self,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        let names = text_values(
            self.metadata_request("labels", &Self::time_range_params(range))
                .await?,
        );
        *self.label_keys.write() = names.iter().map(|name| name.text.clone()).collect();
        Ok(names)
    }

    pub async fn label_values_query(
        &self,
        label: &str,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        let url = format!("label/{label}/values");
        Ok(text_values(
            self.metadata_request(&url, &Self::time_range_params(range))
                .await?,
        ))
    }

    /// Values of `label` across the series matching `selector`, deduplicated
    /// in first-seen order.
    pub async fn label_values_series_query(
        &self,
        selector: &str,
        label: &str,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        let mut params = Self::time_range_params(range);
        params.push(("match[]".to_string(), selector.to_string()));
        let Value::Array(series) = self.metadata_request("series", &params).await? else {
            return Ok(Vec::new());
        };
        let mut seen = HashSet::new();
        Ok(series
            .iter()
            .filter_map(|stream| stream.get(label).and_then(Value::as_str))
            .filter(|value| !value.is_empty() && seen.insert(value.to_string()))
            .map(|value| MetricFindValue {
                text: value.to_string(),
            })
            .collect())
    }

    pub async fn get_tag_keys(
        &self,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        self.label_names_query(range).await
    }

    pub async fn get_tag_values(
        &self,
        key: &str,
        range: &TimeRange,
    ) -> Result<Vec<MetricFindValue>, DatasourceError> {
        self.label_values_query(key, range).await
    }

    /// Reloads the label keys consulted when a filter is added to a query.
    pub async fn refresh_label_keys(&self, range: &TimeRange) -> Result<usize, DatasourceError> {
        let names = self.label_names_query(range).await?;
        Ok(names.len())
    }

    pub fn label_keys(&self) -> Vec<String> {
        self.label_keys.read().clone()
    }
}
