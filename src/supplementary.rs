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

//! Derived volume and sample queries.

use serde::{Deserialize, Serialize};

use crate::{
    logql::{AstOracle, log_query_from_metrics_query},
    modify::remove_comments_from_query,
    query::{
        DEFAULT_MAX_LINES_SAMPLE, LokiQuery, LokiQueryType, REF_ID_DATA_SAMPLES,
        REF_ID_STARTER_LOG_SAMPLE, REF_ID_STARTER_LOG_VOLUME, SupportingQueryType,
    },
};

/// Row cap used when the logs sample provider builds its queries.
pub const LOGS_SAMPLE_PROVIDER_LIMIT: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupplementaryQueryType {
    LogsVolume,
    LogsSample,
}

impl SupplementaryQueryType {
    pub const ALL: [SupplementaryQueryType; 2] = [
        SupplementaryQueryType::LogsVolume,
        SupplementaryQueryType::LogsSample,
    ];
}

pub fn supported_supplementary_query_types() -> &'static [SupplementaryQueryType] {
    &SupplementaryQueryType::ALL
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupplementaryQueryOptions {
    pub limit: Option<u64>,
}

/// Derives the supplementary query of `kind` from `query`, or `None` when
/// the query does not qualify.
///
/// Volume queries need a range-typed logs query. Sample queries need a
/// metric query and carry `options.limit` rows, else `default_max_lines`.
pub fn supplementary_query(
    oracle: &dyn AstOracle,
    kind: SupplementaryQueryType,
    query: &LokiQuery,
    options: SupplementaryQueryOptions,
    default_max_lines: u64,
) -> Option<LokiQuery> {
    let normalized = query.normalized();
    let expr = remove_comments_from_query(&normalized.expr);
    if expr.trim().is_empty() {
        return None;
    }
    let is_logs = oracle.classify(&expr).is_logs_query;
    match kind {
        SupplementaryQueryType::LogsVolume => {
            if !is_logs || normalized.query_type != Some(LokiQueryType::Range) {
                return None;
            }
            Some(LokiQuery {
                ref_id: format!("{REF_ID_STARTER_LOG_VOLUME}{}", normalized.ref_id),
                query_type: Some(LokiQueryType::Range),
                supporting_query_type: Some(SupportingQueryType::LogsVolume),
                expr: format!("sum by (level) (count_over_time({expr}[$__auto]))"),
                ..normalized
            })
        }
        SupplementaryQueryType::LogsSample => {
            if is_logs {
                return None;
            }
            let expr = log_query_from_metrics_query(&expr);
            if expr.is_empty() {
                return None;
            }
            Some(LokiQuery {
                ref_id: format!("{REF_ID_STARTER_LOG_SAMPLE}{}", normalized.ref_id),
                query_type: Some(LokiQueryType::Range),
                supporting_query_type: Some(SupportingQueryType::LogsSample),
                max_lines: Some(options.limit.unwrap_or(default_max_lines)),
                expr,
                ..normalized
            })
        }
    }
}

/// Sample query used to recommend parsers and labels for a logs query.
pub fn data_sample_query(query: &LokiQuery) -> LokiQuery {
    LokiQuery {
        ref_id: REF_ID_DATA_SAMPLES.to_string(),
        expr: query.expr.clone(),
        query_type: Some(LokiQueryType::Range),
        max_lines: Some(
            query
                .max_lines
                .filter(|lines| *lines > 0)
                .unwrap_or(DEFAULT_MAX_LINES_SAMPLE),
        ),
        supporting_query_type: Some(SupportingQueryType::DataSample),
        ..LokiQuery::default()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::logql::LogqlParser;

    fn derive(kind: SupplementaryQueryType, query: &LokiQuery) -> Option<LokiQuery> {
        supplementary_query(
            &LogqlParser,
            kind,
            query,
            SupplementaryQueryOptions::default(),
            1000,
        )
    }

    #[test]
    fn volume_wraps_range_logs_query() {
        let query = LokiQuery::new("A", "{foo=\"bar\"} |= \"x\"")
            .with_query_type(LokiQueryType::Range);
        let volume = derive(SupplementaryQueryType::LogsVolume, &query).unwrap();
        assert_eq!(
            volume.expr,
            "sum by (level) (count_over_time({foo=\"bar\"} |= \"x\"[$__auto]))"
        );
        assert_eq!(volume.ref_id, "log-volume-A");
        assert_eq!(
            volume.supporting_query_type,
            Some(SupportingQueryType::LogsVolume)
        );
    }

    #[test]
    fn volume_rejects_instant_and_metric_queries() {
        let instant = LokiQuery::new("A", "{foo=\"bar\"} |= \"x\"")
            .with_query_type(LokiQueryType::Instant);
        assert_eq!(derive(SupplementaryQueryType::LogsVolume, &instant), None);
        let metric = LokiQuery::new("A", "rate({foo=\"bar\"}[1m])");
        assert_eq!(derive(SupplementaryQueryType::LogsVolume, &metric), None);
        assert_eq!(
            derive(SupplementaryQueryType::LogsVolume, &LokiQuery::new("A", "")),
            None
        );
    }

    #[test]
    fn volume_strips_comments() {
        let query = LokiQuery::new("A", "{foo=\"bar\"} # only errors");
        let volume = derive(SupplementaryQueryType::LogsVolume, &query).unwrap();
        assert!(!volume.expr.contains('#'));
    }

    #[test]
    fn sample_extracts_log_query_from_metric() {
        let query = LokiQuery::new("B", "sum(count_over_time({foo=\"bar\"} | json [1m]))")
            .with_query_type(LokiQueryType::Instant);
        let sample = supplementary_query(
            &LogqlParser,
            SupplementaryQueryType::LogsSample,
            &query,
            SupplementaryQueryOptions { limit: Some(100) },
            1000,
        )
        .unwrap();
        assert_eq!(sample.expr, "{foo=\"bar\"} | json");
        assert_eq!(sample.ref_id, "log-sample-B");
        assert_eq!(sample.query_type, Some(LokiQueryType::Range));
        assert_eq!(sample.max_lines, Some(100));
    }

    #[test]
    fn sample_defaults_limit_and_rejects_logs_queries() {
        let metric = LokiQuery::new("B", "rate({foo=\"bar\"}[1m])");
        let sample = derive(SupplementaryQueryType::LogsSample, &metric).unwrap();
        assert_eq!(sample.max_lines, Some(1000));
        let logs = LokiQuery::new("B", "{foo=\"bar\"}");
        assert_eq!(derive(SupplementaryQueryType::LogsSample, &logs), None);
    }

    #[test]
    fn data_sample_query_defaults() {
        let sample = data_sample_query(&LokiQuery::new("A", "{foo=\"bar\"}"));
        assert_eq!(sample.ref_id, REF_ID_DATA_SAMPLES);
        assert_eq!(sample.max_lines, Some(DEFAULT_MAX_LINES_SAMPLE));
        assert_eq!(
            sample.supporting_query_type,
            Some(SupportingQueryType::DataSample)
        );
    }
}
