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

use std::collections::HashSet;

use log::warn;
use serde::{Deserialize, Serialize};

use super::{Datasource, last_response};
use crate::{
    frame::{DataFrame, FrameData},
    interpolate::render_legend_format,
    query::{CoreApp, DataQueryRequest, LokiQuery, LokiQueryType, REF_ID_STARTER_ANNOTATION, TimeRange},
};

const NS_IN_MS: i64 = 1_000_000;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LokiAnnotation {
    pub name: String,
    #[serde(default)]
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<u64>,
    #[serde(default)]
    pub instant: bool,
    /// Comma separated label names kept as tags; empty keeps every label.
    #[serde(default)]
    pub tag_keys: String,
    #[serde(default)]
    pub title_format: String,
    #[serde(default)]
    pub text_format: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationQueryOptions {
    pub annotation: LokiAnnotation,
    pub range: TimeRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotationEvent {
    pub time_ms: i64,
    pub title: String,
    pub text: String,
    pub tags: Vec<String>,
}

impl LokiAnnotation {
    fn tag_keys(&self) -> Vec<&str> {
        self.tag_keys
            .split(',')
            .filter(|key| !key.is_empty())
            .collect()
    }

    fn events(&self, frame: &DataFrame) -> Vec<AnnotationEvent> {
        let FrameData::Logs { rows } = &frame.data else {
            return Vec::new();
        };
        let tag_keys = self.tag_keys();
        rows.iter()
            .map(|row| {
                let mut seen = HashSet::new();
                let tags = row
                    .labels
                    .iter()
                    .filter(|(key, _)| tag_keys.is_empty() || tag_keys.contains(&key.as_str()))
                    .map(|(_, value)| value.trim())
                    .filter(|value| !value.is_empty() && seen.insert(*value))
                    .map(str::to_string)
                    .collect();
                let text = render_legend_format(&self.text_format, &row.labels);
                AnnotationEvent {
                    time_ms: row.timestamp_ns / NS_IN_MS,
                    title: render_legend_format(&self.title_format, &row.labels),
                    text: if text.is_empty() { row.line.clone() } else { text },
                    tags,
                }
            })
            .collect()
    }
}

impl Datasource {
    /// Runs an annotation query and turns every returned log row into an
    /// event. Failed queries produce no events.
    pub async fn annotation_query(&self, options: &AnnotationQueryOptions) -> Vec<AnnotationEvent> {
        let annotation = &options.annotation;
        if annotation.expr.is_empty() {
            return Vec::new();
        }
        let ref_id = format!("{REF_ID_STARTER_ANNOTATION}{}", annotation.name);
        let query_type = if annotation.instant {
            LokiQueryType::Instant
        } else {
            LokiQueryType::Range
        };
        let query = LokiQuery {
            max_lines: annotation.max_lines,
            instant: Some(annotation.instant),
            ..LokiQuery::new(ref_id.clone(), annotation.expr.clone()).with_query_type(query_type)
        };
        let request = DataQueryRequest::for_query(
            query,
            options.range.clone(),
            CoreApp::Dashboard,
            ref_id,
            false,
        );

        let response = match self.query(&request) {
            Ok(responses) => last_response(responses).await,
            Err(err) => Err(err),
        };
        match response {
            Ok(Some(response)) => response
                .data
                .iter()
                .flat_map(|frame| annotation.events(frame))
                .collect(),
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!("annotation query `{}` failed: {err}", annotation.name);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{super::tests::*, *};
    use crate::{
        frame::{DataQueryResponse, LogRow},
        transport::{TransportError, mock::RecordingTransport},
    };

    fn annotation(tag_keys: &str, text_format: &str) -> AnnotationQueryOptions {
        AnnotationQueryOptions {
            annotation: LokiAnnotation {
                name: "deploys".into(),
                expr: "{job=\"deployer\"}".into(),
                tag_keys: tag_keys.into(),
                title_format: "{{job}} deploy".into(),
                text_format: text_format.into(),
                ..LokiAnnotation::default()
            },
            range: range(),
        }
    }

    fn deploy_transport() -> Arc<RecordingTransport> {
        Arc::new(RecordingTransport::with_query(|request| {
            let ref_id = request.targets[0].ref_id.clone();
            Ok(DataQueryResponse::done(vec![DataFrame::logs(
                ref_id,
                vec![LogRow {
                    timestamp_ns: 1_700_000_000_000_000_000,
                    line: "rolled out v2".into(),
                    labels: [
                        ("job".to_string(), "deployer".to_string()),
                        ("env".to_string(), " prod ".to_string()),
                        ("region".to_string(), "prod".to_string()),
                        ("empty".to_string(), " ".to_string()),
                    ]
                    .into(),
                    ..LogRow::default()
                }],
            )]))
        }))
    }

    #[tokio::test]
    async fn rows_become_events() {
        let transport = deploy_transport();
        let ds = datasource(transport.clone());
        let events = ds.annotation_query(&annotation("", "")).await;
        assert_eq!(
            events,
            vec![AnnotationEvent {
                time_ms: 1_700_000_000_000,
                title: "deployer deploy".into(),
                text: "rolled out v2".into(),
                tags: vec!["prod".into(), "deployer".into()],
            }]
        );
        let sent = transport.queries.lock().clone();
        assert_eq!(sent[0].targets[0].ref_id, "annotation-deploys");
        assert_eq!(sent[0].app, CoreApp::Dashboard);
        assert_eq!(sent[0].targets[0].query_type, Some(LokiQueryType::Range));
    }

    #[tokio::test]
    async fn tag_keys_filter_tags() {
        let ds = datasource(deploy_transport());
        let events = ds.annotation_query(&annotation("job,", "{{env}}")).await;
        assert_eq!(events[0].tags, vec!["deployer".to_string()]);
        assert_eq!(events[0].text, " prod ");
    }

    #[tokio::test]
    async fn failures_and_empty_expressions_yield_nothing() {
        let failing = Arc::new(RecordingTransport::with_query(|_| {
            Err(TransportError::Connection("refused".into()))
        }));
        let ds = datasource(failing.clone());
        assert!(ds.annotation_query(&annotation("", "")).await.is_empty());

        let mut empty = annotation("", "");
        empty.annotation.expr.clear();
        let before = failing.query_count();
        assert!(ds.annotation_query(&empty).await.is_empty());
        assert_eq!(failing.query_count(), before);
    }
}
