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

//! Post-processing applied to every backend response before it reaches the caller.

use log::warn;
use regex::Regex;

use crate::{
    config::{DerivedFieldConfig, DerivedFieldMatcher},
    frame::{DataFrame, DataQueryResponse, DerivedValue, FrameData, Labels, LogLevel, LogRow},
    interpolate::render_legend_format,
    query::{LokiQuery, SupportingQueryType},
};

const VALUE_PLACEHOLDER: &str = "${__value.raw}";
const LEVEL_LABELS: [&str; 3] = ["level", "lvl", "loglevel"];

enum CompiledMatcher {
    Line(Regex),
    Label(String),
}

struct CompiledField<'a> {
    config: &'a DerivedFieldConfig,
    matcher: CompiledMatcher,
}

impl CompiledField<'_> {
    fn resolve(&self, row: &LogRow) -> Option<DerivedValue> {
        let value = match &self.matcher {
            CompiledMatcher::Line(regex) => regex
                .captures(&row.line)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| m.as_str().to_string()),
            CompiledMatcher::Label(label) => row.labels.get(label).cloned(),
        }?;
        let url = self
            .config
            .url
            .as_ref()
            .map(|url| url.replace(VALUE_PLACEHOLDER, &value));
        Some(DerivedValue { value, url })
    }
}

fn compile_fields(configs: &[DerivedFieldConfig]) -> Vec<CompiledField<'_>> {
    configs
        .iter()
        .filter_map(|config| {
            let matcher = match config.matcher_type {
                DerivedFieldMatcher::Label => CompiledMatcher::Label(config.matcher_regex.clone()),
                DerivedFieldMatcher::Regex => match Regex::new(&config.matcher_regex) {
                    Ok(regex) => CompiledMatcher::Line(regex),
                    Err(err) => {
                        warn!(
                            "skipping derived field `{}` with invalid regex: {err}",
                            config.name
                        );
                        return None;
                    }
                },
            };
            Some(CompiledField { config, matcher })
        })
        .collect()
}

/// Level of a volume series, read from the first level-like label.
pub fn extract_level(labels: &Labels) -> LogLevel {
    LEVEL_LABELS
        .iter()
        .find_map(|name| labels.get(*name))
        .map(|value| LogLevel::from_key(value))
        .unwrap_or_default()
}

pub fn transform_backend_result(
    mut response: DataQueryResponse,
    targets: &[LokiQuery],
    derived_fields: &[DerivedFieldConfig],
) -> DataQueryResponse {
    let fields = compile_fields(derived_fields);
    for frame in &mut response.data {
        let query = targets.iter().find(|query| query.ref_id == frame.ref_id);
        transform_frame(frame, query, &fields);
    }
    response
}

fn transform_frame(frame: &mut DataFrame, query: Option<&LokiQuery>, fields: &[CompiledField<'_>]) {
    if let Some(query) = query {
        frame.meta.executed_query.get_or_insert_with(|| query.expr.clone());
    }
    match &mut frame.data {
        FrameData::Logs { rows } => {
            if fields.is_empty() {
                return;
            }
            for row in rows.iter_mut() {
                for field in fields {
                    if let Some(value) = field.resolve(row) {
                        row.derived.insert(field.config.name.clone(), value);
                    }
                }
            }
        }
        FrameData::Series { labels, .. } => {
            let Some(query) = query else {
                return;
            };
            if query.supporting_query_type == Some(SupportingQueryType::LogsVolume) {
                frame.meta.level = Some(extract_level(labels));
            }
            if let Some(legend) = query.legend_format.as_deref().filter(|l| !l.is_empty()) {
                frame.name = Some(render_legend_format(legend, labels));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::frame::Sample;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn field(name: &str, matcher: &str, kind: DerivedFieldMatcher, url: Option<&str>) -> DerivedFieldConfig {
        DerivedFieldConfig {
            name: name.into(),
            matcher_regex: matcher.into(),
            matcher_type: kind,
            url: url.map(Into::into),
            url_display_label: None,
            datasource_uid: None,
        }
    }

    #[test]
    fn resolves_derived_fields_from_lines_and_labels() {
        let row = LogRow {
            timestamp_ns: 1,
            line: "msg=done traceID=abc123".into(),
            labels: labels(&[("pod", "api-0")]),
            ..LogRow::default()
        };
        let response = DataQueryResponse::done(vec![DataFrame::logs("A", vec![row])]);
        let out = transform_backend_result(
            response,
            &[LokiQuery::new("A", "{job=\"api\"}")],
            &[
                field(
                    "trace",
                    r"traceID=(\w+)",
                    DerivedFieldMatcher::Regex,
                    Some("http://tempo/${__value.raw}"),
                ),
                field("pod", "pod", DerivedFieldMatcher::Label, None),
                field("broken", "(", DerivedFieldMatcher::Regex, None),
            ],
        );
        let FrameData::Logs { rows } = &out.data[0].data else {
            panic!("expected logs");
        };
        assert_eq!(
            rows[0].derived.get("trace"),
            Some(&DerivedValue {
                value: "abc123".into(),
                url: Some("http://tempo/abc123".into())
            })
        );
        assert_eq!(rows[0].derived.get("pod").map(|v| v.value.as_str()), Some("api-0"));
        assert!(!rows[0].derived.contains_key("broken"));
        assert_eq!(out.data[0].meta.executed_query.as_deref(), Some("{job=\"api\"}"));
    }

    #[test]
    fn volume_frames_get_a_level() {
        let mut query = LokiQuery::new("log-volume-A", "sum by (level) (count_over_time({a=\"b\"}[$__auto]))");
        query.supporting_query_type = Some(SupportingQueryType::LogsVolume);
        let frame = DataFrame::series(
            "log-volume-A",
            labels(&[("lvl", "warn")]),
            vec![Sample {
                timestamp_ms: 0,
                value: 1.0,
            }],
        );
        let out = transform_backend_result(DataQueryResponse::done(vec![frame]), &[query], &[]);
        assert_eq!(out.data[0].meta.level, Some(LogLevel::Warning));
    }

    #[test]
    fn series_names_follow_legend_format() {
        let mut query = LokiQuery::new("A", "sum by (job) (rate({a=\"b\"}[1m]))");
        query.legend_format = Some("{{job}} rate".into());
        let frame = DataFrame::series("A", labels(&[("job", "api")]), Vec::new());
        let out = transform_backend_result(DataQueryResponse::done(vec![frame]), &[query], &[]);
        assert_eq!(out.data[0].name.as_deref(), Some("api rate"));
        assert_eq!(out.data[0].meta.level, None);
    }

    #[test]
    fn level_defaults_to_unknown() {
        assert_eq!(extract_level(&labels(&[("job", "x")])), LogLevel::Unknown);
        assert_eq!(extract_level(&labels(&[("level", "error")])), LogLevel::Error);
    }
}
