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

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{
    error::DatasourceError, logql::DurationValue, query::DEFAULT_MAX_LINES,
    stats::ZeroStatsPolicy,
};

const DEFAULT_SPLIT_DURATION: &str = "1d";

/// `maxLines` is stored as a string by older settings pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxLinesSetting {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DerivedFieldMatcher {
    #[default]
    Regex,
    Label,
}

/// Link or value extracted from each log row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedFieldConfig {
    pub name: String,
    /// Regex applied to the line, or the label name for label matchers.
    pub matcher_regex: String,
    #[serde(default)]
    pub matcher_type: DerivedFieldMatcher,
    /// May reference the extracted value as `${__value.raw}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_display_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datasource_uid: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LokiOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_lines: Option<MaxLinesSetting>,
    #[serde(default)]
    pub predefined_operations: String,
    #[serde(default)]
    pub derived_fields: Vec<DerivedFieldConfig>,
}

impl LokiOptions {
    /// Configured row limit; missing, zero or unparsable values fall back to the default.
    pub fn max_lines(&self) -> u64 {
        let configured = match &self.max_lines {
            Some(MaxLinesSetting::Number(lines)) => *lines,
            Some(MaxLinesSetting::Text(text)) => text.trim().parse().unwrap_or(0),
            None => 0,
        };
        if configured == 0 {
            DEFAULT_MAX_LINES
        } else {
            configured
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasourceSettings {
    pub uid: String,
    #[serde(default)]
    pub name: String,
    /// Base URL of the Loki API, e.g. `http://localhost:3100`.
    pub url: String,
    #[serde(default)]
    pub json_data: LokiOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureToggles {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub query_splitting: bool,
}

fn default_split_duration() -> String {
    DEFAULT_SPLIT_DURATION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    pub settings: DatasourceSettings,
    #[serde(default)]
    pub features: FeatureToggles,
    #[serde(default = "default_split_duration")]
    pub split_duration: String,
    #[serde(default)]
    pub zero_stats: ZeroStatsPolicy,
}

impl OrchestratorConfig {
    pub fn new(settings: DatasourceSettings) -> Self {
        Self {
            settings,
            features: FeatureToggles::default(),
            split_duration: default_split_duration(),
            zero_stats: ZeroStatsPolicy::default(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, DatasourceError> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|err| DatasourceError::Config(format!("invalid configuration: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DatasourceError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            DatasourceError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<(), DatasourceError> {
        if self.settings.url.trim().is_empty() {
            return Err(DatasourceError::Config("datasource url must not be empty".into()));
        }
        url::Url::parse(&self.settings.url).map_err(|err| {
            DatasourceError::Config(format!("invalid datasource url {}: {err}", self.settings.url))
        })?;
        self.split_duration_ms()?;
        Ok(())
    }

    pub fn split_duration_ms(&self) -> Result<i64, DatasourceError> {
        let duration = DurationValue::parse_literal(&self.split_duration)
            .map_err(|err| DatasourceError::Config(format!("invalid split duration: {err}")))?;
        let ms = duration.as_millis();
        if ms <= 0 {
            return Err(DatasourceError::Config(
                "split duration must be positive".into(),
            ));
        }
        Ok(ms)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn loads_minimal_config_with_defaults() {
        let config = OrchestratorConfig::from_json(
            r#"{"settings":{"uid":"loki","url":"http://localhost:3100"}}"#,
        )
        .unwrap();
        assert_eq!(config.settings.json_data.max_lines(), DEFAULT_MAX_LINES);
        assert_eq!(config.split_duration_ms().unwrap(), 86_400_000);
        assert_eq!(config.zero_stats, ZeroStatsPolicy::Unavailable);
        assert!(!config.features.streaming);
    }

    #[test]
    fn max_lines_accepts_strings_and_numbers() {
        let options: LokiOptions = serde_json::from_str(r#"{"maxLines":"250"}"#).unwrap();
        assert_eq!(options.max_lines(), 250);
        let options: LokiOptions = serde_json::from_str(r#"{"maxLines":40}"#).unwrap();
        assert_eq!(options.max_lines(), 40);
        let options: LokiOptions = serde_json::from_str(r#"{"maxLines":"lots"}"#).unwrap();
        assert_eq!(options.max_lines(), DEFAULT_MAX_LINES);
    }

    #[test]
    fn parses_derived_fields() {
        let options: LokiOptions = serde_json::from_str(
            r#"{"derivedFields":[{"name":"traceID","matcherRegex":"traceID=(\\w+)","url":"http://t/${__value.raw}"},{"name":"pod","matcherRegex":"pod","matcherType":"label"}]}"#,
        )
        .unwrap();
        assert_eq!(options.derived_fields.len(), 2);
        assert_eq!(options.derived_fields[0].matcher_type, DerivedFieldMatcher::Regex);
        assert_eq!(options.derived_fields[1].matcher_type, DerivedFieldMatcher::Label);
    }

    #[test]
    fn rejects_bad_urls_and_durations() {
        assert!(
            OrchestratorConfig::from_json(r#"{"settings":{"uid":"x","url":""}}"#).is_err()
        );
        assert!(
            OrchestratorConfig::from_json(
                r#"{"settings":{"uid":"x","url":"http://l"},"splitDuration":"soon"}"#
            )
            .is_err()
        );
    }
}
