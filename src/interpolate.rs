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

//! Template variable substitution.

use std::{
    collections::BTreeMap,
    sync::LazyLock,
};

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// Interval and range macros resolved by the backend, never by the expression path.
pub const BUILTIN_INTERVAL_VARS: &[&str] = &[
    "__auto",
    "__interval",
    "__interval_ms",
    "__range",
    "__range_s",
    "__range_ms",
];

static VARIABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\$(\w+)|\[\[(\w+?)(?::(\w+))?\]\]|\$\{(\w+)(?:\.([^:^\}]+))?(?::([^\}]+))?\}",
    )
    .expect("variable pattern is valid")
});

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"__V_(\d)__(.+?)__V__(?:__F__(\w+)__F__)?").expect("placeholder pattern is valid")
});

static LEGEND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("legend pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableValue {
    Single(String),
    Multi(Vec<String>),
}

impl VariableValue {
    fn values(&self) -> Vec<&str> {
        match self {
            VariableValue::Single(value) => vec![value.as_str()],
            VariableValue::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub value: VariableValue,
    #[serde(default)]
    pub multi: bool,
    #[serde(default)]
    pub include_all: bool,
}

impl Variable {
    pub fn single(value: impl Into<String>) -> Self {
        Self {
            value: VariableValue::Single(value.into()),
            multi: false,
            include_all: false,
        }
    }

    pub fn multi(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            value: VariableValue::Multi(values.into_iter().map(Into::into).collect()),
            multi: true,
            include_all: false,
        }
    }
}

pub type ScopedVars = BTreeMap<String, Variable>;

/// Escape applied to each substituted value when no explicit `:format` is given.
pub type EscapeFn = fn(&VariableValue, &Variable) -> String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdHocFilter {
    pub key: String,
    pub operator: String,
    pub value: String,
}

/// Dashboard variables and ad-hoc filters, captured once at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSrv {
    #[serde(default)]
    variables: Vec<(String, Variable)>,
    #[serde(default)]
    ad_hoc_filters: Vec<AdHocFilter>,
}

impl TemplateSrv {
    pub fn new(variables: Vec<(String, Variable)>, ad_hoc_filters: Vec<AdHocFilter>) -> Self {
        Self {
            variables,
            ad_hoc_filters,
        }
    }

    pub fn variable_names(&self) -> impl Iterator<Item = &str> {
        self.variables.iter().map(|(name, _)| name.as_str())
    }

    pub fn ad_hoc_filters(&self) -> &[AdHocFilter] {
        &self.ad_hoc_filters
    }

    fn lookup<'a>(&'a self, name: &str, scoped: &'a ScopedVars) -> Option<&'a Variable> {
        scoped.get(name).or_else(|| {
            self.variables
                .iter()
                .find(|(candidate, _)| candidate == name)
                .map(|(_, variable)| variable)
        })
    }

    /// Substitutes `$name`, `${name}`, `${name:format}` and `[[name]]`.
    /// Unknown names are left as written.
    pub fn replace(&self, text: &str, scoped: &ScopedVars, escape: Option<EscapeFn>) -> String {
        VARIABLE_RE
            .replace_all(text, |caps: &Captures<'_>| {
                let Some(name) = caps.get(1).or(caps.get(2)).or(caps.get(4)) else {
                    return caps[0].to_string();
                };
                let Some(variable) = self.lookup(name.as_str(), scoped) else {
                    return caps[0].to_string();
                };
                let format = caps.get(3).or(caps.get(6)).map(|m| m.as_str());
                match (format, escape) {
                    (Some(format), _) => format_value(&variable.value, format),
                    (None, Some(escape)) => escape(&variable.value, variable),
                    (None, None) => format_value(&variable.value, "glob"),
                }
            })
            .into_owned()
    }
}

fn format_value(value: &VariableValue, format: &str) -> String {
    let values = value.values();
    if let VariableValue::Single(value) = value
        && !matches!(format, "json" | "regex")
    {
        return value.clone();
    }
    match format {
        "csv" => values.join(","),
        "pipe" => values.join("|"),
        "text" => values.join(" + "),
        "json" => serde_json::to_string(&values).unwrap_or_default(),
        "regex" => {
            let escaped: Vec<String> = values.iter().map(|value| regex::escape(value)).collect();
            if escaped.len() == 1 {
                escaped.join("")
            } else {
                format!("({})", escaped.join("|"))
            }
        }
        "singlequote" => values
            .iter()
            .map(|value| format!("'{}'", value.replace('\'', "\\'")))
            .collect::<Vec<_>>()
            .join(","),
        "doublequote" => values
            .iter()
            .map(|value| format!("\"{}\"", value.replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(","),
        "raw" => values.join(","),
        _ => format!("{{{}}}", values.join(",")),
    }
}

/// Copy of `scoped` without the interval and range macros.
pub fn strip_builtin_interval_vars(scoped: &ScopedVars) -> ScopedVars {
    scoped
        .iter()
        .filter(|(name, _)| !BUILTIN_INTERVAL_VARS.contains(&name.as_str()))
        .map(|(name, variable)| (name.clone(), variable.clone()))
        .collect()
}

/// Stand-in values that make interval and range macros parseable.
pub fn placeholder_scoped_vars() -> ScopedVars {
    [
        ("__interval", "1s"),
        ("__rate_interval", "1s"),
        ("__auto", "1s"),
        ("__interval_ms", "1000"),
        ("__range_ms", "1000"),
        ("__range_s", "1"),
        ("__range", "1s"),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_string(), Variable::single(value)))
    .collect()
}

/// Rewrites every variable reference into an identifier-safe placeholder so
/// the expression can be parsed. [`return_variables`] restores them.
pub fn replace_variables(expr: &str) -> String {
    VARIABLE_RE
        .replace_all(expr, |caps: &Captures<'_>| {
            let (kind, name) = if let Some(name) = caps.get(2) {
                (1, name.as_str())
            } else if let Some(name) = caps.get(4) {
                (2, name.as_str())
            } else {
                (0, caps.get(1).map(|m| m.as_str()).unwrap_or_default())
            };
            let format = caps
                .get(3)
                .or(caps.get(6))
                .map(|m| format!("__F__{}__F__", m.as_str()))
                .unwrap_or_default();
            format!("__V_{kind}__{name}__V__{format}")
        })
        .into_owned()
}

pub fn return_variables(expr: &str) -> String {
    PLACEHOLDER_RE
        .replace_all(expr, |caps: &Captures<'_>| {
            let name = &caps[2];
            let format = caps.get(3).map(|m| m.as_str());
            match (&caps[1], format) {
                ("1", Some(format)) => format!("[[{name}:{format}]]"),
                ("1", None) => format!("[[{name}]]"),
                ("2", Some(format)) => format!("${{{name}:{format}}}"),
                ("2", None) => format!("${{{name}}}"),
                _ => format!("${name}"),
            }
        })
        .into_owned()
}

/// Renders `{{label}}` references against a label set; missing labels render empty.
pub fn render_legend_format(format: &str, labels: &BTreeMap<String, String>) -> String {
    LEGEND_RE
        .replace_all(format, |caps: &Captures<'_>| {
            labels.get(&caps[1]).cloned().unwrap_or_default()
        })
        .into_owned()
}
