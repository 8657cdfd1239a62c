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

//! Value escaping for template interpolation and selector editing.
//!
//! The interpolation escapes (`plain_escape`, `regex_escape`) and the selector
//! escapes (`escape_label_value_in_*`) are different algorithms and must not be
//! swapped for one another.

use crate::interpolate::{Variable, VariableValue};

const LOKI_REGEX_METACHARACTERS: &[char] = &[
    '$', '^', '*', '{', '}', '[', ']', '+', '?', '.', '(', ')', '|',
];

const RE2_METACHARACTERS: &[char] = &[
    '*', '+', '?', '(', ')', '|', '\\', '.', '[', ']', '{', '}', '^', '$',
];

/// Escapes single quotes only.
pub fn plain_escape(value: &str) -> String {
    value.replace('\'', "\\\\'")
}

/// Escapes backslashes and regex metacharacters, then applies [`plain_escape`].
pub fn regex_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 2);
    for ch in value.chars() {
        if ch == '\\' {
            out.push_str("\\\\\\\\");
        } else if LOKI_REGEX_METACHARACTERS.contains(&ch) {
            out.push_str("\\\\");
            out.push(ch);
        } else {
            out.push(ch);
        }
    }
    plain_escape(&out)
}

/// Escape callback used when interpolating variables into a query expression.
///
/// Single-value variables only get their quotes escaped. Multi-value and
/// include-all variables always render as a regex alternation.
pub fn interpolate_query_expr(value: &VariableValue, variable: &Variable) -> String {
    if !variable.multi && !variable.include_all {
        return match value {
            VariableValue::Single(value) => plain_escape(value),
            VariableValue::Multi(values) => values
                .iter()
                .map(|value| plain_escape(value))
                .collect::<Vec<_>>()
                .join(","),
        };
    }
    match value {
        VariableValue::Single(value) => regex_escape(value),
        VariableValue::Multi(values) => values
            .iter()
            .map(|value| regex_escape(value))
            .collect::<Vec<_>>()
            .join("|"),
    }
}

pub fn is_regex_selector(op: &str) -> bool {
    op.contains("=~") || op.contains("!~")
}

pub fn escape_label_value_in_exact_selector(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}

pub fn escape_label_value_in_regex_selector(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() * 2);
    for ch in value.chars() {
        if RE2_METACHARACTERS.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escape_label_value_in_exact_selector(&escaped)
}

/// Picks the selector escape matching `op`; a missing operator means equality.
pub fn escape_label_value_in_selector(value: &str, op: Option<&str>) -> String {
    match op {
        Some(op) if is_regex_selector(op) => escape_label_value_in_regex_selector(value),
        _ => escape_label_value_in_exact_selector(value),
    }
}

pub fn unescape_label_value(value: &str) -> String {
    value
        .replace("\\n", "\n")
        .replace("\\\"", "\"")
        .replace("\\\\", "\\")
}
