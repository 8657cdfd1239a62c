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

use serde::{Deserialize, Serialize};

/// Half-open byte range `[from, to)` into the expression text it was computed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodePosition {
    pub from: usize,
    pub to: usize,
}

impl NodePosition {
    pub fn new(from: usize, to: usize) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, other: &NodePosition) -> bool {
        self.from <= other.from && other.to <= self.to
    }

    pub fn text<'a>(&self, expr: &'a str) -> &'a str {
        expr.get(self.from..self.to).unwrap_or("")
    }
}

#[derive(Debug, Clone)]
pub enum QueryAst {
    Log(LogExpr),
    Metric(MetricExpr),
}

impl QueryAst {
    pub fn is_logs_query(&self) -> bool {
        matches!(self, QueryAst::Log(_))
    }

    /// Every log expression in source order.
    pub fn log_exprs(&self) -> Vec<&LogExpr> {
        let mut out = Vec::new();
        match self {
            QueryAst::Log(expr) => out.push(expr),
            QueryAst::Metric(expr) => expr.collect_log_exprs(&mut out),
        }
        out
    }

    /// Range windows (`[5m]`, `[$__auto]`) in source order.
    pub fn range_windows(&self) -> Vec<&RangeWindow> {
        let mut out = Vec::new();
        if let QueryAst::Metric(expr) = self {
            expr.collect_ranges(&mut out);
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct LogExpr {
    pub position: NodePosition,
    pub selector: Selector,
    pub stages: Vec<PipelineStage>,
}

impl LogExpr {
    pub fn parsers(&self) -> impl Iterator<Item = &PipelineStage> {
        self.stages
            .iter()
            .filter(|stage| matches!(stage.kind, StageKind::Parser(_)))
    }

    pub fn label_filters(&self) -> impl Iterator<Item = &PipelineStage> {
        self.stages
            .iter()
            .filter(|stage| matches!(stage.kind, StageKind::LabelFilter(_)))
    }

    /// End positions of runs of consecutive line filters.
    pub fn line_filter_groups(&self) -> Vec<NodePosition> {
        let mut groups: Vec<NodePosition> = Vec::new();
        let mut previous_was_filter = false;
        for stage in &self.stages {
            let is_filter = matches!(stage.kind, StageKind::LineFilter(_));
            match (is_filter, previous_was_filter, groups.last_mut()) {
                (true, true, Some(group)) => group.to = stage.position.to,
                (true, _, _) => groups.push(stage.position),
                _ => {}
            }
            previous_was_filter = is_filter;
        }
        groups
    }
}

#[derive(Debug, Clone)]
pub struct Selector {
    pub position: NodePosition,
    pub matchers: Vec<Matcher>,
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub position: NodePosition,
    pub key: String,
    pub op: LabelOp,
    pub value: LabelValue,
    pub value_position: NodePosition,
}

impl Matcher {
    /// Literal string value, `None` for bare numbers, durations and sizes.
    pub fn string_value(&self) -> Option<&str> {
        match &self.value {
            LabelValue::String(value) => Some(value),
            LabelValue::Raw(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LabelValue {
    String(String),
    Raw(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LabelOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "=~")]
    RegexEq,
    #[serde(rename = "!~")]
    RegexNotEq,
    #[serde(rename = "==")]
    EqEq,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
}

impl LabelOp {
    pub fn as_str(self) -> &'static str {
        match self {
            LabelOp::Eq => "=",
            LabelOp::NotEq => "!=",
            LabelOp::RegexEq => "=~",
            LabelOp::RegexNotEq => "!~",
            LabelOp::EqEq => "==",
            LabelOp::Gt => ">",
            LabelOp::Gte => ">=",
            LabelOp::Lt => "<",
            LabelOp::Lte => "<=",
        }
    }

    pub fn parse(op: &str) -> Option<Self> {
        let op = match op {
            "=" => LabelOp::Eq,
            "!=" => LabelOp::NotEq,
            "=~" => LabelOp::RegexEq,
            "!~" => LabelOp::RegexNotEq,
            "==" => LabelOp::EqEq,
            ">" => LabelOp::Gt,
            ">=" => LabelOp::Gte,
            "<" => LabelOp::Lt,
            "<=" => LabelOp::Lte,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_regex(self) -> bool {
        matches!(self, LabelOp::RegexEq | LabelOp::RegexNotEq)
    }
}

impl Display for LabelOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStage {
    pub position: NodePosition,
    pub kind: StageKind,
}

#[derive(Debug, Clone)]
pub enum StageKind {
    LineFilter(LineFilter),
    Parser(ParserStage),
    LabelFilter(Vec<Matcher>),
    LabelFormat,
    LineFormat,
    Drop,
    Keep,
    Decolorize,
    Unwrap,
}

#[derive(Debug, Clone)]
pub struct LineFilter {
    pub op: LineFilterOp,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFilterOp {
    Contains,
    NotContains,
    Regex,
    NotRegex,
    Pattern,
    NotPattern,
}

impl LineFilterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            LineFilterOp::Contains => "|=",
            LineFilterOp::NotContains => "!=",
            LineFilterOp::Regex => "|~",
            LineFilterOp::NotRegex => "!~",
            LineFilterOp::Pattern => "|>",
            LineFilterOp::NotPattern => "!>",
        }
    }
}

impl Display for LineFilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ParserStage {
    pub kind: ParserKind,
    pub params: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    Json,
    Logfmt,
    Unpack,
    Pattern,
    Regexp,
}

#[derive(Debug, Clone)]
pub struct RangeWindow {
    pub position: NodePosition,
    pub text: String,
    /// Set when the window is a literal duration rather than a template token.
    pub duration: Option<NodePosition>,
}

#[derive(Debug, Clone)]
pub struct Grouping {
    pub without: bool,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum MetricExpr {
    RangeAggregation {
        position: NodePosition,
        function: String,
        log: LogExpr,
        range: RangeWindow,
        grouping: Option<Grouping>,
    },
    VectorAggregation {
        position: NodePosition,
        op: String,
        grouping: Option<Grouping>,
        inner: Box<MetricExpr>,
    },
    Binary {
        position: NodePosition,
        op: String,
        lhs: Box<MetricExpr>,
        rhs: Box<MetricExpr>,
    },
    LabelReplace {
        position: NodePosition,
        inner: Box<MetricExpr>,
    },
    Paren {
        position: NodePosition,
        inner: Box<MetricExpr>,
    },
    Vector {
        position: NodePosition,
        value: f64,
    },
    Literal {
        position: NodePosition,
        value: f64,
    },
}

impl MetricExpr {
    pub fn position(&self) -> NodePosition {
        match self {
            MetricExpr::RangeAggregation { position, .. }
            | MetricExpr::VectorAggregation { position, .. }
            | MetricExpr::Binary { position, .. }
            | MetricExpr::LabelReplace { position, .. }
            | MetricExpr::Paren { position, .. }
            | MetricExpr::Vector { position, .. }
            | MetricExpr::Literal { position, .. } => *position,
        }
    }

    fn collect_log_exprs<'a>(&'a self, out: &mut Vec<&'a LogExpr>) {
        match self {
            MetricExpr::RangeAggregation { log, .. } => out.push(log),
            MetricExpr::VectorAggregation { inner, .. }
            | MetricExpr::LabelReplace { inner, .. }
            | MetricExpr::Paren { inner, .. } => inner.collect_log_exprs(out),
            MetricExpr::Binary { lhs, rhs, .. } => {
                lhs.collect_log_exprs(out);
                rhs.collect_log_exprs(out);
            }
            MetricExpr::Vector { .. } | MetricExpr::Literal { .. } => {}
        }
    }

    fn collect_ranges<'a>(&'a self, out: &mut Vec<&'a RangeWindow>) {
        match self {
            MetricExpr::RangeAggregation { range, .. } => out.push(range),
            MetricExpr::VectorAggregation { inner, .. }
            | MetricExpr::LabelReplace { inner, .. }
            | MetricExpr::Paren { inner, .. } => inner.collect_ranges(out),
            MetricExpr::Binary { lhs, rhs, .. } => {
                lhs.collect_ranges(out);
                rhs.collect_ranges(out);
            }
            MetricExpr::Vector { .. } | MetricExpr::Literal { .. } => {}
        }
    }
}
