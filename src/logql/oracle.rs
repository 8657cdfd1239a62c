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

use super::{LabelOp, LabelValue, LogExpr, LogqlParser, NodePosition, QueryAst, StageKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    LogExpr,
    Selector,
    Matcher,
    /// Runs of consecutive line filters.
    LineFilter,
    Parser,
    LabelFilter,
    /// Literal durations inside range windows.
    Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub is_logs_query: bool,
}

/// A string-valued `key op "value"` matcher, inside a selector or a label filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatcherNode {
    pub position: NodePosition,
    pub key: String,
    pub op: LabelOp,
    /// Literal as written, quotes included.
    pub raw_value: String,
    pub scope: MatcherScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatcherScope {
    Selector(NodePosition),
    /// `sole` is set when the matcher is the only one in its pipeline stage.
    LabelFilter { stage: NodePosition, sole: bool },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClausePositions {
    pub parsers: Vec<NodePosition>,
    pub label_filters: Vec<NodePosition>,
    pub line_filters: Vec<NodePosition>,
}

/// Source of structural facts about a query string. Positions are only valid
/// for the exact text passed in.
pub trait AstOracle: Send + Sync {
    fn find_nodes(&self, expr: &str, kind: NodeKind) -> Vec<NodePosition>;

    fn classify(&self, expr: &str) -> Classification;

    fn matchers(&self, expr: &str) -> Vec<MatcherNode>;

    fn clause_positions(&self, expr: &str) -> ClausePositions {
        ClausePositions {
            parsers: self.find_nodes(expr, NodeKind::Parser),
            label_filters: self.find_nodes(expr, NodeKind::LabelFilter),
            line_filters: self.find_nodes(expr, NodeKind::LineFilter),
        }
    }
}

impl AstOracle for LogqlParser {
    fn find_nodes(&self, expr: &str, kind: NodeKind) -> Vec<NodePosition> {
        match self.parse(expr) {
            Ok(ast) => nodes_of_kind(&ast, kind),
            Err(_) => Vec::new(),
        }
    }

    fn classify(&self, expr: &str) -> Classification {
        let is_logs_query = match self.parse(expr) {
            Ok(ast) => ast.is_logs_query(),
            Err(_) => expr.trim_start().starts_with('{'),
        };
        Classification { is_logs_query }
    }

    fn matchers(&self, expr: &str) -> Vec<MatcherNode> {
        let Ok(ast) = self.parse(expr) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for log in ast.log_exprs() {
            let selector = MatcherScope::Selector(log.selector.position);
            for matcher in &log.selector.matchers {
                out.push(matcher_node(expr, matcher, selector));
            }
            for stage in &log.stages {
                if let StageKind::LabelFilter(matchers) = &stage.kind {
                    let scope = MatcherScope::LabelFilter {
                        stage: stage.position,
                        sole: matchers.len() == 1,
                    };
                    out.extend(
                        matchers
                            .iter()
                            .filter(|m| matches!(m.value, LabelValue::String(_)))
                            .map(|m| matcher_node(expr, m, scope)),
                    );
                }
            }
        }
        out
    }
}

fn matcher_node(expr: &str, matcher: &super::Matcher, scope: MatcherScope) -> MatcherNode {
    MatcherNode {
        position: matcher.position,
        key: matcher.key.clone(),
        op: matcher.op,
        raw_value: matcher.value_position.text(expr).to_string(),
        scope,
    }
}

fn nodes_of_kind(ast: &QueryAst, kind: NodeKind) -> Vec<NodePosition> {
    if kind == NodeKind::Duration {
        return ast
            .range_windows()
            .into_iter()
            .filter_map(|range| range.duration)
            .collect();
    }
    ast.log_exprs()
        .into_iter()
        .flat_map(|log| log_nodes(log, kind))
        .collect()
}

fn log_nodes(log: &LogExpr, kind: NodeKind) -> Vec<NodePosition> {
    match kind {
        NodeKind::LogExpr => vec![log.position],
        NodeKind::Selector => vec![log.selector.position],
        NodeKind::Matcher => {
            let mut out: Vec<NodePosition> =
                log.selector.matchers.iter().map(|m| m.position).collect();
            for stage in &log.stages {
                if let StageKind::LabelFilter(matchers) = &stage.kind {
                    out.extend(matchers.iter().map(|m| m.position));
                }
            }
            out
        }
        NodeKind::LineFilter => log.line_filter_groups(),
        NodeKind::Parser => log.parsers().map(|stage| stage.position).collect(),
        NodeKind::LabelFilter => log.label_filters().map(|stage| stage.position).collect(),
        NodeKind::Duration => Vec::new(),
    }
}

pub fn is_logs_query(expr: &str) -> bool {
    LogqlParser.classify(expr).is_logs_query
}

pub fn is_query_with_error(expr: &str) -> bool {
    LogqlParser.parse(expr).is_err()
}

/// Texts of all stream selectors in source order.
pub fn stream_selectors(expr: &str) -> Vec<String> {
    LogqlParser
        .find_nodes(expr, NodeKind::Selector)
        .iter()
        .map(|position| position.text(expr).to_string())
        .collect()
}

/// The first log-selecting sub-expression of a metric query. Logs queries are
/// returned as-is and unparsable input yields an empty string.
pub fn log_query_from_metrics_query(expr: &str) -> String {
    let Ok(ast) = LogqlParser.parse(expr) else {
        return String::new();
    };
    match &ast {
        QueryAst::Log(_) => expr.to_string(),
        QueryAst::Metric(_) => ast
            .log_exprs()
            .first()
            .map(|log| log_expr_text(expr, log))
            .unwrap_or_default(),
    }
}

fn log_expr_text(expr: &str, log: &LogExpr) -> String {
    let selector = log.selector.position.text(expr);
    match (log.stages.first(), log.stages.last()) {
        (Some(first), Some(last)) => format!(
            "{selector} {}",
            NodePosition::new(first.position.from, last.position.to).text(expr)
        ),
        _ => selector.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_logs_and_metrics() {
        assert!(is_logs_query("{job=\"grafana\"} |= \"x\""));
        assert!(!is_logs_query("rate({job=\"grafana\"}[5m])"));
        // unparsable text falls back to the leading brace
        assert!(is_logs_query("{job=\"grafana\""));
        assert!(!is_logs_query("rate({job="));
    }

    #[test]
    fn finds_durations_only_for_literals() {
        let expr = "sum(rate({a=\"b\"}[5m])) + sum(rate({c=\"d\"}[$__interval]))";
        let durations = LogqlParser.find_nodes(expr, NodeKind::Duration);
        assert_eq!(durations.len(), 1);
        assert_eq!(durations[0].text(expr), "5m");
    }

    #[test]
    fn reports_clause_positions() {
        let expr = "{a=\"b\"} |= \"x\" | json | level=\"error\"";
        let clauses = LogqlParser.clause_positions(expr);
        assert_eq!(clauses.parsers.len(), 1);
        assert_eq!(clauses.parsers[0].text(expr), "| json");
        assert_eq!(clauses.label_filters[0].text(expr), "| level=\"error\"");
        assert_eq!(clauses.line_filters[0].text(expr), "|= \"x\"");
    }

    #[test]
    fn reports_matchers_with_scope() {
        let expr = "{a=\"b\", c=~`d.*`} | json | level=\"error\" and status>500";
        let matchers = LogqlParser.matchers(expr);
        assert_eq!(matchers.len(), 3);
        assert_eq!(matchers[1].raw_value, "`d.*`");
        assert!(matches!(matchers[0].scope, MatcherScope::Selector(_)));
        assert!(matches!(
            matchers[2].scope,
            MatcherScope::LabelFilter { sole: false, .. }
        ));
    }

    #[test]
    fn groups_consecutive_line_filters() {
        let expr = "{a=\"b\"} |= \"x\" != \"y\" | json |~ \"z\"";
        let groups = LogqlParser.find_nodes(expr, NodeKind::LineFilter);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].text(expr), "|= \"x\" != \"y\"");
    }

    #[test]
    fn invalid_query_reports_no_nodes() {
        assert!(LogqlParser.find_nodes("{a=", NodeKind::Selector).is_empty());
        assert!(is_query_with_error("{a="));
        assert!(!is_query_with_error("{a=\"b\"}"));
    }

    #[test]
    fn extracts_stream_selectors() {
        assert_eq!(
            stream_selectors("sum(rate({a=\"b\"}[1m])) / sum(rate({c=~\"d|e\"}[1m]))"),
            vec!["{a=\"b\"}".to_string(), "{c=~\"d|e\"}".to_string()]
        );
    }

    #[test]
    fn log_query_from_metrics() {
        assert_eq!(
            log_query_from_metrics_query(
                "count_over_time({job=\"grafana\"} | logfmt | label=\"value\" [1m])"
            ),
            "{job=\"grafana\"} | logfmt | label=\"value\""
        );
        assert_eq!(
            log_query_from_metrics_query("sum(rate({a=\"b\"}[1m]))"),
            "{a=\"b\"}"
        );
        assert_eq!(log_query_from_metrics_query("{a=\"b\"}"), "{a=\"b\"}");
        assert_eq!(log_query_from_metrics_query("rate("), "");
    }
}
