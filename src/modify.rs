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

//! Position based editing of LogQL expressions.
//!
//! Every operation asks the oracle for fresh positions on the text it is about
//! to change. Positions are never carried across an edit.

use serde::{Deserialize, Serialize};

use crate::{
    escape::{escape_label_value_in_selector, unescape_label_value},
    logql::{
        AstOracle, LabelOp, LineFilterOp, LogqlParser, MatcherNode, MatcherScope, NodeKind,
        NodePosition,
    },
};

static DEFAULT_ORACLE: LogqlParser = LogqlParser;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFilter {
    pub key: String,
    pub operator: LabelOp,
    pub value: String,
}

impl LabelFilter {
    pub fn new(key: impl Into<String>, operator: LabelOp, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToggleFilterKind {
    FilterFor,
    FilterOut,
}

#[derive(Clone, Copy)]
pub struct ExpressionEditor<'o> {
    oracle: &'o dyn AstOracle,
}

impl Default for ExpressionEditor<'static> {
    fn default() -> Self {
        Self {
            oracle: &DEFAULT_ORACLE,
        }
    }
}

impl<'o> ExpressionEditor<'o> {
    pub fn new(oracle: &'o dyn AstOracle) -> Self {
        Self { oracle }
    }

    /// Adds `filter` to the query.
    ///
    /// Forced filters become label filters after the last parser or label
    /// filter of every log expression. Otherwise the filter becomes a label
    /// filter only when every selector already has matchers and the query has
    /// a parser or label filter; in all other cases it is added to every
    /// stream selector.
    pub fn add_label_to_query(
        &self,
        expr: &str,
        filter: &LabelFilter,
        force_as_label_filter: bool,
    ) -> String {
        let selectors = self.oracle.find_nodes(expr, NodeKind::Selector);
        if selectors.is_empty() {
            return expr.to_string();
        }
        let clauses = self.oracle.clause_positions(expr);
        let anchors: Vec<NodePosition> = clauses
            .parsers
            .iter()
            .chain(&clauses.label_filters)
            .copied()
            .collect();
        if force_as_label_filter {
            let positions = self.last_position_per_expression(expr, &anchors);
            return add_filter_as_label_filter(expr, &positions, filter);
        }
        let matchers = self.oracle.matchers(expr);
        let every_selector_has_matcher = selectors.iter().all(|selector| {
            matchers
                .iter()
                .any(|matcher| matcher.scope == MatcherScope::Selector(*selector))
        });
        if every_selector_has_matcher && let Some(last) = find_last_position(&anchors) {
            return add_filter_as_label_filter(expr, &[last], filter);
        }
        add_filter_to_stream_selectors(expr, &selectors, &matchers, filter)
    }

    fn last_position_per_expression(
        &self,
        expr: &str,
        anchors: &[NodePosition],
    ) -> Vec<NodePosition> {
        let selectors = self.oracle.find_nodes(expr, NodeKind::Selector);
        self.oracle
            .find_nodes(expr, NodeKind::LogExpr)
            .into_iter()
            .filter_map(|log| {
                let inside: Vec<NodePosition> = anchors
                    .iter()
                    .filter(|anchor| log.contains(anchor))
                    .copied()
                    .collect();
                find_last_position(&inside).or_else(|| {
                    selectors
                        .iter()
                        .find(|selector| log.contains(selector))
                        .copied()
                })
            })
            .collect()
    }

    /// Removes every string matcher equal to `filter`, re-reading positions
    /// after each removal. Matchers sharing a stage with other matchers stay.
    pub fn remove_label_from_query(&self, expr: &str, filter: &LabelFilter) -> String {
        let mut current = expr.to_string();
        'edits: loop {
            for node in self.matching_matchers(&current, filter) {
                let next = match node.scope {
                    MatcherScope::LabelFilter { stage, sole: true } => {
                        format!(
                            "{}{}",
                            current[..stage.from].trim_end(),
                            &current[stage.to..]
                        )
                        .trim()
                        .to_string()
                    }
                    MatcherScope::LabelFilter { sole: false, .. } => continue,
                    MatcherScope::Selector(selector) => {
                        self.render_selector_without(&current, selector, filter)
                    }
                };
                if next != current {
                    current = next;
                    continue 'edits;
                }
            }
            return current;
        }
    }

    /// Re-renders `selector` without the matchers equal to `filter`. Other
    /// matchers on the same key keep their place.
    fn render_selector_without(
        &self,
        expr: &str,
        selector: NodePosition,
        filter: &LabelFilter,
    ) -> String {
        let wanted = unescape_label_value(&filter.value);
        let kept: Vec<String> = self
            .oracle
            .matchers(expr)
            .iter()
            .filter(|matcher| matcher.scope == MatcherScope::Selector(selector))
            .filter(|matcher| !matcher_equals(matcher, filter, &wanted))
            .map(render_matcher)
            .collect();
        splice(expr, selector, &format!("{{{}}}", kept.join(", ")))
    }

    pub fn query_has_filter(&self, expr: &str, filter: &LabelFilter) -> bool {
        !self.matching_matchers(expr, filter).is_empty()
    }

    fn matching_matchers(&self, expr: &str, filter: &LabelFilter) -> Vec<MatcherNode> {
        let wanted = unescape_label_value(&filter.value);
        self.oracle
            .matchers(expr)
            .into_iter()
            .filter(|matcher| matcher_equals(matcher, filter, &wanted))
            .collect()
    }

    /// `FilterFor` flips an equality filter on and off. `FilterOut` drops a
    /// matching equality filter before adding the negated one.
    pub fn toggle_label_filter(
        &self,
        expr: &str,
        key: &str,
        value: &str,
        kind: ToggleFilterKind,
    ) -> String {
        let value = escape_label_value_in_selector(value, None);
        let positive = LabelFilter::new(key, LabelOp::Eq, value.clone());
        match kind {
            ToggleFilterKind::FilterFor => {
                if self.query_has_filter(expr, &positive) {
                    self.remove_label_from_query(expr, &positive)
                } else {
                    self.add_label_to_query(expr, &positive, false)
                }
            }
            ToggleFilterKind::FilterOut => {
                let mut expr = expr.to_string();
                if self.query_has_filter(&expr, &positive) {
                    expr = self.remove_label_from_query(&expr, &positive);
                }
                let negative = LabelFilter::new(key, LabelOp::NotEq, value);
                self.add_label_to_query(&expr, &negative, false)
            }
        }
    }

    /// Inserts ` | parser` after each run of line filters, or after each
    /// stream selector when there are none.
    pub fn add_parser_to_query(&self, expr: &str, parser: &str) -> String {
        let mut positions = self.oracle.find_nodes(expr, NodeKind::LineFilter);
        if positions.is_empty() {
            positions = self.oracle.find_nodes(expr, NodeKind::Selector);
        }
        insert_after(expr, &positions, &format!(" | {parser}"))
    }

    pub fn add_no_pipeline_error_to_query(&self, expr: &str) -> String {
        let parsers = self.oracle.find_nodes(expr, NodeKind::Parser);
        if parsers.is_empty() {
            return expr.to_string();
        }
        let filter = LabelFilter::new("__error__", LabelOp::Eq, "");
        add_filter_as_label_filter(expr, &parsers, &filter)
    }

    pub fn add_label_format_to_query(&self, expr: &str, original: &str, rename_to: &str) -> String {
        let positions = self.oracle.find_nodes(expr, NodeKind::LogExpr);
        insert_after(
            expr,
            &positions,
            &format!(" | label_format {rename_to}={original}"),
        )
    }

    /// Inserts `` op `value` `` right after the first stream selector.
    pub fn add_line_filter(&self, expr: &str, value: &str, op: LineFilterOp) -> String {
        let selectors = self.oracle.find_nodes(expr, NodeKind::Selector);
        match selectors.first() {
            Some(first) => insert_after(expr, &[*first], &format!(" {op} `{value}`")),
            None => expr.to_string(),
        }
    }

    pub fn last_clause_position(&self, expr: &str) -> Option<NodePosition> {
        let clauses = self.oracle.clause_positions(expr);
        let anchors: Vec<NodePosition> = clauses
            .parsers
            .into_iter()
            .chain(clauses.label_filters)
            .collect();
        find_last_position(&anchors)
    }
}

fn add_filter_to_stream_selectors(
    expr: &str,
    selectors: &[NodePosition],
    matchers: &[MatcherNode],
    filter: &LabelFilter,
) -> String {
    let mut out = expr.to_string();
    for selector in selectors.iter().rev() {
        let existing: Vec<&MatcherNode> = matchers
            .iter()
            .filter(|matcher| matcher.scope == MatcherScope::Selector(*selector))
            .collect();
        let mut rendered: Vec<String> = existing.iter().map(|m| render_matcher(m)).collect();
        let duplicate = existing.iter().any(|matcher| {
            matcher.key == filter.key
                && matcher.op == filter.operator
                && literal_inner(&matcher.raw_value) == filter.value
        });
        if !duplicate {
            rendered.push(format!(
                "{}{}\"{}\"",
                filter.key, filter.operator, filter.value
            ));
        }
        out = splice(&out, *selector, &format!("{{{}}}", rendered.join(", ")));
    }
    out
}

/// Inserts `` | key op `value` `` after each position. Numeric values with
/// `<` or `>` are written bare; other values are unescaped into backticks.
pub fn add_filter_as_label_filter(
    expr: &str,
    positions: &[NodePosition],
    filter: &LabelFilter,
) -> String {
    let rendered = match (filter.operator, numeric_value(&filter.value)) {
        (LabelOp::Lt | LabelOp::Gt, Some(number)) => {
            format!(" | {}{}{}", filter.key, filter.operator, number)
        }
        _ => format!(
            " | {}{}`{}`",
            filter.key,
            filter.operator,
            unescape_label_value(&filter.value)
        ),
    };
    insert_after(expr, positions, &rendered)
}

/// Position with the greatest end offset.
pub fn find_last_position(positions: &[NodePosition]) -> Option<NodePosition> {
    positions.iter().copied().max_by_key(|position| position.to)
}

/// Strips `#` comments that are outside string literals.
pub fn remove_comments_from_query(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len());
    let mut chars = expr.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(ch) = chars.next() {
        match quote {
            Some('"') if ch == '\\' => {
                out.push(ch);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                continue;
            }
            Some(open) if ch == open => quote = None,
            Some(_) => {}
            None if ch == '"' || ch == '`' => quote = Some(ch),
            None if ch == '#' => {
                while chars.next_if(|next| *next != '\n').is_some() {}
                continue;
            }
            None => {}
        }
        out.push(ch);
    }
    out
}

fn insert_after(expr: &str, positions: &[NodePosition], text: &str) -> String {
    let mut ends: Vec<usize> = positions.iter().map(|position| position.to).collect();
    ends.sort_unstable();
    let mut out = expr.to_string();
    for end in ends.into_iter().rev() {
        if end <= out.len() {
            out.insert_str(end, text);
        }
    }
    out
}

fn splice(expr: &str, position: NodePosition, replacement: &str) -> String {
    format!(
        "{}{}{}",
        &expr[..position.from],
        replacement,
        &expr[position.to..]
    )
}

fn render_matcher(matcher: &MatcherNode) -> String {
    format!("{}{}{}", matcher.key, matcher.op, matcher.raw_value)
}

fn matcher_equals(matcher: &MatcherNode, filter: &LabelFilter, wanted: &str) -> bool {
    matcher.key == filter.key
        && matcher.op == filter.operator
        && handle_quotes(&matcher.raw_value) == wanted
}

fn literal_inner(raw: &str) -> &str {
    raw.get(1..raw.len().saturating_sub(1)).unwrap_or("")
}

/// Literal value of a quoted matcher as the filter comparison sees it.
fn handle_quotes(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        return literal_inner(raw)
            .replace("\\\"", "\"")
            .replace("\\\\", "\\");
    }
    raw.replace('`', "")
}

fn numeric_value(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn editor() -> ExpressionEditor<'static> {
        ExpressionEditor::default()
    }

    fn eq(key: &str, value: &str) -> LabelFilter {
        LabelFilter::new(key, LabelOp::Eq, value)
    }

    #[test]
    fn adds_matcher_to_selector_without_pipeline() {
        assert_eq!(
            editor().add_label_to_query("{foo=\"bar\"}", &eq("baz", "42"), false),
            "{foo=\"bar\", baz=\"42\"}"
        );
        assert_eq!(
            editor().add_label_to_query("{}", &eq("baz", "42"), false),
            "{baz=\"42\"}"
        );
    }

    #[test]
    fn adds_matcher_to_every_selector() {
        assert_eq!(
            editor().add_label_to_query(
                "sum(rate({a=\"b\"}[1m])) / sum(rate({c=\"d\"}[1m]))",
                &eq("x", "y"),
                false
            ),
            "sum(rate({a=\"b\", x=\"y\"}[1m])) / sum(rate({c=\"d\", x=\"y\"}[1m]))"
        );
    }

    #[test]
    fn skips_duplicate_matcher() {
        assert_eq!(
            editor().add_label_to_query("{foo=\"bar\"}", &eq("foo", "bar"), false),
            "{foo=\"bar\"}"
        );
    }

    #[test]
    fn adds_label_filter_after_last_parser_or_filter() {
        assert_eq!(
            editor().add_label_to_query(
                "{foo=\"bar\"} | logfmt | x=\"y\" |= \"z\"",
                &eq("baz", "42"),
                false
            ),
            "{foo=\"bar\"} | logfmt | x=\"y\" | baz=`42` |= \"z\""
        );
    }

    #[test]
    fn forced_label_filter_goes_after_each_expression() {
        assert_eq!(
            editor().add_label_to_query(
                "sum(rate({a=\"b\"} | json [1m])) + sum(rate({c=\"d\"}[1m]))",
                &eq("x", "y"),
                true
            ),
            "sum(rate({a=\"b\"} | json | x=`y` [1m])) + sum(rate({c=\"d\"} | x=`y`[1m]))"
        );
    }

    #[test]
    fn unchanged_without_selector() {
        assert_eq!(
            editor().add_label_to_query("vector(1)", &eq("a", "b"), false),
            "vector(1)"
        );
        assert_eq!(editor().add_parser_to_query("vector(1)", "json"), "vector(1)");
    }

    #[test]
    fn numeric_comparison_is_bare() {
        let filter = LabelFilter::new("status", LabelOp::Gt, "500");
        assert_eq!(
            add_filter_as_label_filter(
                "{a=\"b\"} | json",
                &[NodePosition::new(8, 14)],
                &filter
            ),
            "{a=\"b\"} | json | status>500"
        );
        let filter = LabelFilter::new("name", LabelOp::Gt, "abc");
        assert_eq!(
            add_filter_as_label_filter("{a=\"b\"}", &[NodePosition::new(0, 7)], &filter),
            "{a=\"b\"} | name>`abc`"
        );
        let filter = LabelFilter::new("status", LabelOp::Gt, "");
        assert_eq!(
            add_filter_as_label_filter("{a=\"b\"}", &[NodePosition::new(0, 7)], &filter),
            "{a=\"b\"} | status>``"
        );
    }

    #[test]
    fn label_filter_value_is_unescaped_into_backticks() {
        let filter = eq("path", "C:\\\\tmp \\\"x\\\"");
        assert_eq!(
            add_filter_as_label_filter("{a=\"b\"}", &[NodePosition::new(0, 7)], &filter),
            "{a=\"b\"} | path=`C:\\tmp \"x\"`"
        );
    }

    #[test]
    fn has_add_remove_round_trip() {
        let ed = editor();
        for expr in [
            "{foo=\"bar\"}",
            "{foo=\"bar\"} | logfmt",
            "rate({foo=\"bar\"} | json [5m])",
        ] {
            let filter = eq("level", "error");
            assert!(!ed.query_has_filter(expr, &filter));
            let added = ed.add_label_to_query(expr, &filter, false);
            assert!(ed.query_has_filter(&added, &filter), "{added}");
            let removed = ed.remove_label_from_query(&added, &filter);
            assert!(!ed.query_has_filter(&removed, &filter));
            assert_eq!(removed, expr);
        }
    }

    #[test]
    fn removes_selector_matchers_by_key() {
        assert_eq!(
            editor().remove_label_from_query(
                "{foo=\"bar\", baz=\"42\"} |= \"x\"",
                &eq("baz", "42")
            ),
            "{foo=\"bar\"} |= \"x\""
        );
    }

    #[test]
    fn removes_only_the_matcher_equal_to_the_filter() {
        assert_eq!(
            editor().remove_label_from_query(
                "{a=\"1\", a!=\"2\"}",
                &LabelFilter::new("a", LabelOp::Eq, "1")
            ),
            "{a!=\"2\"}"
        );
        assert_eq!(
            editor().remove_label_from_query("{a=\"1\", b=\"2\"}", &eq("a", "3")),
            "{a=\"1\", b=\"2\"}"
        );
    }

    #[test]
    fn keeps_matchers_in_combined_label_filters() {
        let expr = "{foo=\"bar\"} | json | level=\"error\" or level=\"warn\"";
        assert_eq!(
            editor().remove_label_from_query(expr, &eq("level", "error")),
            expr
        );
    }

    #[test]
    fn removes_every_matching_stage() {
        assert_eq!(
            editor().remove_label_from_query(
                "{foo=\"bar\"} | json | a=\"b\" | logfmt | a=`b`",
                &eq("a", "b")
            ),
            "{foo=\"bar\"} | json | logfmt"
        );
    }

    #[test]
    fn has_filter_compares_unescaped_values() {
        let expr = "{path=\"C:\\\\tmp\"}";
        assert!(editor().query_has_filter(expr, &eq("path", "C:\\\\tmp")));
        assert!(!editor().query_has_filter(expr, &LabelFilter::new("path", LabelOp::NotEq, "C:\\\\tmp")));
    }

    #[test]
    fn toggle_twice_restores_the_query() {
        let ed = editor();
        for expr in ["{foo=\"bar\"}", "{foo=\"bar\"} | logfmt"] {
            let once = ed.toggle_label_filter(expr, "level", "info", ToggleFilterKind::FilterFor);
            assert_ne!(once, expr);
            let twice = ed.toggle_label_filter(&once, "level", "info", ToggleFilterKind::FilterFor);
            assert_eq!(twice, expr);
        }
    }

    #[test]
    fn toggle_keeps_other_values_of_the_same_key() {
        let ed = editor();
        let expr = "{level=\"warn\"}";
        let once = ed.toggle_label_filter(expr, "level", "info", ToggleFilterKind::FilterFor);
        assert_eq!(once, "{level=\"warn\", level=\"info\"}");
        let twice = ed.toggle_label_filter(&once, "level", "info", ToggleFilterKind::FilterFor);
        assert_eq!(twice, expr);
    }

    #[test]
    fn filter_out_replaces_positive_filter() {
        let ed = editor();
        let positive = ed.toggle_label_filter(
            "{foo=\"bar\"}",
            "level",
            "info",
            ToggleFilterKind::FilterFor,
        );
        assert_eq!(
            ed.toggle_label_filter(&positive, "level", "info", ToggleFilterKind::FilterOut),
            "{foo=\"bar\", level!=\"info\"}"
        );
    }

    #[test]
    fn toggle_escapes_values() {
        assert_eq!(
            editor().toggle_label_filter(
                "{foo=\"bar\"}",
                "msg",
                "say \"hi\"",
                ToggleFilterKind::FilterFor
            ),
            "{foo=\"bar\", msg=\"say \\\"hi\\\"\"}"
        );
    }

    #[test]
    fn adds_parser_after_line_filters_or_selector() {
        let ed = editor();
        assert_eq!(
            ed.add_parser_to_query("{foo=\"bar\"}", "logfmt"),
            "{foo=\"bar\"} | logfmt"
        );
        assert_eq!(
            ed.add_parser_to_query("{foo=\"bar\"} |= \"x\" != \"y\" | line_format \"{{.a}}\"", "json"),
            "{foo=\"bar\"} |= \"x\" != \"y\" | json | line_format \"{{.a}}\""
        );
        assert_eq!(
            ed.add_parser_to_query("rate({foo=\"bar\"}[5m])", "unpack"),
            "rate({foo=\"bar\"} | unpack[5m])"
        );
    }

    #[test]
    fn adds_no_pipeline_error_after_every_parser() {
        let ed = editor();
        assert_eq!(
            ed.add_no_pipeline_error_to_query("{foo=\"bar\"} | json | logfmt"),
            "{foo=\"bar\"} | json | __error__=`` | logfmt | __error__=``"
        );
        assert_eq!(
            ed.add_no_pipeline_error_to_query("{foo=\"bar\"}"),
            "{foo=\"bar\"}"
        );
    }

    #[test]
    fn adds_label_format_after_each_log_expression() {
        assert_eq!(
            editor().add_label_format_to_query(
                "sum(count_over_time({a=\"b\"} | json [1m]))",
                "lvl",
                "level"
            ),
            "sum(count_over_time({a=\"b\"} | json | label_format level=lvl [1m]))"
        );
    }

    #[test]
    fn adds_line_filter_after_first_selector() {
        let ed = editor();
        assert_eq!(
            ed.add_line_filter("{foo=\"bar\"} | json", "err", LineFilterOp::Contains),
            "{foo=\"bar\"} |= `err` | json"
        );
        assert_eq!(
            ed.add_line_filter("{foo=\"bar\"}", "", LineFilterOp::NotContains),
            "{foo=\"bar\"} != ``"
        );
    }

    #[test]
    fn finds_last_position() {
        assert_eq!(
            find_last_position(&[
                NodePosition::new(0, 5),
                NodePosition::new(12, 20),
                NodePosition::new(6, 9)
            ]),
            Some(NodePosition::new(12, 20))
        );
        assert_eq!(find_last_position(&[]), None);
    }

    #[test]
    fn strips_comments_outside_strings() {
        assert_eq!(
            remove_comments_from_query("{a=\"#b\"} # drop me\n|= `#x` # and me"),
            "{a=\"#b\"} \n|= `#x` "
        );
        assert_eq!(remove_comments_from_query("{a=\"b\"}"), "{a=\"b\"}");
    }
}
