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

//! Position-aware LogQL recognizer.
//!
//! The parser does not evaluate anything. It records where selectors, pipeline
//! stages, range windows and aggregations sit in the source text so that callers
//! can splice new clauses into a query and classify it.

mod ast;
mod duration;
mod oracle;

pub use ast::{
    Grouping, LabelOp, LabelValue, LineFilter, LineFilterOp, LogExpr, Matcher, MetricExpr,
    NodePosition, ParserKind, ParserStage, PipelineStage, QueryAst, RangeWindow, Selector,
    StageKind,
};
pub use duration::{DurationValue, is_duration_literal};
pub use oracle::{
    AstOracle, Classification, ClausePositions, MatcherNode, MatcherScope, NodeKind,
    is_logs_query, is_query_with_error, log_query_from_metrics_query, stream_selectors,
};

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_till1, take_while, take_while1},
    character::complete::{anychar, char, digit1, multispace0, multispace1, none_of, one_of},
    combinator::{all_consuming, map, map_opt, map_res, opt, recognize},
    error::{Error as NomError, ErrorKind, context},
    multi::{count, fold_many0, many0_count, separated_list0, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
};
use thiserror::Error;

const RANGE_FUNCTIONS: &[&str] = &[
    "rate",
    "rate_counter",
    "count_over_time",
    "bytes_over_time",
    "bytes_rate",
    "avg_over_time",
    "sum_over_time",
    "min_over_time",
    "max_over_time",
    "stdvar_over_time",
    "stddev_over_time",
    "quantile_over_time",
    "first_over_time",
    "last_over_time",
    "absent_over_time",
];

const VECTOR_OPERATIONS: &[&str] = &[
    "sum",
    "avg",
    "min",
    "max",
    "count",
    "stddev",
    "stdvar",
    "topk",
    "bottomk",
    "sort",
    "sort_desc",
    "approx_topk",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct LogqlParser;

impl LogqlParser {
    pub fn parse(&self, input: &str) -> Result<QueryAst, LogqlError> {
        Scanner { src: input }.parse()
    }
}

#[derive(Debug, Error)]
pub enum LogqlError {
    #[error("failed to parse LogQL: {0}")]
    Invalid(String),
}

type NomResult<'a, T> = IResult<&'a str, T, NomError<&'a str>>;

/// Every slice handed to a parser method is a suffix of `src`, which is what
/// makes `offset` valid.
struct Scanner<'a> {
    src: &'a str,
}

impl<'a> Scanner<'a> {
    fn parse(&self) -> Result<QueryAst, LogqlError> {
        all_consuming(delimited(ws, |i| self.query(i), ws))
            .parse(self.src)
            .map(|(_, ast)| ast)
            .map_err(|err| LogqlError::Invalid(err.to_string()))
    }

    fn offset(&self, rest: &str) -> usize {
        self.src.len() - rest.len()
    }

    fn query(&self, input: &'a str) -> NomResult<'a, QueryAst> {
        alt((
            map(|i| self.log_expr(i), QueryAst::Log),
            map(|i| self.metric_expr(i), QueryAst::Metric),
        ))
        .parse(input)
    }

    fn log_expr(&self, input: &'a str) -> NomResult<'a, LogExpr> {
        let start = self.offset(input);
        let (input, selector) = self.selector(input)?;
        let (input, stages) = self.pipeline(input)?;
        let end = stages
            .last()
            .map(|stage| stage.position.to)
            .unwrap_or(selector.position.to);
        Ok((
            input,
            LogExpr {
                position: NodePosition::new(start, end),
                selector,
                stages,
            },
        ))
    }

    fn selector(&self, input: &'a str) -> NomResult<'a, Selector> {
        let start = self.offset(input);
        let (rest, matchers) = context(
            "label selector",
            delimited(
                char('{'),
                separated_list0(
                    preceded(ws, char(',')),
                    preceded(ws, |i| self.selector_matcher(i)),
                ),
                preceded(ws, char('}')),
            ),
        )
        .parse(input)?;
        Ok((
            rest,
            Selector {
                position: NodePosition::new(start, self.offset(rest)),
                matchers,
            },
        ))
    }

    fn selector_matcher(&self, input: &'a str) -> NomResult<'a, Matcher> {
        let start = self.offset(input);
        let (input, key) = context("label key", label_identifier).parse(input)?;
        let (input, op) = preceded(
            ws,
            context(
                "label operator",
                map_opt(
                    alt((tag("=~"), tag("!~"), tag("!="), tag("="))),
                    LabelOp::parse,
                ),
            ),
        )
        .parse(input)?;
        let (input, _) = ws(input)?;
        let value_start = self.offset(input);
        let (input, value) = string_literal(input)?;
        let end = self.offset(input);
        Ok((
            input,
            Matcher {
                position: NodePosition::new(start, end),
                key,
                op,
                value: LabelValue::String(value),
                value_position: NodePosition::new(value_start, end),
            },
        ))
    }

    fn pipeline(&self, input: &'a str) -> NomResult<'a, Vec<PipelineStage>> {
        let mut rest = input;
        let mut stages = Vec::new();
        loop {
            let (candidate, _) = ws(rest)?;
            match self.stage(candidate) {
                Ok((next, stage)) => {
                    stages.push(stage);
                    rest = next;
                }
                Err(nom::Err::Error(_)) => return Ok((rest, stages)),
                Err(err) => return Err(err),
            }
        }
    }

    fn stage(&self, input: &'a str) -> NomResult<'a, PipelineStage> {
        context(
            "pipeline stage",
            alt((|i| self.line_filter(i), |i| self.pipe_stage(i))),
        )
        .parse(input)
    }

    fn line_filter(&self, input: &'a str) -> NomResult<'a, PipelineStage> {
        let start = self.offset(input);
        let (input, op) = context(
            "line filter",
            map_opt(
                alt((
                    tag("|="),
                    tag("|~"),
                    tag("|>"),
                    tag("!="),
                    tag("!~"),
                    tag("!>"),
                )),
                line_filter_op,
            ),
        )
        .parse(input)?;
        let (mut rest, first) = preceded(ws, line_filter_value).parse(input)?;
        let mut values = vec![first];
        loop {
            match preceded((ws, tag("or"), ws), line_filter_value).parse(rest) {
                Ok((next, value)) => {
                    values.push(value);
                    rest = next;
                }
                Err(nom::Err::Error(_)) => break,
                Err(err) => return Err(err),
            }
        }
        Ok((
            rest,
            PipelineStage {
                position: NodePosition::new(start, self.offset(rest)),
                kind: StageKind::LineFilter(LineFilter { op, values }),
            },
        ))
    }

    fn pipe_stage(&self, input: &'a str) -> NomResult<'a, PipelineStage> {
        let start = self.offset(input);
        let (input, _) = char('|').parse(input)?;
        let (input, _) = ws(input)?;
        let (input, kind) = self.stage_body(input)?;
        Ok((
            input,
            PipelineStage {
                position: NodePosition::new(start, self.offset(input)),
                kind,
            },
        ))
    }

    fn stage_body(&self, input: &'a str) -> NomResult<'a, StageKind> {
        if input.starts_with('(') {
            return map(|i| self.label_filter_expr(i), StageKind::LabelFilter).parse(input);
        }
        let (rest, keyword) = identifier(input)?;
        match keyword {
            "json" => map(
                opt(preceded(ws1, separated_list1(comma, parser_param))),
                |params| parser_stage(ParserKind::Json, params.unwrap_or_default()),
            )
            .parse(rest),
            "logfmt" => map(
                pair(
                    many0_count(preceded(ws1, alt((tag("--strict"), tag("--keep-empty"))))),
                    opt(preceded(ws1, separated_list1(comma, parser_param))),
                ),
                |(_, params)| parser_stage(ParserKind::Logfmt, params.unwrap_or_default()),
            )
            .parse(rest),
            "unpack" => Ok((rest, parser_stage(ParserKind::Unpack, Vec::new()))),
            "pattern" => map(preceded(ws, string_literal), |_| {
                parser_stage(ParserKind::Pattern, Vec::new())
            })
            .parse(rest),
            "regexp" => map(preceded(ws, string_literal), |_| {
                parser_stage(ParserKind::Regexp, Vec::new())
            })
            .parse(rest),
            "label_format" => map(
                preceded(ws1, separated_list1(comma, label_format_rule)),
                |_| StageKind::LabelFormat,
            )
            .parse(rest),
            "line_format" => {
                map(preceded(ws, string_literal), |_| StageKind::LineFormat).parse(rest)
            }
            "drop" => map(preceded(ws1, separated_list1(comma, drop_item)), |_| {
                StageKind::Drop
            })
            .parse(rest),
            "keep" => map(preceded(ws1, separated_list1(comma, drop_item)), |_| {
                StageKind::Keep
            })
            .parse(rest),
            "decolorize" => Ok((rest, StageKind::Decolorize)),
            "unwrap" => map(
                preceded(
                    ws1,
                    alt((
                        recognize((
                            identifier,
                            ws,
                            char('('),
                            ws,
                            label_identifier,
                            ws,
                            char(')'),
                        )),
                        recognize(label_identifier),
                    )),
                ),
                |_| StageKind::Unwrap,
            )
            .parse(rest),
            _ => map(|i| self.label_filter_expr(i), StageKind::LabelFilter).parse(input),
        }
    }

    fn label_filter_expr(&self, input: &'a str) -> NomResult<'a, Vec<Matcher>> {
        let (mut rest, mut matchers) = self.label_filter_term(input)?;
        loop {
            let attempt = preceded(
                (
                    ws,
                    alt((
                        tag(","),
                        terminated(tag("and"), multispace1),
                        terminated(tag("or"), multispace1),
                    )),
                    ws,
                ),
                |i| self.label_filter_term(i),
            )
            .parse(rest);
            match attempt {
                Ok((next, more)) => {
                    matchers.extend(more);
                    rest = next;
                }
                Err(nom::Err::Error(_)) => return Ok((rest, matchers)),
                Err(err) => return Err(err),
            }
        }
    }

    fn label_filter_term(&self, input: &'a str) -> NomResult<'a, Vec<Matcher>> {
        alt((
            delimited(
                (char('('), ws),
                |i| self.label_filter_expr(i),
                (ws, char(')')),
            ),
            map(|i| self.filter_matcher(i), |matcher| vec![matcher]),
        ))
        .parse(input)
    }

    fn filter_matcher(&self, input: &'a str) -> NomResult<'a, Matcher> {
        let start = self.offset(input);
        let (input, key) = context("label filter key", label_identifier).parse(input)?;
        let (input, op) = preceded(
            ws,
            context(
                "label filter operator",
                map_opt(
                    alt((
                        tag("=="),
                        tag("=~"),
                        tag("="),
                        tag("!="),
                        tag("!~"),
                        tag(">="),
                        tag(">"),
                        tag("<="),
                        tag("<"),
                    )),
                    LabelOp::parse,
                ),
            ),
        )
        .parse(input)?;
        let (input, _) = ws(input)?;
        let value_start = self.offset(input);
        let (input, value) = alt((
            map(string_literal, LabelValue::String),
            map(ip_literal, |raw: &str| LabelValue::Raw(raw.to_string())),
            map(raw_value, |raw: &str| LabelValue::Raw(raw.to_string())),
        ))
        .parse(input)?;
        let end = self.offset(input);
        Ok((
            input,
            Matcher {
                position: NodePosition::new(start, end),
                key,
                op,
                value,
                value_position: NodePosition::new(value_start, end),
            },
        ))
    }

    fn metric_expr(&self, input: &'a str) -> NomResult<'a, MetricExpr> {
        let start = self.offset(input);
        let (mut rest, mut lhs) = self.metric_unary(input)?;
        loop {
            let (after_op, op) = match preceded(ws, terminated(binary_op, ws)).parse(rest) {
                Ok(found) => found,
                Err(nom::Err::Error(_)) => return Ok((rest, lhs)),
                Err(err) => return Err(err),
            };
            let (next, rhs) = self.metric_unary(after_op)?;
            lhs = MetricExpr::Binary {
                position: NodePosition::new(start, self.offset(next)),
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
            rest = next;
        }
    }

    fn metric_unary(&self, input: &'a str) -> NomResult<'a, MetricExpr> {
        let start = self.offset(input);
        if input.starts_with('(') {
            let (rest, inner) =
                delimited((char('('), ws), |i| self.metric_expr(i), (ws, char(')')))
                    .parse(input)?;
            return Ok((
                rest,
                MetricExpr::Paren {
                    position: NodePosition::new(start, self.offset(rest)),
                    inner: Box::new(inner),
                },
            ));
        }
        if let Ok((rest, value)) = number_literal(input) {
            return Ok((
                rest,
                MetricExpr::Literal {
                    position: NodePosition::new(start, self.offset(rest)),
                    value,
                },
            ));
        }
        let (rest, name) = context("function", identifier).parse(input)?;
        match name {
            "vector" => {
                let (rest, value) =
                    delimited((ws, char('('), ws), number_literal, (ws, char(')'))).parse(rest)?;
                Ok((
                    rest,
                    MetricExpr::Vector {
                        position: NodePosition::new(start, self.offset(rest)),
                        value,
                    },
                ))
            }
            "label_replace" => self.label_replace(start, rest),
            name if RANGE_FUNCTIONS.contains(&name) => self.range_aggregation(start, name, rest),
            name if VECTOR_OPERATIONS.contains(&name) => {
                self.vector_aggregation(start, name, rest)
            }
            _ => Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag))),
        }
    }

    fn range_aggregation(
        &self,
        start: usize,
        function: &str,
        input: &'a str,
    ) -> NomResult<'a, MetricExpr> {
        let (input, _) = (ws, char('('), ws).parse(input)?;
        let (input, _) = opt(terminated(param_token, (ws, char(','), ws))).parse(input)?;
        let (input, (log, range)) = self.log_range(input)?;
        let (input, _) = opt(preceded(ws, (tag("offset"), ws1, raw_value))).parse(input)?;
        let (input, _) = (ws, char(')')).parse(input)?;
        let (input, grouping) = opt(preceded(ws, grouping)).parse(input)?;
        Ok((
            input,
            MetricExpr::RangeAggregation {
                position: NodePosition::new(start, self.offset(input)),
                function: function.to_string(),
                log,
                range,
                grouping,
            },
        ))
    }

    /// The window may follow the selector or the whole pipeline.
    fn log_range(&self, input: &'a str) -> NomResult<'a, (LogExpr, RangeWindow)> {
        if input.starts_with('(') {
            let (rest, log) =
                delimited((char('('), ws), |i| self.log_expr(i), (ws, char(')'))).parse(input)?;
            let (rest, range) = preceded(ws, |i| self.range_window(i)).parse(rest)?;
            return Ok((rest, (log, range)));
        }
        let start = self.offset(input);
        let (rest, selector) = self.selector(input)?;
        let (rest, early_range) = opt(preceded(ws, |i| self.range_window(i))).parse(rest)?;
        let (rest, stages) = self.pipeline(rest)?;
        let (rest, range) = match early_range {
            Some(range) => (rest, range),
            None => preceded(ws, |i| self.range_window(i)).parse(rest)?,
        };
        let end = stages
            .last()
            .map(|stage| stage.position.to)
            .unwrap_or(selector.position.to);
        Ok((
            rest,
            (
                LogExpr {
                    position: NodePosition::new(start, end),
                    selector,
                    stages,
                },
                range,
            ),
        ))
    }

    fn range_window(&self, input: &'a str) -> NomResult<'a, RangeWindow> {
        let start = self.offset(input);
        let (rest, _) = (char('['), multispace0).parse(input)?;
        let inner_start = self.offset(rest);
        let (rest, text) = take_till1(|c: char| c == ']' || c.is_whitespace()).parse(rest)?;
        let inner_end = self.offset(rest);
        let (rest, _) = (multispace0, char(']')).parse(rest)?;
        let duration = is_duration_literal(text).then(|| NodePosition::new(inner_start, inner_end));
        Ok((
            rest,
            RangeWindow {
                position: NodePosition::new(start, self.offset(rest)),
                text: text.to_string(),
                duration,
            },
        ))
    }

    fn vector_aggregation(&self, start: usize, op: &str, input: &'a str) -> NomResult<'a, MetricExpr> {
        let (input, leading) = opt(preceded(ws, grouping)).parse(input)?;
        let (input, _) = (ws, char('('), ws).parse(input)?;
        let (input, _) = opt(terminated(param_token, (ws, char(','), ws))).parse(input)?;
        let (input, inner) = self.metric_expr(input)?;
        let (input, _) = (ws, char(')')).parse(input)?;
        let (input, trailing) = opt(preceded(ws, grouping)).parse(input)?;
        Ok((
            input,
            MetricExpr::VectorAggregation {
                position: NodePosition::new(start, self.offset(input)),
                op: op.to_string(),
                grouping: leading.or(trailing),
                inner: Box::new(inner),
            },
        ))
    }

    fn label_replace(&self, start: usize, input: &'a str) -> NomResult<'a, MetricExpr> {
        let (input, _) = (ws, char('('), ws).parse(input)?;
        let (input, inner) = self.metric_expr(input)?;
        let (input, _) = count((ws, char(','), ws, string_literal), 4).parse(input)?;
        let (input, _) = (ws, char(')')).parse(input)?;
        Ok((
            input,
            MetricExpr::LabelReplace {
                position: NodePosition::new(start, self.offset(input)),
                inner: Box::new(inner),
            },
        ))
    }
}

fn parser_stage(kind: ParserKind, params: Vec<String>) -> StageKind {
    StageKind::Parser(ParserStage { kind, params })
}

fn line_filter_op(op: &str) -> Option<LineFilterOp> {
    let op = match op {
        "|=" => LineFilterOp::Contains,
        "|~" => LineFilterOp::Regex,
        "|>" => LineFilterOp::Pattern,
        "!=" => LineFilterOp::NotContains,
        "!~" => LineFilterOp::NotRegex,
        "!>" => LineFilterOp::NotPattern,
        _ => return None,
    };
    Some(op)
}

fn line_filter_value(input: &str) -> NomResult<'_, String> {
    alt((
        string_literal,
        map(ip_literal, |raw: &str| raw.to_string()),
    ))
    .parse(input)
}

fn ip_literal(input: &str) -> NomResult<'_, &str> {
    recognize((tag("ip("), ws, string_literal, ws, char(')'))).parse(input)
}

fn parser_param(input: &str) -> NomResult<'_, String> {
    map(
        pair(
            label_identifier,
            opt(preceded((ws, char('='), ws), string_literal)),
        ),
        |(label, _)| label,
    )
    .parse(input)
}

fn label_format_rule(input: &str) -> NomResult<'_, String> {
    map(
        pair(
            label_identifier,
            preceded(
                (ws, char('='), ws),
                alt((string_literal, label_identifier)),
            ),
        ),
        |(target, _)| target,
    )
    .parse(input)
}

fn drop_item(input: &str) -> NomResult<'_, String> {
    map(
        pair(
            label_identifier,
            opt((
                ws,
                alt((tag("=~"), tag("!~"), tag("!="), tag("="))),
                ws,
                string_literal,
            )),
        ),
        |(label, _)| label,
    )
    .parse(input)
}

fn binary_op(input: &str) -> NomResult<'_, String> {
    let (rest, op) = alt((
        tag("=="),
        tag("!="),
        tag(">="),
        tag("<="),
        tag(">"),
        tag("<"),
        tag("+"),
        tag("-"),
        tag("*"),
        tag("/"),
        tag("%"),
        tag("^"),
        terminated(tag("and"), multispace1),
        terminated(tag("or"), multispace1),
        terminated(tag("unless"), multispace1),
    ))
    .parse(input)?;
    let (rest, _) = opt(preceded(ws, tag("bool"))).parse(rest)?;
    let (rest, _) = opt(preceded(
        ws,
        (alt((tag("on"), tag("ignoring"))), ws, label_list),
    ))
    .parse(rest)?;
    let (rest, _) = opt(preceded(
        ws,
        (
            alt((tag("group_left"), tag("group_right"))),
            opt(preceded(ws, label_list)),
        ),
    ))
    .parse(rest)?;
    Ok((rest, op.to_string()))
}

fn grouping(input: &str) -> NomResult<'_, Grouping> {
    map(
        (alt((tag("by"), tag("without"))), ws, label_list),
        |(kind, _, labels)| Grouping {
            without: kind == "without",
            labels,
        },
    )
    .parse(input)
}

fn label_list(input: &str) -> NomResult<'_, Vec<String>> {
    delimited(
        (char('('), ws),
        separated_list0((ws, char(','), ws), label_identifier),
        (ws, char(')')),
    )
    .parse(input)
}

fn param_token(input: &str) -> NomResult<'_, &str> {
    alt((recognize(number_literal), identifier)).parse(input)
}

fn number_literal(input: &str) -> NomResult<'_, f64> {
    map_res(
        recognize((
            opt(char('-')),
            digit1,
            opt((char('.'), digit1)),
            opt((one_of("eE"), opt(one_of("+-")), digit1)),
        )),
        |text: &str| text.parse::<f64>(),
    )
    .parse(input)
}

fn raw_value(input: &str) -> NomResult<'_, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '_')).parse(input)
}

fn comma(input: &str) -> NomResult<'_, char> {
    delimited(ws, char(','), ws).parse(input)
}

/// Whitespace and `#` line comments.
fn ws(input: &str) -> NomResult<'_, ()> {
    map(many0_count(alt((multispace1, line_comment))), |_| ()).parse(input)
}

fn ws1(input: &str) -> NomResult<'_, ()> {
    map((multispace1, ws), |_| ()).parse(input)
}

fn line_comment(input: &str) -> NomResult<'_, &str> {
    recognize(pair(char('#'), take_while(|c: char| c != '\n'))).parse(input)
}

fn identifier(input: &str) -> NomResult<'_, &str> {
    recognize(pair(
        take_while1(is_label_start),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn label_identifier(input: &str) -> NomResult<'_, String> {
    map(recognize(pair(label_start, label_chars)), |ident: &str| {
        ident.to_string()
    })
    .parse(input)
}

fn string_literal(input: &str) -> NomResult<'_, String> {
    context(
        "string literal",
        alt((double_quoted_literal, backtick_literal)),
    )
    .parse(input)
}

enum Fragment {
    Char(char),
    Escaped(char),
}

fn double_quoted_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('"'),
        fold_many0(
            alt((map(none_of("\\\""), Fragment::Char), escaped_fragment)),
            String::new,
            |mut acc, fragment| {
                match fragment {
                    Fragment::Char(ch) => acc.push(ch),
                    Fragment::Escaped(ch) => {
                        acc.push('\\');
                        acc.push(ch);
                    }
                }
                acc
            },
        ),
        char('"'),
    )
    .parse(input)
}

fn backtick_literal(input: &str) -> NomResult<'_, String> {
    delimited(
        char('`'),
        map(take_while(|c: char| c != '`'), |value: &str| value.to_string()),
        char('`'),
    )
    .parse(input)
}

/// Unknown escapes keep their backslash so regex sources survive untouched.
fn escaped_fragment(input: &str) -> NomResult<'_, Fragment> {
    preceded(
        char('\\'),
        map(anychar, |ch| match ch {
            'n' => Fragment::Char('\n'),
            'r' => Fragment::Char('\r'),
            't' => Fragment::Char('\t'),
            '\\' | '"' => Fragment::Char(ch),
            other => Fragment::Escaped(other),
        }),
    )
    .parse(input)
}

fn label_start(input: &str) -> NomResult<'_, &str> {
    take_while1(is_label_start).parse(input)
}

fn label_chars(input: &str) -> NomResult<'_, &str> {
    take_while(is_label_char).parse(input)
}

fn is_label_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_label_char(ch: char) -> bool {
    is_label_start(ch) || ch.is_ascii_digit() || matches!(ch, ':' | '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_log(input: &str) -> LogExpr {
        match LogqlParser.parse(input).unwrap() {
            QueryAst::Log(expr) => expr,
            QueryAst::Metric(_) => panic!("expected log query"),
        }
    }

    #[test]
    fn parse_basic_selector() {
        let expr = parse_log("{app=\"loki\",env!=\"prod\"}");
        let matchers = &expr.selector.matchers;
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[0].key, "app");
        assert_eq!(matchers[0].op, LabelOp::Eq);
        assert_eq!(matchers[0].string_value(), Some("loki"));
        assert_eq!(matchers[1].key, "env");
        assert_eq!(matchers[1].op, LabelOp::NotEq);
        assert_eq!(expr.selector.position, NodePosition::new(0, 24));
        assert!(expr.stages.is_empty());
    }

    #[test]
    fn parse_with_filters_and_escaped_string() {
        let expr = parse_log(
            "{app=\"loki\"} |= \"error\\\"\" |~ \"warn\\n\" != \"drop\" !~ \"panic\" or `fatal`",
        );
        let filters: Vec<&LineFilter> = expr
            .stages
            .iter()
            .filter_map(|stage| match &stage.kind {
                StageKind::LineFilter(filter) => Some(filter),
                _ => None,
            })
            .collect();
        assert_eq!(filters.len(), 4);
        assert_eq!(filters[0].values, vec!["error\"".to_string()]);
        assert_eq!(filters[0].op, LineFilterOp::Contains);
        assert_eq!(filters[1].values, vec!["warn\n".to_string()]);
        assert_eq!(filters[2].op, LineFilterOp::NotContains);
        assert_eq!(filters[3].values.len(), 2);
        assert_eq!(expr.line_filter_groups().len(), 1);
    }

    #[test]
    fn keeps_unknown_escapes_in_regex_values() {
        let expr = parse_log("{app=~\"api\\\\.v1|web\\.v2\"}");
        assert_eq!(
            expr.selector.matchers[0].string_value(),
            Some("api\\.v1|web\\.v2")
        );
    }

    #[test]
    fn parse_fail_on_incomplete_string() {
        let err = LogqlParser.parse("{app=\"loki}").unwrap_err();
        assert!(matches!(err, LogqlError::Invalid(_)));
    }

    #[test]
    fn parse_fail_on_missing_brace() {
        let err = LogqlParser.parse("{app=\"loki\"").unwrap_err();
        assert!(matches!(err, LogqlError::Invalid(_)));
    }

    #[test]
    fn parse_pipeline_stages_with_positions() {
        let query = "{container=\"frontend\"} | logfmt | level=\"error\" | line_format \"{{.query}}\"";
        let expr = parse_log(query);
        assert_eq!(expr.stages.len(), 3);
        assert!(matches!(
            expr.stages[0].kind,
            StageKind::Parser(ParserStage {
                kind: ParserKind::Logfmt,
                ..
            })
        ));
        assert_eq!(expr.stages[0].position.text(query), "| logfmt");
        assert_eq!(expr.stages[1].position.text(query), "| level=\"error\"");
        assert!(matches!(expr.stages[2].kind, StageKind::LineFormat));
        assert_eq!(expr.position.to, query.len());
    }

    #[test]
    fn parse_json_stage_with_params() {
        let expr =
            parse_log("{job=\"api\"} | json duration=\"data.latency\", ua=\"request[\\\"ua\\\"]\"");
        match &expr.stages[0].kind {
            StageKind::Parser(stage) => {
                assert_eq!(stage.kind, ParserKind::Json);
                assert_eq!(stage.params, vec!["duration".to_string(), "ua".to_string()]);
            }
            other => panic!("expected json parser, got {other:?}"),
        }
    }

    #[test]
    fn parse_label_filter_combinations() {
        let expr = parse_log(
            "{job=\"api\"} | json | status >= 500 and (level=\"error\" or level=`warn`), latency > 5s",
        );
        match &expr.stages[1].kind {
            StageKind::LabelFilter(matchers) => {
                assert_eq!(matchers.len(), 4);
                assert_eq!(matchers[0].op, LabelOp::Gte);
                assert_eq!(matchers[0].value, LabelValue::Raw("500".into()));
                assert_eq!(matchers[2].string_value(), Some("warn"));
            }
            other => panic!("expected label filter, got {other:?}"),
        }
    }

    #[test]
    fn parse_label_format_drop_and_unwrap() {
        let ast = LogqlParser
            .parse("sum_over_time({job=\"api\"} | logfmt | label_format level=severity,app=\"{{.svc}}\" | drop tmp, __error__ | unwrap duration(latency) [1m])")
            .unwrap();
        let logs = ast.log_exprs();
        assert_eq!(logs.len(), 1);
        let kinds: Vec<_> = logs[0].stages.iter().map(|stage| &stage.kind).collect();
        assert!(matches!(kinds[1], StageKind::LabelFormat));
        assert!(matches!(kinds[2], StageKind::Drop));
        assert!(matches!(kinds[3], StageKind::Unwrap));
    }

    #[test]
    fn parse_metric_query_with_range_windows() {
        let query = "sum by (level) (count_over_time({app=\"a\"} |= \"x\" [5m])) / sum(rate({app=\"b\"}[$__auto]))";
        let ast = LogqlParser.parse(query).unwrap();
        assert!(!ast.is_logs_query());
        let ranges = ast.range_windows();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].duration.map(|pos| pos.text(query)), Some("5m"));
        assert_eq!(ranges[1].text, "$__auto");
        assert!(ranges[1].duration.is_none());
        assert_eq!(ast.log_exprs().len(), 2);
    }

    #[test]
    fn parse_range_before_pipeline_and_topk() {
        let ast = LogqlParser
            .parse("topk(10, sum without (pod) (rate({app=\"a\"}[1m] | json offset 1h)))")
            .unwrap();
        let logs = ast.log_exprs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].stages.len(), 1);
    }

    #[test]
    fn parse_binary_with_modifiers_and_vector() {
        assert!(
            LogqlParser
                .parse("sum(rate({a=\"b\"}[1m])) > bool on (job) group_left vector(1)")
                .is_ok()
        );
        assert!(LogqlParser.parse("vector(1)+vector(1)").is_ok());
        assert!(LogqlParser.parse("1 + 2").is_ok());
    }

    #[test]
    fn skips_comments() {
        let expr = parse_log("{app=\"a\"} # only the api\n|= \"x\"");
        assert_eq!(expr.stages.len(), 1);
    }

    #[test]
    fn rejects_unknown_functions() {
        assert!(LogqlParser.parse("frobnicate({a=\"b\"}[1m])").is_err());
        assert!(LogqlParser.parse("rate({a=\"b\"})").is_err());
    }
}
