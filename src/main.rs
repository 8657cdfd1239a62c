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

use std::{fmt::Display, path::PathBuf};

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use log::{LevelFilter, debug, info};
use loki_query_orchestrator::{
    DatasourceError, ExpressionEditor, LogqlParser, LokiQuery, LokiQueryType, OrchestratorConfig,
    SupplementaryQueryType, TimeRange,
    logql::{AstOracle, is_query_with_error, stream_selectors},
    query::{
        ModificationOptions, QueryFixAction, QueryModification, classify_for_size_estimate,
        supported_query_modifications,
    },
    stats::stats_time_range,
    supplementary::{SupplementaryQueryOptions, supplementary_query},
};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(author, version, about, disable_help_subcommand = true)]
struct Args {
    /// Datasource configuration file (JSON)
    #[arg(long = "config", env = "LOKIQ_CONFIG", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply a query modification, e.g. ADD_FILTER or ADD_JSON_PARSER
    Modify {
        #[arg(long = "action")]
        action: String,
        #[arg(long)]
        key: Option<String>,
        #[arg(long)]
        value: Option<String>,
        #[arg(long = "original-label")]
        original_label: Option<String>,
        #[arg(long = "rename-to")]
        rename_to: Option<String>,
        /// Stream label names; filters on other keys become label filters
        #[arg(long = "stream-labels", value_delimiter = ',')]
        stream_labels: Vec<String>,
        expr: String,
    },
    /// Print how a query is classified
    Classify {
        #[arg(long = "query-type", value_enum, default_value = "range")]
        query_type: QueryTypeArg,
        expr: String,
    },
    /// Print the index stats window of every stream selector
    StatsRange {
        #[arg(long = "query-type", value_enum, default_value = "range")]
        query_type: QueryTypeArg,
        #[arg(long)]
        from: DateTime<Utc>,
        #[arg(long)]
        to: DateTime<Utc>,
        expr: String,
    },
    /// Print the supplementary query derived from a query
    Supplementary {
        #[arg(long, value_enum, default_value = "logs-volume")]
        kind: SupplementaryArg,
        #[arg(long)]
        limit: Option<u64>,
        expr: String,
    },
    /// List the supported query modifications
    Modifications,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum QueryTypeArg {
    Range,
    Instant,
    Stream,
}

impl From<QueryTypeArg> for LokiQueryType {
    fn from(value: QueryTypeArg) -> Self {
        match value {
            QueryTypeArg::Range => LokiQueryType::Range,
            QueryTypeArg::Instant => LokiQueryType::Instant,
            QueryTypeArg::Stream => LokiQueryType::Stream,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SupplementaryArg {
    LogsVolume,
    LogsSample,
}

impl From<SupplementaryArg> for SupplementaryQueryType {
    fn from(value: SupplementaryArg) -> Self {
        match value {
            SupplementaryArg::LogsVolume => SupplementaryQueryType::LogsVolume,
            SupplementaryArg::LogsSample => SupplementaryQueryType::LogsSample,
        }
    }
}

impl Display for SupplementaryArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupplementaryArg::LogsVolume => write!(f, "logs-volume"),
            SupplementaryArg::LogsSample => write!(f, "logs-sample"),
        }
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<(), DatasourceError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<(), DatasourceError> {
    init_logging();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => {
            info!("loading datasource configuration from {}", path.display());
            let config = OrchestratorConfig::from_file(path)?;
            config.validate()?;
            Some(config)
        }
        None => None,
    };
    let max_lines = config
        .as_ref()
        .map(|config| config.settings.json_data.max_lines())
        .unwrap_or(loki_query_orchestrator::query::DEFAULT_MAX_LINES);
    let oracle = LogqlParser;

    match args.command {
        Command::Modify {
            action,
            key,
            value,
            original_label,
            rename_to,
            stream_labels,
            expr,
        } => {
            let action = QueryFixAction {
                kind: action,
                options: Some(ModificationOptions {
                    key,
                    value,
                    original_label,
                    rename_to,
                }),
            };
            let modification = QueryModification::try_from(&action)?;
            debug!("applying {} to `{expr}`", modification.kind());
            let editor = ExpressionEditor::new(&oracle);
            println!("{}", modification.apply(&editor, &expr, &stream_labels));
        }
        Command::Classify { query_type, expr } => {
            let query = LokiQuery::new("A", expr.as_str()).with_query_type(query_type.into());
            print_json(&json!({
                "isLogsQuery": oracle.classify(&expr).is_logs_query,
                "hasError": is_query_with_error(&expr),
                "estimable": classify_for_size_estimate(&oracle, &query).estimable,
                "streamSelectors": stream_selectors(&expr),
            }))?;
        }
        Command::StatsRange {
            query_type,
            from,
            to,
            expr,
        } => {
            let query = LokiQuery::new("A", expr.as_str()).with_query_type(query_type.into());
            let range = TimeRange::new(from, to);
            let windows: Vec<_> = stream_selectors(&expr)
                .into_iter()
                .enumerate()
                .map(|(idx, selector)| {
                    let window = stats_time_range(&oracle, &query, idx, &range);
                    json!({
                        "selector": selector,
                        "start": window.start,
                        "end": window.end,
                    })
                })
                .collect();
            print_json(&windows)?;
        }
        Command::Supplementary { kind, limit, expr } => {
            info!("deriving {kind} query");
            let query = LokiQuery::new("A", expr.as_str());
            let derived = supplementary_query(
                &oracle,
                kind.into(),
                &query,
                SupplementaryQueryOptions { limit },
                max_lines,
            );
            print_json(&derived)?;
        }
        Command::Modifications => {
            for name in supported_query_modifications() {
                println!("{name}");
            }
        }
    }
    Ok(())
}

fn init_logging() {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::Builder::from_default_env().init();
    } else {
        env_logger::Builder::new()
            .filter_level(LevelFilter::Warn)
            .filter_module("loki_query_orchestrator", LevelFilter::Info)
            .filter_module("lokiq", LevelFilter::Info)
            .init();
    }
}
