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

//! Client-side orchestration of LogQL queries against a Loki datasource.

pub mod config;
pub mod datasource;
pub mod error;
pub mod escape;
pub mod frame;
pub mod interpolate;
pub mod logql;
pub mod modify;
pub mod query;
pub mod stats;
pub mod supplementary;
pub mod transform;
pub mod transport;

pub use config::{DatasourceSettings, FeatureToggles, LokiOptions, OrchestratorConfig};
pub use datasource::{Datasource, QueryFilterOptions, ResponseStream, ToggleFilterAction};
pub use error::DatasourceError;
pub use frame::{DataFrame, DataQueryResponse, LoadingState};
pub use logql::{AstOracle, LogqlParser};
pub use modify::ExpressionEditor;
pub use query::{DataQueryRequest, LokiQuery, LokiQueryType, QueryModification, TimeRange};
pub use stats::{QueryStats, ZeroStatsPolicy};
pub use supplementary::SupplementaryQueryType;
pub use transport::{Transport, TransportError};
