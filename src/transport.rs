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

//! The byte-moving collaborator. Timeouts, retries and authentication belong
//! to implementations of [`Transport`].

use std::fmt::{self, Display};

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::{
    frame::{DataFrame, DataQueryResponse, TailResponse},
    query::{DataQueryRequest, LokiQuery},
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("upstream responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("failed to decode upstream payload: {0}")]
    Decode(String),
    #[error("stream closed: {0}")]
    Closed(String),
}

impl TransportError {
    /// Reason reported to consumers of a failed live tail.
    pub fn reason(&self) -> String {
        match self {
            TransportError::Status { message, .. } => message.clone(),
            TransportError::Connection(reason)
            | TransportError::Decode(reason)
            | TransportError::Closed(reason) => reason.clone(),
        }
    }
}

/// Address of a server-side streaming channel: `ds/<uid>/<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelAddress {
    pub scope: String,
    pub namespace: String,
    pub path: String,
}

impl ChannelAddress {
    pub fn datasource(uid: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            scope: "ds".to_string(),
            namespace: uid.into(),
            path: path.into(),
        }
    }
}

impl Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.namespace, self.path)
    }
}

pub type TailStream = BoxStream<'static, Result<TailResponse, TransportError>>;
pub type FrameStream = BoxStream<'static, Result<DataFrame, TransportError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// One backend round trip for a batch of queries.
    async fn query(&self, request: &DataQueryRequest) -> Result<DataQueryResponse, TransportError>;

    /// GET a resource relative to the Loki API root, e.g. `labels` or `index/stats`.
    async fn get_resource(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<Value, TransportError>;

    /// Opens a websocket tail at `url`.
    async fn open_stream(&self, url: &Url) -> Result<TailStream, TransportError>;

    async fn subscribe_channel(
        &self,
        address: &ChannelAddress,
        query: &LokiQuery,
    ) -> Result<FrameStream, TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::StreamExt;
    use parking_lot::Mutex;
    use tokio::sync::mpsc::{UnboundedSender, unbounded_channel};
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;

    type QueryHandler =
        Box<dyn Fn(&DataQueryRequest) -> Result<DataQueryResponse, TransportError> + Send + Sync>;
    type ResourceHandler =
        Box<dyn Fn(&str, &[(String, String)]) -> Result<Value, TransportError> + Send + Sync>;

    /// In-memory transport that records every call.
    pub(crate) struct RecordingTransport {
        query_handler: QueryHandler,
        resource_handler: ResourceHandler,
        pub(crate) queries: Mutex<Vec<DataQueryRequest>>,
        pub(crate) resources: Mutex<Vec<(String, Vec<(String, String)>)>>,
        pub(crate) opened: Mutex<Vec<Url>>,
        pub(crate) tails: Mutex<Vec<UnboundedSender<Result<TailResponse, TransportError>>>>,
        pub(crate) channels: Mutex<Vec<(ChannelAddress, UnboundedSender<Result<DataFrame, TransportError>>)>>,
        pub(crate) dropped_tails: std::sync::Arc<AtomicUsize>,
    }

    impl Default for RecordingTransport {
        fn default() -> Self {
            Self {
                query_handler: Box::new(|_| Ok(DataQueryResponse::default())),
                resource_handler: Box::new(|_, _| Ok(Value::Null)),
                queries: Mutex::new(Vec::new()),
                resources: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
                tails: Mutex::new(Vec::new()),
                channels: Mutex::new(Vec::new()),
                dropped_tails: Default::default(),
            }
        }
    }

    impl RecordingTransport {
        pub(crate) fn with_query(
            handler: impl Fn(&DataQueryRequest) -> Result<DataQueryResponse, TransportError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                query_handler: Box::new(handler),
                ..Self::default()
            }
        }

        pub(crate) fn with_resources(
            handler: impl Fn(&str, &[(String, String)]) -> Result<Value, TransportError>
            + Send
            + Sync
            + 'static,
        ) -> Self {
            Self {
                resource_handler: Box::new(handler),
                ..Self::default()
            }
        }

        pub(crate) fn query_count(&self) -> usize {
            self.queries.lock().len()
        }

        pub(crate) fn open_count(&self) -> usize {
            self.opened.lock().len()
        }

        pub(crate) fn push_tail(&self, idx: usize, item: Result<TailResponse, TransportError>) {
            if let Some(sender) = self.tails.lock().get(idx) {
                let _ = sender.send(item);
            }
        }
    }

    /// Counts upstream tail streams dropped by their consumer.
    struct DropCounter(std::sync::Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn query(
            &self,
            request: &DataQueryRequest,
        ) -> Result<DataQueryResponse, TransportError> {
            self.queries.lock().push(request.clone());
            (self.query_handler)(request)
        }

        async fn get_resource(
            &self,
            path: &str,
            params: &[(String, String)],
        ) -> Result<Value, TransportError> {
            self.resources
                .lock()
                .push((path.to_string(), params.to_vec()));
            (self.resource_handler)(path, params)
        }

        async fn open_stream(&self, url: &Url) -> Result<TailStream, TransportError> {
            self.opened.lock().push(url.clone());
            let (sender, receiver) = unbounded_channel();
            self.tails.lock().push(sender);
            let guard = DropCounter(self.dropped_tails.clone());
            Ok(UnboundedReceiverStream::new(receiver)
                .map(move |item| {
                    let _ = &guard;
                    item
                })
                .boxed())
        }

        async fn subscribe_channel(
            &self,
            address: &ChannelAddress,
            _query: &LokiQuery,
        ) -> Result<FrameStream, TransportError> {
            let (sender, receiver) = unbounded_channel();
            self.channels.lock().push((address.clone(), sender));
            Ok(UnboundedReceiverStream::new(receiver).boxed())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_channel_address() {
        let address = ChannelAddress::datasource("loki-uid", "tail/abc");
        assert_eq!(address.to_string(), "ds/loki-uid/tail/abc");
    }

    #[test]
    fn reason_strips_the_error_kind() {
        let err = TransportError::Status {
            status: 400,
            message: "bad query".into(),
        };
        assert_eq!(err.reason(), "bad query");
        assert_eq!(
            err.to_string(),
            "upstream responded with status 400: bad query"
        );
    }
}
