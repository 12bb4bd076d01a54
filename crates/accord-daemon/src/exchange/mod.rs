//! The directory ("exchange") client.
//!
//! All workers reach the directory through the [`Directory`] trait so
//! tests can substitute an in-memory fake. The HTTP implementation speaks
//! JSON with Basic auth `{org}/{id}:token`, accepts only 201 for writes
//! and 200/404 for reads, and retries transport failures (timeouts,
//! refused/reset connections) with a fixed backoff before surfacing them.

pub mod mem;
pub mod types;

use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use accord_core::config::ExchangeConfig;

use types::{
    Agbot, MailboxMessage, MailboxResponse, Node, NodeAgreementState, NodeHealthRequest,
    NodeHealthResponse, NodePut, NodeSearchRequest, NodeSummary, Pattern, PatternSearchRequest,
    PatternsResponse, PostMessageBody, ServedPattern,
};

/// Errors from directory calls.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DirectoryError {
    /// Transport failure that survived every retry.
    #[error("directory unreachable after {attempts} attempts: {source}")]
    Transport {
        /// Attempts made.
        attempts: u32,
        /// Final transport error.
        #[source]
        source: reqwest::Error,
    },

    /// The directory answered with an unexpected status.
    #[error("directory returned {status} for {method} {path}")]
    Status {
        /// HTTP method.
        method: &'static str,
        /// Request path.
        path: String,
        /// Status code received.
        status: u16,
    },

    /// The response body did not decode.
    #[error("directory response for {path} did not decode: {source}")]
    Decode {
        /// Request path.
        path: String,
        /// Decoder diagnostic.
        #[source]
        source: reqwest::Error,
    },
}

/// Which mailbox family a party belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartyKind {
    /// An edge node.
    Node,
    /// A consumer agent.
    Agbot,
}

impl PartyKind {
    const fn path_segment(self) -> &'static str {
        match self {
            Self::Node => "nodes",
            Self::Agbot => "agbots",
        }
    }
}

/// The directory surface the workers consume.
pub trait Directory: Send + Sync {
    /// Fetches a node record; `None` on 404.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn get_node(&self, org: &str, id: &str) -> Result<Option<Node>, DirectoryError>;

    /// Registers or updates a node record.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn put_node(&self, org: &str, id: &str, node: &NodePut) -> Result<(), DirectoryError>;

    /// Fetches an agbot record; `None` on 404.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn get_agbot(&self, org: &str, id: &str) -> Result<Option<Agbot>, DirectoryError>;

    /// Records a heartbeat for a node.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn heartbeat(&self, org: &str, id: &str) -> Result<(), DirectoryError>;

    /// Searches nodes by required service URLs.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn search_nodes(
        &self,
        org: &str,
        request: &NodeSearchRequest,
    ) -> Result<Vec<NodeSummary>, DirectoryError>;

    /// Searches nodes that declared a pattern.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn search_pattern(
        &self,
        org: &str,
        pattern: &str,
        request: &PatternSearchRequest,
    ) -> Result<Vec<NodeSummary>, DirectoryError>;

    /// Fetches pattern definitions; one when `name` is given, all
    /// otherwise.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn get_patterns(
        &self,
        org: &str,
        name: Option<&str>,
    ) -> Result<std::collections::BTreeMap<String, Pattern>, DirectoryError>;

    /// Fetches the patterns this agbot is assigned to serve.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn served_patterns(&self, org: &str, id: &str) -> Result<Vec<ServedPattern>, DirectoryError>;

    /// Delivers a protocol message to a party's mailbox.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn post_message(
        &self,
        org: &str,
        kind: PartyKind,
        id: &str,
        body: &PostMessageBody,
    ) -> Result<(), DirectoryError>;

    /// Drains a party's inbound mailbox.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn get_messages(
        &self,
        org: &str,
        kind: PartyKind,
        id: &str,
    ) -> Result<Vec<MailboxMessage>, DirectoryError>;

    /// Deletes a consumed mailbox message.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn delete_message(
        &self,
        org: &str,
        kind: PartyKind,
        id: &str,
        msg_id: u64,
    ) -> Result<(), DirectoryError>;

    /// Bulk node health, optionally pattern-scoped.
    ///
    /// An empty `node_orgs` returns empty without any directory call.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn node_health(
        &self,
        org: &str,
        pattern: Option<&str>,
        request: &NodeHealthRequest,
    ) -> Result<NodeHealthResponse, DirectoryError>;

    /// Publishes an agreement's presence on a node.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn put_node_agreement(
        &self,
        org: &str,
        id: &str,
        agreement_id: &str,
        state: &NodeAgreementState,
    ) -> Result<(), DirectoryError>;

    /// Removes an agreement's presence from a node.
    ///
    /// # Errors
    ///
    /// [`DirectoryError`] on transport or protocol failure.
    fn delete_node_agreement(
        &self,
        org: &str,
        id: &str,
        agreement_id: &str,
    ) -> Result<(), DirectoryError>;
}

/// HTTP implementation of [`Directory`].
pub struct HttpDirectory {
    client: Client,
    base_url: String,
    auth_user: String,
    auth_token: String,
    retry_backoff: Duration,
    max_retries: u32,
}

impl HttpDirectory {
    /// Builds the client from configuration.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::Transport`] when the underlying client cannot be
    /// constructed.
    pub fn new(config: &ExchangeConfig) -> Result<Self, DirectoryError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| DirectoryError::Transport {
                attempts: 0,
                source,
            })?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            auth_user: format!("{}/{}", config.org, config.id),
            auth_token: config.token.clone(),
            retry_backoff: config.retry_backoff,
            max_retries: config.max_retries,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .basic_auth(&self.auth_user, Some(&self.auth_token))
            .header("Accept", "application/json")
    }

    /// Sends with fixed-backoff retries on transport failures.
    fn send_with_retry(
        &self,
        path: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response, DirectoryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match build().send() {
                Ok(response) => return Ok(response),
                Err(source) if is_transient(&source) && attempt <= self.max_retries => {
                    warn!(path, attempt, %source, "transient directory failure, backing off");
                    std::thread::sleep(self.retry_backoff);
                }
                Err(source) => {
                    return Err(DirectoryError::Transport {
                        attempts: attempt,
                        source,
                    })
                }
            }
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, DirectoryError> {
        let response = self.send_with_retry(path, || self.request(Method::GET, path))?;
        match response.status() {
            StatusCode::OK => Ok(Some(response.json().map_err(|source| {
                DirectoryError::Decode {
                    path: path.to_string(),
                    source,
                }
            })?)),
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(DirectoryError::Status {
                method: "GET",
                path: path.to_string(),
                status: status.as_u16(),
            }),
        }
    }

    fn write_json<B: serde::Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), DirectoryError> {
        let method_name = if method == Method::PUT {
            "PUT"
        } else if method == Method::DELETE {
            "DELETE"
        } else {
            "POST"
        };
        let response = self.send_with_retry(path, || {
            let mut builder = self.request(method.clone(), path);
            if let Some(body) = body {
                builder = builder.json(body);
            }
            builder
        })?;
        // Writes accept only 201.
        if response.status() != StatusCode::CREATED {
            return Err(DirectoryError::Status {
                method: method_name,
                path: path.to_string(),
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// POST that returns a JSON body (searches); 201 with body, 404 empty.
    fn search_json<B: serde::Serialize, T: serde::de::DeserializeOwned + Default>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, DirectoryError> {
        let response =
            self.send_with_retry(path, || self.request(Method::POST, path).json(body))?;
        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                response.json().map_err(|source| DirectoryError::Decode {
                    path: path.to_string(),
                    source,
                })
            }
            StatusCode::NOT_FOUND => Ok(T::default()),
            status => Err(DirectoryError::Status {
                method: "POST",
                path: path.to_string(),
                status: status.as_u16(),
            }),
        }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
struct SearchNodesResponse {
    #[serde(default)]
    nodes: Vec<NodeSummary>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct ServedPatternsResponse {
    #[serde(default)]
    patterns: Vec<ServedPattern>,
}

impl Directory for HttpDirectory {
    fn get_node(&self, org: &str, id: &str) -> Result<Option<Node>, DirectoryError> {
        self.get_json(&format!("/orgs/{org}/nodes/{id}"))
    }

    fn put_node(&self, org: &str, id: &str, node: &NodePut) -> Result<(), DirectoryError> {
        debug!(org, id, "registering node with directory");
        self.write_json(Method::PUT, &format!("/orgs/{org}/nodes/{id}"), Some(node))
    }

    fn get_agbot(&self, org: &str, id: &str) -> Result<Option<Agbot>, DirectoryError> {
        self.get_json(&format!("/orgs/{org}/agbots/{id}"))
    }

    fn heartbeat(&self, org: &str, id: &str) -> Result<(), DirectoryError> {
        self.write_json::<()>(
            Method::POST,
            &format!("/orgs/{org}/nodes/{id}/heartbeat"),
            None,
        )
    }

    fn search_nodes(
        &self,
        org: &str,
        request: &NodeSearchRequest,
    ) -> Result<Vec<NodeSummary>, DirectoryError> {
        let response: SearchNodesResponse =
            self.search_json(&format!("/orgs/{org}/search/nodes"), request)?;
        Ok(response.nodes)
    }

    fn search_pattern(
        &self,
        org: &str,
        pattern: &str,
        request: &PatternSearchRequest,
    ) -> Result<Vec<NodeSummary>, DirectoryError> {
        let response: SearchNodesResponse =
            self.search_json(&format!("/orgs/{org}/patterns/{pattern}/search"), request)?;
        Ok(response.nodes)
    }

    fn get_patterns(
        &self,
        org: &str,
        name: Option<&str>,
    ) -> Result<std::collections::BTreeMap<String, Pattern>, DirectoryError> {
        let path = match name {
            Some(name) => format!("/orgs/{org}/patterns/{name}"),
            None => format!("/orgs/{org}/patterns"),
        };
        let response: Option<PatternsResponse> = self.get_json(&path)?;
        Ok(response.unwrap_or_default().patterns)
    }

    fn served_patterns(&self, org: &str, id: &str) -> Result<Vec<ServedPattern>, DirectoryError> {
        let response: Option<ServedPatternsResponse> =
            self.get_json(&format!("/orgs/{org}/agbots/{id}/patterns"))?;
        Ok(response.unwrap_or_default().patterns)
    }

    fn post_message(
        &self,
        org: &str,
        kind: PartyKind,
        id: &str,
        body: &PostMessageBody,
    ) -> Result<(), DirectoryError> {
        self.write_json(
            Method::POST,
            &format!("/orgs/{org}/{}/{id}/msgs", kind.path_segment()),
            Some(body),
        )
    }

    fn get_messages(
        &self,
        org: &str,
        kind: PartyKind,
        id: &str,
    ) -> Result<Vec<MailboxMessage>, DirectoryError> {
        let response: Option<MailboxResponse> =
            self.get_json(&format!("/orgs/{org}/{}/{id}/msgs", kind.path_segment()))?;
        Ok(response.unwrap_or_default().messages)
    }

    fn delete_message(
        &self,
        org: &str,
        kind: PartyKind,
        id: &str,
        msg_id: u64,
    ) -> Result<(), DirectoryError> {
        self.write_json::<()>(
            Method::DELETE,
            &format!("/orgs/{org}/{}/{id}/msgs/{msg_id}", kind.path_segment()),
            None,
        )
    }

    fn node_health(
        &self,
        org: &str,
        pattern: Option<&str>,
        request: &NodeHealthRequest,
    ) -> Result<NodeHealthResponse, DirectoryError> {
        if request.node_orgs.is_empty() {
            // Nothing to ask about; never bother the directory.
            return Ok(NodeHealthResponse::default());
        }
        let path = match pattern {
            Some(pattern) => format!("/orgs/{org}/patterns/{pattern}/nodehealth"),
            None => format!("/orgs/{org}/search/nodehealth"),
        };
        self.search_json(&path, request)
    }

    fn put_node_agreement(
        &self,
        org: &str,
        id: &str,
        agreement_id: &str,
        state: &NodeAgreementState,
    ) -> Result<(), DirectoryError> {
        self.write_json(
            Method::PUT,
            &format!("/orgs/{org}/nodes/{id}/agreements/{agreement_id}"),
            Some(state),
        )
    }

    fn delete_node_agreement(
        &self,
        org: &str,
        id: &str,
        agreement_id: &str,
    ) -> Result<(), DirectoryError> {
        self.write_json::<()>(
            Method::DELETE,
            &format!("/orgs/{org}/nodes/{id}/agreements/{agreement_id}"),
            None,
        )
    }
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() && err.status().is_none()
}
