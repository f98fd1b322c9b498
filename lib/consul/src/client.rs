use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::ServiceEntry;
use crate::kv::{self, KvPair};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Characters escaped in a single path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Slack on top of the blocking wait before the request is abandoned. Consul
/// adds up to wait/16 of jitter to every blocking query.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

fn default_endpoint() -> String {
    "http://127.0.0.1:8500".to_string()
}

const fn default_allow_stale() -> bool {
    true
}

const fn default_wait() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid endpoint {0:?}")]
    InvalidEndpoint(String),
    #[error("load native root certificates failed, {0}")]
    NativeCerts(std::io::Error),
    #[error("invalid acl token, {0}")]
    InvalidToken(http::header::InvalidHeaderValue),
    #[error("build http request failed, {0}")]
    BuildRequest(#[from] http::Error),
    #[error(transparent)]
    Http(#[from] hyper_util::client::legacy::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(#[from] hyper::Error),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected status {status}, {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("deserialize response failed, {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("invalid X-Consul-Index header {0:?}")]
    InvalidIndex(String),
    #[error("decode value of key {key} failed, {source}")]
    DecodeValue {
        key: String,
        source: base64::DecodeError,
    },
}

/// Connection settings of the Consul agent/server to talk to.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The HTTP(S) endpoint of the Consul API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Default datacenter for every query, the agent's datacenter is used
    /// when omitted.
    #[serde(default)]
    pub datacenter: Option<String>,

    /// ACL token sent with every request
    #[serde(default)]
    pub token: Option<String>,

    /// Allow stale Consul results, which reduce load on Consul
    ///
    /// See https://developer.hashicorp.com/consul/api-docs/features/consistency
    #[serde(default = "default_allow_stale")]
    pub allow_stale: bool,

    /// Maximum duration a blocking query waits for a change.
    #[serde(default = "default_wait", with = "humanize::duration::serde")]
    pub wait: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: default_endpoint(),
            datacenter: None,
            token: None,
            allow_stale: default_allow_stale(),
            wait: default_wait(),
        }
    }
}

/// Per request options.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Overrides the datacenter of the client config
    pub datacenter: Option<String>,

    /// Non-zero turns the request into a blocking query which returns once
    /// the index moved past this value or the wait time elapsed.
    pub wait_index: u64,
}

/// Metadata returned with every read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// The index of the data returned, used as `wait_index` of the next
    /// blocking query.
    pub last_index: u64,
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: String,
    datacenter: Option<String>,
    token: Option<HeaderValue>,
    allow_stale: bool,
    wait: Duration,
}

impl Client {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            return Err(Error::InvalidEndpoint(config.endpoint.clone()));
        }

        let token = match config.token.as_deref() {
            Some(token) if !token.is_empty() => {
                let mut value = HeaderValue::from_str(token).map_err(Error::InvalidToken)?;
                value.set_sensitive(true);
                Some(value)
            }
            _ => None,
        };

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let connector = HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(provider)
            .map_err(Error::NativeCerts)?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        let http_client = HttpClient::builder(TokioExecutor::new()).build(connector);

        Ok(Client {
            http_client,
            endpoint,
            datacenter: config.datacenter.clone(),
            token,
            allow_stale: config.allow_stale,
            wait: config.wait,
        })
    }

    /// Instances of `service`, optionally restricted to those carrying every
    /// tag in `tags` and to those with only passing checks.
    pub async fn health_service(
        &self,
        service: &str,
        tags: &[String],
        passing_only: bool,
        opts: &QueryOptions,
    ) -> Result<(Vec<ServiceEntry>, QueryMeta), Error> {
        let mut query = self.query(opts);
        for tag in tags {
            query.append_pair("tag", tag);
        }
        if passing_only {
            query.append_pair("passing", "1");
        }

        let uri = format!(
            "{}/v1/health/service/{}?{}",
            self.endpoint,
            utf8_percent_encode(service, SEGMENT),
            query.finish()
        );
        let (status, meta, body) = self.get(uri, opts.wait_index != 0).await?;
        if !status.is_success() {
            return Err(unexpected(status, &body));
        }

        let entries = serde_json::from_slice::<Vec<ServiceEntry>>(&body)?;

        Ok((entries, meta))
    }

    /// Read a single key, `None` if it does not exist.
    pub async fn kv_get(&self, key: &str) -> Result<Option<KvPair>, Error> {
        let mut query = self.query(&QueryOptions::default());
        let uri = format!(
            "{}/v1/kv/{}?{}",
            self.endpoint,
            encode_key(key),
            query.finish()
        );

        let (status, _meta, body) = self.get(uri, false).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(kv::decode(&body)?.into_iter().next()),
            status => Err(unexpected(status, &body)),
        }
    }

    /// Every key under `prefix`, including the prefix itself if it exists.
    pub async fn kv_list(&self, prefix: &str) -> Result<Vec<KvPair>, Error> {
        let mut query = self.query(&QueryOptions::default());
        query.append_pair("recurse", "true");
        let uri = format!(
            "{}/v1/kv/{}?{}",
            self.endpoint,
            encode_key(prefix),
            query.finish()
        );

        let (status, _meta, body) = self.get(uri, false).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => kv::decode(&body),
            status => Err(unexpected(status, &body)),
        }
    }

    fn query(&self, opts: &QueryOptions) -> form_urlencoded::Serializer<'static, String> {
        let mut builder = form_urlencoded::Serializer::new(String::new());

        if let Some(datacenter) = opts.datacenter.as_ref().or(self.datacenter.as_ref()) {
            builder.append_pair("dc", datacenter);
        }
        if self.allow_stale {
            builder.append_pair("stale", "");
        }
        if opts.wait_index != 0 {
            builder.append_pair("index", opts.wait_index.to_string().as_str());
            builder.append_pair("wait", format!("{}ms", self.wait.as_millis()).as_str());
        }

        builder
    }

    async fn get(&self, uri: String, blocking: bool) -> Result<(StatusCode, QueryMeta, Bytes), Error> {
        trace!(message = "doing http request", uri, blocking);

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;
        if let Some(token) = &self.token {
            req.headers_mut().insert(TOKEN_HEADER, token.clone());
        }

        let timeout = if blocking {
            self.wait + self.wait / 16 + REQUEST_SLACK
        } else {
            REQUEST_SLACK * 3
        };

        let fut = async {
            let resp = self.http_client.request(req).await?;
            let (parts, incoming) = resp.into_parts();
            let body = incoming.collect().await?.to_bytes();

            Ok::<_, Error>((parts, body))
        };
        let (parts, body) = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        let meta = match parts.headers.get(INDEX_HEADER) {
            Some(value) => {
                let value = value
                    .to_str()
                    .map_err(|_| Error::InvalidIndex(format!("{value:?}")))?;
                let last_index = value
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidIndex(value.to_string()))?;

                QueryMeta { last_index }
            }
            None => QueryMeta::default(),
        };

        Ok((parts.status, meta, body))
    }
}

/// KV keys keep their `/` separators, everything else of each segment is
/// escaped.
fn encode_key(key: &str) -> String {
    key.split('/')
        .map(|segment| utf8_percent_encode(segment, SEGMENT).to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn unexpected(status: StatusCode, body: &[u8]) -> Error {
    Error::UnexpectedStatus {
        status,
        body: String::from_utf8_lossy(body).trim().to_string(),
    }
}
