//! Herald kubehub – events watch connection and record decoding

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Event as KubeEvent;
use kube::config::{AuthInfo, Cluster, Context as KubeContext, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};
use kube::{api::WatchParams, core::Request, Client, Resource};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufRead;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info};

pub mod decode;

pub use decode::{decode_record, DecodeError, DecodedRecord, EventDecoder};

/// In-cluster service account token path.
pub const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// In-cluster CA bundle that signs the API server certificate.
pub const DEFAULT_CA_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

/// How the watch connection reaches the API server.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// `https://host:port` with a bearer token read from `token_file`.
    #[default]
    Direct,
    /// Plain URL of an authenticating proxy such as `kubectl proxy`.
    Proxy,
    /// kubeconfig or in-cluster config, whichever kube infers.
    Infer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchConfig {
    pub transport: TransportMode,
    pub host: Option<String>,
    pub port: u16,
    pub token_file: PathBuf,
    /// PEM bundle trusted for the API server (direct transport).
    pub ca_file: PathBuf,
    pub insecure_skip_tls_verify: bool,
    pub proxy_url: String,
    /// Watch a single namespace instead of the whole cluster.
    pub namespace: Option<String>,
    pub field_selector: Option<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Direct,
            host: None,
            port: 443,
            token_file: PathBuf::from(DEFAULT_TOKEN_FILE),
            ca_file: PathBuf::from(DEFAULT_CA_FILE),
            insecure_skip_tls_verify: false,
            proxy_url: "http://127.0.0.1:8001".to_string(),
            namespace: None,
            field_selector: None,
        }
    }
}

impl WatchConfig {
    /// Path of the events collection, e.g. `/api/v1/events` or `/api/v1/namespaces/ns/events`.
    pub fn url_path(&self) -> String {
        KubeEvent::url_path(&(), self.namespace.as_deref())
    }
}

/// Byte stream of the open watch connection.
pub type EventReader = Pin<Box<dyn AsyncBufRead + Send>>;

fn direct_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("https://[{}]:{}", host, port)
    } else {
        format!("https://{}:{}", host, port)
    }
}

const DIRECT_CONTEXT: &str = "herald";

/// Single-context kubeconfig for `https://host:port`, a token file and an optional CA bundle.
fn direct_kubeconfig(cfg: &WatchConfig, host: &str, ca_file: Option<String>) -> Kubeconfig {
    Kubeconfig {
        clusters: vec![NamedCluster {
            name: DIRECT_CONTEXT.to_string(),
            cluster: Some(Cluster {
                server: Some(direct_url(host, cfg.port)),
                certificate_authority: ca_file,
                insecure_skip_tls_verify: Some(cfg.insecure_skip_tls_verify),
                ..Cluster::default()
            }),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: DIRECT_CONTEXT.to_string(),
            auth_info: Some(AuthInfo {
                token_file: Some(cfg.token_file.to_string_lossy().into_owned()),
                ..AuthInfo::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: DIRECT_CONTEXT.to_string(),
            context: Some(KubeContext {
                cluster: DIRECT_CONTEXT.to_string(),
                user: DIRECT_CONTEXT.to_string(),
                ..KubeContext::default()
            }),
        }],
        current_context: Some(DIRECT_CONTEXT.to_string()),
        ..Kubeconfig::default()
    }
}

/// Build the kube client config for the selected transport.
pub async fn client_config(cfg: &WatchConfig) -> Result<kube::Config> {
    let mut config = match cfg.transport {
        TransportMode::Direct => {
            let host = cfg
                .host
                .as_deref()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| anyhow!("no API server host configured (KUBERNETES_SERVICE_HOST) for direct transport"))?;
            tokio::fs::metadata(&cfg.token_file)
                .await
                .with_context(|| format!("reading bearer token file {}", cfg.token_file.display()))?;
            let ca_file = if cfg.insecure_skip_tls_verify {
                None
            } else {
                tokio::fs::metadata(&cfg.ca_file).await.with_context(|| {
                    format!("reading cluster CA file {} (or skip verification with --insecure-skip-tls-verify)", cfg.ca_file.display())
                })?;
                Some(cfg.ca_file.to_string_lossy().into_owned())
            };
            let mut c = kube::Config::from_custom_kubeconfig(direct_kubeconfig(cfg, host, ca_file), &KubeConfigOptions::default())
                .await
                .context("loading direct transport config")?;
            // Only the proxy transport goes through a proxy.
            c.proxy_url = None;
            c
        }
        TransportMode::Proxy => {
            kube::Config::new(cfg.proxy_url.parse().with_context(|| format!("parsing proxy url {}", cfg.proxy_url))?)
        }
        TransportMode::Infer => kube::Config::infer().await.context("inferring kube config")?,
    };
    if cfg.insecure_skip_tls_verify {
        config.accept_invalid_certs = true;
    }
    // Watch streams stay idle for long stretches; never cut them on read inactivity.
    config.read_timeout = None;
    Ok(config)
}

/// Request builder for the events collection.
pub fn events_request(cfg: &WatchConfig) -> Request {
    Request::new(cfg.url_path())
}

pub fn watch_params(cfg: &WatchConfig) -> WatchParams {
    let wp = WatchParams::default().disable_bookmarks();
    match cfg.field_selector.as_deref() {
        Some(sel) => wp.fields(sel),
        None => wp,
    }
}

/// Drop the `timeoutSeconds` kube always appends to watch queries, so the stream
/// stays open until the server ends it.
pub fn without_client_timeout(uri: &str) -> String {
    let Some((path, query)) = uri.split_once('?') else {
        return uri.to_string();
    };
    let pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty() && !p.starts_with("timeoutSeconds=")).collect();
    format!("{}?{}", path, pairs.join("&"))
}

/// Open the long-lived events watch. Failures here are fatal to the caller; there is no retry.
pub async fn connect(cfg: &WatchConfig) -> Result<EventReader> {
    let config = client_config(cfg).await?;
    debug!(url = %config.cluster_url, transport = ?cfg.transport, "building kube client");
    let client = Client::try_from(config).context("building kube client")?;

    // resourceVersion 0: the server replays what it holds, then streams new events.
    let mut req = events_request(cfg)
        .watch(&watch_params(cfg), "0")
        .context("building events watch request")?;
    let uri = without_client_timeout(&req.uri().to_string());
    *req.uri_mut() = uri.parse().with_context(|| format!("parsing events watch uri {}", uri))?;
    let reader = client.request_stream(req).await.context("opening events watch stream")?;
    info!(path = %cfg.url_path(), ns = ?cfg.namespace, transport = ?cfg.transport, "events watch connected");
    Ok(Box::pin(reader.compat()))
}
