use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use herald_core::{Decision, NotificationStyle, Policy, PolicyConfig, Rule, WatchEventType};
use herald_kubehub::{decode_record, TransportMode, WatchConfig, DEFAULT_CA_FILE, DEFAULT_TOKEN_FILE};
use herald_notify::{LogNotifier, Notifier, RenderMode, Renderer, SlackConfig, SlackNotifier};
use herald_pipeline::{Pipeline, PipelineOptions};
use herald_slash::SlashConfig;
use serde::Serialize;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "heraldctl", version, about = "Watch Kubernetes events and forward the interesting ones to Slack")]
struct Cli {
    /// Output format (decide)
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Log line format
    #[arg(long = "log-format", value_enum, global = true, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat { Text, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Transport { Direct, Proxy, Infer }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Render { Attachment, Inline }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stream cluster events and notify Slack until the watch ends
    Watch(WatchArgs),
    /// Run the notification policy on one watch record and print the decision
    Decide(DecideArgs),
    /// Serve the /kubectl slash command endpoint
    Slash(SlashArgs),
}

#[derive(Args, Debug)]
struct KubeArgs {
    /// How to reach the API server
    #[arg(long = "transport", value_enum, env = "HERALD_TRANSPORT", default_value_t = Transport::Direct)]
    transport: Transport,
    /// API server host (direct transport)
    #[arg(long = "host", env = "KUBERNETES_SERVICE_HOST")]
    host: Option<String>,
    #[arg(long = "port", env = "KUBERNETES_PORT_443_TCP_PORT", default_value_t = 443)]
    port: u16,
    /// Bearer token file (direct transport)
    #[arg(long = "token-file", env = "HERALD_TOKEN_FILE", default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,
    /// CA bundle for the API server certificate (direct transport)
    #[arg(long = "ca-file", env = "HERALD_CA_FILE", default_value = DEFAULT_CA_FILE)]
    ca_file: PathBuf,
    #[arg(long = "insecure-skip-tls-verify", env = "HERALD_INSECURE", action = ArgAction::SetTrue)]
    insecure_skip_tls_verify: bool,
    /// Proxy base URL (proxy transport)
    #[arg(long = "proxy-url", env = "HERALD_PROXY_URL", default_value = "http://127.0.0.1:8001")]
    proxy_url: String,
    /// Watch one namespace instead of the whole cluster
    #[arg(long = "namespace", env = "HERALD_NAMESPACE")]
    namespace: Option<String>,
    #[arg(long = "field-selector", env = "HERALD_FIELD_SELECTOR")]
    field_selector: Option<String>,
}

impl KubeArgs {
    fn to_config(&self) -> WatchConfig {
        WatchConfig {
            transport: match self.transport {
                Transport::Direct => TransportMode::Direct,
                Transport::Proxy => TransportMode::Proxy,
                Transport::Infer => TransportMode::Infer,
            },
            host: self.host.clone(),
            port: self.port,
            token_file: self.token_file.clone(),
            ca_file: self.ca_file.clone(),
            insecure_skip_tls_verify: self.insecure_skip_tls_verify,
            proxy_url: self.proxy_url.clone(),
            namespace: self.namespace.clone(),
            field_selector: self.field_selector.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct SlackArgs {
    #[arg(long = "slack-token", env = "SLACK_TOKEN", hide_env_values = true)]
    slack_token: Option<String>,
    #[arg(long = "slack-channel", env = "SLACK_CHANNEL")]
    slack_channel: Option<String>,
    /// Incoming webhook, used when no token is set
    #[arg(long = "slack-webhook-url", env = "SLACK_WEBHOOK_URL", hide_env_values = true)]
    slack_webhook_url: Option<String>,
    #[arg(long = "slack-api-base", default_value = herald_notify::slack::DEFAULT_API_BASE)]
    slack_api_base: String,
    #[arg(long = "render", value_enum, env = "HERALD_RENDER", default_value_t = Render::Attachment)]
    render: Render,
    /// Appended to every message
    #[arg(long = "cluster-name", env = "CLUSTER_NAME")]
    cluster_name: Option<String>,
}

impl SlackArgs {
    fn render_mode(&self) -> RenderMode {
        match self.render {
            Render::Attachment => RenderMode::Attachment,
            Render::Inline => RenderMode::Inline,
        }
    }

    fn to_config(&self) -> SlackConfig {
        SlackConfig {
            token: self.slack_token.clone(),
            channel: self.slack_channel.clone(),
            webhook_url: self.slack_webhook_url.clone(),
            api_base: self.slack_api_base.clone(),
            render: self.render_mode(),
            cluster_name: self.cluster_name.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct PolicyArgs {
    /// Extra allow-list entry `Reason[=style]`; repeat or comma-separate
    #[arg(long = "rule", env = "HERALD_RULES", value_delimiter = ',')]
    rules: Vec<Rule>,
    /// Events older than this are never sent
    #[arg(long = "max-age-secs", default_value_t = 60)]
    max_age_secs: u64,
    #[arg(long = "backoff-reason", default_value = "BackOff")]
    backoff_reason: String,
    /// Exact count that escalates the backoff reason
    #[arg(long = "backoff-count", default_value_t = 3)]
    backoff_count: u32,
    #[arg(long = "backoff-style", default_value = "danger")]
    backoff_style: NotificationStyle,
}

impl PolicyArgs {
    fn to_config(&self) -> PolicyConfig {
        PolicyConfig {
            backoff_reason: self.backoff_reason.clone(),
            backoff_count: self.backoff_count,
            backoff_style: self.backoff_style.clone(),
            max_age: Duration::from_secs(self.max_age_secs),
            ..PolicyConfig::default()
        }
        .with_rules(self.rules.iter().cloned())
    }
}

#[derive(Args, Debug)]
struct WatchArgs {
    #[command(flatten)]
    kube: KubeArgs,
    #[command(flatten)]
    slack: SlackArgs,
    #[command(flatten)]
    policy: PolicyArgs,
    /// Log and drop malformed records instead of stopping
    #[arg(long = "skip-malformed", env = "HERALD_SKIP_MALFORMED", action = ArgAction::SetTrue)]
    skip_malformed: bool,
    /// Log rendered messages instead of posting them
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
}

#[derive(Args, Debug)]
struct DecideArgs {
    /// File holding one watch record; stdin when omitted or `-`
    file: Option<PathBuf>,
    /// Evaluate as of this RFC 3339 instant instead of now
    #[arg(long = "now")]
    now: Option<DateTime<Utc>>,
    #[command(flatten)]
    policy: PolicyArgs,
}

#[derive(Args, Debug)]
struct SlashArgs {
    #[arg(long = "listen", env = "HERALD_SLASH_LISTEN", default_value = "0.0.0.0:9090")]
    listen: SocketAddr,
    /// Verification token configured on the Slack command
    #[arg(long = "slash-token", env = "SLASH_TOKEN", hide_env_values = true)]
    slash_token: String,
}

fn init_tracing(format: LogFormat) {
    let env = std::env::var("HERALD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init(),
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).with_target(true).json().init(),
    }
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HERALD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HERALD_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    init_metrics();

    match cli.command {
        Commands::Watch(args) => run_watch(args).await,
        Commands::Decide(args) => run_decide(args, cli.output),
        Commands::Slash(args) => herald_slash::serve(&SlashConfig { token: args.slash_token, listen: args.listen }).await,
    }
}

async fn run_watch(args: WatchArgs) -> Result<()> {
    let watch_cfg = args.kube.to_config();
    let policy = Policy::new(&args.policy.to_config());
    let notifier: Box<dyn Notifier> = if args.dry_run {
        Box::new(LogNotifier::new(Renderer::new(args.slack.render_mode(), args.slack.cluster_name.clone())))
    } else {
        Box::new(SlackNotifier::new(&args.slack.to_config())?)
    };
    let opts = PipelineOptions { skip_malformed: args.skip_malformed };
    let mut pipeline = Pipeline::new(&policy, notifier.as_ref(), opts);

    info!(transport = ?watch_cfg.transport, path = %watch_cfg.url_path(), sink = notifier.name(), "watching events");
    tokio::select! {
        res = pipeline.connect_and_run(herald_kubehub::connect(&watch_cfg)) => match res {
            Ok(summary) => {
                info!(
                    records = summary.records,
                    notified = summary.notified,
                    suppressed = summary.suppressed,
                    skipped_malformed = summary.skipped_malformed,
                    "watch finished"
                );
                Ok(())
            }
            Err(e) => {
                error!(error = %e, raw = ?e.raw_record(), "watch stopped");
                Err(e.into())
            }
        },
        _ = signal::ctrl_c() => {
            info!("Ctrl-C received; stopping watch");
            Ok(())
        }
    }
}

#[derive(Debug, Serialize)]
struct DecideReport {
    #[serde(rename = "type")]
    kind: WatchEventType,
    reason: String,
    count: u32,
    age_secs: i64,
    decision: Decision,
}

fn decide_bytes(bytes: &[u8], cfg: &PolicyConfig, now: DateTime<Utc>) -> Result<DecideReport> {
    let rec = decode_record(bytes.trim_ascii(), 1)?;
    let decision = Policy::new(cfg).decide(&rec.event, now);
    Ok(DecideReport {
        kind: rec.kind,
        age_secs: (now - rec.event.last_timestamp).num_seconds(),
        reason: rec.event.reason,
        count: rec.event.count,
        decision,
    })
}

fn run_decide(args: DecideArgs, output: Output) -> Result<()> {
    let bytes = match args.file.as_deref() {
        Some(p) if p.as_os_str() != "-" => std::fs::read(p).with_context(|| format!("reading {}", p.display()))?,
        _ => {
            let mut buf = Vec::new();
            std::io::stdin().read_to_end(&mut buf).context("reading stdin")?;
            buf
        }
    };
    let report = decide_bytes(&bytes, &args.policy.to_config(), args.now.unwrap_or_else(Utc::now))?;
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        Output::Human => {
            let style = report.decision.style.as_ref().map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
            println!(
                "{} {} count={} age={}s -> notify={} style={} cause={}",
                report.kind,
                report.reason,
                report.count,
                report.age_secs,
                report.decision.notify,
                style,
                report.decision.cause.as_str()
            );
        }
    }
    Ok(())
}
