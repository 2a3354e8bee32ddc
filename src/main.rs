//! maxwell-round - issue one request round against a Maxwell service

use clap::Parser;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use maxwell_client::{Connection, MultiEndpointConnection, Options, ProtocolMsg, ReqReq};

#[derive(Parser, Debug, Clone)]
#[command(name = "maxwell-round")]
#[command(about = "Send one request to a Maxwell service and print the reply payload")]
struct Args {
    /// Comma-separated endpoints (host:port); several endpoints are rotated through
    #[arg(long, env = "MAXWELL_ENDPOINTS", default_value = "localhost:10000", value_delimiter = ',')]
    endpoints: Vec<String>,

    /// Request path
    #[arg(long, default_value = "/hello")]
    path: String,

    /// Request payload (JSON text)
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Deadline for both opening the connection and the request
    #[arg(long, env = "MAXWELL_TIMEOUT_MS", default_value = "5000")]
    timeout_ms: u64,

    /// TOML file with connection options
    #[arg(long, env = "MAXWELL_CONFIG")]
    config: Option<String>,

    /// Connect with wss instead of ws
    #[arg(long, env = "MAXWELL_TLS", default_value = "false")]
    tls: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn options(&self) -> anyhow::Result<Options> {
        let mut options = match &self.config {
            Some(path) => Options::load(path)?,
            None => Options::default(),
        };
        if self.tls {
            options.tls_enabled = true;
        }
        Ok(options)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("maxwell_client={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    anyhow::ensure!(!args.endpoints.is_empty(), "at least one endpoint is required");
    let options = args.options()?;
    let timeout = Duration::from_millis(args.timeout_ms);
    let msg = ProtocolMsg::ReqReq(ReqReq::new(args.path.clone(), args.payload.clone()));

    info!("Endpoints: {}", args.endpoints.join(", "));
    info!("Path: {}", args.path);

    let result = if args.endpoints.len() == 1 {
        let connection = Connection::new(args.endpoints[0].clone(), options);
        let result = round(
            connection.wait_open(Some(timeout)),
            connection.request(msg, Some(timeout)),
        )
        .await;
        connection.close();
        result
    } else {
        let endpoints = Arc::new(args.endpoints.clone());
        let cursor = Arc::new(AtomicUsize::new(0));
        let picker = move || {
            let endpoints = Arc::clone(&endpoints);
            let cursor = Arc::clone(&cursor);
            async move {
                let next = cursor.fetch_add(1, Ordering::Relaxed) % endpoints.len();
                Ok::<_, anyhow::Error>(endpoints[next].clone())
            }
        };
        let connection = MultiEndpointConnection::new(picker, options);
        let result = round(
            connection.wait_open(Some(timeout)),
            connection.request(msg, Some(timeout)),
        )
        .await;
        connection.close();
        result
    };

    match result {
        Ok(ProtocolMsg::ReqRep(reply)) => {
            println!("{}", reply.payload);
            Ok(())
        }
        Ok(other) => {
            error!("Unexpected reply: {}", other.summary());
            std::process::exit(1);
        }
        Err(e) => {
            error!("Round failed: {}", e);
            std::process::exit(1);
        }
    }
}

async fn round<W, R>(open: W, request: R) -> maxwell_client::Result<ProtocolMsg>
where
    W: std::future::Future<Output = maxwell_client::Result<()>>,
    R: std::future::Future<Output = maxwell_client::Result<ProtocolMsg>>,
{
    open.await?;
    request.await
}
