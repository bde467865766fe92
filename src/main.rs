use clap::Parser;
use futures::StreamExt;
use futures::stream::select_all;
use std::sync::Arc;
use std::time::Duration;
use syndesis_api::api::changes::{ChangeConfig, EventEndpoint, ResourceKey, SseTransport, SubscriberRegistry};
use syndesis_api::api::{ApiConfig, HttpFetchGateway, VersionSource};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API root, e.g. `https://syndesis.example.com/api/v1`
    base_url: String,

    /// Resource key to watch, e.g. `integrations` or `connections:abc`. Repeatable.
    #[arg(short, long = "key", default_value = "integrations")]
    keys: Vec<String>,

    /// Poll interval in milliseconds
    #[arg(short, long)]
    interval_ms: Option<u64>,

    /// Poll only, never open the event stream
    #[arg(long)]
    no_events: bool,

    /// Bearer token for the API
    #[arg(short, long)]
    token: Option<String>,

    /// Read versions from this JSON pointer instead of the version header
    #[arg(long)]
    version_pointer: Option<String>,

    /// Fixed event stream path instead of the reservation handshake
    #[arg(long)]
    events_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut api = ApiConfig::new(&args.base_url)?;
    if let Some(token) = args.token {
        api = api.with_token(token);
    }

    let mut config = ChangeConfig::from_env();
    if let Some(ms) = args.interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }

    let version_source = args
        .version_pointer
        .map_or_else(VersionSource::default, VersionSource::Pointer);
    let gateway = Arc::new(HttpFetchGateway::new(api.clone(), version_source)?);

    let mut builder = SubscriberRegistry::builder(gateway).config(config);
    if !args.no_events {
        let endpoint = args.events_path.map_or(EventEndpoint::Reservation, EventEndpoint::Path);
        builder = builder.transport(Arc::new(SseTransport::new(api, endpoint)?));
    }
    let registry = builder.build()?;

    let mut disposers = Vec::with_capacity(args.keys.len());
    let mut streams = Vec::with_capacity(args.keys.len());
    for key in &args.keys {
        let (disposer, stream) = registry.subscribe_channel(&ResourceKey::new(key));
        disposers.push(disposer);
        streams.push(stream);
    }
    info!("Watching {} keys at {}", args.keys.len(), args.base_url);

    let mut changes = select_all(streams);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            next = changes.next() => match next {
                Some(change) => println!("{}", serde_json::to_string(&change)?),
                None => break,
            },
        }
    }

    for disposer in &disposers {
        disposer.dispose();
    }
    registry.shutdown();
    info!("{:?}", registry.stats());
    Ok(())
}
