use std::error::Error;
use std::sync::Arc;

use rand::rngs::OsRng;
use tokio::io::BufReader;
use tracing::info;

use sepal_onion::crypto::{encode_b64, KeyPair};
use sepal_onion::logging;
use sepal_onion::relay::intake::serve_lines;
use sepal_onion::relay::{Relay, Transport};
use sepal_onion::{RelayConfig, RunConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::new("http://127.0.0.1:8080"),
    };
    logging::init(config.log_level);

    let keys = KeyPair::generate(&mut OsRng);
    info!(
        address = %config.address,
        public_key = %encode_b64(keys.public_key().as_bytes()),
        "sepal relay starting"
    );

    let transport = build_transport(&config)?;
    let (relay, mut deliveries) = Relay::new(config.address.clone(), keys, transport);
    let relay = Arc::new(relay);

    if let Some(run_file) = &config.run_file {
        relay.start_run(&RunConfig::load(run_file)?)?;
    }

    tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            info!(
                from = %delivery.from,
                message = %String::from_utf8_lossy(&delivery.message),
                "inbox"
            );
        }
    });

    let reader = BufReader::new(tokio::io::stdin());
    let summary = serve_lines(Arc::clone(&relay), reader).await?;
    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        abandoned = summary.abandoned,
        "input closed"
    );
    relay.stats().log_stats();
    Ok(())
}

#[cfg(feature = "http_transport")]
fn build_transport(config: &RelayConfig) -> Result<Arc<dyn Transport>, Box<dyn Error>> {
    let transport = sepal_onion::relay::HttpTransport::new(config.forward_timeout())?;
    Ok(Arc::new(transport))
}

#[cfg(not(feature = "http_transport"))]
fn build_transport(_config: &RelayConfig) -> Result<Arc<dyn Transport>, Box<dyn Error>> {
    let (transport, mut outbox) = sepal_onion::relay::ChannelTransport::new();
    tokio::spawn(async move {
        while let Some(envelope) = outbox.recv().await {
            info!(to = %envelope.to, "outbound envelope");
        }
    });
    Ok(Arc::new(transport))
}
