use anyhow::Context;
use quik_connector::{MarketDataSource, OrderPlacer, QuikConfig, QuikConnector, TransReply};
use tracing::{info, warn, Level};

/// Comma separated `CLASS:CODE` pairs to subscribe to, e.g. `SPBFUT:RIU8`
const SUBSCRIPTIONS_VAR: &str = "QUIK_SUBSCRIPTIONS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("Failed to load QUIK configuration")?;

    let level = config.log_level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    let connector = QuikConnector::new(config)?;

    for (class_code, sec_code) in subscriptions_from_env() {
        connector.subscribe(&class_code, &sec_code, |trade| {
            info!(
                "{}:{} price={} qty={}",
                trade.class_code, trade.sec_code, trade.price, trade.qty
            );
        })?;
    }
    connector.subscribe_transactions(|reply| match reply {
        TransReply::Detailed(detail) => info!(trans_id = ?detail.trans_id, "{}", detail.result_msg),
        TransReply::Ack(result) => info!("Transaction acknowledged: {}", result),
    });

    let shutdown = connector.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted by user");
            shutdown.shutdown();
        }
    });

    connector.run().await?;
    Ok(())
}

#[cfg(feature = "env-file")]
fn load_config() -> Result<QuikConfig, quik_connector::core::config::ConfigError> {
    QuikConfig::from_env_file("QUIK")
}

#[cfg(not(feature = "env-file"))]
fn load_config() -> Result<QuikConfig, quik_connector::core::config::ConfigError> {
    QuikConfig::from_env("QUIK")
}

fn subscriptions_from_env() -> Vec<(String, String)> {
    let Ok(raw) = std::env::var(SUBSCRIPTIONS_VAR) else {
        return Vec::new();
    };
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .filter_map(|item| match item.split_once(':') {
            Some((class_code, sec_code)) => Some((class_code.to_string(), sec_code.to_string())),
            None => {
                warn!("Ignoring subscription '{}', expected CLASS:CODE", item);
                None
            }
        })
        .collect()
}
