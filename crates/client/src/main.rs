//! `waybill-agent`: headless sync agent.
//!
//! Keeps the offline queue draining against the backend and, when an identity
//! is configured, mirrors realtime events into the log.

use anyhow::Context;

use waybill_client::{ClientConfig, SyncContext};
use waybill_events::WILDCARD;
use waybill_observability::LogFormat;

const ENV_LOG_FORMAT: &str = "WAYBILL_LOG_FORMAT";
const ENV_USER_ID: &str = "WAYBILL_USER_ID";
const ENV_AUTH_TOKEN: &str = "WAYBILL_AUTH_TOKEN";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var(ENV_LOG_FORMAT) {
        Ok(raw) => raw.parse::<LogFormat>()?,
        Err(_) => LogFormat::default(),
    };
    waybill_observability::init_with(format);

    let config = ClientConfig::from_env().context("loading configuration")?;
    let ctx = SyncContext::build(config).await.context("building sync context")?;

    let worker = ctx.sync_worker();
    let worker_handle = worker.start();

    let identity = std::env::var(ENV_USER_ID).ok().zip(std::env::var(ENV_AUTH_TOKEN).ok());
    let _events = match identity {
        Some((user_id, token)) => {
            let handle = ctx.realtime.subscribe(WILDCARD, |event| {
                tracing::info!(event_type = %event.event_type, data = %event.data, "realtime event");
                Ok(())
            });
            if !ctx.realtime.initialize(user_id, token).await {
                tracing::warn!("realtime channel not connected yet; retrying in the background");
            }
            Some(handle)
        }
        None => {
            tracing::info!("{ENV_USER_ID}/{ENV_AUTH_TOKEN} not set; realtime channel disabled");
            None
        }
    };

    tracing::info!("waybill-agent running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;

    tracing::info!("shutting down");
    ctx.realtime.disconnect();
    worker.shutdown();
    worker_handle.await.context("joining sync worker")?;

    Ok(())
}
