//! One-shot signal delivery

use anyhow::{anyhow, Context, Result};
use isonet_core::SignalTransport;
use isonet_http::HttpTransport;
use isonet_types::{DeliveryMode, HostAccess, SignalEnvelope};
use serde_json::Value;
use std::path::Path;

use super::load_config;
use crate::Overrides;

pub async fn send_signal(
    config_path: &Path,
    overrides: &Overrides,
    target: &str,
    subject: &str,
    content: &str,
    mode: DeliveryMode,
) -> Result<()> {
    let mut config = load_config(config_path, overrides)?;
    let identity = config.resolve_identity();

    let (host, port) = target
        .rsplit_once(':')
        .and_then(|(host, port)| Some((host, port.parse::<u16>().ok()?)))
        .ok_or_else(|| anyhow!("target '{}' is not host:port", target))?;
    let content: Value = serde_json::from_str(content).context("content is not valid JSON")?;

    let envelope = SignalEnvelope::new(subject, identity.uid, identity.name, identity.node, content);
    let transport = HttpTransport::new(config.receiver.path.clone())?;
    let results = transport
        .deliver(&HostAccess::new(host, port), mode, subject, &envelope)
        .await?;

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
