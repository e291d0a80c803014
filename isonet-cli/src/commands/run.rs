//! Isolate host process

use anyhow::{Context, Result};
use isonet_core::{CallbackListener, Isonet, PresenceEvent, SignalTransport};
use isonet_http::{router, serve, HttpTransport, ReceiverState};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use super::load_config;
use crate::Overrides;

pub async fn run_isolate(config_path: &Path, overrides: &Overrides) -> Result<()> {
    let config = load_config(config_path, overrides)?;

    // Bound first: discovery announces the port
    let listener = TcpListener::bind(&config.receiver.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.receiver.listen_addr))?;
    let port = listener.local_addr()?.port();

    let transport: Arc<dyn SignalTransport> =
        Arc::new(HttpTransport::new(config.receiver.path.clone())?);
    let isonet = Isonet::new(config, port, vec![transport])?;

    isonet
        .directory()
        .subscribe(Arc::new(CallbackListener::new(|event: &PresenceEvent| {
            match event {
                PresenceEvent::Validated { uid, node } => {
                    tracing::info!(%uid, %node, "isolate validated")
                }
                PresenceEvent::Lost { uid, node } => tracing::info!(%uid, %node, "isolate lost"),
            }
        })));

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(serve(
        listener,
        router(ReceiverState::for_isonet(&isonet)),
        async move {
            let _ = shutdown_rx.await;
        },
    ));

    isonet.start().await?;
    println!(
        "isolate {} listening on port {} (Ctrl+C to stop)",
        isonet.directory().local_uid(),
        port
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    isonet.stop().await;
    let _ = shutdown_tx.send(());
    server.await??;
    Ok(())
}
