use dealflow_daemon::{
    ControlServer, DaemonConfig,
    http::{self, HttpAgent, HttpEntityRepository, HttpSideEffectHandler},
};
use dealflow_engine::WorkflowEngine;
use dealflow_workflow::{NatsConfig, NatsEventSink};
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,dealflow=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = DaemonConfig::from_env().expect("failed to load configuration");
    tracing::info!("Loaded configuration");

    let client = http::client(config.http_timeout()).expect("failed to build HTTP client");

    tracing::info!(url = %config.nats.url, "Connecting to NATS");
    let nats = async_nats::connect(&config.nats.url)
        .await
        .expect("failed to connect to NATS");
    let sink = NatsEventSink::with_client(
        nats.clone(),
        NatsConfig {
            url: config.nats.url.clone(),
            events_stream_name: config.nats.events_stream_name.clone(),
        },
    )
    .await
    .expect("failed to set up the events stream");

    let mut builder = WorkflowEngine::builder(config.engine.clone()).with_event_sink(Arc::new(sink));
    for (name, endpoint) in &config.agents {
        tracing::info!(agent = %name, endpoint = %endpoint, "Registering HTTP agent");
        builder = builder.with_agent(Arc::new(HttpAgent::new(name, endpoint, client.clone())));
    }
    for (kind, endpoint) in config.side_effects.configured() {
        tracing::info!(kind = kind.as_str(), endpoint = %endpoint, "Registering side-effect endpoint");
        builder = builder.with_handler(Arc::new(HttpSideEffectHandler::new(
            kind,
            endpoint,
            client.clone(),
        )));
    }
    match &config.entity_endpoint {
        Some(endpoint) => {
            builder = builder.with_entity_repository(Arc::new(HttpEntityRepository::new(
                endpoint.as_str(),
                client.clone(),
            )));
        }
        None => {
            tracing::warn!("No entity endpoint configured; entities resolve from an empty in-memory store");
        }
    }

    let engine = Arc::new(builder.build().expect("failed to build workflow engine"));
    let scheduler = engine.spawn().await.expect("failed to start scheduler");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let control = ControlServer::new(engine.clone(), nats.clone(), config.nats.control_prefix.clone());
    let control = tokio::spawn(control.serve(shutdown_rx));

    tracing::info!("dealflow daemon running");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }

    tracing::info!("Shutting down");
    shutdown_tx.send_replace(true);
    engine.shutdown();
    if let Err(e) = scheduler.await {
        tracing::error!(error = %e, "Scheduler task ended abnormally");
    }
    match control.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "Control server failed"),
        Err(e) => tracing::error!(error = %e, "Control server task ended abnormally"),
    }
    if let Err(e) = nats.flush().await {
        tracing::warn!(error = %e, "Failed to flush NATS connection");
    }
}
