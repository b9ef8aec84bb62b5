//! Demo binary: wires one Avro protocol ("Echo") into a [`Server`],
//! binds it to a [`Proxy`] scope, and serves `POST`/`CONNECT`/WebSocket
//! traffic for it on the configured address.

use std::sync::Arc;

use apache_avro::Schema;
use avro_rpc::{
    Message, ServiceOptions,
    avro::Service,
    config::Cli,
    proxy::{Proxy, ProxyOptions},
    server::Server,
    tracing_mw::{ServerTracing, TracingConfig},
};
use clap::Parser;
use indexmap::IndexMap;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const ECHO_SCOPE: &str = "echo";

fn echo_service() -> Arc<Service> {
    let mut messages = IndexMap::new();
    messages.insert(
        "echo".to_owned(),
        Message::new("echo".to_owned(), false, Schema::String, Schema::String, Schema::String),
    );
    Arc::new(Service::new(
        "Echo",
        serde_json::json!({"protocol": "Echo"}),
        messages,
        IndexMap::new(),
    ))
}

async fn build_server(trace_key: &str) -> Arc<Server> {
    let mut server = Server::new(echo_service(), ServiceOptions::default());
    server.on_message("echo", |_ctx, req| async move { Ok(req) });
    let tracing_config = TracingConfig {
        trace_key: trace_key.to_owned(),
        ..TracingConfig::default()
    };
    server.use_middleware(Arc::new(ServerTracing::new(tracing_config))).await;
    Arc::new(server)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = cli.config;

    let server = build_server(&config.trace_key).await;
    let proxy = Arc::new(
        Proxy::new(
            ProxyOptions {
                post_scope_prefix: config.post_scope_prefix.clone(),
                no_ping: config.no_ping,
            },
            None,
        )
        .expect_scopes([ECHO_SCOPE.to_owned()]),
    );
    proxy.bind_server(ECHO_SCOPE, server);

    info!(bind = %config.bind, scope = ECHO_SCOPE, "starting avro-rpc demo proxy");
    let listener = TcpListener::bind(&config.bind).await?;
    proxy
        .serve_with_shutdown(listener, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received ctrl-c, shutting down");
        })
        .await?;
    Ok(())
}
