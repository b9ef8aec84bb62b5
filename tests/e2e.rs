//! End-to-end scenarios from the runtime's testable-properties list: a
//! direct call round trip and trace stitching across a client → server →
//! client → server fan-out, driven over real in-memory duplex transports
//! rather than the pipeline alone (see the unit tests in `src/middleware.rs`
//! and `src/tracing_mw.rs` for the narrower per-component checks).

#![expect(clippy::expect_used, reason = "test assertions")]
#![expect(clippy::unwrap_used, reason = "test assertions")]

use std::sync::Arc;

use apache_avro::{Schema, types::Value};
use avro_rpc::{
    CallContext, CallOptions, Client, RpcError, Server, ServiceOptions, Trace, TraceHandle,
    avro::{Message, Service},
    tracing_mw::{CallState, ClientTracing, ServerTracing, TracingConfig},
    transport::{Transport, memory_pair},
};
use indexmap::IndexMap;
use tokio::sync::Mutex;

fn math_service() -> Arc<Service> {
    let mut messages = IndexMap::new();
    messages.insert(
        "neg".to_owned(),
        Message::new(
            "neg".to_owned(),
            false,
            Schema::Int,
            Schema::Int,
            Schema::parse_str(r#"["string"]"#).expect("parse error schema"),
        ),
    );
    Arc::new(Service::new(
        "Math",
        serde_json::json!({"protocol": "Math"}),
        messages,
        IndexMap::new(),
    ))
}

async fn connected_neg_pair(server_handler_fails: bool) -> (Client, Arc<Server>) {
    let service = math_service();
    let mut server = Server::new(Arc::clone(&service), ServiceOptions::default());
    server.on_message("neg", move |_ctx, req| async move {
        let Value::Int(n) = req else {
            return Err(RpcError::System("expected int".to_owned()));
        };
        if server_handler_fails {
            return Err(RpcError::Application(Value::Union(0, Box::new(Value::String("bar".to_owned())))));
        }
        Ok(Value::Int(-n))
    });
    let server = Arc::new(server);
    server.use_middleware(Arc::new(ServerTracing::new(TracingConfig::default()))).await;

    let client = Client::new(Arc::clone(&service), ServiceOptions::default());
    client.use_middleware(Arc::new(ClientTracing::new(TracingConfig::default()))).await;

    let (client_transport, server_transport) = memory_pair();
    client.connect(Transport::Stateful(client_transport), "", true).await;
    Server::listen(&server, Transport::Stateful(server_transport), "", true);

    (client, server)
}

/// Scenario 1: direct negation round trip (spec "Concrete end-to-end
/// scenarios" #1).
#[tokio::test]
async fn direct_negation_round_trip() {
    let (client, _server) = connected_neg_pair(false).await;
    let trace: TraceHandle = Arc::new(Mutex::new(Trace::new_random()));

    let response = client
        .emit_message(
            "neg",
            Value::Int(10),
            CallOptions {
                trace: Some(Arc::clone(&trace)),
                ..CallOptions::default()
            },
        )
        .await
        .expect("neg(10) should succeed");
    assert_eq!(response, Value::Int(-10));

    let trace = trace.lock().await;
    assert_eq!(trace.calls.len(), 1);
    assert_eq!(trace.calls[0].state, CallState::Success);
    assert!(trace.calls[0].downstream_calls.is_empty());
}

/// Scenario 2: single-hop trace stitching — a server handler makes its
/// own downstream call before failing the inbound one (spec "Concrete
/// end-to-end scenarios" #2).
#[tokio::test]
async fn single_hop_trace_stitches_a_successful_downstream_call_under_a_failing_parent() {
    let (downstream_client, _downstream_server) = connected_neg_pair(false).await;
    let downstream_client = Arc::new(downstream_client);

    let service = math_service();
    let mut server_a = Server::new(Arc::clone(&service), ServiceOptions::default());
    {
        let downstream_client = Arc::clone(&downstream_client);
        server_a.on_message("neg", move |ctx: &mut CallContext, req| {
            let downstream_client = Arc::clone(&downstream_client);
            async move {
                let Value::Int(n) = req else {
                    return Err(RpcError::System("expected int".to_owned()));
                };
                let handle = ctx
                    .local::<TraceHandle>(avro_rpc::tracing_mw::DEFAULT_TRACE_KEY)
                    .map(Arc::clone)
                    .ok_or_else(|| RpcError::System("missing incoming trace".to_owned()))?;
                downstream_client
                    .emit_message(
                        "neg",
                        Value::Int(n),
                        CallOptions {
                            trace: Some(handle),
                            ..CallOptions::default()
                        },
                    )
                    .await
                    .map_err(|e| RpcError::System(e.to_string()))?;
                Err(RpcError::Application(Value::Union(0, Box::new(Value::String("bar".to_owned())))))
            }
        });
    }
    let server_a = Arc::new(server_a);
    server_a.use_middleware(Arc::new(ServerTracing::new(TracingConfig::default()))).await;

    let client_a = Client::new(Arc::clone(&service), ServiceOptions::default());
    client_a.use_middleware(Arc::new(ClientTracing::new(TracingConfig::default()))).await;
    let (client_transport, server_transport) = memory_pair();
    client_a.connect(Transport::Stateful(client_transport), "", true).await;
    Server::listen(&server_a, Transport::Stateful(server_transport), "", true);

    let trace: TraceHandle = Arc::new(Mutex::new(Trace::new_random()));
    let err = client_a
        .emit_message(
            "neg",
            Value::Int(4),
            CallOptions {
                trace: Some(Arc::clone(&trace)),
                ..CallOptions::default()
            },
        )
        .await
        .expect_err("server A's handler always fails after its downstream call succeeds");
    assert!(matches!(err, RpcError::Application(_)));

    let trace = trace.lock().await;
    assert_eq!(trace.calls.len(), 1);
    assert_eq!(trace.calls[0].state, CallState::Error);
    assert_eq!(trace.calls[0].downstream_calls.len(), 1);
    assert_eq!(trace.calls[0].downstream_calls[0].state, CallState::Success);
}

/// Scenario 4: a client without `create_missing_outgoing` must fail a
/// call emitted with no trace option (spec "Concrete end-to-end
/// scenarios" #4).
#[tokio::test]
async fn missing_outgoing_trace_fails_the_call() {
    let (client, _server) = connected_neg_pair(false).await;
    let err = client
        .emit_message("neg", Value::Int(1), CallOptions::default())
        .await
        .expect_err("no trace option and no create_missing_outgoing");
    assert!(matches!(err, RpcError::Tracing(avro_rpc::error::TracingError::MissingOutgoing)));
}
