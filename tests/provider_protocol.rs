use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use lsp_lint::{
    BuiltinProvider, Connection, ConnectionHandlers, InitConfig, Provider, ProviderConfig,
    ProviderError, ProviderServer, ResponseError, RpcError, StdioTransport, Supervisor,
    SupervisorOptions, TagStore, Transport, TransportKind,
};

const MAX: usize = 10 * 1024 * 1024;

fn fake_provider_config() -> ProviderConfig {
    ProviderConfig {
        name: "fake".to_owned(),
        binary_path: None,
        args: Vec::new(),
        address: None,
        transport: TransportKind::Stdio,
        init_config: Vec::new(),
    }
}

/// A provider living on the far side of a duplex pipe, speaking the real
/// wire protocol.
fn serve_fake_provider(transport: Transport) -> Arc<Connection> {
    Connection::new(
        transport,
        ConnectionHandlers {
            on_notification: None,
            on_request: Some(Box::new(|method, params| match method {
                "capabilities" => Ok(json!([
                    {
                        "name": "referenced",
                        "inputSchema": {
                            "type": "object",
                            "required": ["pattern"],
                            "properties": {"pattern": {"type": "string"}},
                        },
                    }
                ])),
                "init" => Ok(json!({"builtinConfigs": []})),
                "evaluate" => {
                    let payload = params.unwrap_or_default();
                    Ok(json!({
                        "matched": true,
                        "incidents": [{
                            "fileURI": "file:///work/a.ts",
                            "lineNumber": 4,
                            "variables": {"pattern": payload["payload"]["pattern"]},
                        }],
                        "templateContext": {},
                    }))
                }
                other => Err(ResponseError::method_not_found(other)),
            })),
        },
    )
}

fn duplex_transports() -> (Transport, Transport) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    let (near_read, near_write) = tokio::io::split(near);
    let (far_read, far_write) = tokio::io::split(far);
    (
        StdioTransport::from_pair(near_read, near_write, MAX),
        StdioTransport::from_pair(far_read, far_write, MAX),
    )
}

#[tokio::test]
async fn capability_discovery_and_evaluate_round_trip() {
    let (client_side, server_side) = duplex_transports();
    let _server = serve_fake_provider(server_side);

    let supervisor = Supervisor::new(fake_provider_config(), SupervisorOptions::default());
    let provider = supervisor
        .start_with_transport(client_side, ConnectionHandlers::default(), false)
        .await
        .unwrap();

    assert!(provider.has_capability("referenced"));
    assert!(!provider.has_capability("dependency"));

    let cancel = CancellationToken::new();
    let response = provider
        .evaluate(&cancel, "referenced", json!({"pattern": "createPool"}))
        .await
        .unwrap();
    assert!(response.matched);
    assert_eq!(response.incidents.len(), 1);
    assert_eq!(response.incidents[0].file_uri, "file:///work/a.ts");
    assert_eq!(response.incidents[0].line_number, Some(4));
    assert_eq!(
        response.incidents[0].variables["pattern"],
        json!("createPool")
    );

    provider.stop().await;
    supervisor.stop().await;
}

#[tokio::test]
async fn dropped_provider_surfaces_transport_errors() {
    let (client_side, server_side) = duplex_transports();
    let server = serve_fake_provider(server_side);

    let supervisor = Supervisor::new(fake_provider_config(), SupervisorOptions::default());
    let provider = supervisor
        .start_with_transport(client_side, ConnectionHandlers::default(), false)
        .await
        .unwrap();

    server.close();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let cancel = CancellationToken::new();
    let error = provider
        .evaluate(&cancel, "referenced", json!({"pattern": "x"}))
        .await
        .unwrap_err();
    assert!(error.is_transport(), "got: {error}");

    provider.stop().await;
}

#[tokio::test]
async fn assume_works_skips_probing_and_advertises_everything() {
    let (client_side, server_side) = duplex_transports();
    let _server = serve_fake_provider(server_side);

    let supervisor = Supervisor::new(fake_provider_config(), SupervisorOptions::default());
    let provider = supervisor
        .start_with_transport(client_side, ConnectionHandlers::default(), true)
        .await
        .unwrap();

    // no probe ran, yet every method reads as supported
    assert!(provider.has_capability("referenced"));
    assert!(provider.has_capability("made-up-capability"));

    // misuse surfaces at call time, as a remote error
    let cancel = CancellationToken::new();
    let error = provider
        .evaluate(&cancel, "made-up-capability", json!({}))
        .await;
    // the fake provider answers evaluate for any capability; the contract
    // here is only that the call reached the wire rather than being
    // rejected up front
    assert!(error.is_ok());

    let unknown = provider.connection().request("no-such-method", None).await;
    assert!(matches!(unknown, Err(RpcError::Remote(_))));

    provider.stop().await;
}

#[tokio::test]
async fn builtin_provider_round_trips_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("app.js"),
        "const fs = require('fs');\nconst net = require('net');\n",
    )
    .unwrap();

    let (client_side, server_side) = duplex_transports();
    let server_cancel = CancellationToken::new();
    let server_task = tokio::spawn({
        let cancel = server_cancel.clone();
        async move {
            ProviderServer::new(Arc::new(BuiltinProvider::new(TagStore::default())))
                .serve(server_side, cancel)
                .await
        }
    });

    let supervisor = Supervisor::new(fake_provider_config(), SupervisorOptions::default());
    let provider = supervisor
        .start_with_transport(client_side, ConnectionHandlers::default(), false)
        .await
        .unwrap();
    assert!(provider.has_capability("filecontent"));
    assert!(provider.has_capability("file"));

    let cancel = CancellationToken::new();
    provider
        .init(
            &cancel,
            vec![InitConfig {
                location: dir.path().display().to_string(),
                ..Default::default()
            }],
        )
        .await
        .unwrap();

    let response = provider
        .evaluate(&cancel, "filecontent", json!({"pattern": "require"}))
        .await
        .unwrap();
    assert!(response.matched);
    assert_eq!(response.incidents.len(), 2);
    assert_eq!(response.incidents[0].line_number, Some(1));

    // shutdown notification ends the serve loop cleanly
    provider.stop().await;
    assert!(server_task.await.unwrap().is_ok());
}

#[tokio::test]
async fn empty_capability_set_is_a_fatal_startup_error() {
    let (client_side, server_side) = duplex_transports();
    let _server = Connection::new(
        server_side,
        ConnectionHandlers {
            on_notification: None,
            on_request: Some(Box::new(|method, _| match method {
                "capabilities" => Ok(json!([])),
                other => Err(ResponseError::method_not_found(other)),
            })),
        },
    );

    let options = lsp_lint::SupervisorOptionsBuilder::default()
        .startup_deadline(std::time::Duration::from_millis(150))
        .poll_interval(std::time::Duration::from_millis(40))
        .build()
        .unwrap();
    let supervisor = Supervisor::new(fake_provider_config(), options);
    let error = supervisor
        .start_with_transport(client_side, ConnectionHandlers::default(), false)
        .await;
    assert!(matches!(error, Err(ProviderError::CapabilityDeadline(_))));
}

#[tokio::test]
async fn startup_fails_without_an_endpoint() {
    let supervisor = Supervisor::new(fake_provider_config(), SupervisorOptions::default());
    let error = supervisor.start(ConnectionHandlers::default()).await;
    assert!(matches!(error, Err(ProviderError::Startup(_))));
}
