use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use pion::api_client::ReqwestDispatcher;
use pion::provision::{DefinitionStoreLoader, ProvisionConfig, RoleConfig};
use pion::{Player, StaticIdentityProvider, TestDataStore, UserData};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    hits: Arc<AtomicUsize>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let app = Router::new()
            .route(
                "/tokens",
                post(|| async move {
                    (
                        StatusCode::CREATED,
                        Json(json!({
                            "case_id": "C-1",
                            "tokens": [
                                {"token": "token value"},
                                {"token": "token value at index 2"}
                            ]
                        })),
                    )
                }),
            )
            .route(
                "/cases/:cid",
                get(
                    |State(hits): State<Arc<AtomicUsize>>,
                     Path(cid): Path<String>,
                     Query(query): Query<HashMap<String, String>>,
                     headers: HeaderMap| async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let auth = bearer(&headers);
                        Json(json!({
                            "case_id": cid,
                            "auth": auth,
                            "token": query.get("token"),
                            "token_2": query.get("token_2"),
                            "created": "2026-10-16T00:00:00Z"
                        }))
                    },
                ),
            )
            .route(
                "/roles",
                get(|| async move {
                    Json(json!({
                        "roles": [
                            {"case_id": "A", "user_id": "U1", "role": "R1"},
                            {"case_id": "C", "user_id": "U3", "role": "R3"},
                            {"case_id": "B", "user_id": "U2", "role": "R2"}
                        ]
                    }))
                }),
            )
            .route(
                "/api/user-role",
                put(|headers: HeaderMap, Json(role): Json<Value>| async move {
                    if bearer(&headers) != "Bearer importer-token" {
                        return StatusCode::UNAUTHORIZED;
                    }
                    match role["role"].as_str() {
                        Some("bad-role") => StatusCode::BAD_REQUEST,
                        Some(_) if role["security_classification"].is_string() => {
                            StatusCode::NO_CONTENT
                        }
                        _ => StatusCode::UNPROCESSABLE_ENTITY,
                    }
                }),
            )
            .route(
                "/import",
                post(|headers: HeaderMap, body: Bytes| async move {
                    let multipart = headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("multipart/form-data"));
                    if bearer(&headers) != "Bearer importer-token" || !multipart {
                        return StatusCode::UNAUTHORIZED;
                    }
                    if String::from_utf8_lossy(&body).contains("broken.xlsx") {
                        StatusCode::BAD_REQUEST
                    } else {
                        StatusCode::CREATED
                    }
                }),
            )
            .with_state(hits.clone());

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn player(&self) -> Player {
        Player::new(
            Arc::new(ReqwestDispatcher::new(
                Some(self.base_url.clone()),
                Duration::from_secs(5),
            )),
            Arc::new(StaticIdentityProvider::new().with_user("someone@example.com", "access-token")),
        )
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn bearer(headers: &HeaderMap) -> String {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

const TOKEN_CALL: &str = "${[scenarioContext][childContexts][Token_Creation_Call][testData][actualResponse][body]";

fn store_with(entries: &[Value]) -> (tempfile::TempDir, TestDataStore) {
    let dir = tempfile::tempdir().unwrap();
    let token_call = json!({
        "_guid_": "Token_Creation_Call",
        "method": "POST",
        "uri": "/tokens",
        "expectedResponse": {"responseCode": 201}
    });
    std::fs::write(
        dir.path().join("Token_Creation_Call.td.json"),
        serde_json::to_string_pretty(&token_call).unwrap(),
    )
    .unwrap();
    for entry in entries {
        let guid = entry["_guid_"].as_str().unwrap();
        std::fs::write(
            dir.path().join(format!("{guid}.td.yaml")),
            serde_yaml::to_string(entry).unwrap(),
        )
        .unwrap();
    }

    let mut store = TestDataStore::new();
    store.load_dir(dir.path()).unwrap();
    (dir, store)
}

#[tokio::test]
async fn values_from_prerequisite_are_injected_into_the_call() {
    let server = TestServer::spawn().await;
    let (_dir, store) = store_with(&[json!({
        "_guid_": "Get_Case",
        "uri": "/cases/{cid}",
        "prerequisites": ["Token_Creation_Call"],
        "user": {"username": "someone@example.com"},
        "request": {
            "pathVariables": {"cid": format!("{TOKEN_CALL}[case_id]}}")},
            "queryParams": {
                "token": format!("{TOKEN_CALL}[tokens][token]}}"),
                "token_2": format!("{TOKEN_CALL}[tokens][token]}}")
            }
        },
        "expectedResponse": {
            "responseCode": 200,
            "headers": {"Content-Type": "application/json"},
            "body": {
                "case_id": "C-1",
                "auth": "Bearer access-token",
                "token": "token value",
                "token_2": "token value at index 2",
                "created": "[[ANYTHING_PRESENT]]"
            }
        }
    })]);

    let result = server.player().run(&store, "Get_Case").await.unwrap();

    assert!(result.success, "scenario should succeed: {result:#?}");
    assert_eq!(result.calls.len(), 2);
    assert_eq!(server.hits.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn unordered_subset_verified_by_inferred_identity() {
    let server = TestServer::spawn().await;
    let (_dir, store) = store_with(&[
        json!({
            "_guid_": "Get_Roles",
            "uri": "/roles",
            "expectedResponse": {
                "responseCode": 200,
                "body": {"roles": [
                    {"__operator__": "SUBSET", "__ordering__": "UNORDERED"},
                    {"case_id": "B", "user_id": "U2", "role": "R2"},
                    {"case_id": "A", "user_id": "U1", "role": "R1"}
                ]}
            }
        }),
        json!({
            "_guid_": "Get_Roles_Missing",
            "uri": "/roles",
            "expectedResponse": {
                "responseCode": 200,
                "body": {"roles": [
                    {"__operator__": "SUBSET", "__ordering__": "UNORDERED"},
                    {"case_id": "D", "user_id": "U4", "role": "R4"}
                ]}
            }
        }),
        json!({
            "_guid_": "Get_Roles_Equivalent",
            "uri": "/roles",
            "expectedResponse": {
                "responseCode": 200,
                "body": {"roles": [
                    {"__operator__": "EQUIVALENT", "__ordering__": "UNORDERED"},
                    {"case_id": "A", "user_id": "U1", "role": "R1"},
                    {"case_id": "B", "user_id": "U2", "role": "R2"}
                ]}
            }
        }),
    ]);
    let player = server.player();

    let subset = player.run(&store, "Get_Roles").await.unwrap();
    assert!(subset.success, "subset should pass: {subset:#?}");

    let missing = player.run(&store, "Get_Roles_Missing").await.unwrap();
    assert!(!missing.success);
    assert_eq!(missing.calls[0].diffs.len(), 1);
    assert!(missing.calls[0].diffs[0].starts_with("body.roles[0]: no matching element"));

    let equivalent = player.run(&store, "Get_Roles_Equivalent").await.unwrap();
    assert!(!equivalent.success);
    assert!(equivalent.calls[0].diffs[0].contains("unexpected element"));

    server.shutdown().await;
}

#[tokio::test]
async fn ambiguous_identity_fails_the_call() {
    let server = TestServer::spawn().await;
    let (_dir, store) = store_with(&[json!({
        "_guid_": "Get_Roles_Ambiguous",
        "uri": "/roles",
        "expectedResponse": {
            "body": {"roles": [
                {"__operator__": "SUBSET", "__ordering__": "UNORDERED"},
                {"case_id": "A"},
                {"case_id": "A"}
            ]}
        }
    })]);

    let result = server.player().run(&store, "Get_Roles_Ambiguous").await.unwrap();

    assert!(!result.success);
    assert!(result.calls[0].diffs[0].contains("invalid verification metadata"));

    server.shutdown().await;
}

#[tokio::test]
async fn unresolvable_reference_is_never_dispatched() {
    let server = TestServer::spawn().await;
    let (_dir, store) = store_with(&[json!({
        "_guid_": "Get_Case_Broken",
        "uri": "/cases/{cid}",
        "prerequisites": ["Token_Creation_Call"],
        "request": {
            "pathVariables": {"cid": format!("{TOKEN_CALL}[no_such_field]}}")}
        }
    })]);

    let result = server.player().run(&store, "Get_Case_Broken").await.unwrap();

    assert!(!result.success);
    let error = result.calls[1].error.as_deref().unwrap();
    assert!(error.contains("request.pathVariables.cid"), "{error}");
    assert!(error.contains("body.no_such_field"), "{error}");
    assert_eq!(server.hits.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn dynamic_sentinel_survives_injection() {
    let server = TestServer::spawn().await;
    let (_dir, store) = store_with(&[json!({
        "_guid_": "Get_Case_Dynamic",
        "uri": "/cases/{cid}",
        "request": {
            "pathVariables": {"cid": "C-9"},
            "queryParams": {"token": "[[DYNAMIC]]"}
        },
        "expectedResponse": {"responseCode": 200, "body": {
            "case_id": "C-9",
            "auth": "",
            "token": "[[DYNAMIC]]",
            "token_2": null,
            "created": "[[ANYTHING_PRESENT]]"
        }}
    })]);

    let result = server.player().run(&store, "Get_Case_Dynamic").await.unwrap();

    assert!(result.success, "{result:#?}");

    server.shutdown().await;
}

#[tokio::test]
async fn provisioning_skips_failed_items_and_continues() {
    let server = TestServer::spawn().await;
    let dir = tempfile::tempdir().unwrap();
    for name in ["ok.xlsx", "broken.xlsx", "~$ok.xlsx", "notes.txt"] {
        std::fs::write(dir.path().join(name), b"workbook").unwrap();
    }

    let config = ProvisionConfig {
        definition_store_url: server.base_url.clone(),
        importer: UserData {
            username: "importer@example.com".into(),
            password: None,
        },
        roles: vec![
            RoleConfig::new("caseworker-autotest1", "PUBLIC"),
            RoleConfig::new("bad-role", "PUBLIC"),
            RoleConfig::new("caseworker-autotest1-private", "PRIVATE"),
        ],
        definitions_dir: Some(dir.path().to_path_buf()),
    };
    let loader = DefinitionStoreLoader::new(
        &config,
        Arc::new(StaticIdentityProvider::new().with_user("importer@example.com", "importer-token")),
        Duration::from_secs(5),
    );

    let roles = loader.add_roles(&config.roles).await;
    assert!(!roles.success());
    assert_eq!(roles.succeeded.len(), 2);
    assert_eq!(roles.failed.len(), 1);
    assert!(roles.failed[0].0.contains("bad-role"));
    assert!(roles.failed[0].1.contains("400"));

    let definitions = loader.import_definitions(dir.path()).await.unwrap();
    assert_eq!(definitions.succeeded.len(), 1);
    assert!(definitions.succeeded[0].ends_with("ok.xlsx"));
    assert_eq!(definitions.failed.len(), 1);
    assert!(definitions.failed[0].0.ends_with("broken.xlsx"));

    server.shutdown().await;
}
