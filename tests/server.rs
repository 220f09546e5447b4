mod common;

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{signed_pdf, Fixture};
use pdf_signature_remover::config::ACCESS_LEVEL_PUBLIC;
use pdf_signature_remover::coordinator::RunCoordinator;
use pdf_signature_remover::delta::DeltaBuffer;
use pdf_signature_remover::graph::Scope;
use pdf_signature_remover::models::{DOSSIER_STUK, RDF_TYPE};
use pdf_signature_remover::server::{router, AppState, RemoverFactory};

struct TestServer {
    base: String,
    fx: Fixture,
    scopes: Arc<Mutex<Vec<Scope>>>,
}

async fn start() -> TestServer {
    let fx = Fixture::new();
    let buffer = Arc::new(DeltaBuffer::new());
    let coordinator = RunCoordinator::new(
        Arc::clone(&buffer),
        Arc::new(fx.remover.clone()),
        Duration::from_millis(50),
    );

    let scopes = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&scopes);
    let remover = fx.remover.clone();
    let direct: RemoverFactory = Arc::new(move |scope| {
        seen.lock().unwrap().push(scope);
        Ok(remover.clone())
    });

    let app = router(AppState::new(buffer, coordinator, direct, true));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        fx,
        scopes,
    }
}

fn delta_for(piece: &str) -> Value {
    json!([{
        "inserts": [{
            "subject": { "type": "uri", "value": piece },
            "predicate": { "type": "uri", "value": RDF_TYPE },
            "object": { "type": "uri", "value": DOSSIER_STUK }
        }],
        "deletes": []
    }])
}

#[tokio::test]
async fn greeting_and_health() {
    let server = start().await;
    let client = reqwest::Client::new();

    let root = client.get(&server.base).send().await.unwrap();
    assert_eq!(root.status(), 200);
    assert!(root.text().await.unwrap().contains("pdf-signature-remover"));

    let health: Value = client
        .get(format!("{}/health", server.base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["run_state"], "idle");
    assert_eq!(health["buffered_changesets"], 0);
}

#[tokio::test]
async fn delta_is_accepted_then_processed() {
    let server = start().await;
    let file = server.fx.add_pdf("f1", signed_pdf());
    let piece = server
        .fx
        .add_piece("p1", "Nota", &file, Some(ACCESS_LEVEL_PUBLIC));

    let response = reqwest::Client::new()
        .post(format!("{}/delta", server.base))
        .json(&delta_for(&piece))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);

    for _ in 0..100 {
        if !server.fx.pieces.signed_copies_of(&piece).is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(server.fx.pieces.signed_copies_of(&piece).len(), 1);
}

#[tokio::test]
async fn malformed_delta_is_rejected() {
    let server = start().await;
    let response = reqwest::Client::new()
        .post(format!("{}/delta", server.base))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn direct_request_runs_as_the_session() {
    let server = start().await;
    let file = server.fx.add_pdf("f1", signed_pdf());
    let piece = server
        .fx
        .add_piece("p1", "Nota", &file, Some(ACCESS_LEVEL_PUBLIC));

    let response = reqwest::Client::new()
        .post(format!("{}/remove-signatures", server.base))
        .header("mu-session-id", "http://mu.semte.ch/sessions/s1")
        .header("mu-call-id", "42")
        .json(&json!({ "piece": piece }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["status"], "done");
    assert_eq!(body["result"]["relinked"], true);

    assert_eq!(
        *server.scopes.lock().unwrap(),
        vec![Scope::Session {
            session_id: "http://mu.semte.ch/sessions/s1".into(),
            call_id: Some("42".into()),
        }]
    );
}

#[tokio::test]
async fn direct_request_reports_skips() {
    let server = start().await;
    let file = server.fx.add_pdf("f1", common::unsigned_pdf());
    let piece = server
        .fx
        .add_piece("p1", "Nota", &file, Some(ACCESS_LEVEL_PUBLIC));

    let body: Value = reqwest::Client::new()
        .post(format!("{}/remove-signatures", server.base))
        .header("mu-session-id", "s1")
        .json(&json!({ "piece": piece }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["result"], json!({ "status": "skipped", "reason": "no_signatures" }));
}

#[tokio::test]
async fn direct_request_validates_input() {
    let server = start().await;
    let client = reqwest::Client::new();
    let url = format!("{}/remove-signatures", server.base);

    let bad_iri = client
        .post(&url)
        .header("mu-session-id", "s1")
        .json(&json!({ "piece": "not an iri" }))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_iri.status(), 400);
    let body: Value = bad_iri.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let no_session = client
        .post(&url)
        .json(&json!({ "piece": "http://themis.vlaanderen.be/id/stuk/p1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(no_session.status(), 400);
    assert!(server.scopes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn pipeline_failure_is_a_500() {
    let server = start().await;
    let file = server.fx.add_pdf("f1", b"garbage".to_vec());
    let piece = server
        .fx
        .add_piece("p1", "Nota", &file, Some(ACCESS_LEVEL_PUBLIC));

    let response = reqwest::Client::new()
        .post(format!("{}/remove-signatures", server.base))
        .header("mu-session-id", "s1")
        .json(&json!({ "piece": piece }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "pipeline_error");
}
