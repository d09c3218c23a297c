//! Relay scenarios: scrubbed status, auth-gated full status, replayed
//! nonces and pledge upload.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{Message, Secp256k1};
use http_body_util::BodyExt;
use tower::util::ServiceExt;

use lighthouse::api::{router, AppState};
use lighthouse::engine::Event;
use lighthouse::wire::{self, ProjectStatus};

use common::*;

const GOAL: u64 = 100_000_000;

async fn status_from(response: axum::response::Response) -> ProjectStatus {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    wire::decode_delimited(&bytes).unwrap()
}

/// Engine + relay with one verified pledge in place.
async fn relay_fixture(
    dir: &std::path::Path,
) -> (AppState, lighthouse::project::Project, bitcoin::secp256k1::SecretKey) {
    let view = MockView::new(2);
    let (auth_sk, auth_pk) = auth_keypair(9);
    let project = test_project(GOAL, 25_000, &auth_pk);
    let node = start_engine(view.clone(), None, dir).await;
    node.handle.send(Event::ProjectAppeared { path: None, bytes: project.encode_delimited() });

    let (bob, _) = funded_wallet(60_000_000).await;
    let creation = pledge_with_utxo(&bob, &view, &project, 50_000_000, "bob").await;
    node.handle
        .submit_pledge(lighthouse::engine::PledgeSource::WalletOwn, creation.pledge.encode_delimited())
        .await
        .unwrap();

    // Wait for the mirror to catch up with the verified pledge.
    let projects = node.projects.clone();
    let id = project.id_hash();
    eventually(move || projects.get(&id).map(|s| s.open.len() == 1).unwrap_or(false)).await;

    let state = AppState::new(node.projects.clone(), node.handle.clone());
    (state, project, auth_sk)
}

fn sign_challenge(sk: &bitcoin::secp256k1::SecretKey, msg: &[u8]) -> String {
    let secp = Secp256k1::new();
    let digest = sha256::Hash::hash(msg).to_byte_array();
    let sig = secp.sign_ecdsa(&Message::from_digest(digest), sk);
    hex::encode(sig.serialize_der())
}

#[tokio::test]
async fn get_serves_scrubbed_status() {
    let dir = tempfile::tempdir().unwrap();
    let (state, project, _) = relay_fixture(dir.path()).await;
    let app = router(state);

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/project/{}", project.id_hash()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = status_from(response).await;
    assert_eq!(status.value_pledged_so_far, 50_000_000);
    assert_eq!(status.pledges.len(), 1);
    for pledge in &status.pledges {
        assert!(pledge.transactions.is_empty());
        assert_eq!(pledge.orig_hash.as_ref().map(Vec::len), Some(32));
    }
}

#[tokio::test]
async fn auth_signature_reveals_full_pledges() {
    let dir = tempfile::tempdir().unwrap();
    let (state, project, auth_sk) = relay_fixture(dir.path()).await;
    let app = router(state);

    let msg = b"challenge-1";
    let uri = format!(
        "/project/{}?msg={}&sig={}",
        project.id_hash(),
        hex::encode(msg),
        sign_challenge(&auth_sk, msg),
    );
    let response = app
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = status_from(response).await;
    assert_eq!(status.pledges.len(), 1);
    assert_eq!(status.pledges[0].transactions.len(), 1);
    assert!(status.pledges[0].orig_hash.is_none());

    // Replaying the same challenge is throttled.
    let replay = app
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::TOO_MANY_REQUESTS);

    // A signature by some other key is rejected.
    let (wrong_sk, _) = auth_keypair(11);
    let uri = format!(
        "/project/{}?msg={}&sig={}",
        project.id_hash(),
        hex::encode(b"challenge-2"),
        sign_challenge(&wrong_sk, b"challenge-2"),
    );
    let response = app
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn post_uploads_a_pledge_and_returns_updated_status() {
    let dir = tempfile::tempdir().unwrap();
    let view = MockView::new(2);
    let (_, auth_pk) = auth_keypair(9);
    let project = test_project(GOAL, 25_000, &auth_pk);
    let node = start_engine(view.clone(), None, dir.path()).await;
    node.handle.send(Event::ProjectAppeared { path: None, bytes: project.encode_delimited() });
    // Give the mirror a moment to learn about the project.
    let projects = node.projects.clone();
    let id = project.id_hash();
    eventually(move || projects.get(&id).is_some()).await;

    let state = AppState::new(node.projects.clone(), node.handle.clone());
    let app = router(state);

    let (bob, _) = funded_wallet(60_000_000).await;
    let creation = pledge_with_utxo(&bob, &view, &project, 50_000_000, "bob").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/project/{}", project.id_hash()))
                .body(Body::from(creation.pledge.encode_delimited()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let status = status_from(response).await;
    assert_eq!(status.value_pledged_so_far, 50_000_000);

    // Unknown projects 404 without reaching the engine.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/project/{}", sha256::Hash::all_zeros()))
                .body(Body::from(creation.pledge.encode_delimited()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn client_pulls_scrubbed_peer_pledges_from_a_relay() {
    // Relay side: a project with one verified pledge, served over a real
    // socket so the client exercises its HTTP path.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());

    let server_dir = tempfile::tempdir().unwrap();
    let server_view = MockView::new(2);
    let (_, auth_pk) = auth_keypair(9);
    let project = test_project_with_server(GOAL, 25_000, &auth_pk, &base);
    let server = start_engine(server_view.clone(), None, server_dir.path()).await;
    server
        .handle
        .send(Event::ProjectAppeared { path: None, bytes: project.encode_delimited() });

    let (bob, _) = funded_wallet(60_000_000).await;
    let creation = pledge_with_utxo(&bob, &server_view, &project, 50_000_000, "bob").await;
    server
        .handle
        .submit_pledge(lighthouse::engine::PledgeSource::HttpUpload, creation.pledge.encode_delimited())
        .await
        .unwrap();
    let server_projects = server.projects.clone();
    let id = project.id_hash();
    eventually(move || {
        server_projects.get(&id).map(|s| s.open.len() == 1).unwrap_or(false)
    })
    .await;

    let app = router(AppState::new(server.projects.clone(), server.handle.clone()));
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Client side: same project definition, empty pledge set.
    let client_dir = tempfile::tempdir().unwrap();
    let client_view = MockView::new(2);
    let client = start_engine(client_view, None, client_dir.path()).await;
    client
        .handle
        .send(Event::ProjectAppeared { path: None, bytes: project.encode_delimited() });
    let client_projects = client.projects.clone();
    eventually(move || client_projects.get(&id).is_some()).await;

    let http = reqwest::Client::new();
    let snapshot = client.projects.get(&id).unwrap();
    let pulled = lighthouse::api::client::sync_project(&http, &client.handle, &snapshot)
        .await
        .unwrap();
    assert_eq!(pulled, 1);

    // The peer pledge lands scrubbed in the client's open set.
    let client_projects = client.projects.clone();
    eventually(move || {
        client_projects.get(&id).map(|s| s.open.len() == 1).unwrap_or(false)
    })
    .await;
    let snapshot = client.projects.get(&id).unwrap();
    assert!(snapshot.open[0].is_scrubbed());
    assert_eq!(snapshot.open[0].identity(), creation.pledge.identity());
    assert_eq!(snapshot.total_pledged(), 50_000_000);
}
