//! End-to-end pairing session scenarios over mocked relay transport.

mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::{PairingFixture, RELAY_ONE, RELAY_TWO};
use lantern_core::connect::{PairingSessionState, SessionRegistry};
use nostr::{Keys, Kind};

#[tokio::test]
async fn handshake_with_matching_secret_resolves_connected() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;
    let secret = fixture.secret();

    fixture.deliver_result(RELAY_ONE, &secret);

    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("handshake should resolve");

    assert_eq!(
        result.remote_signer_pubkey,
        fixture.signer_keys.public_key()
    );
    assert_eq!(fixture.session.state(), PairingSessionState::Connected);

    // The descriptor is rebuilt with the signer's key populated.
    let info = fixture.session.info().unwrap();
    assert_eq!(
        info.remote_signer_pubkey,
        Some(fixture.signer_keys.public_key())
    );
}

#[tokio::test]
async fn handshake_with_ack_literal_is_accepted() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    fixture.deliver_result(RELAY_ONE, "ack");

    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_some());
    assert_eq!(fixture.session.state(), PairingSessionState::Connected);
}

#[tokio::test]
async fn lenient_mode_accepts_inexact_acknowledgement() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    // Some signers reply with their own pubkey instead of the secret.
    let pubkey_reply = fixture.signer_keys.public_key().to_hex();
    fixture.deliver_result(RELAY_ONE, &pubkey_reply);

    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_some());
}

#[tokio::test]
async fn strict_mode_rejects_inexact_acknowledgement() {
    let fixture = PairingFixture::start_with(&[RELAY_ONE], true, None).await;

    fixture.deliver_result(RELAY_ONE, "not-the-secret");

    // The reply was dropped; the session keeps listening until the
    // wait times out.
    let result = fixture
        .session
        .wait_for_connection(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(fixture.session.state(), PairingSessionState::Timeout);
}

#[tokio::test]
async fn strict_mode_still_accepts_the_secret() {
    let fixture = PairingFixture::start_with(&[RELAY_ONE], true, None).await;
    let secret = fixture.secret();

    fixture.deliver_result(RELAY_ONE, &secret);

    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_some());
}

#[tokio::test]
async fn duplicate_replies_resolve_exactly_once() {
    let fixture = PairingFixture::start(&[RELAY_ONE, RELAY_TWO]).await;
    let secret = fixture.secret();

    // Two relays deliver copies of the same reply; the second arrival
    // must be a no-op, not a second resolution or a crash.
    fixture.deliver_result(RELAY_ONE, &secret);
    fixture.deliver_result(RELAY_TWO, &secret);

    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_some());
    assert_eq!(fixture.session.state(), PairingSessionState::Connected);
}

#[tokio::test]
async fn protocol_error_reply_fails_the_session() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    fixture.deliver_error(RELAY_ONE, "user denied the request");

    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(fixture.session.state(), PairingSessionState::Error);
}

#[tokio::test]
async fn undecryptable_reply_is_dropped_and_session_keeps_listening() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    // Encrypted for a different recipient entirely.
    let other_client = Keys::generate();
    let stray = helpers::pairing_reply(
        &fixture.signer_keys,
        &other_client.public_key(),
        "ack",
        None,
    );
    fixture.deliver(RELAY_ONE, stray);

    assert_eq!(fixture.session.state(), PairingSessionState::Listening);

    // A later valid reply still completes the handshake.
    let secret = fixture.secret();
    fixture.deliver_result(RELAY_ONE, &secret);
    let result = fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();
    assert!(result.is_some());
}

#[tokio::test]
async fn wrong_kind_event_is_ignored() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    let note = nostr::EventBuilder::text_note("not a handshake")
        .sign_with_keys(&fixture.signer_keys)
        .unwrap();
    fixture.deliver(RELAY_ONE, note);

    assert_eq!(fixture.session.state(), PairingSessionState::Listening);
}

#[tokio::test]
async fn auth_url_challenge_keeps_session_listening() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    fixture.deliver_result(RELAY_ONE, "auth_url");

    assert_eq!(fixture.session.state(), PairingSessionState::Listening);
}

#[tokio::test]
async fn zero_timeout_resolves_empty_and_leaves_timeout_state() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    let result = fixture
        .session
        .wait_for_connection(Duration::ZERO)
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(fixture.session.state(), PairingSessionState::Timeout);
}

#[tokio::test]
async fn partial_relay_failure_still_listens() {
    let factory = Arc::new(lantern_core::testing::MockSocketFactory::new());
    factory.fail_address(RELAY_TWO);

    let options = lantern_core::connect::SessionOptions {
        socket_factory: Some(factory.clone()),
        ..lantern_core::connect::SessionOptions::default()
    };
    let relays = vec![RELAY_ONE.to_string(), RELAY_TWO.to_string()];
    let session = lantern_core::connect::NostrConnectSession::new(
        &relays,
        lantern_core::connect::AppMetadata::default(),
        options,
    )
    .unwrap();

    session.start().await.unwrap();
    assert_eq!(session.state(), PairingSessionState::Listening);
}

#[tokio::test]
async fn subscription_filter_targets_the_ephemeral_key() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;

    let socket = fixture.factory.socket_for(RELAY_ONE).unwrap();
    let filter = socket.subscription("pairing").expect("filter installed");

    assert_eq!(filter.kinds, Some([Kind::NostrConnect].into_iter().collect()));
    assert!(filter.since.is_some());
}

#[tokio::test]
async fn ensure_connected_is_idempotent() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;
    let socket = fixture.factory.socket_for(RELAY_ONE).unwrap();
    let since_before = socket.subscription("pairing").unwrap().since;

    socket.force_phase(lantern_core::relay::SocketPhase::Disconnected);

    fixture.session.ensure_connected().await;
    fixture.session.ensure_connected().await;

    // No duplicate socket objects and no duplicate subscriptions. The
    // second pass found the socket already connected and left it alone.
    assert_eq!(fixture.factory.created_for(RELAY_ONE), 1);
    assert_eq!(socket.subscription_count(), 1);
    assert_eq!(socket.connect_calls(), 2);
    assert_eq!(socket.subscribe_calls(), 2);

    // The pinned `since` is reused verbatim so a reconnect cannot
    // narrow the lookback window.
    let since_after = socket.subscription("pairing").unwrap().since;
    assert_eq!(since_before, since_after);
}

#[tokio::test]
async fn completed_registry_entry_suppresses_the_reply() {
    let registry = Arc::new(SessionRegistry::new());
    let fixture = PairingFixture::start_with(&[RELAY_ONE], false, Some(Arc::clone(&registry))).await;

    // Simulate a pairing that already completed before this session's
    // socket delivered its copy of the reply.
    registry.mark_completed(&fixture.client_pubkey().to_hex());

    let secret = fixture.secret();
    fixture.deliver_result(RELAY_ONE, &secret);

    assert_eq!(fixture.session.state(), PairingSessionState::Listening);
    let result = fixture
        .session
        .wait_for_connection(Duration::from_millis(50))
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn successful_handshake_records_completion_in_registry() {
    let registry = Arc::new(SessionRegistry::new());
    let fixture = PairingFixture::start_with(&[RELAY_ONE], false, Some(Arc::clone(&registry))).await;
    let secret = fixture.secret();

    fixture.deliver_result(RELAY_ONE, &secret);
    fixture
        .session
        .wait_for_connection(Duration::from_secs(5))
        .await
        .unwrap();

    assert!(registry.is_completed(&fixture.client_pubkey().to_hex()));
}

#[tokio::test]
async fn cancel_resolves_outstanding_wait_with_none() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;
    let session = fixture.session;

    let wait = session.wait_for_connection(Duration::from_secs(30));
    tokio::pin!(wait);

    // Poll the wait once so it is outstanding, then cancel.
    tokio::select! {
        _ = &mut wait => panic!("wait should not resolve yet"),
        () = tokio::task::yield_now() => {}
    }
    session.cancel();

    let result = wait.await.unwrap();
    assert!(result.is_none());
    assert_eq!(session.state(), PairingSessionState::Cancelled);
}

#[tokio::test]
async fn reply_after_cancellation_is_ignored() {
    let fixture = PairingFixture::start(&[RELAY_ONE]).await;
    fixture.session.cancel();

    let secret = fixture.secret();
    fixture.deliver_result(RELAY_ONE, &secret);

    assert_eq!(fixture.session.state(), PairingSessionState::Cancelled);
}
