//! Incoming (UAS) call flows: offer validation, ringing, answer, ACK
//! handling, guard timers, CANCEL races and the deferred-BYE path.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use invite_core::{
    Cause, Header, Method, Originator, ServerTransaction, SessionError, SessionEvent,
    SessionStatus, TerminateOptions, TransactionState,
};

async fn ringing_peer() -> Peer {
    let mut peer = incoming_peer(incoming_invite("call-1", "bob-tag"));
    settle().await;
    assert_eq!(peer.session.status(), SessionStatus::WaitingForAnswer);
    drain(&mut peer.events);
    peer
}

async fn answered_peer() -> Peer {
    let mut peer = ringing_peer().await;
    peer.session.answer(Default::default()).await.unwrap();
    settle().await;
    assert_eq!(peer.session.status(), SessionStatus::WaitingForAck);
    drain(&mut peer.events);
    peer
}

async fn confirmed_peer() -> Peer {
    let mut peer = answered_peer().await;
    peer.session
        .deliver_request(in_dialog_request(Method::Ack, "call-1", "bob-tag", 1));
    settle().await;
    assert_eq!(peer.session.status(), SessionStatus::Confirmed);
    drain(&mut peer.events);
    peer
}

#[tokio::test(start_paused = true)]
async fn uas_happy_path_rings_answers_and_confirms() {
    let mut peer = incoming_peer(incoming_invite("call-1", "bob-tag"));
    settle().await;

    assert_eq!(peer.driver.reply_count(180), 1);
    assert_eq!(peer.session.status(), SessionStatus::WaitingForAnswer);
    assert_eq!(peer.registry.len(), 1);
    assert_eq!(
        drain(&mut peer.events),
        vec![
            SessionEvent::NewSession { originator: Originator::Remote },
            SessionEvent::Progress { originator: Originator::Local, status_code: Some(180) },
        ]
    );

    peer.session.answer(Default::default()).await.unwrap();
    settle().await;

    assert_eq!(peer.driver.reply_count(200), 1);
    assert_eq!(peer.session.status(), SessionStatus::WaitingForAck);
    assert!(peer.session.start_time().is_some());
    assert_eq!(
        drain(&mut peer.events),
        vec![
            SessionEvent::Connecting,
            SessionEvent::Started { originator: Originator::Local },
        ]
    );

    peer.session
        .deliver_request(in_dialog_request(Method::Ack, "call-1", "bob-tag", 1));
    settle().await;
    assert_eq!(peer.session.status(), SessionStatus::Confirmed);
    assert!(!peer.session.local_streams().is_empty());
    assert!(!peer.session.remote_streams().is_empty());

    // ACK canceled the retransmission machinery: nothing further goes out.
    let replies = peer.driver.reply_count(200);
    tokio::time::advance(Duration::from_secs(40)).await;
    settle().await;
    assert_eq!(peer.driver.reply_count(200), replies);
}

#[tokio::test(start_paused = true)]
async fn uas_invite_without_sdp_is_refused_415() {
    let mut peer = incoming_peer(in_dialog_request(Method::Invite, "call-2", "bob-tag", 1));
    settle().await;

    assert_eq!(peer.driver.reply_count(415), 1);
    assert_eq!(peer.session.status(), SessionStatus::Terminated);
    assert!(peer.registry.is_empty());
    // Never surfaced to the application.
    assert!(drain(&mut peer.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn uas_rejected_offer_is_refused_488() {
    let invite = incoming_invite("call-3", "bob-tag");
    let driver = MockDriver::new();
    let media = MockMedia::new();
    media.reject_remote.store(true, Ordering::SeqCst);
    let registry = invite_core::SessionRegistry::new();
    let (events_tx, mut events) = invite_core::event_channel();
    let session = invite_core::Session::new_incoming(
        invite,
        test_config(),
        driver.clone(),
        media.clone(),
        registry.clone(),
        events_tx,
    );
    settle().await;

    assert_eq!(driver.reply_count(488), 1);
    assert_eq!(session.status(), SessionStatus::Terminated);
    assert!(registry.is_empty());
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn uas_no_answer_timeout_replies_408() {
    let mut peer = ringing_peer().await;

    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;

    assert_eq!(peer.driver.reply_count(408), 1);
    assert_eq!(
        drain(&mut peer.events).last(),
        Some(&SessionEvent::Failed { originator: Originator::Local, cause: Cause::NoAnswer })
    );
    assert_eq!(peer.session.status(), SessionStatus::Terminated);
    assert!(peer.registry.is_empty());
    assert!(peer.media.closed.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn uas_expires_header_is_honored() {
    let mut invite = incoming_invite("call-4", "bob-tag");
    invite.headers.push(Header::new("Expires", "5"));
    let mut peer = incoming_peer(invite);
    settle().await;
    drain(&mut peer.events);

    tokio::time::advance(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(peer.driver.reply_count(487), 1);
    assert_eq!(
        drain(&mut peer.events).last(),
        Some(&SessionEvent::Failed { originator: Originator::System, cause: Cause::Expires })
    );
}

#[tokio::test(start_paused = true)]
async fn uas_retransmits_200_until_timer_h_then_gives_up() {
    let mut peer = answered_peer().await;
    assert_eq!(peer.driver.reply_count(200), 1);

    // T1, then 2·T1, then min(4·T1, T2).
    tokio::time::advance(Duration::from_millis(500)).await;
    settle().await;
    assert_eq!(peer.driver.reply_count(200), 2);

    tokio::time::advance(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(peer.driver.reply_count(200), 3);

    tokio::time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(peer.driver.reply_count(200), 4);

    // No ACK by Timer H: BYE out, session over.
    tokio::time::advance(Duration::from_secs(29)).await;
    settle().await;
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 1);
    assert_eq!(
        drain(&mut peer.events).last(),
        Some(&SessionEvent::Ended { originator: Originator::Remote, cause: Cause::NoAck })
    );
    assert_eq!(peer.session.status(), SessionStatus::Terminated);
    assert!(peer.session.end_time().is_some());
}

#[tokio::test(start_paused = true)]
async fn uas_cancel_while_ringing_replies_487() {
    let mut peer = ringing_peer().await;

    peer.session
        .deliver_request(in_dialog_request(Method::Cancel, "call-1", "bob-tag", 1));
    settle().await;

    assert_eq!(peer.driver.reply_count(487), 1);
    assert_eq!(
        drain(&mut peer.events).last(),
        Some(&SessionEvent::Failed { originator: Originator::Remote, cause: Cause::Canceled })
    );
    assert_eq!(peer.session.status(), SessionStatus::Terminated);
}

#[tokio::test(start_paused = true)]
async fn uas_late_cancel_changes_nothing() {
    let mut peer = answered_peer().await;

    peer.session
        .deliver_request(in_dialog_request(Method::Cancel, "call-1", "bob-tag", 2));
    settle().await;

    assert_eq!(peer.driver.reply_count(487), 0);
    assert_eq!(peer.session.status(), SessionStatus::WaitingForAck);
    assert!(drain(&mut peer.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn uas_reject_with_terminate_replies_chosen_code() {
    let mut peer = ringing_peer().await;

    let options = TerminateOptions { status_code: Some(486), ..Default::default() };
    peer.session.terminate(options).await.unwrap();
    settle().await;

    assert_eq!(peer.driver.reply_count(486), 1);
    assert_eq!(
        drain(&mut peer.events).last(),
        Some(&SessionEvent::Failed { originator: Originator::Local, cause: Cause::Rejected })
    );
}

#[tokio::test(start_paused = true)]
async fn uas_reject_validates_status_code_range() {
    let peer = ringing_peer().await;

    let options = TerminateOptions { status_code: Some(200), ..Default::default() };
    assert!(matches!(
        peer.session.terminate(options).await,
        Err(SessionError::InvalidStatusCode(200))
    ));
    // Still ringing: programmer errors leave state alone.
    assert_eq!(peer.session.status(), SessionStatus::WaitingForAnswer);
}

#[tokio::test(start_paused = true)]
async fn uas_terminate_while_waiting_for_ack_defers_the_bye() {
    let mut peer = answered_peer().await;

    peer.session.terminate(TerminateOptions::default()).await.unwrap();
    settle().await;

    // Observable immediately, but nothing on the wire yet.
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 0);
    assert_eq!(
        drain(&mut peer.events),
        vec![SessionEvent::Ended { originator: Originator::Local, cause: Cause::Bye }]
    );
    assert_eq!(peer.session.status(), SessionStatus::Terminated);
    // The session stays routable so the ACK can reach it.
    assert_eq!(peer.registry.len(), 1);

    peer.session
        .deliver_request(in_dialog_request(Method::Ack, "call-1", "bob-tag", 1));
    settle().await;
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 1);
    assert!(peer.registry.is_empty());

    // The second trigger is a no-op.
    peer.session
        .deliver_request(in_dialog_request(Method::Ack, "call-1", "bob-tag", 1));
    settle().await;
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 1);
    assert!(drain(&mut peer.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn uas_deferred_bye_also_fires_on_transaction_death() {
    let (server_tx, tx_ctrl) = ServerTransaction::channel();
    let mut invite = incoming_invite("call-5", "bob-tag");
    invite.server_tx = Some(server_tx);
    let mut peer = incoming_peer(invite);
    settle().await;
    peer.session.answer(Default::default()).await.unwrap();
    settle().await;
    drain(&mut peer.events);

    peer.session.terminate(TerminateOptions::default()).await.unwrap();
    settle().await;
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 0);

    tx_ctrl.send(TransactionState::Terminated).unwrap();
    settle().await;
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 1);

    // A late ACK no longer triggers anything.
    peer.session
        .deliver_request(in_dialog_request(Method::Ack, "call-5", "bob-tag", 1));
    settle().await;
    assert_eq!(peer.driver.in_dialog_count(Method::Bye), 1);
}

#[tokio::test(start_paused = true)]
async fn uas_remote_bye_ends_the_call() {
    let mut peer = confirmed_peer().await;
    let ok_replies = peer.driver.reply_count(200);

    peer.session
        .deliver_request(in_dialog_request(Method::Bye, "call-1", "bob-tag", 2));
    settle().await;

    assert_eq!(peer.driver.reply_count(200), ok_replies + 1);
    assert_eq!(
        drain(&mut peer.events),
        vec![SessionEvent::Ended { originator: Originator::Remote, cause: Cause::Bye }]
    );
    assert!(peer.session.end_time().is_some());
    assert!(peer.media.closed.load(Ordering::SeqCst));
    assert!(peer.registry.is_empty());
    assert_eq!(peer.registry.dialog_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn uas_local_bye_carries_reason_for_coded_termination() {
    let mut peer = confirmed_peer().await;

    let options = TerminateOptions { status_code: Some(603), ..Default::default() };
    peer.session.terminate(options).await.unwrap();
    settle().await;

    let byes = peer.driver.in_dialog(Method::Bye);
    assert_eq!(byes.len(), 1);
    match &byes[0] {
        WireOp::InDialog { headers, .. } => {
            let reason = headers.iter().find(|h| h.name == "Reason").expect("Reason header");
            assert_eq!(reason.value, "SIP ;cause=603 ;text=\"Decline\"");
        }
        other => panic!("unexpected op {other:?}"),
    }
    assert_eq!(
        drain(&mut peer.events),
        vec![SessionEvent::Ended { originator: Originator::Local, cause: Cause::Bye }]
    );
}

#[tokio::test(start_paused = true)]
async fn uas_incoming_info_dtmf_is_surfaced() {
    let mut peer = confirmed_peer().await;
    let ok_replies = peer.driver.reply_count(200);

    let mut info = in_dialog_request(Method::Info, "call-1", "bob-tag", 2);
    info.headers.push(Header::new("Content-Type", "application/dtmf-relay"));
    info.body = Some("Signal=4\r\nDuration=160\r\n".to_string());
    peer.session.deliver_request(info);
    settle().await;

    assert_eq!(peer.driver.reply_count(200), ok_replies + 1);
    assert_eq!(
        drain(&mut peer.events),
        vec![SessionEvent::NewDtmf { originator: Originator::Remote, tone: '4', duration: 160 }]
    );
}

#[tokio::test(start_paused = true)]
async fn uas_reinvite_is_ignored_without_renegotiation() {
    let mut peer = confirmed_peer().await;

    let mut reinvite = incoming_invite("call-1", "bob-tag");
    reinvite.cseq = 2;
    peer.session.deliver_request(reinvite);
    settle().await;

    assert_eq!(peer.session.status(), SessionStatus::Confirmed);
    assert!(drain(&mut peer.events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn uas_terminate_after_termination_is_invalid() {
    let mut peer = confirmed_peer().await;
    peer.session.terminate(TerminateOptions::default()).await.unwrap();
    settle().await;
    drain(&mut peer.events);

    assert!(matches!(
        peer.session.terminate(TerminateOptions::default()).await,
        Err(SessionError::InvalidState(SessionStatus::Terminated))
    ));
}
