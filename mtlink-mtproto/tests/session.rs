use std::sync::Arc;

use mtlink_crypto::{AuthKey, DefaultCryptoProvider, Side, decrypt_message, encrypt_message};
use mtlink_mtproto::envelope::gzip_if_smaller;
use mtlink_mtproto::session::MAX_PAYLOAD_SIZE;
use mtlink_mtproto::{Session, SessionConfig, SessionError, SessionEvent};
use mtlink_tl_types::mtproto::{ServiceMessage, functions, types, updates_ids};
use mtlink_tl_types::{Blob, Deserializable, Identifiable, Serializable};

const NOW: u64 = 1_700_000_000_000;

fn auth_key() -> AuthKey {
    let mut data = [0u8; 256];
    for (i, b) in data.iter_mut().enumerate() {
        *b = (i * 7 + 3) as u8;
    }
    AuthKey::from_bytes(data, &DefaultCryptoProvider)
}

fn session_with(config: SessionConfig) -> Session {
    Session::new(Arc::new(DefaultCryptoProvider), auth_key(), config)
}

fn session() -> Session { session_with(SessionConfig::default()) }

fn request(n: u32) -> Vec<u8> {
    let mut v = 0xc0ffee00u32.to_le_bytes().to_vec();
    v.extend_from_slice(&n.to_le_bytes());
    v
}

/// One decrypted client packet.
#[derive(Debug)]
struct Sent {
    salt: i64,
    session_id: i64,
    msg_id: i64,
    seq_no: i32,
    body: Vec<u8>,
}

impl Sent {
    fn is_container(&self) -> bool {
        self.body[..4] == types::MsgContainer::CONSTRUCTOR_ID.to_le_bytes()
    }

    /// `(msg_id, seq_no, body)` of every message carried, unpacking a container.
    fn messages(&self) -> Vec<(i64, i32, Vec<u8>)> {
        match ServiceMessage::from_bytes(&self.body).unwrap() {
            ServiceMessage::MsgContainer(c) => c.messages.0.into_iter().map(|m| (m.msg_id, m.seqno, m.body.0)).collect(),
            _ => vec![(self.msg_id, self.seq_no, self.body.clone())],
        }
    }

    fn find(&self, body: &[u8]) -> Option<(i64, i32)> {
        self.messages().into_iter().find(|(_, _, b)| b == body).map(|(id, seq, _)| (id, seq))
    }

    fn find_by_id(&self, constructor: u32) -> Option<(i64, Vec<u8>)> {
        self.messages()
            .into_iter()
            .find(|(_, _, b)| b[..4] == constructor.to_le_bytes())
            .map(|(id, _, b)| (id, b))
    }
}

/// Plays the server half of the session.
struct FakeServer {
    key: AuthKey,
    session_id: i64,
    counter: i64,
}

impl FakeServer {
    fn new(session: &Session) -> Self {
        Self { key: auth_key(), session_id: session.session_id(), counter: 0 }
    }

    fn read(&self, mut packet: Vec<u8>) -> Sent {
        let plain = decrypt_message(&DefaultCryptoProvider, &self.key, Side::Client, &mut packet).unwrap();
        let i64_at = |at: usize| i64::from_le_bytes(plain[at..at + 8].try_into().unwrap());
        let len = u32::from_le_bytes(plain[28..32].try_into().unwrap()) as usize;
        Sent {
            salt: i64_at(0),
            session_id: i64_at(8),
            msg_id: i64_at(16),
            seq_no: i32::from_le_bytes(plain[24..28].try_into().unwrap()),
            body: plain[32..32 + len].to_vec(),
        }
    }

    fn next_msg_id(&mut self) -> i64 {
        self.counter += 1;
        ((NOW as i64 / 1000) << 32) | (self.counter << 2) | 1
    }

    fn frame(&mut self, body: Vec<u8>) -> Vec<u8> {
        let msg_id = self.next_msg_id();
        self.frame_with(msg_id, self.session_id, body)
    }

    fn frame_with(&self, msg_id: i64, session_id: i64, body: Vec<u8>) -> Vec<u8> {
        let mut plain = Vec::new();
        plain.extend_from_slice(&0i64.to_le_bytes());
        plain.extend_from_slice(&session_id.to_le_bytes());
        plain.extend_from_slice(&msg_id.to_le_bytes());
        plain.extend_from_slice(&1i32.to_le_bytes());
        plain.extend_from_slice(&(body.len() as u32).to_le_bytes());
        plain.extend_from_slice(&body);
        encrypt_message(&DefaultCryptoProvider, &self.key, Side::Server, plain).unwrap()
    }
}

fn rpc_result(req_msg_id: i64, result: Vec<u8>) -> Vec<u8> {
    types::RpcResult { req_msg_id, result: Blob(result) }.to_bytes()
}

fn bool_true() -> Vec<u8> { mtlink_tl_types::BOOL_TRUE_ID.to_le_bytes().to_vec() }

#[test]
fn single_request_round_trip() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let id = s.enqueue_rpc(request(1)).unwrap();

    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(sent.session_id, s.session_id());
    assert_eq!(sent.salt, 0);
    assert_eq!(sent.seq_no, 1);
    assert_eq!(sent.msg_id % 4, 0);
    assert_eq!(sent.body, request(1));
    assert!(s.poll_transmit(NOW).unwrap().is_none());

    let mut frame = server.frame(rpc_result(sent.msg_id, bool_true()));
    let events = s.handle_frame(&mut frame, NOW + 50).unwrap();
    assert_eq!(events, vec![SessionEvent::RpcResult { id, body: bool_true() }]);
    assert_eq!(s.pending_rpc_count(), 0);
}

#[test]
fn lone_ack_waits_for_flush_timer() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let mut frame = server.frame(rpc_result(sent.msg_id, bool_true()));
    s.handle_frame(&mut frame, NOW).unwrap();
    assert!(s.poll_transmit(NOW).unwrap().is_none());
    assert_eq!(s.next_deadline(), Some(NOW + 30_000));

    s.handle_timers(NOW + 30_000);
    let ack = server.read(s.poll_transmit(NOW + 30_000).unwrap().unwrap());
    assert_eq!(ack.seq_no % 2, 0, "acks are not content-related");
    let ServiceMessage::MsgsAck(a) = ServiceMessage::from_bytes(&ack.body).unwrap() else {
        panic!("expected msgs_ack");
    };
    assert_eq!(a.msg_ids, vec![server.counter << 2 | ((NOW as i64 / 1000) << 32) | 1]);
}

#[test]
fn ack_threshold_flushes_immediately() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    for _ in 0..100 {
        let mut frame = server.frame(updates_ids::UPDATES_TOO_LONG.to_le_bytes().to_vec());
        s.handle_frame(&mut frame, NOW).unwrap();
    }
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    let ServiceMessage::MsgsAck(a) = ServiceMessage::from_bytes(&sent.body).unwrap() else {
        panic!("expected msgs_ack");
    };
    assert_eq!(a.msg_ids.len(), 100);
}

#[test]
fn ids_and_seqnos_increase() {
    let mut s = session();
    let server = FakeServer::new(&s);
    let mut prev = 0;
    for (n, expected_seq) in [(1, 1), (2, 3), (3, 5)] {
        s.enqueue_rpc(request(n)).unwrap();
        // Same millisecond for every packet.
        let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
        assert!(sent.msg_id > prev);
        assert_eq!(sent.seq_no, expected_seq);
        prev = sent.msg_id;
    }
}

#[test]
fn requests_queued_together_share_a_container() {
    let mut s = session();
    let server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    s.enqueue_rpc(request(2)).unwrap();

    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert!(sent.is_container());
    assert_eq!(sent.seq_no, 4, "container seqno is not content-related");
    let messages = sent.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!((messages[0].1, messages[1].1), (1, 3));
    assert_eq!(messages[0].2, request(1));
    assert_eq!(messages[1].2, request(2));
    assert!(messages.iter().all(|(id, _, _)| *id < sent.msg_id));
}

#[test]
fn large_compressible_request_is_gzipped() {
    let mut s = session();
    let server = FakeServer::new(&s);
    s.enqueue_rpc(vec![0u8; 4096]).unwrap();
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(sent.body[..4], types::GzipPacked::CONSTRUCTOR_ID.to_le_bytes());
    assert!(sent.body.len() < 1024);
}

#[test]
fn oversized_request_is_refused() {
    let mut s = session();
    assert!(matches!(
        s.enqueue_rpc(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        Err(SessionError::PayloadTooLarge(_))
    ));
}

#[test]
fn rpc_error_is_surfaced() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let id = s.enqueue_rpc(request(1)).unwrap();
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let error = types::RpcError { error_code: 420, error_message: "FLOOD_WAIT_5".into() };
    let mut frame = server.frame(rpc_result(sent.msg_id, error.to_bytes()));
    let events = s.handle_frame(&mut frame, NOW).unwrap();
    assert_eq!(events, vec![SessionEvent::RpcError { id, error }]);
}

#[test]
fn gzipped_result_is_inflated() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let id = s.enqueue_rpc(request(1)).unwrap();
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let body = b"abcd".repeat(300);
    let packed = gzip_if_smaller(&body).unwrap();
    let mut frame = server.frame(rpc_result(sent.msg_id, packed));
    let events = s.handle_frame(&mut frame, NOW).unwrap();
    assert_eq!(events, vec![SessionEvent::RpcResult { id, body }]);
}

#[test]
fn bad_server_salt_resends_with_new_salt() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let notice = types::BadServerSalt {
        bad_msg_id: first.msg_id,
        bad_msg_seqno: first.seq_no,
        error_code: 48,
        new_server_salt: 0x1234,
    };
    let mut frame = server.frame(notice.to_bytes());
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty());

    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(second.salt, 0x1234);
    let (resent_id, _) = second.find(&request(1)).expect("request resent");
    assert!(resent_id > first.msg_id);
    // Knowing a salt but no future ones triggers get_future_salts.
    let (salts_req, _) = second.find_by_id(functions::GetFutureSalts::CONSTRUCTOR_ID).expect("salts requested");

    let secs = (NOW / 1000) as i32;
    let salts = types::FutureSalts {
        req_msg_id: salts_req,
        now: secs,
        salts: vec![
            types::FutureSalt { valid_since: secs - 10, valid_until: secs + 3600, salt: 0x5555 },
            types::FutureSalt { valid_since: secs + 3600, valid_until: secs + 7200, salt: 0x6666 },
            types::FutureSalt { valid_since: secs + 7200, valid_until: secs + 10800, salt: 0x7777 },
        ],
    };
    let mut frame = server.frame(salts.to_bytes());
    s.handle_frame(&mut frame, NOW).unwrap();
    assert_eq!(s.server_salt(), 0x5555);
    assert_eq!(s.salts().future_salts().count(), 2);
    assert!(!s.salts().should_fetch_salts());
}

#[test]
fn bad_msg_time_sync_adjusts_offset() {
    let mut s = session();
    let server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let server_secs = NOW as i64 / 1000 + 100;
    let notice = types::BadMsgNotification { bad_msg_id: first.msg_id, bad_msg_seqno: first.seq_no, error_code: 16 };
    let mut frame = server.frame_with((server_secs << 32) | 5, server.session_id, notice.to_bytes());
    s.handle_frame(&mut frame, NOW).unwrap();
    assert_eq!(s.time_offset(), 100);

    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(second.body, request(1));
    assert_eq!(second.msg_id >> 32, server_secs);
}

#[test]
fn fatal_bad_msg_resets_session() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    let old_session = s.session_id();

    let notice = types::BadMsgNotification { bad_msg_id: first.msg_id, bad_msg_seqno: first.seq_no, error_code: 64 };
    let mut frame = server.frame(notice.to_bytes());
    assert_eq!(s.handle_frame(&mut frame, NOW).unwrap(), vec![SessionEvent::Reset]);
    assert_ne!(s.session_id(), old_session);

    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(second.session_id, s.session_id());
    assert!(second.find(&functions::DestroySession { session_id: old_session }.to_bytes()).is_some());
    let (_, seq) = second.find(&request(1)).expect("request requeued");
    assert!(seq <= 3, "seqno restarts with the new session");
}

#[test]
fn new_session_created_resends_older_messages() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let created = types::NewSessionCreated { first_msg_id: first.msg_id + 4, unique_id: 7, server_salt: 99 };
    let mut frame = server.frame(created.to_bytes());
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty(), "first session needs no catch-up");
    assert_eq!(s.server_salt(), 99);

    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    let (resent, _) = second.find(&request(1)).expect("request resent");
    assert_ne!(resent, first.msg_id);
    assert!(second.find_by_id(types::MsgsAck::CONSTRUCTOR_ID).is_some());

    // The same uid again changes nothing; a new one means updates were lost.
    let mut frame = server.frame(created.to_bytes());
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty());
    let again = types::NewSessionCreated { unique_id: 8, ..created };
    let mut frame = server.frame(again.to_bytes());
    assert_eq!(
        s.handle_frame(&mut frame, NOW).unwrap(),
        vec![SessionEvent::Update(updates_ids::UPDATES_TOO_LONG.to_le_bytes().to_vec())]
    );
}

#[test]
fn cancel_before_and_after_sending() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let a = s.enqueue_rpc(request(1)).unwrap();
    let b = s.enqueue_rpc(request(2)).unwrap();
    assert!(s.cancel_rpc(a));

    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(sent.body, request(2));

    assert!(s.cancel_rpc(b));
    let dropped = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(dropped.body, functions::RpcDropAnswer { req_msg_id: sent.msg_id }.to_bytes());

    let mut frame = server.frame(rpc_result(sent.msg_id, bool_true()));
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty());
    assert_eq!(s.pending_rpc_count(), 0);
    assert!(!s.cancel_rpc(b));
}

#[test]
fn unacknowledged_request_state_is_queried() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    s.handle_timers(NOW + 1_500);
    let query = server.read(s.poll_transmit(NOW + 1_500).unwrap().unwrap());
    assert_eq!(query.body, types::MsgsStateReq { msg_ids: vec![first.msg_id] }.to_bytes());

    // "Nothing known about the message": send it again.
    let info = types::MsgsStateInfo { req_msg_id: query.msg_id, info: vec![1] };
    let mut frame = server.frame(info.to_bytes());
    s.handle_frame(&mut frame, NOW + 1_600).unwrap();
    let resent = server.read(s.poll_transmit(NOW + 1_600).unwrap().unwrap());
    assert_eq!(resent.body, request(1));
    assert!(resent.msg_id > first.msg_id);
}

#[test]
fn acknowledged_request_is_not_queried() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let mut frame = server.frame(types::MsgsAck { msg_ids: vec![first.msg_id] }.to_bytes());
    s.handle_frame(&mut frame, NOW).unwrap();
    s.handle_timers(NOW + 1_500);
    assert!(s.poll_transmit(NOW + 1_500).unwrap().is_none());
}

#[test]
fn ping_pong_measures_rtt() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.start(NOW);
    assert_eq!(s.next_deadline(), Some(NOW + 60_000));

    s.handle_timers(NOW + 60_000);
    let ping = server.read(s.poll_transmit(NOW + 60_000).unwrap().unwrap());
    assert_eq!(ping.body[..4], functions::PingDelayDisconnect::CONSTRUCTOR_ID.to_le_bytes());
    let ping_id = i64::from_le_bytes(ping.body[4..12].try_into().unwrap());
    assert_eq!(i32::from_le_bytes(ping.body[12..16].try_into().unwrap()), 75);

    let mut frame = server.frame(types::Pong { msg_id: ping.msg_id, ping_id }.to_bytes());
    let events = s.handle_frame(&mut frame, NOW + 60_120).unwrap();
    assert_eq!(events, vec![SessionEvent::Pong { rtt: 120 }]);
    assert_eq!(s.last_rtt(), Some(120));
}

#[test]
fn updates_are_delivered_once() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let update = updates_ids::UPDATES_TOO_LONG.to_le_bytes().to_vec();
    let msg_id = server.next_msg_id();

    let mut frame = server.frame_with(msg_id, server.session_id, update.clone());
    assert_eq!(s.handle_frame(&mut frame, NOW).unwrap(), vec![SessionEvent::Update(update.clone())]);
    let mut frame = server.frame_with(msg_id, server.session_id, update.clone());
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty(), "duplicate msg_id");
    let mut frame = server.frame_with(msg_id + 1, server.session_id, update);
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty(), "even msg_id");
}

#[test]
fn updates_ignored_when_disabled() {
    let mut s = session_with(SessionConfig { receive_updates: false, ..SessionConfig::default() });
    let mut server = FakeServer::new(&s);
    let mut frame = server.frame(updates_ids::UPDATES_TOO_LONG.to_le_bytes().to_vec());
    assert!(s.handle_frame(&mut frame, NOW).unwrap().is_empty());
}

#[test]
fn container_from_server_is_unpacked() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let a = s.enqueue_rpc(request(1)).unwrap();
    let b = s.enqueue_rpc(request(2)).unwrap();
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    let ids: Vec<i64> = sent.messages().iter().map(|m| m.0).collect();

    let container = types::MsgContainer {
        messages: mtlink_tl_types::RawVec(vec![
            types::Message { msg_id: server.next_msg_id(), seqno: 1, body: Blob(rpc_result(ids[1], bool_true())) },
            types::Message { msg_id: server.next_msg_id(), seqno: 3, body: Blob(rpc_result(ids[0], bool_true())) },
        ]),
    };
    let mut frame = server.frame(container.to_bytes());
    let events = s.handle_frame(&mut frame, NOW).unwrap();
    assert_eq!(
        events,
        vec![
            SessionEvent::RpcResult { id: b, body: bool_true() },
            SessionEvent::RpcResult { id: a, body: bool_true() },
        ]
    );
}

#[test]
fn foreign_session_is_ignored_and_tampering_is_fatal() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    let msg_id = server.next_msg_id();
    let mut foreign = server.frame_with(msg_id, server.session_id ^ 1, bool_true());
    assert!(s.handle_frame(&mut foreign, NOW).unwrap().is_empty());

    let mut tampered = server.frame(bool_true());
    tampered[40] ^= 0xff;
    let err = s.handle_frame(&mut tampered, NOW).unwrap_err();
    assert!(err.is_security_violation(), "{err}");
}

#[test]
fn transport_flood_pauses_and_resends() {
    let mut s = session();
    let server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    s.on_transport_flood(NOW, 1_000);
    assert!(s.poll_transmit(NOW).unwrap().is_none());
    assert_eq!(s.next_deadline(), Some(NOW + 1_000));

    let resent = server.read(s.poll_transmit(NOW + 1_000).unwrap().unwrap());
    assert_eq!(resent.body, request(1));
    assert!(resent.msg_id > first.msg_id);
}

#[test]
fn chained_request_waits_for_its_predecessor() {
    let mut s = session();
    let server = FakeServer::new(&s);

    s.enqueue_chained_rpc(request(1), "send").unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(first.body, request(1), "nothing to wait for yet");

    s.enqueue_rpc(request(2)).unwrap();
    let unrelated = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(unrelated.body, request(2));

    s.enqueue_chained_rpc(request(3), "send").unwrap();
    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    let expected = functions::InvokeAfterMsg { msg_id: first.msg_id, query: Blob(request(3)) }.to_bytes();
    assert_eq!(second.body, expected);

    s.enqueue_chained_rpc(request(4), "other").unwrap();
    let other = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert_eq!(other.body, request(4));
}

#[test]
fn chains_do_not_survive_a_session_reset() {
    let mut s = session();
    let server = FakeServer::new(&s);
    s.enqueue_chained_rpc(request(1), "send").unwrap();
    server.read(s.poll_transmit(NOW).unwrap().unwrap());

    s.reset_session();
    s.enqueue_chained_rpc(request(2), "send").unwrap();
    let sent = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert!(sent.find(&request(2)).is_some());
    assert!(sent.find_by_id(functions::InvokeAfterMsg::CONSTRUCTOR_ID).is_none());
}

#[test]
fn resent_request_gets_a_fresh_id_without_a_container() {
    let mut s = session();
    let mut server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW).unwrap().unwrap());

    let notice = types::BadMsgNotification { bad_msg_id: first.msg_id, bad_msg_seqno: first.seq_no, error_code: 20 };
    let mut frame = server.frame(notice.to_bytes());
    s.handle_frame(&mut frame, NOW).unwrap();

    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    assert!(!second.is_container());
    assert_eq!(second.body, request(1));
    assert!(second.msg_id > first.msg_id);
    assert_eq!(second.seq_no, 3);
}

#[test]
fn session_reset_restarts_message_ids_from_the_clock() {
    let mut s = session();
    let server = FakeServer::new(&s);
    s.enqueue_rpc(request(1)).unwrap();
    let first = server.read(s.poll_transmit(NOW + 5_000).unwrap().unwrap());
    assert_eq!(first.msg_id >> 32, (NOW / 1000) as i64 + 5);

    s.reset_session();
    let second = server.read(s.poll_transmit(NOW).unwrap().unwrap());
    let (resent, _) = second.find(&request(1)).expect("request requeued");
    assert_eq!(resent >> 32, (NOW / 1000) as i64);
}
