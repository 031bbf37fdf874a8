mod common;

use std::time::Duration;

use common::{Client, start_server};
use murmur_proto::{MsgKind, SERVER_SENDER};

/// Two users meet, chat, and one leaves: the full JOIN / INITIAL /
/// GROUP_MSG / EXIT exchange.
#[test]
fn two_user_chat() {
    let (_server, addr) = start_server();

    let mut alice = Client::connect(addr);
    assert!(alice.join("alice").is_none(), "first user should get no roster");

    let mut bob = Client::connect(addr);
    let initial = bob.join("bob").expect("second user should get a roster");
    assert_eq!(initial.sender, SERVER_SENDER);
    assert_eq!(initial.body, b"alice");

    let join = alice.recv_frame();
    assert_eq!(join.kind, MsgKind::Join);
    assert_eq!(join.sender, "bob");
    assert!(join.body.is_empty());

    bob.send_frame(MsgKind::GroupMsg, "bob", b"hi");
    let msg = alice.recv_frame();
    assert_eq!(msg.kind, MsgKind::GroupMsg);
    assert_eq!(msg.sender, "bob");
    assert_eq!(msg.body, b"hi");

    // The sender must not hear their own message echoed back.
    bob.expect_silence(Duration::from_millis(200));

    drop(bob);
    let exit = alice.recv_frame();
    assert_eq!(exit.kind, MsgKind::Exit);
    assert_eq!(exit.sender, "bob");
}

/// The sender field of a chat frame is replaced with the name bound at
/// JOIN; clients can't impersonate each other.
#[test]
fn group_msg_sender_is_server_trusted() {
    let (_server, addr) = start_server();

    let mut alice = Client::connect(addr);
    alice.join("alice");
    let mut bob = Client::connect(addr);
    bob.join("bob");
    alice.recv_frame(); // bob's JOIN

    bob.send_frame(MsgKind::GroupMsg, "alice", b"forged");
    let msg = alice.recv_frame();
    assert_eq!(msg.sender, "bob");
    assert_eq!(msg.body, b"forged");
}

/// A second claim of a live name is rejected with a terminal disconnect and
/// the holder sees no trace of it.
#[test]
fn name_collision_disconnects_the_claimer() {
    let (_server, addr) = start_server();

    let mut alice = Client::connect(addr);
    alice.join("alice");

    let mut imposter = Client::connect(addr);
    imposter.send_control(MsgKind::Join, "alice");
    imposter.expect_eof();

    alice.expect_silence(Duration::from_millis(200));
    // Alice's claim is intact and the room still works.
    alice.ping();
}

/// An anonymous session may authenticate and ping, but its chat frames are
/// dropped and it observes no room traffic.
#[test]
fn anonymous_sessions_are_isolated() {
    let (_server, addr) = start_server();

    let mut alice = Client::connect(addr);
    alice.join("alice");

    let mut lurker = Client::connect(addr);
    lurker.ping();
    lurker.send_frame(MsgKind::GroupMsg, "lurker", b"can you hear me");
    alice.expect_silence(Duration::from_millis(200));

    // Named traffic doesn't reach the anonymous session either.
    alice.send_frame(MsgKind::GroupMsg, "alice", b"to the room");
    lurker.expect_silence(Duration::from_millis(200));

    // Dropping the lurker produces no EXIT: it never had a name.
    drop(lurker);
    alice.expect_silence(Duration::from_millis(200));
}

/// EXIT asked for explicitly behaves like a disconnect: one EXIT broadcast,
/// socket closed.
#[test]
fn exit_frame_closes_and_notifies() {
    let (_server, addr) = start_server();

    let mut alice = Client::connect(addr);
    alice.join("alice");
    let mut bob = Client::connect(addr);
    bob.join("bob");
    alice.recv_frame(); // bob's JOIN

    bob.send_control(MsgKind::Exit, "bob");
    let exit = alice.recv_frame();
    assert_eq!(exit.kind, MsgKind::Exit);
    assert_eq!(exit.sender, "bob");
    bob.expect_eof();
}

/// Per-sender-per-recipient FIFO: a burst from one sender arrives in order.
#[test]
fn messages_keep_order_per_sender() {
    let (_server, addr) = start_server();

    let mut alice = Client::connect(addr);
    alice.join("alice");
    let mut bob = Client::connect(addr);
    bob.join("bob");
    alice.recv_frame(); // bob's JOIN

    for i in 0..100u32 {
        bob.send_frame(MsgKind::GroupMsg, "bob", &i.to_le_bytes());
    }
    for i in 0..100u32 {
        let msg = alice.recv_frame();
        assert_eq!(msg.kind, MsgKind::GroupMsg);
        assert_eq!(msg.body, i.to_le_bytes());
    }
}
