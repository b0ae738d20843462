//! End-to-end scenarios over loopback TCP.
//!
//! Each test stands up a real server on an ephemeral port and drives it
//! with real client sessions through the full admission handshake and the
//! encrypted channel.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use chatprog_core::client::{self, Session};
use chatprog_core::crypto::Identity;
use chatprog_core::protocol::{tag, read_frame, Command, CommandKind, Payload, ServerMsg};
use chatprog_core::server::{Server, ServerConfig};
use chatprog_core::Error;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

/// One RSA identity for the whole test binary; the server does not require
/// key uniqueness and 1024-bit generation is the slow part of a test.
fn shared_identity() -> &'static Identity {
    static IDENTITY: OnceLock<Identity> = OnceLock::new();
    IDENTITY.get_or_init(|| Identity::generate().expect("generate identity"))
}

async fn start_server() -> (SocketAddr, JoinHandle<()>) {
    let config = ServerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        tick: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.expect("bind server");
    let addr = server.local_addr();
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, handle)
}

async fn join(addr: SocketAddr, name: &str) -> Session {
    client::connect(&addr.ip().to_string(), addr.port(), name, shared_identity())
        .await
        .expect("connect")
}

/// Receive the next server message, skipping any other payload kind.
async fn next_server_msg(session: &mut Session) -> ServerMsg {
    loop {
        match timeout(WAIT, session.receive())
            .await
            .expect("receive timed out")
            .expect("receive failed")
        {
            Some(Payload::Server(msg)) => return msg,
            Some(_) => continue,
            None => panic!("connection ended while waiting for a server message"),
        }
    }
}

async fn next_payload(session: &mut Session) -> Payload {
    timeout(WAIT, session.receive())
        .await
        .expect("receive timed out")
        .expect("receive failed")
        .expect("connection ended")
}

/// Assert that nothing arrives within a quiet window.
async fn assert_silent(session: &mut Session) {
    assert!(
        timeout(QUIET, session.receive()).await.is_err(),
        "expected silence but a payload arrived"
    );
}

/// Consume the joiner's own join notice and help tip.
async fn drain_welcome(session: &mut Session) {
    let join_notice = next_server_msg(session).await;
    assert!(join_notice.msg.ends_with("joined the chat."));
    let tip = next_server_msg(session).await;
    assert!(tip.msg.starts_with("Tip:"));
}

#[tokio::test]
async fn admission_and_duplicate_names() {
    let (addr, server) = start_server().await;

    // first member ever becomes a manager, so the join notice carries `@`
    let mut alice = join(addr, "alice").await;
    let notice = next_server_msg(&mut alice).await;
    assert_eq!(notice.msg, "@alice joined the chat.");
    assert!(notice.name.is_empty(), "join notices are system messages");
    let tip = next_server_msg(&mut alice).await;
    assert_eq!(tip.msg, "Tip: Type /help to display available commands.");

    // the same name again is refused before entering the roster
    match client::connect(&addr.ip().to_string(), addr.port(), "alice", shared_identity()).await {
        Err(Error::Rejected(reason)) => {
            assert_eq!(reason, "Connection Refused: Name is already taken.")
        }
        Err(other) => panic!("expected rejection, got {other:?}"),
        Ok(_) => panic!("duplicate name must be rejected"),
    }

    // a distinct name succeeds and alice sees the join broadcast
    let mut bob = join(addr, "bob").await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");
    drain_welcome(&mut bob).await;

    // the roster still has exactly one alice
    alice
        .send(&Payload::Command(Command::no_args(CommandKind::List)))
        .await
        .expect("send list");
    assert_eq!(next_server_msg(&mut alice).await.msg, "Online: @alice, bob");

    server.abort();
}

#[tokio::test]
async fn first_member_is_promoted() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;

    alice
        .send(&Payload::Command(Command::no_args(CommandKind::ViewManagers)))
        .await
        .expect("send view-managers");
    assert_eq!(next_server_msg(&mut alice).await.msg, "Managers: @alice");

    server.abort();
}

#[tokio::test]
async fn configured_names_join_as_managers() {
    let config = ServerConfig {
        bind: "127.0.0.1".to_string(),
        port: 0,
        manager_names: vec!["bob".to_string()],
        tick: Duration::from_millis(10),
        ..ServerConfig::default()
    };
    let server = Server::bind(config).await.expect("bind server");
    let addr = server.local_addr();
    let handle = tokio::spawn(async move {
        let _ = server.run().await;
    });

    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "@bob joined the chat.");

    bob.send(&Payload::Command(Command::no_args(CommandKind::ViewManagers)))
        .await
        .expect("send view-managers");
    assert_eq!(
        next_server_msg(&mut bob).await.msg,
        "Managers: @alice, @bob"
    );

    handle.abort();
}

#[tokio::test]
async fn muted_members_cannot_broadcast() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");

    alice
        .send(&Payload::Command(Command::one_arg(CommandKind::Mute, "bob")))
        .await
        .expect("send mute");
    assert_eq!(
        next_server_msg(&mut bob).await.msg,
        "You have been muted by a manager."
    );

    // muting an already-muted member is a no-op with no notification
    alice
        .send(&Payload::Command(Command::one_arg(CommandKind::Mute, "bob")))
        .await
        .expect("send mute again");
    assert_silent(&mut bob).await;

    // bob's message reaches nobody but bob, as an error
    bob.send(&Payload::Msg("can anyone hear me?".into()))
        .await
        .expect("send message");
    assert_eq!(
        next_server_msg(&mut bob).await.msg,
        "Error - You are muted, message was not sent."
    );
    assert_silent(&mut alice).await;

    // unmuting restores the normal broadcast path
    alice
        .send(&Payload::Command(Command::one_arg(CommandKind::Unmute, "bob")))
        .await
        .expect("send unmute");
    assert_eq!(next_server_msg(&mut bob).await.msg, "You are no longer muted.");

    bob.send(&Payload::Msg("back again".into()))
        .await
        .expect("send message");
    let seen_by_alice = next_server_msg(&mut alice).await;
    assert_eq!(seen_by_alice.name, "bob");
    assert_eq!(seen_by_alice.msg, "back again");
    // the sender gets an echo under its own name for self rendering
    let echo = next_server_msg(&mut bob).await;
    assert_eq!(echo.name, "bob");
    assert_eq!(echo.msg, "back again");

    server.abort();
}

#[tokio::test]
async fn tell_reaches_only_executor_and_target() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");
    let mut carol = join(addr, "carol").await;
    drain_welcome(&mut carol).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "carol joined the chat.");
    assert_eq!(next_server_msg(&mut bob).await.msg, "carol joined the chat.");

    alice
        .send(&Payload::Command(Command::tell("bob", "hello")))
        .await
        .expect("send tell");
    assert_eq!(next_server_msg(&mut alice).await.msg, "alice -> bob: hello");
    assert_eq!(next_server_msg(&mut bob).await.msg, "alice -> bob: hello");
    assert_silent(&mut carol).await;

    server.abort();
}

#[tokio::test]
async fn permission_is_enforced() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");

    // bob is not a manager; no roster mutation may happen
    bob.send(&Payload::Command(Command::one_arg(CommandKind::Kick, "alice")))
        .await
        .expect("send kick");
    assert_eq!(next_server_msg(&mut bob).await.msg, "Error - Permission denied.");
    assert_silent(&mut alice).await;

    bob.send(&Payload::Command(Command::no_args(CommandKind::List)))
        .await
        .expect("send list");
    assert_eq!(next_server_msg(&mut bob).await.msg, "Online: @alice, bob");

    server.abort();
}

#[tokio::test]
async fn empty_tell_target_is_not_found() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;

    alice
        .send(&Payload::Command(Command::tell("", "hi")))
        .await
        .expect("send tell");
    assert_eq!(
        next_server_msg(&mut alice).await.msg,
        "Error - '' is not in the group."
    );

    server.abort();
}

#[tokio::test]
async fn kick_removes_the_target() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");

    alice
        .send(&Payload::Command(Command::one_arg(CommandKind::Kick, "bob")))
        .await
        .expect("send kick");

    assert_eq!(
        next_server_msg(&mut alice).await.msg,
        "bob has been kicked from the group."
    );
    assert_eq!(
        next_server_msg(&mut bob).await.msg,
        "You have been kicked from the group."
    );
    // the server closes bob's connection after the notice
    let ended = timeout(WAIT, bob.receive())
        .await
        .expect("receive timed out")
        .expect("receive failed");
    assert!(ended.is_none(), "kicked member's connection must close");

    server.abort();
}

#[tokio::test]
async fn promote_is_idempotent() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");

    alice
        .send(&Payload::Command(Command::one_arg(CommandKind::Promote, "bob")))
        .await
        .expect("send promote");
    assert_eq!(next_server_msg(&mut bob).await.msg, "You are now a manager.");

    // promoting an already-manager member sends no duplicate notification
    alice
        .send(&Payload::Command(Command::one_arg(CommandKind::Promote, "bob")))
        .await
        .expect("send promote again");
    assert_silent(&mut bob).await;

    bob.send(&Payload::Command(Command::no_args(CommandKind::ViewManagers)))
        .await
        .expect("send view-managers");
    assert_eq!(
        next_server_msg(&mut bob).await.msg,
        "Managers: @alice, @bob"
    );

    server.abort();
}

#[tokio::test]
async fn attachment_upload_and_download() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");

    let blob = b"attachment payload".to_vec();
    alice
        .send_attachment("notes.txt", blob.clone())
        .await
        .expect("send attachment");

    // everyone, the sender included, gets the notice with the same id
    let alice_notice = match next_payload(&mut alice).await {
        Payload::FileAttachRecv(notice) => notice,
        other => panic!("expected attach notice, got {other:?}"),
    };
    let bob_notice = match next_payload(&mut bob).await {
        Payload::FileAttachRecv(notice) => notice,
        other => panic!("expected attach notice, got {other:?}"),
    };
    assert_eq!(alice_notice, bob_notice);
    assert_eq!(bob_notice.filename, "notes.txt");
    assert_eq!(bob_notice.sender, "alice");

    // give the blob frame time to be polled and stored
    tokio::time::sleep(Duration::from_millis(200)).await;

    bob.send(&Payload::Msg("DOWNLOAD:1".into()))
        .await
        .expect("send download");
    match next_payload(&mut bob).await {
        Payload::Bytes(data) => assert_eq!(data, blob),
        other => panic!("expected the stored blob, got {other:?}"),
    }

    // an unknown descriptor answers with an error, not silence
    bob.send(&Payload::Msg("DOWNLOAD:99".into()))
        .await
        .expect("send download");
    assert_eq!(next_server_msg(&mut bob).await.msg, "Error - No such attachment.");

    server.abort();
}

#[tokio::test]
async fn legacy_file_reference_gets_a_descriptor() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let mut bob = join(addr, "bob").await;
    drain_welcome(&mut bob).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");

    alice
        .send(&Payload::Msg("FILE:report.pdf".into()))
        .await
        .expect("send file reference");

    let seen_by_bob = next_server_msg(&mut bob).await;
    assert_eq!(seen_by_bob.name, "alice");
    assert_eq!(seen_by_bob.msg, "FILE:1");
    let echo = next_server_msg(&mut alice).await;
    assert_eq!(echo.msg, "FILE:1");

    server.abort();
}

#[tokio::test]
async fn quit_broadcasts_but_vanishing_does_not() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;
    let bob = join(addr, "bob").await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob joined the chat.");
    let mut carol = join(addr, "carol").await;
    drain_welcome(&mut carol).await;
    assert_eq!(next_server_msg(&mut alice).await.msg, "carol joined the chat.");

    // a graceful quit says goodbye
    bob.quit().await.expect("quit");
    assert_eq!(next_server_msg(&mut alice).await.msg, "bob left the chat.");

    // an abrupt disconnect is reaped silently
    drop(carol);
    assert_silent(&mut alice).await;

    alice
        .send(&Payload::Command(Command::no_args(CommandKind::List)))
        .await
        .expect("send list");
    assert_eq!(next_server_msg(&mut alice).await.msg, "Online: @alice");

    server.abort();
}

#[tokio::test]
async fn unknown_command_byte_is_invalid_input() {
    let (addr, server) = start_server().await;
    let mut alice = join(addr, "alice").await;
    drain_welcome(&mut alice).await;

    alice
        .send(&Payload::Command(Command::no_args(CommandKind::Unknown(0xC7))))
        .await
        .expect("send unknown command");
    assert_eq!(
        next_server_msg(&mut alice).await.msg,
        "Error - Invalid input, try /help."
    );

    server.abort();
}

#[tokio::test]
async fn desynchronized_connection_is_dropped() {
    let (addr, server) = start_server().await;

    // handshake by hand so we can inject unauthenticated envelopes
    let identity = shared_identity();
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream
        .write_all(&Payload::Msg("mallory".into()).encode().expect("encode"))
        .await
        .expect("send name");
    stream
        .write_all(
            &Payload::Msg(identity.public_key_pem().expect("pem"))
                .encode()
                .expect("encode"),
        )
        .await
        .expect("send key");

    let (reply_tag, ciphertext) = read_frame(&mut stream)
        .await
        .expect("read reply")
        .expect("admission reply");
    assert_eq!(reply_tag, tag::BYTES);
    let _session_key = identity
        .decrypt_session_key(&ciphertext)
        .expect("session key");

    // five consecutive envelopes that cannot authenticate
    for _ in 0..5 {
        let mut envelope = vec![0u8; 4 + 40];
        envelope[3] = 40; // nonce + tag + 8 bytes of garbage
        stream.write_all(&envelope).await.expect("send garbage");
    }

    // the server tears the connection down; drain whatever legitimate
    // traffic (join notice, tip) arrived first
    let closed = timeout(WAIT, async {
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server should close a desynchronized connection");

    server.abort();
}
