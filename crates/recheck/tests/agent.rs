//! Agent lifecycle against the scripted `stub-agent` binary.

use std::time::Duration;

use recheck::{
    Agent, AgentConfig, AgentError, CancellationToken, CheckOptions, Diagnostics, Status,
    Subscriber,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

const STUB: &str = env!("CARGO_BIN_EXE_stub-agent");

async fn start(extra: &[&str]) -> Agent {
    let mut args = vec!["agent"];
    args.extend_from_slice(extra);
    Agent::start(STUB, args).await.unwrap()
}

#[tokio::test]
async fn requests_get_sequential_ids_and_results() {
    let agent = start(&[]).await;

    // The handshake ping took id 0.
    let (tx, mut messages) = mpsc::unbounded_channel::<Value>();
    let first = agent.request("test-request", json!({}), Some(Subscriber::from(tx)));
    assert_eq!(first.id(), 1);
    assert_eq!(first.await.unwrap(), json!(0));
    assert_eq!(messages.recv().await, Some(json!("message")));
    assert_eq!(messages.recv().await, None);

    agent.notify("test-notify", json!({})).unwrap();
    let second = agent.request("test-request", json!({}), None);
    assert_eq!(second.id(), 2);
    assert_eq!(second.await.unwrap(), json!(1));

    agent.kill();
}

#[tokio::test]
async fn concurrent_requests_resolve_independently() {
    let agent = start(&[]).await;

    let a = agent.request("echo", json!({"n": "a"}), None);
    let b = agent.request("echo", json!({"n": "b"}), None);
    assert_eq!(agent.outstanding(), 2);

    let (b, a) = tokio::join!(b, a);
    assert_eq!(a.unwrap(), json!({"n": "a"}));
    assert_eq!(b.unwrap(), json!({"n": "b"}));
    assert_eq!(agent.outstanding(), 0);
}

#[tokio::test]
async fn check_streams_progress_and_resolves() {
    let agent = start(&["--delay-ms", "10"]).await;

    let (tx, mut progress) = mpsc::unbounded_channel();
    let d = agent
        .check("^(a|a)*$", "", CheckOptions::default().with_progress(tx))
        .await
        .unwrap();
    assert_eq!(d.status(), Status::Vulnerable);
    assert_eq!(d.source(), "^(a|a)*$");
    assert_eq!(progress.recv().await.as_deref(), Some("message"));
    assert_eq!(progress.recv().await, None);

    let d = agent.check("^a+$", "u", CheckOptions::default()).await.unwrap();
    assert_eq!(d.status(), Status::Safe);
}

#[tokio::test]
async fn large_results_survive_framing() {
    let agent = start(&["--delay-ms", "0"]).await;

    let d = agent
        .check("test-large", "", CheckOptions::default())
        .await
        .unwrap();
    let Diagnostics::Vulnerable(v) = d else {
        panic!("expected vulnerable, got {d:?}");
    };
    assert_eq!(v.attack.unwrap().string.len(), 300_000);
}

#[tokio::test]
async fn cancel_waits_for_the_agent_answer() {
    let agent = start(&[]).await;
    let token = CancellationToken::new();

    let check = tokio::spawn({
        let agent = agent.clone();
        let options = CheckOptions::default().with_cancel(token.clone());
        async move { agent.check("test-hang", "", options).await }
    });
    while agent.outstanding() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    token.cancel();
    let d = tokio::time::timeout(Duration::from_secs(5), check)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(d.is_cancelled());
    assert_eq!(d.source(), "test-hang");
    assert!(!agent.is_killed());
}

#[tokio::test]
async fn check_with_an_already_cancelled_token() {
    let agent = start(&[]).await;
    let token = CancellationToken::new();
    token.cancel();

    let d = tokio::time::timeout(
        Duration::from_secs(5),
        agent.check("test-hang", "", CheckOptions::default().with_cancel(token)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(d.is_cancelled());
    assert_eq!(d.source(), "test-hang");
    assert_eq!(agent.outstanding(), 0);
    assert!(!agent.is_killed());

    // The agent is still usable afterwards.
    let d = agent.check("^a$", "", CheckOptions::default()).await.unwrap();
    assert_eq!(d.status(), Status::Safe);
}

#[tokio::test]
async fn kill_settles_everything_pending() {
    let agent = start(&[]).await;

    let check = tokio::spawn({
        let agent = agent.clone();
        async move { agent.check("test-hang", "", CheckOptions::default()).await }
    });
    let raw = agent.request("check", json!({"source": "test-hang", "flags": ""}), None);
    while agent.outstanding() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    agent.kill();
    agent.kill();

    assert!(check.await.unwrap().unwrap().is_cancelled());
    assert!(matches!(raw.await, Err(AgentError::Killed)));
    assert!(!agent.is_pinned());

    // Later calls fail fast.
    assert!(matches!(
        agent.request("echo", json!({}), None).await,
        Err(AgentError::Killed)
    ));
    assert!(matches!(
        agent.notify("test-notify", json!({})),
        Err(AgentError::Killed)
    ));
}

#[tokio::test]
async fn crash_fails_pending_requests() {
    let agent = start(&[]).await;

    let hanging = agent.request("check", json!({"source": "test-hang", "flags": ""}), None);
    let crash = agent.request("crash", json!({}), None);

    assert!(matches!(crash.await, Err(AgentError::Closed)));
    assert!(matches!(hanging.await, Err(AgentError::Closed)));
}

#[tokio::test]
async fn requests_after_a_crash_fail_fast() {
    let agent = start(&[]).await;
    assert!(matches!(
        agent.request("crash", json!({}), None).await,
        Err(AgentError::Closed)
    ));
    assert!(agent.is_closed());
    assert!(!agent.is_killed());

    let late = tokio::time::timeout(
        Duration::from_secs(3),
        agent.request("echo", json!({"x": 1}), None),
    )
    .await
    .unwrap();
    assert!(matches!(late, Err(AgentError::Closed)), "{late:?}");
    assert!(matches!(
        agent.notify("test-notify", json!({})),
        Err(AgentError::Closed)
    ));
    assert!(!agent.is_pinned());

    let err = tokio::time::timeout(
        Duration::from_secs(3),
        agent.check("^a$", "", CheckOptions::default()),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, AgentError::Closed), "{err:?}");
}

#[tokio::test]
async fn pinned_exactly_while_requests_are_outstanding() {
    let agent = start(&["--delay-ms", "50"]).await;
    assert!(!agent.is_pinned());

    let check = tokio::spawn({
        let agent = agent.clone();
        async move { agent.check("^a$", "", CheckOptions::default()).await }
    });
    while !agent.is_pinned() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    tokio::time::timeout(Duration::from_secs(5), agent.wait_idle())
        .await
        .unwrap();
    assert!(!agent.is_pinned());
    assert_eq!(check.await.unwrap().unwrap().status(), Status::Safe);
}

#[tokio::test]
async fn dropping_a_call_forgets_it() {
    let agent = start(&[]).await;

    let call = agent.request("check", json!({"source": "test-hang", "flags": ""}), None);
    assert!(agent.is_pinned());
    drop(call);
    assert!(!agent.is_pinned());
    assert_eq!(agent.outstanding(), 0);
}

#[tokio::test]
async fn start_fails_when_the_process_exits_early() {
    let err = Agent::start(STUB, ["agent", "--exit-on-start"])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AgentError::StartupFailed(_)), "{err:?}");
}

#[tokio::test]
async fn start_fails_when_the_binary_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("recheck");
    let err = Agent::start(missing.to_str().unwrap(), ["agent"])
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AgentError::Spawn(_)), "{err:?}");
}

#[tokio::test]
async fn handshake_times_out_on_a_silent_agent() {
    let err = AgentConfig::new(STUB)
        .with_args(["agent", "--mute"])
        .with_handshake_timeout(Some(Duration::from_millis(200)))
        .start()
        .await
        .err()
        .unwrap();
    assert!(matches!(err, AgentError::HandshakeTimeout(_)), "{err:?}");
}
