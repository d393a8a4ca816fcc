//! Backend selection with a real agent process.

use std::sync::Arc;

use recheck::{
    AgentError, Backend, CheckError, CheckOptions, Checker, CheckerConfig, Diagnostics, Progress,
    Status,
};
use recheck::bridge::protocol::CheckRequest;

const STUB: &str = env!("CARGO_BIN_EXE_stub-agent");

fn missing_path() -> std::path::PathBuf {
    tempfile::tempdir().unwrap().path().join("missing")
}

#[tokio::test]
async fn auto_prefers_the_native_agent() {
    let checker = Checker::new(
        CheckerConfig::new()
            .with_native_bin(STUB)
            .with_engine(Arc::new(|req: &CheckRequest, _: &Progress| {
                Diagnostics::unexpected(&req.source, &req.flags, "engine should not run")
            })),
    );

    let d = checker
        .check("^(a|a)*$", "", CheckOptions::default())
        .await
        .unwrap();
    assert_eq!(d.status(), Status::Vulnerable);
    assert_eq!(checker.backend_name(), Some("agent"));
    checker.shutdown().await;
}

#[tokio::test]
async fn auto_falls_back_to_java_when_native_is_missing() {
    let checker = Checker::new(
        CheckerConfig::new()
            .with_native_bin(missing_path())
            .with_java(STUB)
            .with_jar("/opt/recheck.jar"),
    );

    let d = checker.check("^a$", "", CheckOptions::default()).await.unwrap();
    assert_eq!(d.status(), Status::Safe);
    assert_eq!(checker.backend_name(), Some("agent"));
}

#[tokio::test]
async fn pinned_java_surfaces_spawn_errors() {
    let checker = Checker::new(
        CheckerConfig::new()
            .with_backend(Backend::Java)
            .with_java(missing_path().display().to_string())
            .with_jar("/opt/recheck.jar"),
    );

    let err = checker.check("^a$", "", CheckOptions::default()).await.unwrap_err();
    assert!(matches!(err, CheckError::Agent(AgentError::Spawn(_))), "{err:?}");
}

#[tokio::test]
async fn worker_backend_without_engine_runs_agent_processes() {
    let checker = Checker::new(
        CheckerConfig::new()
            .with_backend(Backend::Worker)
            .with_native_bin(STUB)
            .with_workers(2),
    );

    let (a, b) = tokio::join!(
        checker.check("^(a|a)*$", "", CheckOptions::default()),
        checker.check("^a$", "", CheckOptions::default()),
    );
    assert_eq!(a.unwrap().status(), Status::Vulnerable);
    assert_eq!(b.unwrap().status(), Status::Safe);
    assert_eq!(checker.backend_name(), Some("worker"));
    checker.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_later_agent_checks() {
    let checker = Checker::new(
        CheckerConfig::new()
            .with_backend(Backend::Native)
            .with_native_bin(STUB),
    );
    checker.check("^a$", "", CheckOptions::default()).await.unwrap();

    checker.shutdown().await;
    let d = checker.check("^a$", "", CheckOptions::default()).await.unwrap();
    assert!(d.is_cancelled());
}
