//! Scripted agent speaking the recheck line protocol.
//!
//! Used by the integration tests and for poking at the protocol by hand:
//!
//!   echo '{"id":1,"method":"check","params":{"source":"^(a|a)*$","flags":""}}' \
//!     | cargo run --bin stub-agent -- agent
//!
//! Methods:
//! - `ping`: an empty line and a result for an unknown id, then `{}`
//! - `test-request`: one progress message, then the notify counter
//! - `test-notify` (notification): bumps the counter
//! - `echo`: returns its params
//! - `crash`: exits without answering
//! - `check`: one progress message, then a verdict after the delay.
//!   `^(a|a)*$` is vulnerable, `test-large` is vulnerable with a 300k
//!   attack string, `test-hang` never finishes, anything else is safe.
//! - `cancel` (notification): answers the pending check as cancelled
//!
//! Flags: `--delay-ms N` (default 100), `--exit-on-start`, `--mute`.
//! `agent` and `-jar <path>` are accepted and ignored.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use recheck::LineFramer;
use recheck::bridge::protocol::{Request, Response};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

struct Options {
    delay: Duration,
    exit_on_start: bool,
    mute: bool,
}

fn parse_args() -> Result<Options> {
    let mut options = Options {
        delay: Duration::from_millis(100),
        exit_on_start: false,
        mute: false,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "agent" => {}
            // Lets the stub stand in for `java -jar <jar> agent`.
            "-jar" => {
                args.next().context("-jar needs a path")?;
            }
            "--exit-on-start" => options.exit_on_start = true,
            "--mute" => options.mute = true,
            "--delay-ms" => {
                let value = args.next().context("--delay-ms needs a value")?;
                let millis: u64 = value
                    .parse()
                    .with_context(|| format!("invalid --delay-ms: {value}"))?;
                options.delay = Duration::from_millis(millis);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(options)
}

/// Logs go to stderr; stdout carries the protocol.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("RECHECK_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("info") => "info",
            Ok("error") => "error",
            _ => "warn",
        };
        EnvFilter::new(format!("stub_agent={level},recheck={level}"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

type Out = mpsc::UnboundedSender<String>;

fn emit(out: &Out, response: Response) {
    match serde_json::to_string(&response) {
        Ok(line) => {
            let _ = out.send(line);
        }
        Err(e) => tracing::error!(error = %e, "Failed to encode response"),
    }
}

struct Agent {
    out: Out,
    delay: Duration,
    count: u64,
    checks: HashMap<u64, (JoinHandle<()>, Value)>,
}

impl Agent {
    fn handle(&mut self, request: Request) {
        tracing::debug!(id = ?request.id, method = %request.method, "Request");
        match (request.method.as_str(), request.id) {
            ("ping", Some(id)) => {
                let _ = self.out.send(String::new());
                let _ = self.out.send(
                    json!({"jsonrpc": "2.0+push", "id": id as i64 - 1, "result": {}}).to_string(),
                );
                let _ = self.out.send(
                    json!({"jsonrpc": "2.0+push", "id": id + 1_000_000, "result": {}}).to_string(),
                );
                emit(&self.out, Response::result(id, json!({})));
            }
            ("test-request", Some(id)) => {
                emit(&self.out, Response::progress(id, "message"));
                emit(&self.out, Response::result(id, json!(self.count)));
            }
            ("test-notify", None) => self.count += 1,
            ("echo", Some(id)) => emit(&self.out, Response::result(id, request.params)),
            ("crash", _) => {
                tracing::warn!("Crashing on request");
                std::process::exit(3);
            }
            ("check", Some(id)) => self.check(id, request.params),
            ("cancel", None) => {
                let Some(id) = request.params.get("id").and_then(Value::as_u64) else {
                    tracing::warn!(params = %request.params, "cancel without id");
                    return;
                };
                if let Some((timer, params)) = self.checks.remove(&id)
                    && !timer.is_finished()
                {
                    timer.abort();
                    emit(
                        &self.out,
                        Response::result(
                            id,
                            json!({
                                "status": "unknown",
                                "source": params.get("source").cloned().unwrap_or(Value::Null),
                                "flags": params.get("flags").cloned().unwrap_or(Value::Null),
                                "error": {"kind": "cancel"},
                            }),
                        ),
                    );
                }
            }
            (method, _) => tracing::warn!(method, "Ignoring unknown method"),
        }
    }

    fn check(&mut self, id: u64, params: Value) {
        self.checks.retain(|_, (timer, _)| !timer.is_finished());
        emit(&self.out, Response::progress(id, "message"));

        let source = params
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let flags = params
            .get("flags")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let out = self.out.clone();
        let delay = self.delay;

        let timer = tokio::spawn(async move {
            if source == "test-hang" {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(delay).await;
            let result = match source.as_str() {
                "^(a|a)*$" => json!({
                    "source": source,
                    "flags": flags,
                    "status": "vulnerable",
                    "checker": "automaton",
                    "attack": {"pumps": [{"prefix": "", "pump": "aa", "bias": 0}], "suffix": "\n", "base": 17, "string": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n"},
                    "complexity": {"type": "exponential", "isFuzz": false},
                    "hotspot": [{"start": 2, "end": 3, "temperature": "heat"}],
                }),
                "test-large" => json!({
                    "source": source,
                    "flags": flags,
                    "status": "vulnerable",
                    "attack": {"string": "a".repeat(300_000)},
                }),
                _ => json!({
                    "source": source,
                    "flags": flags,
                    "status": "safe",
                    "checker": "automaton",
                    "complexity": {"type": "linear", "isFuzz": false},
                }),
            };
            emit(&out, Response::result(id, result));
        });
        self.checks.insert(id, (timer, params));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let options = parse_args()?;

    if options.exit_on_start {
        tracing::info!("Exiting on start");
        return Ok(());
    }

    let (out, mut lines) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = lines.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut agent = Agent {
        out,
        delay: options.delay,
        count: 0,
        checks: HashMap::new(),
    };

    let mut input = FramedRead::new(tokio::io::stdin(), LineFramer::new());
    while let Some(line) = input.next().await {
        let line = line.context("reading stdin")?;
        if options.mute || line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Request>(&line) {
            Ok(request) => agent.handle(request),
            Err(e) => tracing::warn!(error = %e, "Ignoring malformed request"),
        }
    }

    tracing::debug!("stdin closed, exiting");
    for (timer, _) in agent.checks.values() {
        timer.abort();
    }
    drop(agent);
    writer.await.context("writer task")?.context("writing stdout")?;
    Ok(())
}
