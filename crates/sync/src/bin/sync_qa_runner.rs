use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt, Snafu};

use parley_sync::{
    ArmOutcome, ConfirmGate, ConfirmState, DeleteOutcome, MemoryTransport, SendIgnored,
    SendOutcome, SettingsStore, SyncCoordinator, SyncError, SyncSettings, TransportError,
    TransportOp,
};

#[derive(Debug, Clone)]
struct RunnerArgs {
    scenario: Scenario,
    settings_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
enum Scenario {
    BootstrapEmpty,
    FirstMessageTitle,
    InFlightGuard,
    FailedSendRollback,
    DeleteLastSession,
    ConfirmGate,
    All,
}

impl Scenario {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "bootstrap_empty" => Some(Self::BootstrapEmpty),
            "first_message_title" => Some(Self::FirstMessageTitle),
            "in_flight_guard" => Some(Self::InFlightGuard),
            "failed_send_rollback" => Some(Self::FailedSendRollback),
            "delete_last_session" => Some(Self::DeleteLastSession),
            "confirm_gate" => Some(Self::ConfirmGate),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::BootstrapEmpty => "bootstrap_empty",
            Self::FirstMessageTitle => "first_message_title",
            Self::InFlightGuard => "in_flight_guard",
            Self::FailedSendRollback => "failed_send_rollback",
            Self::DeleteLastSession => "delete_last_session",
            Self::ConfirmGate => "confirm_gate",
            Self::All => "all",
        }
    }
}

#[derive(Debug, Snafu)]
enum RunnerError {
    #[snafu(display("missing required --scenario argument"))]
    MissingScenario { stage: &'static str },
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown scenario '{raw}'"))]
    UnknownScenario { stage: &'static str, raw: String },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("sync intent failed on `{stage}`: {source}"))]
    SyncIntent {
        stage: &'static str,
        source: SyncError,
    },
    #[snafu(display("scenario '{scenario}' failed: {reason}"))]
    ScenarioFailed {
        stage: &'static str,
        scenario: &'static str,
        reason: String,
    },
}

type RunnerResult<T> = Result<T, RunnerError>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run().await {
        println!("runner_ok=false");
        eprintln!("runner_error={error}");
        std::process::exit(1);
    }
}

async fn run() -> RunnerResult<()> {
    let args = parse_args(env::args().skip(1))?;
    println!("scenario={}", args.scenario.name());

    let settings = match args.settings_path {
        Some(path) => {
            println!("settings_path={}", path.display());
            SettingsStore::new(path).settings().as_ref().clone()
        }
        None => SyncSettings::default(),
    };

    match args.scenario {
        Scenario::BootstrapEmpty => run_bootstrap_empty(&settings).await,
        Scenario::FirstMessageTitle => run_first_message_title(&settings).await,
        Scenario::InFlightGuard => run_in_flight_guard(&settings).await,
        Scenario::FailedSendRollback => run_failed_send_rollback(&settings).await,
        Scenario::DeleteLastSession => run_delete_last_session(&settings).await,
        Scenario::ConfirmGate => run_confirm_gate(&settings).await,
        Scenario::All => run_all(&settings).await,
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> RunnerResult<RunnerArgs> {
    let mut scenario = None;
    let mut settings_path = None;
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--scenario" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-scenario-value",
                    arg: "--scenario",
                })?;

                let parsed = Scenario::parse(&value).context(UnknownScenarioSnafu {
                    stage: "parse-args-scenario",
                    raw: value,
                })?;
                scenario = Some(parsed);
            }
            "--settings" => {
                let value = pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-settings-value",
                    arg: "--settings",
                })?;
                settings_path = Some(PathBuf::from(value));
            }
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(RunnerArgs {
        scenario: scenario.context(MissingScenarioSnafu {
            stage: "parse-args-scenario-required",
        })?,
        settings_path,
    })
}

async fn run_all(settings: &SyncSettings) -> RunnerResult<()> {
    run_bootstrap_empty(settings).await?;
    run_first_message_title(settings).await?;
    run_in_flight_guard(settings).await?;
    run_failed_send_rollback(settings).await?;
    run_delete_last_session(settings).await?;
    run_confirm_gate(settings).await?;

    println!("all_passed=true");
    Ok(())
}

async fn run_bootstrap_empty(settings: &SyncSettings) -> RunnerResult<()> {
    let transport = Arc::new(MemoryTransport::new());
    let coordinator = SyncCoordinator::new(transport.clone(), settings);

    let current = coordinator
        .init()
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-bootstrap-empty-init",
        })?;
    let snapshot = coordinator.snapshot();

    let create_calls = transport.calls(TransportOp::CreateSession);
    println!("bootstrap_create_calls={create_calls}");
    println!("bootstrap_session_count={}", snapshot.sessions.len());
    println!("bootstrap_current={current}");
    println!("bootstrap_message_count={}", snapshot.messages.len());

    let bootstrap_ok = create_calls == 1
        && snapshot.sessions.len() == 1
        && snapshot.current_session_id.as_ref() == Some(&current)
        && snapshot.messages.is_empty();
    println!("bootstrap_empty={bootstrap_ok}");
    ensure_scenario(
        bootstrap_ok,
        "scenario-bootstrap-empty",
        "bootstrap_empty",
        "empty bootstrap did not yield exactly one selected session",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_first_message_title(settings: &SyncSettings) -> RunnerResult<()> {
    let transport = Arc::new(MemoryTransport::new());
    let coordinator = SyncCoordinator::new(transport.clone(), settings);
    coordinator
        .init()
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-first-message-init",
        })?;

    let hold = transport.hold(TransportOp::SendMessage);
    let observe = async {
        tokio::task::yield_now().await;
        let optimistic_len = coordinator.snapshot().messages.len();
        hold.release();
        optimistic_len
    };
    let (outcome, optimistic_len) =
        futures::join!(coordinator.send_message("What is flu?"), observe);
    let outcome = outcome
        .context(SyncIntentSnafu {
            stage: "scenario-first-message-send",
        })?;

    let snapshot = coordinator.snapshot();
    let title = snapshot
        .sessions
        .first()
        .map(|session| session.title.clone())
        .unwrap_or_default();
    let rename_calls = transport.calls(TransportOp::RenameSession);
    println!("first_message_optimistic_len={optimistic_len}");
    println!("first_message_reconciled_len={}", snapshot.messages.len());
    println!("first_message_rename_calls={rename_calls}");
    println!("first_message_title={title}");

    let first_message_ok = matches!(outcome, SendOutcome::Delivered { was_first: true, .. })
        && optimistic_len == 1
        && snapshot.messages.len() == 2
        && rename_calls == 1
        && title == "What is flu?";
    ensure_scenario(
        first_message_ok,
        "scenario-first-message-title",
        "first_message_title",
        "first message did not reconcile to user + assistant and rename the session",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_in_flight_guard(settings: &SyncSettings) -> RunnerResult<()> {
    let transport = Arc::new(MemoryTransport::new());
    let coordinator = SyncCoordinator::new(transport.clone(), settings);
    coordinator
        .init()
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-in-flight-init",
        })?;

    let hold = transport.hold(TransportOp::SendMessage);
    let second = async {
        tokio::task::yield_now().await;
        let outcome = coordinator.send_message("double submit").await;
        hold.release();
        outcome
    };
    let (first, second) = futures::join!(coordinator.send_message("double submit"), second);
    let first = first
        .context(SyncIntentSnafu {
            stage: "scenario-in-flight-first",
        })?;
    let second = second
        .context(SyncIntentSnafu {
            stage: "scenario-in-flight-second",
        })?;

    let send_calls = transport.calls(TransportOp::SendMessage);
    let message_count = coordinator.snapshot().messages.len();
    println!("in_flight_send_calls={send_calls}");
    println!("in_flight_message_count={message_count}");

    let guard_ok = matches!(first, SendOutcome::Delivered { .. })
        && matches!(second, SendOutcome::Ignored(SendIgnored::AlreadyInFlight))
        && send_calls == 1
        && message_count == 2;
    println!("in_flight_guard={guard_ok}");
    ensure_scenario(
        guard_ok,
        "scenario-in-flight-guard",
        "in_flight_guard",
        "a second send was admitted while the first was in flight",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_failed_send_rollback(settings: &SyncSettings) -> RunnerResult<()> {
    let transport = Arc::new(MemoryTransport::new());
    let coordinator = SyncCoordinator::new(transport.clone(), settings);
    coordinator
        .init()
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-failed-send-init",
        })?;
    coordinator
        .send_message("What is flu?")
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-failed-send-seed",
        })?;

    let before = coordinator.snapshot().messages;
    transport.fail_next(
        TransportOp::SendMessage,
        TransportError::Rejected {
            stage: "qa-runner",
            status: Some(503),
            detail: Some("agent is overloaded".to_string()),
        },
    );
    let failed = coordinator.send_message("And the symptoms?").await;
    let snapshot = coordinator.snapshot();

    let detail = failed
        .as_ref()
        .err()
        .and_then(SyncError::detail)
        .unwrap_or_default()
        .to_string();
    let restored = snapshot.messages == before;
    println!("failed_send_detail={detail}");
    println!("failed_send_restored={restored}");
    println!(
        "failed_send_last_error={}",
        snapshot.last_error.as_deref().unwrap_or_default()
    );

    let rollback_ok = matches!(failed, Err(SyncError::Send { .. }))
        && restored
        && detail == "agent is overloaded";
    ensure_scenario(
        rollback_ok,
        "scenario-failed-send-rollback",
        "failed_send_rollback",
        "failed send did not restore the previous message sequence",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_delete_last_session(settings: &SyncSettings) -> RunnerResult<()> {
    let transport = Arc::new(MemoryTransport::new());
    let only = transport.seed_session("only");
    let coordinator = SyncCoordinator::new(transport.clone(), settings);
    coordinator
        .init()
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-delete-last-init",
        })?;

    let armed = coordinator
        .delete_session(&only)
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-delete-last-arm",
        })?;
    let confirmed = coordinator
        .delete_session(&only)
        .await
        .context(SyncIntentSnafu {
            stage: "scenario-delete-last-confirm",
        })?;

    let snapshot = coordinator.snapshot();
    let remaining = snapshot.sessions.len();
    let replaced = snapshot
        .current_session_id
        .as_ref()
        .is_some_and(|current| *current != only);
    println!("delete_last_remaining={remaining}");
    println!("delete_last_replaced={replaced}");

    let delete_ok = armed == DeleteOutcome::Armed
        && matches!(confirmed, DeleteOutcome::Deleted(effect) if effect.created_fallback)
        && remaining == 1
        && replaced
        && transport.sessions().len() == 1;
    ensure_scenario(
        delete_ok,
        "scenario-delete-last-session",
        "delete_last_session",
        "deleting the only session did not leave exactly one replacement",
    )?;

    println!("runner_ok=true");
    Ok(())
}

async fn run_confirm_gate(settings: &SyncSettings) -> RunnerResult<()> {
    // Short window so the expiry half of the scenario runs in real time.
    let gate = ConfirmGate::new(Duration::from_millis(50));
    println!("confirm_configured_expiry_ms={}", settings.confirm_expiry_ms);

    let first = gate.arm("x");
    let second = gate.arm("x");
    let same_target_ok =
        first == ArmOutcome::Armed("x") && second == ArmOutcome::Confirmed("x");

    gate.arm("x");
    let switched = gate.arm("y");
    let switch_ok = switched == ArmOutcome::Armed("y") && !gate.is_armed(&"x");

    tokio::time::sleep(gate.expiry() + Duration::from_millis(50)).await;
    let expiry_ok = gate.state() == ConfirmState::Idle;

    println!("confirm_same_target={same_target_ok}");
    println!("confirm_switch_target={switch_ok}");
    println!("confirm_expired={expiry_ok}");
    ensure_scenario(
        same_target_ok && switch_ok && expiry_ok,
        "scenario-confirm-gate",
        "confirm_gate",
        "confirmation gate did not follow the arm/confirm/expire cycle",
    )?;

    println!("runner_ok=true");
    Ok(())
}

fn ensure_scenario(
    passed: bool,
    stage: &'static str,
    scenario: &'static str,
    reason: &str,
) -> RunnerResult<()> {
    if passed {
        return Ok(());
    }

    ScenarioFailedSnafu {
        stage,
        scenario,
        reason: reason.to_string(),
    }
    .fail()
}
