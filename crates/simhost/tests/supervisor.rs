//! End-to-end supervisor tests against real `sh` workers.
#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use simhost::{
    HOST_SHUTDOWN, IpcError, LaunchSpec, ProcessSupervisor, RunState, RunStatus, SupervisorConfig,
    SupervisorError,
};

const CONFIG: &str = r#"{
  "time_config": {"total_simulation_hours": 4, "minutes_per_round": 60},
  "agent_configs": [{"agent_id": 1}, {"agent_id": 2}, {"agent_id": 3}]
}"#;

fn config(root: &Path) -> SupervisorConfig {
    SupervisorConfig::new(root)
        .with_poll_interval(Duration::from_millis(50))
        .with_stop_grace(Duration::from_secs(3))
        .with_kill_wait(Duration::from_secs(3))
        .with_shutdown_grace(Duration::from_secs(1))
}

fn prepare_run(root: &Path, run_id: &str) -> PathBuf {
    let dir = root.join(run_id);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("simulation_config.json"), CONFIG).unwrap();
    std::fs::write(dir.join("twitter_profiles.csv"), "id,name\n1,Ada\n").unwrap();
    dir
}

fn sh_worker(script: &str) -> LaunchSpec {
    LaunchSpec::new("sh").args(["-c", script, "worker"])
}

async fn wait_until<F>(supervisor: &ProcessSupervisor, run_id: &str, mut pred: F) -> RunState
where
    F: FnMut(&RunState) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(state) = supervisor.state(run_id).unwrap()
            && pred(&state)
        {
            return state;
        }
        assert!(Instant::now() < deadline, "timed out waiting on {run_id}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for_file(path: &Path) -> String {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(text) = std::fs::read_to_string(path)
            && text.ends_with('\n')
        {
            return text;
        }
        assert!(Instant::now() < deadline, "timed out waiting on {}", path.display());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Running, as opposed to gone or a zombie waiting to be reaped.
fn process_running(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
            return false;
        };
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        !matches!(state, None | Some('Z') | Some('X'))
    }
    #[cfg(not(target_os = "linux"))]
    {
        simhost::process::pid_alive(pid)
    }
}

const SIM_1: &str = r#"
mkdir -p A B
echo '{"event_type":"simulation_start"}' >> A/actions.jsonl
echo '{"event_type":"simulation_start"}' >> B/actions.jsonl
for i in 1 2 3; do
  echo "{\"round\":1,\"timestamp\":\"2024-01-01T00:00:0$i\",\"agent_id\":$i,\"agent_name\":\"a$i\",\"action_type\":\"CREATE_POST\",\"action_args\":{},\"success\":true}" >> A/actions.jsonl
done
echo '{"event_type":"round_end","round":1}' >> A/actions.jsonl
echo '{"event_type":"simulation_end","total_rounds":1,"total_actions":3}' >> A/actions.jsonl
sleep 0.3
echo '{"event_type":"simulation_end","total_rounds":1,"total_actions":0}' >> B/actions.jsonl
"#;

#[tokio::test]
async fn two_platforms_complete_at_different_times() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "sim_1");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let started = supervisor
        .start(
            "sim_1",
            sh_worker(SIM_1).platform("A").platform("B"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(started.status, RunStatus::Running);
    assert_eq!(started.total_rounds, 4);
    assert!(started.process_pid.is_some());

    let exit = supervisor.wait("sim_1").await.unwrap();
    assert!(exit.success());

    let state = supervisor.state("sim_1").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.platforms["A"].actions_count, 3);
    assert_eq!(state.platforms["B"].actions_count, 0);
    assert_eq!(state.current_round, 1);
    let ids: Vec<u64> = state.recent_actions.iter().map(|a| a.agent_id).collect();
    assert_eq!(ids, vec![3, 2, 1]);
    assert!(state.completed_at.is_some());

    let persisted = supervisor.store().load("sim_1").unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Completed);
    assert_eq!(persisted.total_actions(), 3);
    assert!(supervisor.active_runs().is_empty());
}

#[tokio::test]
async fn nonzero_exit_fails_with_log_excerpt() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "crash");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    supervisor
        .start(
            "crash",
            sh_worker("echo 'loading agents'; echo 'Traceback: boom' >&2; exit 3").platform("twitter"),
            Some(2),
        )
        .await
        .unwrap();
    let exit = supervisor.wait("crash").await.unwrap();
    assert_eq!(exit.code, Some(3));

    let state = supervisor.state("crash").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.total_rounds, 2);
    let error = state.error.unwrap();
    assert!(error.contains("exit code 3"), "{error}");
    assert!(error.contains("Traceback: boom"), "{error}");
}

#[tokio::test]
async fn clean_exit_without_terminal_event_fails() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "short");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let script = r#"mkdir -p twitter; echo '{"event_type":"simulation_start"}' >> twitter/actions.jsonl"#;
    supervisor
        .start("short", sh_worker(script).platform("twitter"), None)
        .await
        .unwrap();
    supervisor.wait("short").await.unwrap();

    let state = supervisor.state("short").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state.error.unwrap().contains("twitter"));
}

#[tokio::test]
async fn stop_terminates_the_whole_group() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = prepare_run(root.path(), "long");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    supervisor
        .start(
            "long",
            sh_worker("sleep 30 & echo $! > child.pid; wait").platform("twitter"),
            None,
        )
        .await
        .unwrap();
    let child: u32 = wait_for_file(&run_dir.join("child.pid")).await.trim().parse().unwrap();
    assert!(process_running(child));

    let started = Instant::now();
    let state = supervisor.stop("long").await.unwrap();
    assert_eq!(state.status, RunStatus::Stopped);
    assert!(started.elapsed() < Duration::from_secs(6));
    assert!(!process_running(child));
    assert!(!process_running(state.process_pid.unwrap()));

    let persisted = supervisor.store().load("long").unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Stopped);

    let err = supervisor.stop("long").await.unwrap_err();
    assert!(matches!(err, SupervisorError::NotRunning { status: RunStatus::Stopped, .. }));
}

#[tokio::test]
async fn stop_escalates_when_sigterm_is_ignored() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = prepare_run(root.path(), "stubborn");
    let supervisor = ProcessSupervisor::new(
        config(root.path()).with_stop_grace(Duration::from_millis(300)),
    );

    supervisor
        .start(
            "stubborn",
            sh_worker("trap '' TERM; sleep 30 & echo $! > child.pid; wait").platform("twitter"),
            None,
        )
        .await
        .unwrap();
    let child: u32 = wait_for_file(&run_dir.join("child.pid")).await.trim().parse().unwrap();

    let started = Instant::now();
    let state = supervisor.stop("stubborn").await.unwrap();
    assert_eq!(state.status, RunStatus::Stopped);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!process_running(child));
}

#[tokio::test]
async fn worker_outliving_sigkill_leaves_run_failed() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "unkillable");
    let supervisor = ProcessSupervisor::new(
        config(root.path())
            .with_stop_grace(Duration::from_millis(100))
            .with_kill_wait(Duration::ZERO),
    );

    supervisor
        .start(
            "unkillable",
            sh_worker("trap '' TERM; sleep 30 & wait").platform("twitter"),
            None,
        )
        .await
        .unwrap();

    let err = supervisor.stop("unkillable").await.unwrap_err();
    assert!(matches!(err, SupervisorError::StopTimeout { .. }));
    let state = supervisor.state("unkillable").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state.completed_at.is_some());

    supervisor.wait("unkillable").await.unwrap();
    let persisted = supervisor.store().load("unkillable").unwrap().unwrap();
    assert_eq!(persisted.status, RunStatus::Failed);
    assert!(persisted.error.unwrap().contains("after SIGKILL"));
}

#[tokio::test]
async fn duplicate_start_is_rejected() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "dup");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    supervisor
        .start("dup", sh_worker("sleep 30").platform("twitter"), None)
        .await
        .unwrap();
    let err = supervisor
        .start("dup", sh_worker("sleep 30").platform("twitter"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::AlreadyRunning(_)));
    assert_eq!(supervisor.active_runs(), vec!["dup".to_string()]);

    supervisor.stop("dup").await.unwrap();
}

#[tokio::test]
async fn missing_configuration_never_starts() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("bare")).unwrap();
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let err = supervisor
        .start("bare", sh_worker("exit 0").platform("twitter"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ConfigurationMissing { .. }));
    assert!(supervisor.state("bare").unwrap().is_none());

    prepare_run(root.path(), "noplatforms");
    let err = supervisor
        .start("noplatforms", sh_worker("exit 0"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ConfigurationMissing { .. }));
}

#[tokio::test]
async fn launch_failure_marks_run_failed() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "nolaunch");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let err = supervisor
        .start(
            "nolaunch",
            LaunchSpec::new("simhost-test-no-such-worker").platform("twitter"),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Launch(_)));

    let state = supervisor.store().load("nolaunch").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state.error.unwrap().starts_with("launch failed"));
}

#[tokio::test]
async fn pause_and_resume() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "pausable");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    supervisor
        .start("pausable", sh_worker("sleep 30").platform("twitter"), None)
        .await
        .unwrap();
    assert_eq!(supervisor.pause("pausable").unwrap().status, RunStatus::Paused);
    assert!(matches!(
        supervisor.pause("pausable"),
        Err(SupervisorError::NotRunning { status: RunStatus::Paused, .. })
    ));
    assert_eq!(supervisor.resume("pausable").unwrap().status, RunStatus::Running);

    supervisor.pause("pausable").unwrap();
    let state = supervisor.stop("pausable").await.unwrap();
    assert_eq!(state.status, RunStatus::Stopped);
}

#[tokio::test]
async fn completed_worker_serving_commands_stays_completed_on_stop() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "serving");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let script = r#"
mkdir -p twitter
echo '{"event_type":"simulation_start"}' >> twitter/actions.jsonl
echo '{"event_type":"simulation_end","total_rounds":0,"total_actions":0}' >> twitter/actions.jsonl
sleep 30
"#;
    supervisor
        .start("serving", sh_worker(script).platform("twitter"), None)
        .await
        .unwrap();
    wait_until(&supervisor, "serving", |s| s.status == RunStatus::Completed).await;
    assert_eq!(supervisor.active_runs(), vec!["serving".to_string()]);

    let state = supervisor.stop("serving").await.unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(supervisor.active_runs().is_empty());
}

#[tokio::test]
async fn host_shutdown_keeps_completed_runs_completed() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "served");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let script = r#"
mkdir -p twitter
echo '{"event_type":"simulation_start"}' >> twitter/actions.jsonl
echo '{"event_type":"simulation_end","total_rounds":0,"total_actions":0}' >> twitter/actions.jsonl
sleep 30
"#;
    supervisor
        .start("served", sh_worker(script).platform("twitter"), None)
        .await
        .unwrap();
    wait_until(&supervisor, "served", |s| s.status == RunStatus::Completed).await;

    assert_eq!(supervisor.shutdown_all().await, 1);
    supervisor.wait("served").await.unwrap();

    let state = supervisor.store().load("served").unwrap().unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.error.as_deref(), Some(HOST_SHUTDOWN));
    assert!(!process_running(state.process_pid.unwrap()));
}

#[tokio::test]
async fn cleanup_keeps_precomputed_inputs() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = prepare_run(root.path(), "rerun");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    supervisor
        .start("rerun", sh_worker("sleep 30").platform("twitter"), None)
        .await
        .unwrap();
    assert!(matches!(
        supervisor.cleanup_logs("rerun"),
        Err(SupervisorError::AlreadyRunning(_))
    ));
    supervisor.stop("rerun").await.unwrap();

    std::fs::create_dir_all(run_dir.join("twitter")).unwrap();
    std::fs::write(run_dir.join("twitter/actions.jsonl"), "{}\n").unwrap();
    std::fs::write(run_dir.join("twitter_simulation.db"), "db").unwrap();
    std::fs::write(run_dir.join("env_status.json"), r#"{"status":"stopped"}"#).unwrap();
    std::fs::create_dir_all(run_dir.join("ipc_commands")).unwrap();
    std::fs::write(run_dir.join("ipc_commands/stale.json"), "{}").unwrap();

    let report = supervisor.cleanup_logs("rerun").unwrap();
    assert!(report.success, "{:?}", report.errors);
    let mut cleaned = report.cleaned_files.clone();
    cleaned.sort();
    assert_eq!(
        cleaned,
        vec![
            "env_status.json",
            "ipc_commands/stale.json",
            "run_state.json",
            "simulation.log",
            "twitter/actions.jsonl",
            "twitter_simulation.db",
        ]
    );
    assert!(run_dir.join("simulation_config.json").is_file());
    assert!(run_dir.join("twitter_profiles.csv").is_file());
    assert!(supervisor.state("rerun").unwrap().is_none());
}

#[tokio::test]
async fn host_shutdown_runs_once_and_marks_runs_stopped() {
    let root = tempfile::tempdir().unwrap();
    prepare_run(root.path(), "one");
    prepare_run(root.path(), "two");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    for run_id in ["one", "two"] {
        supervisor
            .start(run_id, sh_worker("trap '' TERM; sleep 30").platform("twitter"), None)
            .await
            .unwrap();
    }

    let started = Instant::now();
    let (first, second) = tokio::join!(supervisor.shutdown_all(), supervisor.shutdown_all());
    assert_eq!(first + second, 2);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(supervisor.shutdown_all().await, 0);

    for run_id in ["one", "two"] {
        let state = supervisor.store().load(run_id).unwrap().unwrap();
        assert_eq!(state.status, RunStatus::Stopped);
        assert_eq!(state.error.as_deref(), Some("host shutdown"));
        assert!(!process_running(state.process_pid.unwrap()));
    }

    let err = supervisor
        .start("one", sh_worker("exit 0").platform("twitter"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::ShuttingDown));
}

const MAILBOX_WORKER: &str = r#"
echo '{"status":"alive","twitter_available":true,"reddit_available":false}' > env_status.json
mkdir -p ipc_commands ipc_responses
while :; do
  for f in ipc_commands/*.json; do
    [ -e "$f" ] || continue
    id=$(basename "$f" .json)
    printf '{"command_id":"%s","status":"completed","result":{"answer":"fine"},"timestamp":"t"}' "$id" > "ipc_responses/.$id.tmp"
    mv "ipc_responses/.$id.tmp" "ipc_responses/$id.json"
    rm -f "$f"
    exit 0
  done
  sleep 0.05
done
"#;

#[tokio::test]
async fn interview_through_run_mailbox() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = prepare_run(root.path(), "talk");
    let supervisor: Arc<ProcessSupervisor> = ProcessSupervisor::new(config(root.path()));

    supervisor
        .start(
            "talk",
            sh_worker(MAILBOX_WORKER).platform("twitter").platform("reddit"),
            None,
        )
        .await
        .unwrap();
    wait_for_file(&run_dir.join("env_status.json")).await;

    let coordinator = supervisor.interviews("talk").unwrap();
    assert_eq!(coordinator.channels(), vec!["twitter".to_string()]);
    let result = coordinator
        .interview(7, "how was your day?", None, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert_eq!(result["answer"], "fine");

    supervisor.wait("talk").await.unwrap();
    let leftovers = std::fs::read_dir(run_dir.join("ipc_commands")).unwrap().count()
        + std::fs::read_dir(run_dir.join("ipc_responses")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn interview_fails_fast_after_worker_is_killed() {
    let root = tempfile::tempdir().unwrap();
    let run_dir = prepare_run(root.path(), "crashed");
    let supervisor = ProcessSupervisor::new(config(root.path()));

    let script = r#"
echo '{"status":"alive","twitter_available":true,"reddit_available":false}' > env_status.json
sleep 30
"#;
    let state = supervisor
        .start("crashed", sh_worker(script).platform("twitter"), None)
        .await
        .unwrap();
    wait_for_file(&run_dir.join("env_status.json")).await;

    let pgid = state.process_pid.unwrap();
    let killed = std::process::Command::new("kill")
        .args(["-KILL", "--", &format!("-{pgid}")])
        .status()
        .unwrap();
    assert!(killed.success());
    supervisor.wait("crashed").await.unwrap();
    assert!(std::fs::read_to_string(run_dir.join("env_status.json")).unwrap().contains("alive"));

    let started = Instant::now();
    let err = supervisor
        .interviews("crashed")
        .unwrap()
        .interview(1, "still there?", None, Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::EnvironmentNotAlive));
    assert!(started.elapsed() < Duration::from_secs(1));

    // A supervisor that never owned the worker falls back to the recorded pid.
    let observer = ProcessSupervisor::new(config(root.path()));
    let err = observer
        .interviews("crashed")
        .unwrap()
        .interview(1, "still there?", None, Some(Duration::from_secs(10)))
        .await
        .unwrap_err();
    assert!(matches!(err, IpcError::EnvironmentNotAlive));
    assert!(started.elapsed() < Duration::from_secs(1));
}
