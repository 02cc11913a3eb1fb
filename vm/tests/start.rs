mod common;

use chrono::Utc;
use common::{CopyDecompressor, RecordingShell, context, init_options, write_image, write_script};
use cradle_vm::{
    ConfigStore, Context, MachineConfig, Processes, Provider, RetryPolicy, StartError,
    StartOptions, VmState, init, is_process_alive, start, state, wait_for_path,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const FAKE_GVPROXY: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    -listen-vfkit) sock="${2#unixgram://}"; shift ;;
  esac
  shift
done
touch "$sock"
exec sleep 30
"#;

fn fake_hypervisor(pid_file: &Path) -> String {
    format!("echo $$ > '{}'\nexec sleep 30\n", pid_file.display())
}

/// Records its pid, then runs until `release` appears and exits with `code`.
fn releasable_hypervisor(pid_file: &Path, release: &Path, code: i32) -> String {
    format!(
        "echo $$ > '{pid}.tmp' && mv '{pid}.tmp' '{pid}'\n\
         while [ ! -f '{release}' ]; do sleep 0.1; done\n\
         exit {code}\n",
        pid = pid_file.display(),
        release = release.display(),
    )
}

fn quick_options(parent_pid: u32) -> StartOptions {
    StartOptions {
        parent_pid: Some(parent_pid),
        watchdog_interval: Duration::from_millis(50),
        transport_wait: RetryPolicy::fixed(100, Duration::from_millis(50)),
        ssh_readiness: RetryPolicy::fixed(1000, Duration::from_millis(50)),
        termination_grace: Duration::from_secs(1),
        listen_for_signals: false,
        ..StartOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parent_death_stops_machine() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), Arc::new(CopyDecompressor::default()));
    let bin = dir.path().join("bin");
    let hypervisor_pid_file = dir.path().join("hypervisor.pid");
    write_script(&bin.join("gvproxy"), FAKE_GVPROXY);
    write_script(&bin.join("vfkit"), &fake_hypervisor(&hypervisor_pid_file));

    let image = write_image(dir.path(), "image.raw.zst", b"boot");
    let config = init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();

    let mut parent = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
    let parent_pid = parent.id().unwrap();

    let machine = {
        let ctx = ctx.clone();
        tokio::spawn(async move { start(&ctx, "dev", quick_options(parent_pid)).await })
    };

    let policy = RetryPolicy::fixed(200, Duration::from_millis(50));
    wait_for_path(&hypervisor_pid_file, &policy, &CancellationToken::new())
        .await
        .unwrap();
    let mut hypervisor_pid = String::new();
    for _ in 0..50 {
        hypervisor_pid = std::fs::read_to_string(&hypervisor_pid_file).unwrap();
        if hypervisor_pid.ends_with('\n') {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let hypervisor_pid: u32 = hypervisor_pid.trim().parse().unwrap();
    assert!(is_process_alive(hypervisor_pid));

    parent.kill().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), machine)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(StartError::ParentExited { pid }) if pid == parent_pid));
    assert!(!is_process_alive(hypervisor_pid));
    assert!(!config.network.transport_socket.exists());
    assert!(!config.api_socket().exists());
    assert_eq!(state(&ctx, "dev").await.unwrap(), VmState::Stopped);
}

#[tokio::test]
async fn test_dead_parent_fails_before_anything_starts() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = context(dir.path(), Arc::new(CopyDecompressor::default()));

    let mut parent = tokio::process::Command::new("true").spawn().unwrap();
    let parent_pid = parent.id().unwrap();
    parent.wait().await.unwrap();

    let result = start(&ctx, "dev", quick_options(parent_pid)).await;

    assert!(matches!(result, Err(StartError::ParentExited { .. })));
    assert!(!ctx.workspace().sock_dir().exists());
}

/// Answers every request on the forwarded guest API socket once gvproxy is up.
fn serve_guest_api(config: &MachineConfig) -> JoinHandle<()> {
    let transport = config.network.transport_socket.clone();
    let socket = config.forwarded_api_socket().unwrap().to_path_buf();
    tokio::spawn(async move {
        let policy = RetryPolicy::fixed(400, Duration::from_millis(25));
        wait_for_path(&transport, &policy, &CancellationToken::new())
            .await
            .unwrap();
        let listener = UnixListener::bind(&socket).unwrap();
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nOK")
                    .await;
            });
        }
    })
}

struct ReadyMachine {
    _dir: tempfile::TempDir,
    ctx: Context,
    config: MachineConfig,
    shell: Arc<RecordingShell>,
    hypervisor_pid_file: PathBuf,
    release: PathBuf,
    _guest_api: JoinHandle<()>,
}

/// A machine whose guest answers SSH and API checks, and whose hypervisor
/// exits with `code` once released.
async fn ready_machine(code: i32) -> ReadyMachine {
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let hypervisor_pid_file = dir.path().join("hypervisor.pid");
    let release = dir.path().join("release");
    write_script(&bin.join("gvproxy"), FAKE_GVPROXY);
    write_script(
        &bin.join("vfkit"),
        &releasable_hypervisor(&hypervisor_pid_file, &release, code),
    );

    let ctx = context(dir.path(), Arc::new(CopyDecompressor::default()));
    let image = write_image(dir.path(), "image.raw.zst", b"boot");
    let config = init(&ctx, init_options("dev", &image, "v1.0")).await.unwrap();

    let shell = Arc::new(RecordingShell::new(&config.network.transport_socket));
    let ctx = ctx.with_shell(shell.clone());
    let guest_api = serve_guest_api(&config);

    ReadyMachine {
        _dir: dir,
        ctx,
        config,
        shell,
        hypervisor_pid_file,
        release,
        _guest_api: guest_api,
    }
}

fn ready_options(parent_pid: Option<u32>) -> StartOptions {
    StartOptions {
        parent_pid,
        api_readiness: RetryPolicy::fixed(1000, Duration::from_millis(50)),
        ..quick_options(0)
    }
}

/// Poll the stored config until the running processes have been recorded.
async fn wait_until_running(ctx: &Context) -> MachineConfig {
    let store = ConfigStore::new(ctx.workspace().config_dir(Provider::Vfkit));
    for _ in 0..400 {
        let config = store.load("dev").await.unwrap();
        if config.processes.hypervisor_pid.is_some() {
            return config;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("machine never reported running");
}

async fn stored(ctx: &Context) -> MachineConfig {
    ConfigStore::new(ctx.workspace().config_dir(Provider::Vfkit))
        .load("dev")
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clean_hypervisor_exit_records_and_clears_state() {
    let machine = ready_machine(0).await;
    let rest_socket = machine.config.hypervisor.rest_socket.clone().unwrap();
    std::fs::write(&rest_socket, b"stale").unwrap();
    let before = Utc::now();

    let run = {
        let ctx = machine.ctx.clone();
        tokio::spawn(async move { start(&ctx, "dev", ready_options(None)).await })
    };

    let running = wait_until_running(&machine.ctx).await;
    let hypervisor_pid: u32 = std::fs::read_to_string(&machine.hypervisor_pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(running.processes.hypervisor_pid, Some(hypervisor_pid));
    let network_pid = running.processes.network_pid.unwrap();
    assert!(is_process_alive(network_pid));
    assert!(running.last_up.unwrap() >= before);
    assert!(!rest_socket.exists());
    assert!(machine.shell.calls().iter().any(|(line, _)| line == "true"));

    std::fs::write(&machine.release, b"").unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();

    assert!(result.is_ok(), "unexpected result: {result:?}");
    let after = stored(&machine.ctx).await;
    assert_eq!(after.processes, Processes::default());
    assert_eq!(after.last_up, running.last_up);
    assert!(!is_process_alive(network_pid));
    assert!(!machine.config.network.transport_socket.exists());
    assert!(!rest_socket.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_hypervisor_exit_is_reported() {
    let machine = ready_machine(3).await;

    let run = {
        let ctx = machine.ctx.clone();
        tokio::spawn(async move { start(&ctx, "dev", ready_options(None)).await })
    };
    wait_until_running(&machine.ctx).await;

    std::fs::write(&machine.release, b"").unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(StartError::HypervisorExited { exit }) => assert!(!exit.success()),
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(stored(&machine.ctx).await.processes, Processes::default());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disks_flush_before_network_files_go() {
    let machine = ready_machine(0).await;
    let mut parent = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
    let parent_pid = parent.id().unwrap();

    let run = {
        let ctx = machine.ctx.clone();
        tokio::spawn(async move { start(&ctx, "dev", ready_options(Some(parent_pid))).await })
    };
    let running = wait_until_running(&machine.ctx).await;

    parent.kill().await.unwrap();
    let result = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap();

    assert!(matches!(result, Err(StartError::ParentExited { .. })));
    let calls = machine.shell.calls();
    let (_, transport_present) = calls
        .iter()
        .find(|(line, _)| line.ends_with("sync"))
        .expect("guest disks were not flushed");
    assert!(*transport_present);
    assert!(!machine.config.network.transport_socket.exists());
    assert!(!is_process_alive(running.processes.hypervisor_pid.unwrap()));
}
