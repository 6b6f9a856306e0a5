use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use nix::pty::PtyMaster;
use nix::sys::signal::kill;
use tether_cgroup::{ActiveCgroup, CgroupBackend};
use tether_core::*;
use tether_namespace::*;
use tether_network::InterfaceOps;

/// Runs a shell script that first waits for the supervisor to release it
struct ScriptBuilder(&'static str);

impl CommandBuilder for ScriptBuilder {
    fn build(&self, params: &CommandParams<'_>) -> Result<ContainerCommand> {
        Ok(ContainerCommand::new("/bin/sh")
            .args(["-c", self.0])
            .current_dir(params.rootfs)
            .clone_flags(get_namespace_flags(&params.container.namespaces))
            .sync_pipe(params.pipe))
    }
}

const WAIT_FOR_RELEASE: &str = "cat <&3 >/dev/null";

/// Counts applies and cleanups instead of touching cgroupfs
#[derive(Clone, Default)]
struct RecordingBackend {
    applied: Arc<Mutex<Vec<ProcessId>>>,
    cleanups: Arc<AtomicUsize>,
    fail: bool,
}

#[derive(Debug)]
struct RecordedCgroup(Arc<AtomicUsize>);

impl ActiveCgroup for RecordedCgroup {
    fn cleanup(&mut self) -> Result<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl CgroupBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn apply(&self, _spec: &CgroupSpec, pid: ProcessId) -> Result<Box<dyn ActiveCgroup>> {
        self.applied.lock().unwrap().push(pid);
        if self.fail {
            return Err(Error::CGroup {
                message: "memory.max: permission denied".to_string(),
            });
        }
        Ok(Box::new(RecordedCgroup(Arc::clone(&self.cleanups))))
    }
}

/// Pid store that remembers what it was asked to record
#[derive(Clone, Default)]
struct RecordingStore {
    written: Arc<Mutex<Vec<ProcessId>>>,
    deletes: Arc<AtomicUsize>,
    fail: bool,
}

impl PidStore for RecordingStore {
    fn write_pid(&self, _data_path: &Path, pid: ProcessId, _started: &str) -> Result<()> {
        self.written.lock().unwrap().push(pid);
        if self.fail {
            return Err(Error::PidRecord {
                message: "read-only file system".to_string(),
            });
        }
        Ok(())
    }

    fn delete_pid(&self, _data_path: &Path) -> Result<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records interface operations; `fail_on` names one that always fails
#[derive(Clone, Default)]
struct RecordingOps {
    calls: Arc<Mutex<Vec<String>>>,
    fail_on: Option<&'static str>,
}

impl RecordingOps {
    fn record(&self, op: &str, args: &[&str]) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{op}({})", args.join(",")));

        if self.fail_on == Some(op) {
            return Err(Error::Netlink {
                message: format!("{op} rejected"),
            });
        }
        Ok(())
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl InterfaceOps for RecordingOps {
    fn interface_up(&self, name: &str) -> Result<()> {
        self.record("up", &[name])
    }

    fn interface_down(&self, name: &str) -> Result<()> {
        self.record("down", &[name])
    }

    fn change_interface_name(&self, old: &str, new: &str) -> Result<()> {
        self.record("rename", &[old, new])
    }

    fn create_veth_pair(&self, name: &str, peer: &str) -> Result<()> {
        self.record("veth", &[name, peer])
    }

    fn set_interface_in_namespace_pid(&self, name: &str, pid: ProcessId) -> Result<()> {
        self.record("netns", &[name, &pid.to_string()])
    }

    fn set_interface_master(&self, name: &str, master: &str) -> Result<()> {
        self.record("master", &[name, master])
    }

    fn set_default_gateway(&self, gateway: &str, name: &str) -> Result<()> {
        self.record("gateway", &[gateway, name])
    }

    fn set_interface_ip(&self, name: &str, cidr: &str) -> Result<()> {
        self.record("ip", &[name, cidr])
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.record("mtu", &[name, &mtu.to_string()])
    }
}

#[derive(Default)]
struct CountingTerminal {
    attaches: usize,
    starts: usize,
    closes: usize,
}

impl Terminal for CountingTerminal {
    fn set_master(&mut self, _master: PtyMaster) {}

    fn attach(&mut self, _command: &mut ContainerCommand) -> Result<()> {
        self.attaches += 1;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.starts += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closes += 1;
        Ok(())
    }
}

fn launcher() -> Launcher {
    Launcher::new()
        .with_cgroup_backend(RecordingBackend::default())
        .with_interface_ops(RecordingOps::default())
}

fn assert_reaped(pid: ProcessId) {
    assert_eq!(kill(pid.as_nix_pid(), None), Err(Errno::ESRCH));
}

fn with_interfaces(names: &[&str]) -> Container {
    Container {
        network_interfaces: names
            .iter()
            .map(|name| NetworkInterface {
                host_iface_name: (*name).to_string(),
            })
            .collect(),
        ..Container::default()
    }
}

#[test]
fn test_exec_returns_exit_code() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut terminal = StdTerminal::new();
    let mut released = None;
    let mut on_released = |pid: ProcessId| {
        let record = PidRecord::read(data.path()).unwrap();
        assert_eq!(record.pid, pid);
        assert!(record.is_running());
        released = Some(pid);
    };

    let code = launcher()
        .exec(
            &Container::default(),
            &mut terminal,
            rootfs.path(),
            data.path(),
            &[],
            &ScriptBuilder("cat <&3 >/dev/null; exit 17"),
            Some(&mut on_released),
        )
        .unwrap();

    assert_eq!(code, 17);
    let pid = released.unwrap();
    assert_reaped(pid);
    assert!(!data.path().join(PID_FILE).exists());
}

#[test]
fn test_child_receives_context() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let container = Container {
        networks: vec![Network::new("loopback"), Network::new("none")],
        ..Container::default()
    };

    let code = launcher()
        .exec(
            &container,
            &mut StdTerminal::new(),
            rootfs.path(),
            data.path(),
            &[],
            &ScriptBuilder(r#"[ "$(cat <&3)" = '{}' ]"#),
            None,
        )
        .unwrap();

    assert_eq!(code, 0);
}

#[test]
fn test_child_runs_in_rootfs() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    std::fs::write(rootfs.path().join("marker"), "").unwrap();

    let code = launcher()
        .exec(
            &Container::default(),
            &mut StdTerminal::new(),
            rootfs.path(),
            data.path(),
            &[],
            &ScriptBuilder("cat <&3 >/dev/null; [ -f marker ]"),
            None,
        )
        .unwrap();

    assert_eq!(code, 0);
}

#[test]
fn test_spawn_failure_releases_terminal() {
    struct MissingProgram;

    impl CommandBuilder for MissingProgram {
        fn build(&self, params: &CommandParams<'_>) -> Result<ContainerCommand> {
            Ok(ContainerCommand::new("/nonexistent/init").sync_pipe(params.pipe))
        }
    }

    let data = tempfile::tempdir().unwrap();
    let store = RecordingStore::default();
    let mut terminal = CountingTerminal::default();

    let err = launcher()
        .with_pid_store(store.clone())
        .exec(
            &Container::default(),
            &mut terminal,
            Path::new("/"),
            data.path(),
            &[],
            &MissingProgram,
            None,
        )
        .unwrap_err();

    assert!(matches!(err, Error::Spawn { .. }));
    assert_eq!(terminal.attaches, 1);
    assert_eq!(terminal.starts, 0);
    assert_eq!(terminal.closes, 1);
    assert!(store.written.lock().unwrap().is_empty());
}

#[test]
fn test_tty_spawn_failure_returns() {
    struct NulArgument;

    impl CommandBuilder for NulArgument {
        fn build(&self, params: &CommandParams<'_>) -> Result<ContainerCommand> {
            Ok(ContainerCommand::new("/bin/true")
                .arg("a\0b")
                .sync_pipe(params.pipe))
        }
    }

    let data = tempfile::tempdir().unwrap();
    let mut terminal = TtyTerminal::new();

    let err = launcher()
        .exec(
            &Container {
                tty: true,
                ..Container::default()
            },
            &mut terminal,
            Path::new("/"),
            data.path(),
            &[],
            &NulArgument,
            None,
        )
        .unwrap_err();

    assert!(matches!(err, Error::Spawn { .. }));
}

#[test]
fn test_terminal_started_after_spawn() {
    let data = tempfile::tempdir().unwrap();
    let mut terminal = CountingTerminal::default();

    let code = launcher()
        .exec(
            &Container::default(),
            &mut terminal,
            Path::new("/"),
            data.path(),
            &[],
            &ScriptBuilder(WAIT_FOR_RELEASE),
            None,
        )
        .unwrap();

    assert_eq!(code, 0);
    assert_eq!((terminal.attaches, terminal.starts, terminal.closes), (1, 1, 1));
}

#[test]
fn test_record_failure_kills_child() {
    let data = tempfile::tempdir().unwrap();
    let store = RecordingStore {
        fail: true,
        ..RecordingStore::default()
    };
    let backend = RecordingBackend::default();
    let mut called = false;
    let mut on_released = |_: ProcessId| called = true;

    let err = launcher()
        .with_pid_store(store.clone())
        .with_cgroup_backend(backend.clone())
        .exec(
            &Container {
                cgroups: Some(CgroupSpec::new("c1")),
                ..Container::default()
            },
            &mut StdTerminal::new(),
            Path::new("/"),
            data.path(),
            &[],
            &ScriptBuilder(WAIT_FOR_RELEASE),
            Some(&mut on_released),
        )
        .unwrap_err();

    assert!(matches!(err, Error::PidRecord { .. }));
    assert!(!called);
    assert!(backend.applied.lock().unwrap().is_empty());

    let pid = store.written.lock().unwrap()[0];
    assert_reaped(pid);
    assert_eq!(store.deletes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cgroup_failure_kills_child() {
    let data = tempfile::tempdir().unwrap();
    let backend = RecordingBackend {
        fail: true,
        ..RecordingBackend::default()
    };
    let ops = RecordingOps::default();
    let container = Container {
        cgroups: Some(CgroupSpec::new("c2")),
        network_interfaces: vec![NetworkInterface {
            host_iface_name: "eth1".to_string(),
        }],
        ..Container::default()
    };

    let err = launcher()
        .with_cgroup_backend(backend.clone())
        .with_interface_ops(ops.clone())
        .exec(
            &container,
            &mut StdTerminal::new(),
            Path::new("/"),
            data.path(),
            &[],
            &ScriptBuilder(WAIT_FOR_RELEASE),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, Error::CGroup { .. }));
    assert_reaped(backend.applied.lock().unwrap()[0]);
    assert!(ops.calls().is_empty());
    assert!(!data.path().join(PID_FILE).exists());
}

#[test]
fn test_network_failure_cleans_cgroup() {
    let data = tempfile::tempdir().unwrap();
    let backend = RecordingBackend::default();
    let mut terminal = CountingTerminal::default();
    let container = Container {
        cgroups: Some(CgroupSpec::new("c3")),
        networks: vec![Network::new("loopback"), Network::new("macvlan")],
        ..Container::default()
    };

    let err = launcher()
        .with_cgroup_backend(backend.clone())
        .exec(
            &container,
            &mut terminal,
            Path::new("/"),
            data.path(),
            &[],
            &ScriptBuilder(WAIT_FOR_RELEASE),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, Error::UnknownStrategy { kind } if kind == "macvlan"));
    assert_reaped(backend.applied.lock().unwrap()[0]);
    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(terminal.closes, 1);
    assert!(!data.path().join(PID_FILE).exists());
}

#[test]
fn test_veth_without_bridge_fails_launch() {
    let data = tempfile::tempdir().unwrap();
    let ops = RecordingOps::default();

    let err = launcher()
        .with_interface_ops(ops.clone())
        .exec(
            &Container {
                networks: vec![Network::new("veth")],
                ..Container::default()
            },
            &mut StdTerminal::new(),
            Path::new("/"),
            data.path(),
            &[],
            &ScriptBuilder(WAIT_FOR_RELEASE),
            None,
        )
        .unwrap_err();

    assert!(matches!(err, Error::Network { .. }));
    assert!(ops.calls().is_empty());
}

#[test]
fn test_interface_relocation_is_best_effort() {
    let data = tempfile::tempdir().unwrap();
    let ops = RecordingOps {
        fail_on: Some("down"),
        ..RecordingOps::default()
    };
    let backend = RecordingBackend::default();

    let code = launcher()
        .with_interface_ops(ops.clone())
        .with_cgroup_backend(backend.clone())
        .exec(
            &Container {
                cgroups: Some(CgroupSpec::new("c4")),
                ..with_interfaces(&["eth1", "eth2"])
            },
            &mut StdTerminal::new(),
            Path::new("/"),
            data.path(),
            &[],
            &ScriptBuilder(WAIT_FOR_RELEASE),
            None,
        )
        .unwrap();

    assert_eq!(code, 0);
    let pid = backend.applied.lock().unwrap()[0];
    assert_eq!(
        ops.calls(),
        vec![
            "down(eth1)".to_string(),
            format!("netns(eth1,{pid})"),
            "up(eth1)".to_string(),
            "down(eth2)".to_string(),
            format!("netns(eth2,{pid})"),
            "up(eth2)".to_string(),
            "down(eth1)".to_string(),
            "netns(eth1,1)".to_string(),
            "up(eth1)".to_string(),
            "down(eth2)".to_string(),
            "netns(eth2,1)".to_string(),
            "up(eth2)".to_string(),
        ]
    );
    assert_eq!(backend.cleanups.load(Ordering::SeqCst), 1);
}

#[test]
fn test_teardown_continues_after_failures() {
    let ops = RecordingOps {
        fail_on: Some("netns"),
        ..RecordingOps::default()
    };

    launcher()
        .with_interface_ops(ops.clone())
        .teardown_networking(&with_interfaces(&["eth1", "eth2"]), ProcessId::from_raw(i32::MAX), None);

    assert_eq!(
        ops.calls(),
        [
            "down(eth1)",
            "netns(eth1,1)",
            "up(eth1)",
            "down(eth2)",
            "netns(eth2,1)",
            "up(eth2)",
        ]
    );
}

#[test]
fn test_initialize_networking_sends_context() {
    let ops = RecordingOps::default();
    let mut network = Network::new("veth");
    network
        .context
        .insert("bridge".to_string(), "br0".to_string());
    let container = Container {
        networks: vec![network],
        ..Container::default()
    };
    let mut pipe = SyncPipe::new().unwrap();

    launcher()
        .with_interface_ops(ops.clone())
        .initialize_networking(&container, ProcessId::from_raw(77), &mut pipe)
        .unwrap();
    pipe.close();

    let context = pipe.read_from_parent().unwrap().unwrap();
    let child = context.get("veth-child").unwrap();
    assert!(ops.calls().contains(&format!("netns({child},77)")));
    assert!(context.get("veth-host").is_some());
}

#[test]
#[ignore] // Requires root
fn test_exec_in_new_namespaces() {
    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let container = Container {
        namespaces: ["NEWPID", "NEWUTS", "NEWIPC"]
            .into_iter()
            .map(|key| (key.to_string(), true))
            .collect(),
        ..Container::default()
    };

    let code = launcher()
        .exec(
            &container,
            &mut StdTerminal::new(),
            rootfs.path(),
            data.path(),
            &[],
            &ScriptBuilder("cat <&3 >/dev/null; [ $$ -eq 1 ]"),
            None,
        )
        .unwrap();

    assert_eq!(code, 0);
}

fn ip_link(args: &[&str]) {
    let status = std::process::Command::new("ip")
        .arg("link")
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "ip link {args:?} failed");
}

#[test]
#[ignore] // Requires root
fn test_exec_returns_bound_interface_to_host() {
    ip_link(&["add", "tthdummy0", "type", "dummy"]);
    ip_link(&["add", "tthbr0", "type", "bridge"]);

    let rootfs = tempfile::tempdir().unwrap();
    let data = tempfile::tempdir().unwrap();
    let mut veth = Network::new("veth");
    veth.context
        .insert("bridge".to_string(), "tthbr0".to_string());
    let container = Container {
        namespaces: [("NEWNET".to_string(), true)].into_iter().collect(),
        networks: vec![veth],
        ..with_interfaces(&["tthdummy0"])
    };

    let result = Launcher::new()
        .with_cgroup_backend(RecordingBackend::default())
        .exec(
            &container,
            &mut StdTerminal::new(),
            rootfs.path(),
            data.path(),
            &[],
            &ScriptBuilder("cat <&3 >/dev/null; exit 17"),
            None,
        );

    // SAFETY: NUL-terminated literal
    let index = unsafe { libc::if_nametoindex(c"tthdummy0".as_ptr()) };
    ip_link(&["del", "tthdummy0"]);
    ip_link(&["del", "tthbr0"]);

    assert_eq!(result.unwrap(), 17);
    assert_ne!(index, 0);
}
