//! End-to-end scenarios driving the wrapper, engine, scheduler, activator
//! and reconciler together against the in-memory runtime. Everything here
//! runs unprivileged: listeners live in the current netns and redirects are
//! recorded, not installed.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use oci_spec::runtime::SpecBuilder;

use libzeropod::config;
use libzeropod::container::{ManagedContainer, ScaleState};
use libzeropod::events::{EventForwarder, TaskEvent, VecPublisher};
use libzeropod::reconciler::{ExitEvent, ExitReconciler};
use libzeropod::runtime::test::TestRuntime;
use libzeropod::runtime::{container_dir, work_dir};
use libzeropod::task::api::{
    CreateRequest, DeleteRequest, ExecRequest, KillRequest, StartRequest,
};
use libzeropod::task::{LocalTask, TaskDelegate, TaskService, ZeropodTask};

const CONTAINER_NAME: &str = "web";

struct Harness {
    runtime: TestRuntime,
    task: ZeropodTask<LocalTask>,
    publisher: VecPublisher,
    fatals: Arc<AtomicUsize>,
    _forwarder: EventForwarder,
    dir: tempfile::TempDir,
}

fn harness() -> Result<Harness> {
    let runtime = TestRuntime::new();
    let publisher = VecPublisher::default();
    let forwarder = EventForwarder::spawn(Arc::new(publisher.clone()))?;

    let (exit_tx, exit_rx) = channel();
    runtime.set_exit_sender(exit_tx);

    let delegate = Arc::new(LocalTask::new(
        Arc::new(runtime.clone()),
        forwarder.sender(),
    ));
    let delegate_exit = {
        let delegate = delegate.clone();
        Box::new(move |event: &ExitEvent| delegate.handle_process_exit(event))
    };
    let reconciler = ExitReconciler::new(forwarder.sender(), delegate_exit);
    let _reconciler_thread = reconciler.run(exit_rx)?;

    let fatals = Arc::new(AtomicUsize::new(0));
    let fatals_clone = fatals.clone();
    let task = ZeropodTask::new(
        delegate,
        Arc::new(runtime.clone()),
        reconciler,
        forwarder.sender(),
    )
    .with_fatal_handler(Arc::new(move |message| {
        eprintln!("fatal: {message}");
        fatals_clone.fetch_add(1, Ordering::SeqCst);
    }));

    Ok(Harness {
        runtime,
        task,
        publisher,
        fatals,
        _forwarder: forwarder,
        dir: tempfile::tempdir()?,
    })
}

impl Harness {
    /// Writes a bundle with the scale-down annotations and starts the
    /// container through the wrapper.
    fn start_container(
        &self,
        id: &str,
        ports: &[u16],
        scaledown: &str,
        extra: &[(&str, &str)],
    ) -> Result<Arc<ManagedContainer>> {
        self.runtime.serve(id, ports, "ok");

        let bundle = self.dir.path().join(id);
        std::fs::create_dir_all(&bundle)?;
        let port_list = ports
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut annotations: HashMap<String, String> = HashMap::from([
            (
                config::CRI_CONTAINER_NAME_ANNOTATION.to_string(),
                CONTAINER_NAME.to_string(),
            ),
            (
                config::PORTS_ANNOTATION.to_string(),
                format!("{CONTAINER_NAME}={port_list}"),
            ),
            (
                config::SCALEDOWN_DURATION_ANNOTATION.to_string(),
                scaledown.to_string(),
            ),
        ]);
        for (key, value) in extra {
            annotations.insert(key.to_string(), value.to_string());
        }
        SpecBuilder::default()
            .annotations(annotations)
            .build()?
            .save(bundle.join("config.json"))?;

        self.task.create(CreateRequest {
            id: id.to_string(),
            bundle,
            stdio: Default::default(),
        })?;
        self.task.start(StartRequest {
            id: id.to_string(),
            exec_id: String::new(),
        })?;
        self.task
            .managed(id)
            .context("container was not elected for management")
    }

    fn bundle(&self, id: &str) -> PathBuf {
        self.dir.path().join(id)
    }
}

fn wait_for<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

fn wait_for_state(container: &Arc<ManagedContainer>, state: ScaleState) {
    wait_for(&format!("state {state}"), Duration::from_secs(10), || {
        container.status() == state
    });
}

fn activator_addr(container: &Arc<ManagedContainer>, port: u16) -> SocketAddr {
    container
        .activator()
        .and_then(|activator| activator.bound_addr(port))
        .expect("activator has no bound address")
}

fn http_get(addr: SocketAddr) -> Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")?;
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    Ok(response
        .split("\r\n\r\n")
        .nth(1)
        .unwrap_or_default()
        .to_string())
}

fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|listener| listener.local_addr().unwrap().port())
        .collect()
}

fn checkpoint_marker(bundle: &Path) -> PathBuf {
    container_dir(bundle).join("inventory.img")
}

#[test]
fn test_idle_scale_down_and_wake() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container("wake", &ports, "150ms", &[])?;
    let initial_pid = container.current_process().pid();

    wait_for_state(&container, ScaleState::ScaledDown);
    assert!(checkpoint_marker(&harness.bundle("wake")).exists());
    // the service port still accepts through the activator
    let addr = activator_addr(&container, ports[0]);

    assert_eq!(http_get(addr)?, "ok");

    wait_for_state(&container, ScaleState::Running);
    // the activator is bound only while scaled down or restoring
    assert!(container.activator().is_none());
    assert_eq!(harness.runtime.restores(), 1);
    assert_ne!(container.current_process().pid(), initial_pid);

    wait_for("checkpointed and resumed events", Duration::from_secs(5), || {
        let events = harness.publisher.events();
        events
            .iter()
            .any(|event| matches!(event, TaskEvent::Checkpointed { .. }))
            && events
                .iter()
                .any(|event| matches!(event, TaskEvent::Resumed { .. }))
    });
    Ok(())
}

#[test]
fn test_parallel_wake_on_two_ports() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(2);
    let container = harness.start_container("parallel", &ports, "150ms", &[])?;

    wait_for_state(&container, ScaleState::ScaledDown);

    // resolve the listener addresses up front: the first served request
    // unbinds the activator
    let addrs: Vec<SocketAddr> = ports
        .iter()
        .map(|port| activator_addr(&container, *port))
        .collect();
    let mut clients = Vec::new();
    for _ in 0..6 {
        for addr in &addrs {
            let addr = *addr;
            clients.push(thread::spawn(move || http_get(addr).unwrap()));
        }
    }
    for client in clients {
        assert_eq!(client.join().unwrap(), "ok");
    }
    assert_eq!(harness.runtime.restores(), 1);
    Ok(())
}

#[test]
fn test_exec_cancels_scale_down() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container("exec", &ports, "150ms", &[])?;

    harness.task.exec(ExecRequest {
        id: "exec".to_string(),
        exec_id: "e1".to_string(),
        stdio: Default::default(),
    })?;
    harness.task.start(StartRequest {
        id: "exec".to_string(),
        exec_id: "e1".to_string(),
    })?;

    // well past the countdown: the pending exec must hold the container up
    thread::sleep(Duration::from_millis(400));
    assert_eq!(container.status(), ScaleState::Running);
    assert_eq!(harness.runtime.checkpoints(), 0);

    // reaping the exec re-arms the countdown
    harness.task.delete(DeleteRequest {
        id: "exec".to_string(),
        exec_id: "e1".to_string(),
    })?;
    wait_for_state(&container, ScaleState::ScaledDown);
    assert_eq!(harness.runtime.checkpoints(), 1);
    Ok(())
}

#[test]
fn test_exec_restores_scaled_down_container() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container("exec-restore", &ports, "100ms", &[])?;

    wait_for_state(&container, ScaleState::ScaledDown);

    harness.task.exec(ExecRequest {
        id: "exec-restore".to_string(),
        exec_id: "e1".to_string(),
        stdio: Default::default(),
    })?;
    assert_eq!(container.status(), ScaleState::Running);
    assert!(container.activator().is_none());
    assert_eq!(harness.runtime.restores(), 1);
    assert_eq!(harness.fatals.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn test_kill_while_scaled_down() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container("kill", &ports, "100ms", &[])?;

    wait_for_state(&container, ScaleState::ScaledDown);
    let addr = activator_addr(&container, ports[0]);

    harness.task.kill(KillRequest {
        id: "kill".to_string(),
        exec_id: String::new(),
        signal: 15,
        all: false,
    })?;

    assert_eq!(container.status(), ScaleState::Terminating);
    // a synthesized exit(0) is published
    wait_for("synthesized exit event", Duration::from_secs(5), || {
        harness.publisher.events().iter().any(|event| {
            matches!(
                event,
                TaskEvent::Exit {
                    container_id,
                    exit_status: 0,
                    ..
                } if container_id == "kill"
            )
        })
    });
    // the activator is gone, connections are refused and nothing restores
    assert!(TcpStream::connect(addr).is_err());
    assert_eq!(harness.runtime.restores(), 0);
    Ok(())
}

#[test]
fn test_checkpoint_failure_is_recoverable() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    harness.runtime.fail_next_checkpoint(true);
    let container = harness.start_container("dumpfail", &ports, "300ms", &[])?;

    // first attempt fails and recovers to Running, the workload keeps
    // serving on its own port the whole time
    wait_for("failed dump log", Duration::from_secs(10), || {
        work_dir(&harness.bundle("dumpfail")).join("dump.log").exists()
    });
    assert_eq!(
        http_get(SocketAddr::from(([127, 0, 0, 1], ports[0])))?,
        "ok"
    );

    // the countdown was re-armed, the next attempt goes through
    wait_for_state(&container, ScaleState::ScaledDown);
    assert_eq!(harness.runtime.checkpoints(), 1);
    Ok(())
}

#[test]
fn test_restore_failure_is_fatal() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container("corrupt", &ports, "100ms", &[])?;

    wait_for_state(&container, ScaleState::ScaledDown);
    // corrupt the checkpoint between dump and first connection
    std::fs::remove_file(checkpoint_marker(&harness.bundle("corrupt")))?;

    let addr = activator_addr(&container, ports[0]);
    let mut stream = TcpStream::connect(addr)?;
    stream.write_all(b"GET / HTTP/1.1\r\n\r\n")?;
    let mut buf = Vec::new();
    // the connection is dropped without a response
    stream.read_to_end(&mut buf)?;
    assert!(buf.is_empty());

    wait_for("fatal handler", Duration::from_secs(5), || {
        harness.fatals.load(Ordering::SeqCst) > 0
    });
    assert_eq!(container.status(), ScaleState::Terminating);
    Ok(())
}

#[test]
fn test_disabled_checkpointing_recreates_fresh() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container(
        "nocheckpoint",
        &ports,
        "100ms",
        &[(config::DISABLE_CHECKPOINTING_ANNOTATION, "true")],
    )?;

    wait_for_state(&container, ScaleState::ScaledDown);
    // no images were written
    assert!(!checkpoint_marker(&harness.bundle("nocheckpoint")).exists());

    let addr = activator_addr(&container, ports[0]);
    assert_eq!(http_get(addr)?, "ok");
    wait_for_state(&container, ScaleState::Running);
    // fresh create, not a restore from images
    assert_eq!(harness.runtime.restores(), 0);
    Ok(())
}

#[test]
fn test_sandbox_and_unselected_containers_are_not_managed() -> Result<()> {
    let harness = harness()?;

    let bundle = harness.dir.path().join("sandbox");
    std::fs::create_dir_all(&bundle)?;
    SpecBuilder::default()
        .annotations(HashMap::from([(
            config::CRI_CONTAINER_TYPE_ANNOTATION.to_string(),
            "sandbox".to_string(),
        )]))
        .build()?
        .save(bundle.join("config.json"))?;
    harness.task.create(CreateRequest {
        id: "sandbox".to_string(),
        bundle,
        stdio: Default::default(),
    })?;
    harness.task.start(StartRequest {
        id: "sandbox".to_string(),
        exec_id: String::new(),
    })?;
    assert!(harness.task.managed("sandbox").is_none());

    let bundle = harness.dir.path().join("other");
    std::fs::create_dir_all(&bundle)?;
    SpecBuilder::default()
        .annotations(HashMap::from([
            (
                config::CRI_CONTAINER_NAME_ANNOTATION.to_string(),
                "sidecar".to_string(),
            ),
            (
                config::CONTAINER_NAMES_ANNOTATION.to_string(),
                CONTAINER_NAME.to_string(),
            ),
        ]))
        .build()?
        .save(bundle.join("config.json"))?;
    harness.task.create(CreateRequest {
        id: "other".to_string(),
        bundle,
        stdio: Default::default(),
    })?;
    harness.task.start(StartRequest {
        id: "other".to_string(),
        exec_id: String::new(),
    })?;
    assert!(harness.task.managed("other").is_none());
    Ok(())
}

#[test]
fn test_delete_tears_down_managed_container() -> Result<()> {
    let harness = harness()?;
    let ports = free_ports(1);
    let container = harness.start_container("teardown", &ports, "100ms", &[])?;

    wait_for_state(&container, ScaleState::ScaledDown);
    let addr = activator_addr(&container, ports[0]);

    harness.task.delete(DeleteRequest {
        id: "teardown".to_string(),
        exec_id: String::new(),
    })?;

    assert!(harness.task.managed("teardown").is_none());
    assert_eq!(container.status(), ScaleState::Terminated);
    assert!(TcpStream::connect(addr).is_err());
    Ok(())
}
