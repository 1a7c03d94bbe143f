use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::relay::EventSink;

use super::enrich::EventEnricher;
use super::event::{EventFilter, RawEvent, decode_line};
use super::line_parser::LineParser;
use super::{AtomicWatcherState, WatcherState};

/// Delay before the first restart attempt after an unplanned stop.
const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(5);
/// Ceiling for the exponential restart backoff.
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);
/// How long a planned stop waits for graceful exit before SIGKILL.
pub(crate) const STOP_GRACE: Duration = Duration::from_secs(5);
/// Pause between the stop and start halves of a restart.
const RESTART_PAUSE: Duration = Duration::from_millis(500);
/// Bound on draining leftover stdout from a dead subprocess. A grandchild
/// inheriting the pipe could otherwise hold the supervisor here forever.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);
/// Read size for the subprocess output pipes.
const READ_CHUNK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatcherCmd {
    Start,
    Stop,
    Restart,
}

/// Handle to the watcher actor.
///
/// All watcher state lives inside a single task; the handle only enqueues
/// commands and observes the state atomically, so a manual `stop()` can
/// never race an unplanned-exit restart.
#[derive(Clone)]
pub struct EventWatcher {
    cmd_tx: mpsc::Sender<WatcherCmd>,
    state: Arc<AtomicWatcherState>,
}

impl EventWatcher {
    pub fn spawn(
        command: Vec<String>,
        filter: EventFilter,
        enricher: EventEnricher,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let state = Arc::new(AtomicWatcherState::new(WatcherState::Stopped));

        let task = WatcherTask {
            command,
            cmd_rx,
            state: Arc::clone(&state),
            filter,
            relay: Arc::new(EventRelay { enricher, sink }),
            child: None,
            stdout: None,
            parser: LineParser::new(),
            read_buf: vec![0u8; READ_CHUNK_BYTES],
            retries: 0,
            restart_at: None,
        };
        tokio::spawn(task.run());

        Self { cmd_tx, state }
    }

    pub async fn start(&self) {
        let _ = self.cmd_tx.send(WatcherCmd::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(WatcherCmd::Stop).await;
    }

    pub async fn restart(&self) {
        let _ = self.cmd_tx.send(WatcherCmd::Restart).await;
    }

    /// Planned teardown at agent shutdown: stops the event source and waits
    /// for the supervisor to settle.
    pub async fn shutdown(&self) {
        self.stop().await;
        let deadline = Instant::now() + STOP_GRACE + Duration::from_secs(2);
        while self.state() != WatcherState::Stopped && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn state(&self) -> WatcherState {
        self.state.load(Ordering::SeqCst)
    }
}

/// Enriches and delivers one event per detached task. Failures are logged
/// and dropped; nothing propagates back into the line-processing loop.
struct EventRelay {
    enricher: EventEnricher,
    sink: Arc<dyn EventSink>,
}

impl EventRelay {
    fn dispatch(self: &Arc<Self>, event: RawEvent) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let action = event.action.clone();
            let id = event.actor.id.clone();
            let payload = relay.enricher.build_payload(event).await;
            if let Err(e) = relay.sink.send(&payload).await {
                log::warn!("Failed to relay {action} event for container {id}: {e}");
            }
        });
    }
}

struct WatcherTask {
    command: Vec<String>,
    cmd_rx: mpsc::Receiver<WatcherCmd>,
    state: Arc<AtomicWatcherState>,
    filter: EventFilter,
    relay: Arc<EventRelay>,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    parser: LineParser,
    read_buf: Vec<u8>,
    retries: u32,
    restart_at: Option<Instant>,
}

impl WatcherTask {
    async fn run(mut self) {
        loop {
            let restart_deadline = self.restart_at;
            tokio::select! {
                maybe_cmd = self.cmd_rx.recv() => {
                    match maybe_cmd {
                        Some(WatcherCmd::Start) => self.handle_start(),
                        Some(WatcherCmd::Stop) => self.handle_stop().await,
                        Some(WatcherCmd::Restart) => {
                            self.handle_stop().await;
                            tokio::time::sleep(RESTART_PAUSE).await;
                            self.handle_start();
                        }
                        None => {
                            // Every handle dropped; tear down and exit.
                            self.handle_stop().await;
                            break;
                        }
                    }
                }
                read = read_pipe(&mut self.stdout, &mut self.read_buf) => {
                    match read {
                        Ok(0) => {
                            // EOF; the wait branch observes the exit.
                            self.stdout = None;
                        }
                        Ok(n) => self.process_chunk(n),
                        Err(e) => {
                            log::warn!("Error reading event stream: {e}");
                            self.stdout = None;
                        }
                    }
                }
                status = wait_child(&mut self.child) => {
                    self.on_unplanned_exit(status).await;
                }
                _ = tokio::time::sleep_until(restart_deadline.unwrap_or_else(Instant::now)),
                    if restart_deadline.is_some() =>
                {
                    self.restart_at = None;
                    self.handle_start();
                }
            }
        }
    }

    fn handle_start(&mut self) {
        match self.state.load(Ordering::SeqCst) {
            WatcherState::Running | WatcherState::Starting => {
                log::debug!("Watcher already running, ignoring start");
                return;
            }
            WatcherState::Stopped | WatcherState::Stopping => {}
        }

        // A manual start supersedes any scheduled one.
        self.restart_at = None;
        self.set_state(WatcherState::Starting);

        let Some((program, args)) = self.command.split_first() else {
            log::error!("Event source command is empty, watcher cannot start");
            self.set_state(WatcherState::Stopped);
            return;
        };

        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(mut child) => {
                self.stdout = child.stdout.take();
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(log_stderr(stderr));
                }
                log::info!(
                    "Event source started (pid {})",
                    child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                );
                self.child = Some(child);
                self.retries = 0;
                self.set_state(WatcherState::Running);
            }
            Err(e) => {
                log::error!("Failed to spawn event source {:?}: {e}", self.command);
                self.set_state(WatcherState::Stopped);
                self.schedule_restart();
            }
        }
    }

    async fn handle_stop(&mut self) {
        match self.state.load(Ordering::SeqCst) {
            WatcherState::Stopped | WatcherState::Stopping => {
                // Nothing to terminate, but a restart scheduled by an
                // earlier unplanned exit must not fire after a stop.
                self.restart_at = None;
                log::debug!("Watcher already stopped, ignoring stop");
                return;
            }
            WatcherState::Running | WatcherState::Starting => {}
        }

        self.set_state(WatcherState::Stopping);
        self.restart_at = None;
        self.stdout = None;
        self.parser.clear();

        if let Some(mut child) = self.child.take() {
            graceful_stop(&mut child).await;
        }
        self.set_state(WatcherState::Stopped);
    }

    async fn on_unplanned_exit(&mut self, status: std::io::Result<std::process::ExitStatus>) {
        self.child = None;
        // The exit may be observed before the pipe is empty; drain what the
        // process managed to write so its last events are not lost.
        self.drain_stdout().await;
        self.parser.clear();
        match status {
            Ok(status) => log::warn!("Event source exited unexpectedly ({status})"),
            Err(e) => log::warn!("Lost track of the event source process: {e}"),
        }
        self.set_state(WatcherState::Stopped);
        self.schedule_restart();
    }

    async fn drain_stdout(&mut self) {
        let Some(mut out) = self.stdout.take() else {
            return;
        };
        loop {
            let read =
                tokio::time::timeout(DRAIN_TIMEOUT, read_into(&mut out, &mut self.read_buf)).await;
            match read {
                Ok(Ok(n)) if n > 0 => self.process_chunk(n),
                _ => break,
            }
        }
    }

    fn schedule_restart(&mut self) {
        let delay = restart_delay(self.retries);
        self.retries += 1;
        self.restart_at = Some(Instant::now() + delay);
        log::info!(
            "Restarting event source in {:?} (attempt {})",
            delay,
            self.retries
        );
    }

    fn process_chunk(&mut self, len: usize) {
        for line in self.parser.push(&self.read_buf[..len]) {
            let Some(event) = decode_line(&line) else {
                continue;
            };
            if !self.filter.forwards(&event) {
                log::debug!("Ignoring {} {} event", event.kind, event.action);
                continue;
            }
            self.relay.dispatch(event);
        }
    }

    fn set_state(&self, state: WatcherState) {
        log::info!("Watcher is now {}", state.as_ref());
        self.state.store(state, Ordering::SeqCst);
    }
}

fn restart_delay(retries: u32) -> Duration {
    INITIAL_RESTART_DELAY
        .saturating_mul(2u32.saturating_pow(retries))
        .min(MAX_RESTART_DELAY)
}

async fn read_pipe(stdout: &mut Option<ChildStdout>, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    match stdout {
        Some(out) => read_into(out, buf).await,
        None => std::future::pending().await,
    }
}

async fn read_into(out: &mut ChildStdout, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    out.read(buf.as_mut_slice()).await
}

async fn wait_child(child: &mut Option<Child>) -> std::io::Result<std::process::ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

/// SIGTERM, then SIGKILL if the process outlives the grace period.
async fn graceful_stop(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = nix::sys::signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            log::warn!("Failed to signal event source (pid {pid}): {e}");
        }
    }

    match tokio::time::timeout(STOP_GRACE, child.wait()).await {
        Ok(Ok(status)) => log::info!("Event source stopped ({status})"),
        Ok(Err(e)) => log::warn!("Failed to await event source exit: {e}"),
        Err(_) => {
            log::warn!(
                "Event source did not exit within {STOP_GRACE:?}, killing it"
            );
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill event source: {e}");
            }
        }
    }
}

/// The event source's stderr is logged, never parsed.
async fn log_stderr(mut stderr: ChildStderr) {
    let mut parser = LineParser::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in parser.push(&buf[..n]) {
                    log::info!("Event source stderr: {line}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::{OutboundEventPayload, RelayError};
    use crate::watcher::enrich::{ContainerInspector, ContainerMetadata, InspectError};
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct NullInspector;

    #[async_trait]
    impl ContainerInspector for NullInspector {
        async fn inspect(&self, _id: &str) -> Result<ContainerMetadata, InspectError> {
            Err(InspectError::NotFound)
        }
    }

    /// Forwards every delivered payload to a channel, optionally delaying
    /// specific container ids to expose delivery reordering.
    struct RecordingSink {
        tx: mpsc::UnboundedSender<OutboundEventPayload>,
        delays: HashMap<String, Duration>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn send(&self, payload: &OutboundEventPayload) -> Result<(), RelayError> {
            if let Some(delay) = self.delays.get(&payload.id) {
                tokio::time::sleep(*delay).await;
            }
            let _ = self.tx.send(payload.clone());
            Ok(())
        }
    }

    fn recording_watcher(
        command: Vec<String>,
        delays: HashMap<String, Duration>,
    ) -> (EventWatcher, mpsc::UnboundedReceiver<OutboundEventPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = EventWatcher::spawn(
            command,
            EventFilter::default(),
            EventEnricher::new(Arc::new(NullInspector)),
            Arc::new(RecordingSink { tx, delays }),
        );
        (watcher, rx)
    }

    fn sh(script: impl Into<String>) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.into()]
    }

    async fn wait_for_state(watcher: &EventWatcher, state: WatcherState, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while watcher.state() != state {
            assert!(
                Instant::now() < deadline,
                "Timed out waiting for state {} (currently {})",
                state.as_ref(),
                watcher.state().as_ref()
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    fn container_event_json(action: &str, id: &str) -> String {
        format!(
            r#"{{"Type":"container","Action":"{action}","Actor":{{"ID":"{id}","Attributes":{{"name":"web"}}}},"time":1736000000}}"#
        )
    }

    #[test]
    fn test_restart_delay_grows_exponentially_to_ceiling() {
        assert_eq!(restart_delay(0), Duration::from_secs(5));
        assert_eq!(restart_delay(1), Duration::from_secs(10));
        assert_eq!(restart_delay(2), Duration::from_secs(20));
        // After 3 consecutive unplanned exits the 4th schedule waits 40s.
        assert_eq!(restart_delay(3), Duration::from_secs(40));
        assert_eq!(restart_delay(4), Duration::from_secs(60));
        assert_eq!(restart_delay(30), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_events_flow_from_subprocess_to_sink() {
        let script = format!(
            "printf '%s\\n' '{}' 'garbage-line' '{}' '{}'; exec sleep 30",
            container_event_json("start", "aaa"),
            container_event_json("stop", "bbb"),
            container_event_json("die", "ccc"),
        );
        let (watcher, mut rx) = recording_watcher(sh(script), HashMap::new());
        watcher.start().await;

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for first event")
            .expect("Sink channel closed");
        assert_eq!(first.event, "start");
        assert_eq!(first.id, "aaa");

        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for second event")
            .expect("Sink channel closed");
        // The garbage line and the suppressed stop never reach the sink.
        assert_eq!(second.event, "die");
        assert_eq!(second.id, "ccc");

        watcher.shutdown().await;
        assert_eq!(watcher.state(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_delivery_order_is_not_line_order() {
        let script = format!(
            "printf '%s\\n' '{}' '{}'; exec sleep 30",
            container_event_json("start", "slow"),
            container_event_json("die", "fast"),
        );
        let delays = HashMap::from([("slow".to_string(), Duration::from_millis(500))]);
        let (watcher, mut rx) = recording_watcher(sh(script), delays);
        watcher.start().await;

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out")
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out")
            .unwrap();

        // Lines were emitted slow-then-fast; deliveries arrive fast-then-slow.
        assert_eq!(first.id, "fast");
        assert_eq!(second.id, "slow");

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_unplanned_exit_restarts_with_backoff() {
        // The subprocess emits one event and exits; the supervisor restarts
        // it after the initial 5s backoff and the event arrives again.
        let script = format!("printf '%s\\n' '{}'", container_event_json("die", "rrr"));
        let (watcher, mut rx) = recording_watcher(sh(script), HashMap::new());
        watcher.start().await;

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("Timed out waiting for first delivery")
            .unwrap();
        assert_eq!(first.id, "rrr");

        let second = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("Timed out waiting for post-restart delivery")
            .unwrap();
        assert_eq!(second.id, "rrr");

        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_then_start_leaves_one_subprocess() {
        let pid_file = std::env::temp_dir().join(format!(
            "stevedore-supervisor-test-{}.pid",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&pid_file);
        let script = format!("echo $$ > {}; exec sleep 30", pid_file.display());

        let (watcher, _rx) = recording_watcher(sh(script), HashMap::new());
        watcher.start().await;
        wait_for_state(&watcher, WatcherState::Running, Duration::from_secs(5)).await;

        let first_pid = read_pid(&pid_file).await;

        // Queue the stop and the start back to back; the actor serializes
        // them, so the old process is fully reaped before the new spawn.
        watcher.stop().await;
        watcher.start().await;
        wait_for_state(&watcher, WatcherState::Running, Duration::from_secs(10)).await;

        let second_pid = wait_for_new_pid(&pid_file, first_pid).await;
        assert_ne!(first_pid, second_pid);
        assert!(
            nix::sys::signal::kill(Pid::from_raw(first_pid), None).is_err(),
            "Old subprocess should be gone"
        );

        watcher.shutdown().await;
        let _ = std::fs::remove_file(&pid_file);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill_after_grace() {
        // The subprocess ignores SIGTERM; stop must escalate to SIGKILL
        // after the grace period.
        let script = "trap '' TERM; while :; do sleep 1; done";
        let (watcher, _rx) = recording_watcher(sh(script), HashMap::new());
        watcher.start().await;
        wait_for_state(&watcher, WatcherState::Running, Duration::from_secs(5)).await;
        // Give the shell a moment to install the trap.
        tokio::time::sleep(Duration::from_millis(500)).await;

        let stopping_since = Instant::now();
        watcher.stop().await;
        wait_for_state(&watcher, WatcherState::Stopped, STOP_GRACE + Duration::from_secs(3)).await;

        assert!(
            stopping_since.elapsed() >= STOP_GRACE,
            "Stop finished before the grace period elapsed"
        );
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let (watcher, _rx) = recording_watcher(sh("exec sleep 30"), HashMap::new());
        watcher.start().await;
        wait_for_state(&watcher, WatcherState::Running, Duration::from_secs(5)).await;
        watcher.start().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(watcher.state(), WatcherState::Running);
        watcher.shutdown().await;
    }

    async fn read_pid(path: &std::path::Path) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Ok(content) = std::fs::read_to_string(path) {
                if let Ok(pid) = content.trim().parse() {
                    return pid;
                }
            }
            assert!(Instant::now() < deadline, "Timed out waiting for pid file");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_for_new_pid(path: &std::path::Path, old_pid: i32) -> i32 {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let pid = read_pid(path).await;
            if pid != old_pid {
                return pid;
            }
            assert!(Instant::now() < deadline, "Timed out waiting for new pid");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}
