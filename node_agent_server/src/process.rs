//! Supervision of one launched OS process.
//!
//! Each process gets a pump thread per output channel, an exit-wait thread
//! that owns the `Popen`, and heartbeat, idle and flush threads. The
//! lifecycle only moves forward: alive, destroying, destroyed. The exit code
//! is fixed by whichever of destroy or natural exit gets there first.

use std::ffi::OsString;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};
use tracing::{debug, error, info, warn};

use node_agent_common::{
    now_millis, Channel, NodeError, OutputListener, ProcessDescription, ProcessStatus,
    RemoteListenableConfig, EXIT_KILLED, EXIT_UNAVAILABLE,
};

use crate::config::SupervisorConfig;
use crate::launch::LaunchCommand;
use crate::listenable::RemoteListenable;
use crate::system;

pub type DestroyedCallback = Box<dyn FnOnce(i32) + Send>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Alive,
    Destroying,
    Destroyed { exit_code: i32 },
}

struct Lifecycle {
    state: State,
    /// Exit code once the wait thread has reaped the child.
    reaped: Option<i32>,
}

struct Inner {
    description: ProcessDescription,
    pid: u32,
    config: SupervisorConfig,
    listenable: Arc<RemoteListenable>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    on_destroyed: Mutex<Option<DestroyedCallback>>,
}

#[derive(Clone)]
pub struct RemoteProcess {
    inner: Arc<Inner>,
}

fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code as i32,
        ExitStatus::Signaled(signal) => -i32::from(signal),
        ExitStatus::Other(code) => code,
        ExitStatus::Undetermined => EXIT_KILLED,
    }
}

/// Kill and reap a child nothing else will wait for.
fn reap_abandoned(mut popen: Popen) -> i32 {
    let _ = popen.kill();
    match popen.wait() {
        Ok(status) => exit_code(status),
        Err(_) => EXIT_KILLED,
    }
}

fn spawn_named<F>(name: String, f: F) -> Result<JoinHandle<()>, NodeError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(f)
        .map_err(NodeError::from)
}

fn child_environment(overrides: &[(String, String)]) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = std::env::vars_os()
        .filter(|(k, _)| !overrides.iter().any(|(name, _)| OsString::from(name) == *k))
        .collect();
    env.extend(
        overrides
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v))),
    );
    env
}

impl RemoteProcess {
    /// Launch `command` and start supervising it.
    ///
    /// `on_destroyed` runs once, just before the process reaches its terminal
    /// state.
    pub fn spawn(
        description: ProcessDescription,
        command: &LaunchCommand,
        listenable_config: &RemoteListenableConfig,
        listener: Option<Arc<dyn OutputListener>>,
        config: SupervisorConfig,
        on_destroyed: Option<DestroyedCallback>,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let listenable = Arc::new(RemoteListenable::new(
            description.name(),
            listenable_config,
            listener,
            config.discard_fraction,
        )?);

        debug!(
            process = %description.name(),
            argv = ?command.argv,
            env = ?command.env,
            "Launching process"
        );
        let mut popen = Popen::create(
            command.argv.as_slice(),
            PopenConfig {
                stdin: Redirection::Pipe,
                stdout: Redirection::Pipe,
                stderr: Redirection::Pipe,
                env: Some(child_environment(&command.env)),
                ..PopenConfig::default()
            },
        )
        .map_err(|e| {
            NodeError::ProcessStartFailure(format!("{}: {}", command.argv.join(" "), e))
        })?;
        // the child sees end-of-file on stdin
        drop(popen.stdin.take());
        // reaping is explicit; dropping the handle must never block
        popen.detach();
        let pid = popen.pid().unwrap_or_default();
        let stdout = popen.stdout.take();
        let stderr = popen.stderr.take();

        let process = RemoteProcess {
            inner: Arc::new(Inner {
                description,
                pid,
                config,
                listenable,
                lifecycle: Mutex::new(Lifecycle {
                    state: State::Alive,
                    reaped: None,
                }),
                changed: Condvar::new(),
                pumps: Mutex::new(Vec::new()),
                on_destroyed: Mutex::new(on_destroyed),
            }),
        };
        info!(process = %process.name(), pid, "Process started");

        if let Err(e) = process.start_threads(popen, stdout, stderr) {
            error!(process = %process.name(), error = %e, "Unable to start supervision");
            process.destroy();
            return Err(e);
        }
        Ok(process)
    }

    fn start_threads(
        &self,
        popen: Popen,
        stdout: Option<File>,
        stderr: Option<File>,
    ) -> Result<(), NodeError> {
        let name = self.name().to_string();
        let mut pumps = Vec::new();
        for (source, channel, label) in [(stdout, Channel::Out, "stdOut"), (stderr, Channel::Err, "stdErr")] {
            if let Some(source) = source {
                let inner = self.inner.clone();
                let spawned = spawn_named(format!("{}-{}", name, label), move || {
                    inner.pump(source, channel)
                });
                match spawned {
                    Ok(pump) => pumps.push(pump),
                    Err(e) => {
                        let code = reap_abandoned(popen);
                        self.inner.lifecycle().reaped = Some(code);
                        return Err(e);
                    }
                }
            }
        }
        *self.inner.pumps.lock()? = pumps;

        let inner = self.inner.clone();
        spawn_named(format!("{}-waiter", name), move || inner.wait_for_exit(popen))?;
        let inner = self.inner.clone();
        spawn_named(format!("{}-heartbeat", name), move || inner.heartbeat_loop())?;
        let inner = self.inner.clone();
        spawn_named(format!("{}-idle", name), move || inner.idle_loop())?;
        let inner = self.inner.clone();
        spawn_named(format!("{}-flush", name), move || inner.flush_loop())?;
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.inner.description.name()
    }

    pub fn description(&self) -> &ProcessDescription {
        &self.inner.description
    }

    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    pub fn remote_listenable(&self) -> Arc<RemoteListenable> {
        self.inner.listenable.clone()
    }

    /// True until the process reaches its destroyed state.
    pub fn is_alive(&self) -> bool {
        !matches!(self.inner.lifecycle().state, State::Destroyed { .. })
    }

    /// `EXIT_UNAVAILABLE` until destroyed.
    pub fn exit_value(&self) -> i32 {
        match self.inner.lifecycle().state {
            State::Destroyed { exit_code } => exit_code,
            _ => EXIT_UNAVAILABLE,
        }
    }

    /// Block until destroyed, or for at most `timeout`; a zero timeout only
    /// checks. Returns `EXIT_UNAVAILABLE` if the process is still alive.
    pub fn wait_for(&self, timeout: Option<Duration>) -> i32 {
        let running = |lc: &mut Lifecycle| !matches!(lc.state, State::Destroyed { .. });
        let inner = &self.inner;
        let lifecycle = match timeout {
            None => inner
                .changed
                .wait_while(inner.lifecycle(), running)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) if timeout.is_zero() => inner.lifecycle(),
            Some(timeout) => {
                inner
                    .changed
                    .wait_timeout_while(inner.lifecycle(), timeout, running)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        match lifecycle.state {
            State::Destroyed { exit_code } => exit_code,
            _ => EXIT_UNAVAILABLE,
        }
    }

    /// Stop the process; every call returns the same exit code.
    pub fn destroy(&self) -> i32 {
        self.inner.destroy()
    }

    pub fn dump_threads(&self) -> Result<(), NodeError> {
        if !self.is_alive() {
            return Err(NodeError::ProcessDestroyed);
        }
        system::dump_threads(self.inner.pid)
    }

    /// Host process listing with this process's relatives marked. Without
    /// `show_all`, a destroyed process has nothing left to list.
    pub fn list_processes(&self, show_all: bool) -> Result<Vec<ProcessStatus>, NodeError> {
        if !show_all && !self.is_alive() {
            return Ok(Vec::new());
        }
        system::list_processes(self.inner.pid, show_all)
    }
}

impl Inner {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self) -> &str {
        self.description.name()
    }

    fn pump(&self, mut source: File, channel: Channel) {
        let mut buf = vec![0u8; self.config.read_chunk];
        loop {
            match source.read(&mut buf) {
                Ok(0) => return,
                Ok(n) => match self.listenable.append_output(channel, &buf[..n]) {
                    Ok(()) => {}
                    Err(NodeError::ConsumerUnreachable { id, .. }) => {
                        warn!(process = %self.name(), listener = %id, ?channel, "Client died, destroying process");
                        self.destroy();
                        return;
                    }
                    Err(NodeError::ProcessDestroyed) => return,
                    Err(e) => {
                        error!(process = %self.name(), error = %e, "Output pump failed");
                        return;
                    }
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(process = %self.name(), ?channel, error = %e, "Output pipe closed");
                    return;
                }
            }
        }
    }

    fn wait_for_exit(&self, mut popen: Popen) {
        let code = match popen.wait() {
            Ok(status) => exit_code(status),
            Err(e) => {
                error!(process = %self.name(), error = %e, "Unable to wait for process");
                EXIT_KILLED
            }
        };
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.reaped = Some(code);
            self.changed.notify_all();
        }
        debug!(process = %self.name(), code, "Process exited");

        // forward everything the process wrote before reporting the exit
        let pumps = match self.pumps.lock() {
            Ok(mut pumps) => std::mem::take(&mut *pumps),
            Err(_) => Vec::new(),
        };
        for pump in pumps {
            let _ = pump.join();
        }

        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state != State::Alive {
                return;
            }
            lifecycle.state = State::Destroying;
        }
        self.complete(code);
    }

    fn destroy(&self) -> i32 {
        let already_reaped = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                State::Destroyed { exit_code } => return exit_code,
                State::Destroying => {
                    let lifecycle = self
                        .changed
                        .wait_while(lifecycle, |lc| !matches!(lc.state, State::Destroyed { .. }))
                        .unwrap_or_else(PoisonError::into_inner);
                    return match lifecycle.state {
                        State::Destroyed { exit_code } => exit_code,
                        _ => EXIT_KILLED,
                    };
                }
                State::Alive => lifecycle.state = State::Destroying,
            }
            lifecycle.reaped
        };

        let exit_code = match already_reaped {
            Some(code) => code,
            None => {
                self.terminate();
                EXIT_KILLED
            }
        };
        self.complete(exit_code)
    }

    /// SIGTERM, then SIGKILL if the child is not reaped within the timeout.
    fn terminate(&self) {
        if let Err(e) = system::terminate(self.pid) {
            debug!(process = %self.name(), error = %e, "SIGTERM failed");
        }
        if self.await_reap(self.config.destroy_timeout) {
            return;
        }
        warn!(process = %self.name(), pid = self.pid, "Process ignored SIGTERM, killing");
        if let Err(e) = system::force_kill(self.pid) {
            warn!(process = %self.name(), error = %e, "SIGKILL failed");
        }
        self.await_reap(self.config.destroy_timeout);
    }

    fn await_reap(&self, timeout: Duration) -> bool {
        let (lifecycle, _) = self
            .changed
            .wait_timeout_while(self.lifecycle(), timeout, |lc| lc.reaped.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.reaped.is_some()
    }

    /// Final delivery, then the destroyed callback, then the terminal state,
    /// so waiters wake to a fully retired process.
    fn complete(&self, exit_code: i32) -> i32 {
        if let Err(e) = self.listenable.close() {
            warn!(process = %self.name(), error = %e, "Unable to close output");
        }
        let callback = self
            .on_destroyed
            .lock()
            .ok()
            .and_then(|mut callback| callback.take());
        if let Some(callback) = callback {
            callback(exit_code);
        }
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = State::Destroyed { exit_code };
            self.changed.notify_all();
        }
        info!(process = %self.name(), exit_code, "Process destroyed");
        exit_code
    }

    /// Wait up to `interval`, returning false once the process is no longer alive.
    fn pause(&self, interval: Duration) -> bool {
        let (lifecycle, _) = self
            .changed
            .wait_timeout_while(self.lifecycle(), interval, |lc| lc.state == State::Alive)
            .unwrap_or_else(PoisonError::into_inner);
        lifecycle.state == State::Alive
    }

    fn heartbeat_loop(&self) {
        while self.pause(self.config.heartbeat_interval) {
            if let Err(NodeError::ConsumerUnreachable { id, .. }) = self.listenable.send_heartbeat() {
                warn!(process = %self.name(), listener = %id, "Client died (heartbeat), destroying process");
                self.destroy();
                return;
            }
        }
    }

    fn idle_loop(&self) {
        let interval = self.config.idle_interval;
        loop {
            let started = Instant::now();
            if !self.pause(interval) {
                return;
            }
            let slip = started.elapsed().saturating_sub(interval);
            let percent = slip.as_secs_f64() / interval.as_secs_f64();
            if self.listenable.append_idle_update(percent, now_millis()).is_err() {
                return;
            }
        }
    }

    fn flush_loop(&self) {
        while self.pause(self.config.flush_period) {
            match self.listenable.tick() {
                Ok(()) => {}
                Err(NodeError::ConsumerUnreachable { id, .. }) => {
                    warn!(process = %self.name(), listener = %id, "Client died (flush), destroying process");
                    self.destroy();
                    return;
                }
                Err(_) => return,
            }
        }
    }
}
