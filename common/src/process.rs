//! Child workers launched by fork or on a thread.

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

#[cfg(unix)]
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};

use crate::{
    config::{Context, StartMethod},
    error::{IpcError, Result},
};

/// Body of a worker. `Ok` exits with code 0; an error or a panic with 1.
pub type Target = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

const JOIN_POLL: Duration = Duration::from_millis(5);

enum State {
    Created(Target),
    #[cfg(unix)]
    Forked(Pid),
    Threaded(JoinHandle<i32>),
    Finished,
}

/// A worker running either in a forked child process or on a thread
pub struct Process {
    name:         String,
    start_method: StartMethod,
    state:        State,
    exitcode:     Option<i32>,
}

impl Process {
    pub fn new<F>(ctx: &Context, name: impl Into<String>, target: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let name = name.into();
        tracing::debug!("Initialized Process(name={}, start_method={})", name, ctx.start_method);
        Self {
            name,
            start_method: ctx.start_method,
            state: State::Created(Box::new(target)),
            exitcode: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS pid of a forked child
    pub fn pid(&self) -> Option<u32> {
        match self.state {
            #[cfg(unix)]
            State::Forked(pid) => Some(pid.as_raw() as u32),
            _ => None,
        }
    }

    /// Launch the worker. Fails if it was already started.
    pub fn start(&mut self) -> Result<()> {
        let target = match std::mem::replace(&mut self.state, State::Finished) {
            State::Created(target) => target,
            other => {
                self.state = other;
                return Err(IpcError::Process(format!("process {} already started", self.name)));
            }
        };

        tracing::info!("Process {} starting", self.name);
        self.state = match self.start_method {
            StartMethod::Fork => self.fork(target)?,
            StartMethod::Thread => {
                let name = self.name.clone();
                let handle = thread::Builder::new()
                    .name(self.name.clone())
                    .spawn(move || run_target(&name, target))?;
                State::Threaded(handle)
            }
        };
        Ok(())
    }

    #[cfg(unix)]
    fn fork(&self, target: Target) -> Result<State> {
        // SAFETY: the child only runs `target` and then `_exit`s without
        // returning into the caller's stack.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => Ok(State::Forked(child)),
            Ok(ForkResult::Child) => {
                let code = run_target(&self.name, target);
                // SAFETY: `_exit` skips atexit handlers and destructors that
                // belong to the parent's copy of shared resources.
                unsafe { libc::_exit(code) }
            }
            Err(e) => Err(IpcError::Process(format!("fork failed: {e}"))),
        }
    }

    #[cfg(not(unix))]
    fn fork(&self, _target: Target) -> Result<State> {
        Err(IpcError::Process("fork is not available on this platform".to_string()))
    }

    /// Wait for the worker to finish, or until `timeout` elapses
    pub fn join(&mut self, timeout: Option<Duration>) -> Result<()> {
        tracing::info!("Waiting for process {} to finish", self.name);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.reap(deadline.is_none())? {
                break;
            }
            match deadline {
                Some(deadline) if Instant::now() >= deadline => break,
                _ => thread::sleep(JOIN_POLL),
            }
        }

        match self.exitcode {
            Some(code) => tracing::info!("Process {} terminated with exitcode={}", self.name, code),
            None => tracing::warn!(
                "Process {} is still alive after join(timeout={:?})",
                self.name,
                timeout
            ),
        }
        Ok(())
    }

    /// Collect the exit status if the worker has ended. Returns whether
    /// there is nothing left to wait for.
    fn reap(&mut self, block: bool) -> Result<bool> {
        match &self.state {
            State::Created(_) => {
                Err(IpcError::Process(format!("process {} was never started", self.name)))
            }
            State::Finished => Ok(true),
            #[cfg(unix)]
            State::Forked(pid) => {
                let flags = if block { None } else { Some(WaitPidFlag::WNOHANG) };
                let code = match waitpid(*pid, flags) {
                    Ok(WaitStatus::Exited(_, code)) => code,
                    Ok(WaitStatus::Signaled(_, signal, _)) => -(signal as i32),
                    Ok(_) => return Ok(false),
                    Err(e) => return Err(IpcError::Process(format!("waitpid failed: {e}"))),
                };
                self.exitcode = Some(code);
                self.state = State::Finished;
                Ok(true)
            }
            State::Threaded(handle) => {
                if !block && !handle.is_finished() {
                    return Ok(false);
                }
                if let State::Threaded(handle) = std::mem::replace(&mut self.state, State::Finished)
                {
                    self.exitcode = Some(handle.join().unwrap_or(1));
                }
                Ok(true)
            }
        }
    }

    pub fn is_alive(&mut self) -> bool {
        let alive = match self.state {
            State::Created(_) | State::Finished => false,
            _ => !self.reap(false).unwrap_or(true),
        };
        tracing::debug!("Process {} is_alive -> {}", self.name, alive);
        alive
    }

    /// Exit code once finished; a negative value is the terminating signal
    pub fn exitcode(&mut self) -> Option<i32> {
        if matches!(self.state, State::Created(_)) {
            return None;
        }
        let _ = self.reap(false);
        self.exitcode
    }

    /// Ask the worker to stop. Only forked children can be terminated.
    pub fn terminate(&mut self) -> Result<()> {
        tracing::info!("Terminating process {}", self.name);
        match &self.state {
            #[cfg(unix)]
            State::Forked(pid) => kill(*pid, Signal::SIGTERM)
                .map_err(|e| IpcError::Process(format!("SIGTERM failed: {e}"))),
            State::Threaded(_) => Err(IpcError::Process(format!(
                "process {} runs on a thread and cannot be terminated",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

fn run_target(name: &str, target: Target) -> i32 {
    tracing::info!("Process {} starting run()", name);
    match panic::catch_unwind(AssertUnwindSafe(target)) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            tracing::error!("Exception in process {}: {:#}", name, e);
            1
        }
        Err(_) => {
            tracing::error!("Process {} panicked", name);
            1
        }
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("name", &self.name)
            .field("start_method", &self.start_method)
            .field("exitcode", &self.exitcode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn thread_worker_reports_exit_codes() {
        let ctx = Context::with_start_method(StartMethod::Thread);

        let mut ok = Process::new(&ctx, "ok", || Ok(()));
        ok.start().unwrap();
        ok.join(None).unwrap();
        assert_eq!(ok.exitcode(), Some(0));
        assert!(!ok.is_alive());

        let mut failing = Process::new(&ctx, "failing", || anyhow::bail!("boom"));
        failing.start().unwrap();
        failing.join(None).unwrap();
        assert_eq!(failing.exitcode(), Some(1));

        let mut panicking = Process::new(&ctx, "panicking", || panic!("boom"));
        panicking.start().unwrap();
        panicking.join(None).unwrap();
        assert_eq!(panicking.exitcode(), Some(1));
    }

    #[test]
    fn join_with_timeout_leaves_slow_worker_running() {
        let ctx = Context::with_start_method(StartMethod::Thread);
        let release = Arc::new(AtomicBool::new(false));
        let flag = release.clone();

        let mut slow = Process::new(&ctx, "slow", move || {
            while !flag.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        });
        slow.start().unwrap();
        slow.join(Some(Duration::from_millis(20))).unwrap();
        assert!(slow.is_alive());
        assert_eq!(slow.exitcode(), None);

        release.store(true, Ordering::SeqCst);
        slow.join(None).unwrap();
        assert_eq!(slow.exitcode(), Some(0));
    }

    #[test]
    fn start_twice_is_rejected() {
        let ctx = Context::with_start_method(StartMethod::Thread);
        let mut worker = Process::new(&ctx, "once", || Ok(()));
        assert!(matches!(worker.join(None), Err(IpcError::Process(_))));
        worker.start().unwrap();
        assert!(matches!(worker.start(), Err(IpcError::Process(_))));
        worker.join(None).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn forked_child_exit_status_is_collected() {
        let ctx = Context::with_start_method(StartMethod::Fork);

        let mut child = Process::new(&ctx, "child", || anyhow::bail!("exit with failure"));
        child.start().unwrap();
        assert!(child.pid().is_some());
        child.join(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(child.exitcode(), Some(1));
    }

    #[cfg(unix)]
    #[test]
    fn forked_child_can_be_terminated() {
        let ctx = Context::with_start_method(StartMethod::Fork);

        let mut child = Process::new(&ctx, "sleeper", || {
            thread::sleep(Duration::from_secs(30));
            Ok(())
        });
        child.start().unwrap();
        child.terminate().unwrap();
        child.join(Some(Duration::from_secs(10))).unwrap();
        assert_eq!(child.exitcode(), Some(-(Signal::SIGTERM as i32)));
    }
}
