//! Execution of external network configuration commands.
//!
//! Every command runs while holding a [`CommandLock`]. Locks are looked up
//! by name in a process-wide table, so several devices configured from
//! one process never race `ip`/`ifconfig`/`netsh` against each other.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

/// One external command: program plus arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        self.args.extend(args.into_iter().map(|a| a.to_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Shorthand for building a [`CommandLine`] from displayable parts.
#[macro_export]
macro_rules! cmdline {
    ($program:expr $(, $arg:expr)* $(,)?) => {
        $crate::command::CommandLine::new($program)$(.arg($arg))*
    };
}

/// How a failing command is treated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// Failure aborts the current operation.
    Fatal,
    /// Failure is logged as a warning.
    Warn,
    /// Failure is expected in normal operation, e.g. deleting something
    /// that may not exist.
    Tolerate,
}

/// Bounded retry policy for commands that are known to fail transiently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Sleep before every attempt.
    pub pre_delay: Duration,
    /// Additional sleep after a failed attempt.
    pub failure_delay: Duration,
}

impl RetryPolicy {
    pub fn netsh(attempts: u32) -> Self {
        Self {
            attempts,
            pre_delay: Duration::from_secs(1),
            failure_delay: Duration::from_secs(4),
        }
    }

    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            pre_delay: Duration::ZERO,
            failure_delay: Duration::ZERO,
        }
    }
}

/// Runs a command and returns its standard output on success.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandLine) -> io::Result<Vec<u8>>;
}

/// Runs commands as child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandLine) -> io::Result<Vec<u8>> {
        let mut cmd = std::process::Command::new(command.program());
        cmd.args(command.arguments());
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NO_WINDOW);
        }
        let out = cmd.output()?;
        if !out.status.success() {
            let err = String::from_utf8_lossy(if out.stderr.is_empty() {
                &out.stdout
            } else {
                &out.stderr
            });
            let info = format!("{} failed with: \"{}\"", command.program(), err.trim());
            return Err(io::Error::other(info));
        }
        Ok(out.stdout)
    }
}

/// Name of the lock used by [`CommandDriver::system`].
pub const DEFAULT_LOCK_NAME: &str = "tuntap-netcmd";

static LOCKS: OnceLock<Mutex<HashMap<String, CommandLock>>> = OnceLock::new();

/// Named mutual exclusion shared by everything that reconfigures the network.
#[derive(Clone, Debug)]
pub struct CommandLock {
    name: Arc<str>,
    inner: Arc<Mutex<()>>,
}

impl CommandLock {
    /// Returns the process-wide lock registered under `name`, creating it
    /// on first use.
    pub fn new(name: &str) -> Self {
        let table = LOCKS.get_or_init(|| Mutex::new(HashMap::new()));
        let mut table = table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(name.to_string())
            .or_insert_with(|| Self {
                name: Arc::from(name),
                inner: Arc::new(Mutex::new(())),
            })
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), a poisoned lock carries no broken state.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shares_with(&self, other: &CommandLock) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CommandLock {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_NAME)
    }
}

/// Executes configuration commands under a shared [`CommandLock`].
#[derive(Clone)]
pub struct CommandDriver {
    runner: Arc<dyn CommandRunner>,
    lock: CommandLock,
}

impl fmt::Debug for CommandDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandDriver")
            .field("lock", &self.lock.name())
            .finish()
    }
}

impl Default for CommandDriver {
    fn default() -> Self {
        Self::system()
    }
}

impl CommandDriver {
    pub fn new(runner: Arc<dyn CommandRunner>, lock: CommandLock) -> Self {
        Self { runner, lock }
    }

    /// Driver running real child processes under the default lock.
    pub fn system() -> Self {
        Self::new(Arc::new(SystemRunner), CommandLock::default())
    }

    pub fn lock(&self) -> &CommandLock {
        &self.lock
    }

    /// Run `command` once. Returns `Ok(false)` when a non-fatal command failed.
    pub fn execute(&self, command: &CommandLine, severity: Severity) -> Result<bool> {
        log::info!("{command}");
        let result = {
            let _guard = self.lock.lock();
            self.runner.run(command)
        };
        match result {
            Ok(_) => Ok(true),
            Err(e) => match severity {
                Severity::Fatal => {
                    let err = Error::Command {
                        command: command.to_string(),
                        reason: e.to_string(),
                    };
                    log::error!("{err}");
                    Err(err)
                }
                Severity::Warn => {
                    log::warn!("command failed: {command}: {e}");
                    Ok(false)
                }
                Severity::Tolerate => {
                    log::debug!("command failed: {command}: {e}");
                    Ok(false)
                }
            },
        }
    }

    /// Run `command` and return its standard output.
    pub fn capture(&self, command: &CommandLine) -> Result<String> {
        log::debug!("{command}");
        let _guard = self.lock.lock();
        let out = self.runner.run(command).map_err(|e| Error::Command {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Run `command` until it succeeds or `policy.attempts` runs are used up.
    pub fn execute_with_retry(&self, command: &CommandLine, policy: RetryPolicy) -> Result<()> {
        for attempt in 1..=policy.attempts {
            sleep(policy.pre_delay);
            log::info!("{command}");
            let result = {
                let _guard = self.lock.lock();
                self.runner.run(command)
            };
            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "attempt {attempt}/{} failed: {command}: {e}",
                        policy.attempts
                    );
                }
            }
            sleep(policy.failure_delay);
        }
        let err = Error::RetriesExhausted {
            command: command.to_string(),
            attempts: policy.attempts,
        };
        log::error!("{err}");
        Err(err)
    }
}

fn sleep(d: Duration) {
    if !d.is_zero() {
        std::thread::sleep(d);
    }
}
