//! Helpers for locating and signalling the daemon process.

use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Delivers the out-of-band reload signal.
pub trait ProcessSignaller: Send + Sync {
    /// Ask process `pid` to reload its configuration. Errors carry the
    /// system's description of the failure.
    fn signal_reload(&self, pid: u32) -> Result<(), String>;
}

/// Sends `SIGHUP` with `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NixSignaller;

impl ProcessSignaller for NixSignaller {
    fn signal_reload(&self, pid: u32) -> Result<(), String> {
        let pid = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
        signal::kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|errno| errno.desc().to_string())
    }
}

/// Find the daemon's pid: the pid file if one is configured and readable,
/// otherwise a process-name search that must match exactly one process.
pub fn find_pid(pid_file: Option<&Path>, process_name: &str) -> Option<u32> {
    if let Some(pid) = pid_file.and_then(read_pid_file) {
        return Some(pid);
    }

    for (program, args) in [("pgrep", vec!["-x", process_name]), ("pidof", vec![process_name])] {
        match run(program, &args).as_deref().and_then(single_pid) {
            Some(pid) => return Some(pid),
            None => debug!(program, process_name, "no unambiguous pid"),
        }
    }
    None
}

/// First line of a pid file, if it is a number.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let content = std::fs::read_to_string(path).ok()?;
    content.lines().next()?.trim().parse().ok()
}

/// When process `pid` started, from its elapsed running time.
pub fn process_start_time(pid: u32) -> Option<SystemTime> {
    let output = run("ps", &["-p", &pid.to_string(), "-o", "etime"])?;
    // First line is the column header.
    let elapsed = parse_elapsed(output.lines().nth(1)?.trim())?;
    SystemTime::now().checked_sub(elapsed)
}

/// Parse a `ps` elapsed-time field of the form `[[dd-]hh:]mm:ss`.
pub fn parse_elapsed(label: &str) -> Option<Duration> {
    let (days, clock) = match label.split_once('-') {
        Some((days, clock)) => (days.parse::<u64>().ok()?, clock),
        None => (0, label),
    };

    let fields = clock
        .split(':')
        .map(|field| field.parse::<u64>().ok())
        .collect::<Option<Vec<u64>>>()?;
    let (hours, minutes, seconds) = match fields.as_slice() {
        [minutes, seconds] => (0, *minutes, *seconds),
        [hours, minutes, seconds] => (*hours, *minutes, *seconds),
        _ => return None,
    };
    if days > 0 && fields.len() != 3 {
        return None;
    }

    let secs = days
        .checked_mul(24)?
        .checked_add(hours)?
        .checked_mul(60)?
        .checked_add(minutes)?
        .checked_mul(60)?
        .checked_add(seconds)?;
    Some(Duration::from_secs(secs))
}

fn single_pid(output: &str) -> Option<u32> {
    let mut pids = output.split_whitespace();
    let pid = pids.next()?.parse().ok()?;
    pids.next().is_none().then_some(pid)
}

fn run(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).into_owned())
}
