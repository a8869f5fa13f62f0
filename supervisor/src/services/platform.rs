//! Platform process operations
//!
//! OS-specific leaf of the supervisor: enumerate processes by argument
//! pattern, enumerate children by parent PID, check liveness, kill. One
//! implementation per OS family, selected once at startup; every other
//! component talks to the `ProcessOps` trait.
//!
//! Enumeration shells out to platform tooling (`ps` on POSIX, `wmic` and
//! `tasklist` on Windows) under a hard timeout. A timed-out or failed tool
//! run degrades to "no results" so a wedged `ps` cannot take the health
//! system down with it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::traits::ProcessOps;
use shared::{ChildProcess, KillSignal, ProcessMatch};

/// Hard ceiling for any enumeration shell-out
const ENUMERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace polls after SIGTERM before the kill is declared failed
const TERM_VERIFY_ATTEMPTS: u32 = 6;
const TERM_VERIFY_INTERVAL: Duration = Duration::from_millis(500);

/// SIGKILL takes effect quickly; verify on a tighter loop
const KILL_VERIFY_ATTEMPTS: u32 = 4;
const KILL_VERIFY_INTERVAL: Duration = Duration::from_millis(250);

/// Select the native implementation for this OS family
pub fn native_process_ops() -> Arc<dyn ProcessOps> {
    #[cfg(unix)]
    {
        Arc::new(PosixProcessOps)
    }
    #[cfg(windows)]
    {
        Arc::new(WindowsProcessOps)
    }
}

/// Run a platform tool under the given time budget
///
/// Returns the tool's stdout, or `None` when the tool timed out, failed to
/// spawn, or exited unsuccessfully. Callers treat `None` as "no results".
async fn run_tool(tool: &str, args: &[&str], timeout: Duration) -> Option<String> {
    let run = Command::new(tool).args(args).kill_on_drop(true).output();

    match tokio::time::timeout(timeout, run).await {
        Ok(Ok(output)) if output.status.success() => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Ok(output)) => {
            debug!("{} exited with {}; treating as no results", tool, output.status);
            None
        }
        Ok(Err(e)) => {
            warn!("failed to run {}: {}; treating as no results", tool, e);
            None
        }
        Err(_) => {
            warn!("{} timed out after {:?}; treating as no results", tool, timeout);
            None
        }
    }
}

/// Confirm a kill by watching the process disappear, not by parsing tool
/// output; this keeps the check locale independent.
async fn verify_killed(ops: &dyn ProcessOps, pid: u32, signal: KillSignal) -> SupervisorResult<()> {
    let (attempts, interval) = match signal {
        KillSignal::Term => (TERM_VERIFY_ATTEMPTS, TERM_VERIFY_INTERVAL),
        KillSignal::Kill => (KILL_VERIFY_ATTEMPTS, KILL_VERIFY_INTERVAL),
    };

    for _ in 0..attempts {
        if !ops.is_process_alive(pid).await {
            return Ok(());
        }
        tokio::time::sleep(interval).await;
    }

    Err(SupervisorError::ProcessKillFailed {
        pid,
        signal: signal.to_string(),
    })
}

/// Parse `ps -eo pid=,comm=,args=` output into argument matches
fn parse_ps_args_output(output: &str, pattern: &str, own_pid: u32) -> Vec<ProcessMatch> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            let mut parts = trimmed.splitn(3, char::is_whitespace);
            let pid: u32 = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            let command_line = parts.next().unwrap_or("").trim().to_string();
            Some(ProcessMatch { pid, command_line, name })
        })
        .filter(|m| m.pid != own_pid && m.command_line.contains(pattern))
        .collect()
}

/// Parse `ps -eo pid=,ppid=,comm=` output into child records for one parent
fn parse_ps_children_output(output: &str, parent_pid: u32) -> Vec<ChildProcess> {
    output
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            let mut parts = trimmed.split_whitespace();
            let pid: u32 = parts.next()?.parse().ok()?;
            let ppid: u32 = parts.next()?.parse().ok()?;
            let name = parts.next()?.to_string();
            Some(ChildProcess { pid, ppid, name })
        })
        .filter(|c| c.ppid == parent_pid)
        .collect()
}

/// Parse `wmic ... /format:csv` output using its header row for field order
///
/// Returns one map-like record per data row as `(field, value)` pairs kept in
/// header order. `wmic` pads output with blank lines and `\r`, both skipped.
fn parse_wmic_csv(output: &str) -> Vec<Vec<(String, String)>> {
    let mut lines = output.lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.trim().is_empty());

    let header: Vec<String> = match lines.next() {
        Some(h) => h.split(',').map(|s| s.trim().to_string()).collect(),
        None => return Vec::new(),
    };

    lines
        .map(|line| {
            // CommandLine may itself contain commas; give trailing fields the
            // benefit of splitn at the header arity.
            let values: Vec<&str> = line.splitn(header.len(), ',').collect();
            header
                .iter()
                .zip(values.iter())
                .map(|(h, v)| (h.clone(), v.trim().to_string()))
                .collect()
        })
        .collect()
}

fn wmic_field<'a>(record: &'a [(String, String)], field: &str) -> Option<&'a str> {
    record
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(field))
        .map(|(_, value)| value.as_str())
}

/// POSIX implementation backed by `ps` and signal delivery
#[cfg(unix)]
pub struct PosixProcessOps;

#[cfg(unix)]
impl PosixProcessOps {
    fn signal_probe(pid: u32) -> bool {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        // Signal 0: existence check without delivering anything. EPERM means
        // the process exists but belongs to someone else.
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessOps for PosixProcessOps {
    async fn find_by_args(&self, pattern: &str) -> Vec<ProcessMatch> {
        match run_tool("ps", &["-eo", "pid=,comm=,args="], ENUMERATION_TIMEOUT).await {
            Some(output) => parse_ps_args_output(&output, pattern, std::process::id()),
            None => Vec::new(),
        }
    }

    async fn find_child_processes(&self, parent_pid: u32) -> Vec<ChildProcess> {
        match run_tool("ps", &["-eo", "pid=,ppid=,comm="], ENUMERATION_TIMEOUT).await {
            Some(output) => parse_ps_children_output(&output, parent_pid),
            None => Vec::new(),
        }
    }

    async fn is_process_alive(&self, pid: u32) -> bool {
        Self::signal_probe(pid)
    }

    async fn kill_process(&self, pid: u32, signal: KillSignal) -> SupervisorResult<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid).map_err(|_| SupervisorError::platform("kill", format!("pid {pid} out of range")))?;
        let sig = match signal {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };

        match kill(Pid::from_raw(raw), sig) {
            // Already gone counts as success; the goal is a dead process.
            Err(Errno::ESRCH) => return Ok(()),
            Err(e) => debug!("kill({pid}, {signal}) returned {e}; verifying by liveness"),
            Ok(()) => {}
        }

        verify_killed(self, pid, signal).await
    }
}

/// Windows implementation backed by `wmic`, `tasklist`, and `taskkill`
#[cfg(windows)]
pub struct WindowsProcessOps;

#[cfg(windows)]
#[async_trait]
impl ProcessOps for WindowsProcessOps {
    async fn find_by_args(&self, pattern: &str) -> Vec<ProcessMatch> {
        let output = match run_tool("wmic", &["process", "get", "ProcessId,Name,CommandLine", "/format:csv"], ENUMERATION_TIMEOUT).await {
            Some(output) => output,
            None => return Vec::new(),
        };

        let own_pid = std::process::id();
        parse_wmic_csv(&output)
            .iter()
            .filter_map(|record| {
                let pid: u32 = wmic_field(record, "ProcessId")?.parse().ok()?;
                let command_line = wmic_field(record, "CommandLine")?.to_string();
                let name = wmic_field(record, "Name")?.to_string();
                Some(ProcessMatch { pid, command_line, name })
            })
            .filter(|m| m.pid != own_pid && m.command_line.contains(pattern))
            .collect()
    }

    async fn find_child_processes(&self, parent_pid: u32) -> Vec<ChildProcess> {
        let filter = format!("(ParentProcessId={parent_pid})");
        let output = match run_tool(
            "wmic",
            &["process", "where", &filter, "get", "ProcessId,Name", "/format:csv"],
        )
        .await
        {
            Some(output) => output,
            None => return Vec::new(),
        };

        parse_wmic_csv(&output)
            .iter()
            .filter_map(|record| {
                let pid: u32 = wmic_field(record, "ProcessId")?.parse().ok()?;
                let name = wmic_field(record, "Name")?.to_string();
                Some(ChildProcess {
                    pid,
                    ppid: parent_pid,
                    name,
                })
            })
            .collect()
    }

    async fn is_process_alive(&self, pid: u32) -> bool {
        let filter = format!("PID eq {pid}");
        match run_tool("tasklist", &["/FI", &filter, "/NH", "/FO", "CSV"], ENUMERATION_TIMEOUT).await {
            Some(output) => output.contains(&format!("\"{pid}\"")),
            None => false,
        }
    }

    async fn kill_process(&self, pid: u32, signal: KillSignal) -> SupervisorResult<()> {
        let pid_arg = pid.to_string();
        let args: Vec<&str> = match signal {
            KillSignal::Term => vec!["/PID", &pid_arg],
            KillSignal::Kill => vec!["/F", "/PID", &pid_arg],
        };
        // taskkill's exit text varies by locale; only the liveness check
        // afterwards decides success or failure.
        let _ = run_tool("taskkill", &args, ENUMERATION_TIMEOUT).await;

        verify_killed(self, pid, signal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ps_args_filters_pattern_and_own_pid() {
        let output = "\
  101 node    /usr/bin/node agent.js --managed-by=supervisor:abc
  102 bash    bash -c sleep 100
  103 node    /usr/bin/node agent.js --managed-by=supervisor:def
";
        let matches = parse_ps_args_output(output, "--managed-by=supervisor:", 103);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pid, 101);
        assert_eq!(matches[0].name, "node");
        assert!(matches[0].command_line.contains("supervisor:abc"));
    }

    #[test]
    fn test_parse_ps_args_skips_malformed_lines() {
        let output = "garbage line\n  201 sh sh -c --managed-by=supervisor:x\nnot-a-pid cmd args";
        let matches = parse_ps_args_output(output, "--managed-by=supervisor:", 1);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pid, 201);
    }

    #[test]
    fn test_parse_ps_children_selects_parent() {
        let output = "\
  300   1 systemd-worker
  301 300 node
  302 300 cloudflared
  303 999 sshd
";
        let children = parse_ps_children_output(output, 300);
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].pid, 301);
        assert_eq!(children[1].name, "cloudflared");
    }

    #[test]
    fn test_parse_wmic_csv_uses_header_order() {
        let output = "\r\nNode,CommandLine,Name,ProcessId\r\nHOST,node agent.js --flag,node.exe,501\r\n\r\n";
        let records = parse_wmic_csv(output);
        assert_eq!(records.len(), 1);
        assert_eq!(wmic_field(&records[0], "ProcessId"), Some("501"));
        assert_eq!(wmic_field(&records[0], "Name"), Some("node.exe"));
        assert_eq!(wmic_field(&records[0], "commandline"), Some("node agent.js --flag"));
    }

    #[test]
    fn test_parse_wmic_csv_empty_output() {
        assert!(parse_wmic_csv("").is_empty());
        assert!(parse_wmic_csv("\r\n\r\n").is_empty());
    }

    #[tokio::test]
    async fn test_missing_tool_degrades_to_no_results() {
        assert!(run_tool("no-such-enumeration-tool", &[], ENUMERATION_TIMEOUT).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tool_timeout_degrades_to_no_results() {
        assert!(run_tool("sleep", &["5"], Duration::from_millis(50)).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_tool_degrades_to_no_results() {
        assert!(run_tool("false", &[], ENUMERATION_TIMEOUT).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_tool_returns_stdout() {
        let output = run_tool("echo", &["ok"], ENUMERATION_TIMEOUT).await;
        assert_eq!(output.as_deref().map(str::trim), Some("ok"));
    }
}
