//! Host-side OS helpers: process listings and signals.

use std::collections::{HashMap, HashSet, VecDeque};

use subprocess::{Exec, ExitStatus, Redirection};
use tracing::debug;

use node_agent_common::{NodeError, ProcessMark, ProcessStatus};

use crate::util::split_lines;

const PS_ARGS: [&str; 7] = [
    "-A",
    "-o",
    "pid,ppid,user,lstart,cmd",
    "--no-headers",
    "--sort=pid",
    "--width",
    "1000",
];

fn next_token(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    let end = s.find(char::is_whitespace).unwrap_or(s.len());
    Some((&s[..end], &s[end..]))
}

/// One `ps` row: pid, ppid, user, five start-time fields, command.
fn parse_ps_line(line: &str) -> Option<ProcessStatus> {
    let (pid, rest) = next_token(line)?;
    let (ppid, rest) = next_token(rest)?;
    let (user, mut rest) = next_token(rest)?;
    let mut start = Vec::with_capacity(5);
    for _ in 0..5 {
        let (field, tail) = next_token(rest)?;
        start.push(field);
        rest = tail;
    }
    Some(ProcessStatus {
        pid: pid.parse().ok()?,
        ppid: ppid.parse().ok()?,
        user: user.to_string(),
        start: start.join(" "),
        command: rest.trim().to_string(),
        mark: ProcessMark::None,
    })
}

pub fn parse_ps_output(output: &[u8]) -> Vec<ProcessStatus> {
    split_lines(output)
        .iter()
        .filter_map(|line| {
            let parsed = parse_ps_line(line);
            if parsed.is_none() {
                debug!(line = %line, "Skipping unparsable ps line");
            }
            parsed
        })
        .collect()
}

/// Mark `target`, its ancestors and its descendants.
pub fn mark_relatives(statuses: &mut [ProcessStatus], target: u32) {
    let parent_of: HashMap<u32, u32> = statuses.iter().map(|s| (s.pid, s.ppid)).collect();
    if !parent_of.contains_key(&target) {
        return;
    }

    let mut ancestors = HashSet::new();
    let mut pid = target;
    while let Some(&ppid) = parent_of.get(&pid) {
        if ppid == pid || !ancestors.insert(ppid) {
            break;
        }
        pid = ppid;
    }

    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for s in statuses.iter() {
        if s.pid != s.ppid {
            children.entry(s.ppid).or_default().push(s.pid);
        }
    }
    let mut descendants = HashSet::new();
    let mut queue = VecDeque::from([target]);
    while let Some(pid) = queue.pop_front() {
        for &child in children.get(&pid).into_iter().flatten() {
            if child != target && descendants.insert(child) {
                queue.push_back(child);
            }
        }
    }

    for s in statuses.iter_mut() {
        s.mark = if s.pid == target {
            ProcessMark::Target
        } else if descendants.contains(&s.pid) {
            ProcessMark::Descendant
        } else if ancestors.contains(&s.pid) {
            ProcessMark::Ancestor
        } else {
            ProcessMark::None
        };
    }
}

/// Host processes with `target`'s relatives marked; only the target and its
/// descendants unless `show_all`.
pub fn list_processes(target: u32, show_all: bool) -> Result<Vec<ProcessStatus>, NodeError> {
    let capture = Exec::cmd("ps")
        .args(&PS_ARGS[..])
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .capture()
        .map_err(|e| NodeError::IoError(format!("ps: {}", e)))?;
    if !matches!(capture.exit_status, ExitStatus::Exited(0)) {
        return Err(NodeError::IoError(format!(
            "ps failed ({:?}): {}",
            capture.exit_status,
            capture.stderr_str().trim()
        )));
    }
    let mut statuses = parse_ps_output(&capture.stdout);
    mark_relatives(&mut statuses, target);
    if !show_all {
        statuses.retain(|s| matches!(s.mark, ProcessMark::Target | ProcessMark::Descendant));
    }
    Ok(statuses)
}

#[cfg(unix)]
mod signals {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    use node_agent_common::NodeError;

    fn send(pid: u32, signal: Signal) -> Result<(), NodeError> {
        let pid = Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX));
        kill(pid, signal).map_err(|e| NodeError::IoError(format!("{:?} to {}: {}", signal, pid, e)))
    }

    pub fn terminate(pid: u32) -> Result<(), NodeError> {
        send(pid, Signal::SIGTERM)
    }

    pub fn force_kill(pid: u32) -> Result<(), NodeError> {
        send(pid, Signal::SIGKILL)
    }

    /// SIGQUIT asks a JVM-style runtime to print its thread dump to stdout.
    pub fn dump_threads(pid: u32) -> Result<(), NodeError> {
        send(pid, Signal::SIGQUIT)
    }
}

#[cfg(not(unix))]
mod signals {
    use node_agent_common::NodeError;

    fn unsupported(what: &str) -> Result<(), NodeError> {
        Err(NodeError::Unsupported(format!("{} is only available on unix", what)))
    }

    pub fn terminate(_pid: u32) -> Result<(), NodeError> {
        unsupported("terminate")
    }

    pub fn force_kill(_pid: u32) -> Result<(), NodeError> {
        unsupported("kill")
    }

    pub fn dump_threads(_pid: u32) -> Result<(), NodeError> {
        unsupported("dump_threads")
    }
}

pub use signals::{dump_threads, force_kill, terminate};

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"    1     0 root     Tue Oct 16 17:57:12 2001 /sbin/init
  100     1 node     Tue Oct 16 17:58:00 2001 node-agent-server --port 8484
  200   100 node     Tue Oct 16 17:59:00 2001 /bin/sh -c  run.sh   x
  300   200 node     Tue Oct 16 17:59:01 2001 sleep 30
  400     1 other    Tue Oct 16 18:00:00 2001 unrelated
garbage line
";

    #[test]
    fn test_parse_ps_output() {
        let statuses = parse_ps_output(SAMPLE);
        assert_eq!(statuses.len(), 5);
        assert_eq!(statuses[2].pid, 200);
        assert_eq!(statuses[2].ppid, 100);
        assert_eq!(statuses[2].user, "node");
        assert_eq!(statuses[2].start, "Tue Oct 16 17:59:00 2001");
        assert_eq!(statuses[2].command, "/bin/sh -c  run.sh   x");
    }

    #[test]
    fn test_mark_relatives() {
        let mut statuses = parse_ps_output(SAMPLE);
        mark_relatives(&mut statuses, 200);
        let marks: Vec<_> = statuses.iter().map(|s| (s.pid, s.mark)).collect();
        assert_eq!(
            marks,
            vec![
                (1, ProcessMark::Ancestor),
                (100, ProcessMark::Ancestor),
                (200, ProcessMark::Target),
                (300, ProcessMark::Descendant),
                (400, ProcessMark::None),
            ]
        );
    }

    #[test]
    fn test_unknown_target_marks_nothing() {
        let mut statuses = parse_ps_output(SAMPLE);
        mark_relatives(&mut statuses, 999);
        assert!(statuses.iter().all(|s| s.mark == ProcessMark::None));
    }
}
