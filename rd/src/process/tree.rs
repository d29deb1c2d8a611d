//! Process table snapshots and descendant discovery
//!
//! Everything here is a point-in-time view: pids can vanish or be recycled
//! between a snapshot and any action taken on it, so callers pair a pid with
//! its start time before acting on a stale snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tracing::debug;

use crate::config::ProcessConfig;

/// One process as seen in a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmdline: String,
    /// Seconds since the epoch
    pub start_time: u64,
}

impl ProcessInfo {
    /// Same pid and same start time, i.e. not a recycled pid
    pub fn same_process(&self, other: &ProcessInfo) -> bool {
        self.pid == other.pid && self.start_time == other.start_time
    }
}

/// Snapshot of all live processes with a parent -> children index
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: HashMap<u32, ProcessInfo>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTable {
    /// Read the OS process table (zombies and threads excluded)
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
        );

        let processes = system
            .processes()
            .values()
            .filter(|p| p.thread_kind().is_none())
            .filter(|p| p.status() != ProcessStatus::Zombie)
            .map(|p| ProcessInfo {
                pid: p.pid().as_u32(),
                parent: p.parent().map(|pp| pp.as_u32()),
                name: p.name().to_string_lossy().into_owned(),
                cmdline: p
                    .cmd()
                    .iter()
                    .map(|arg| arg.to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(" "),
                start_time: p.start_time(),
            });

        let table = Self::from_processes(processes);
        debug!(process_count = table.len(), "ProcessTable::snapshot: done");
        table
    }

    /// Build from an explicit process list
    pub fn from_processes(processes: impl IntoIterator<Item = ProcessInfo>) -> Self {
        let mut table = Self::default();
        for info in processes {
            if let Some(parent) = info.parent {
                table.children.entry(parent).or_default().push(info.pid);
            }
            table.processes.insert(info.pid, info);
        }
        for kids in table.children.values_mut() {
            kids.sort_unstable();
        }
        table
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    /// Whether `info` is still running as the same process (start time matches)
    pub fn is_alive(&self, info: &ProcessInfo) -> bool {
        self.get(info.pid).is_some_and(|live| live.same_process(info))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.processes.values()
    }

    /// All transitive descendants of `root`, parents before children
    ///
    /// The root itself is not included. Reverse the result for a
    /// children-first order.
    pub fn descendants(&self, root: u32) -> Vec<u32> {
        let mut order = Vec::new();
        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);

        while let Some(pid) = queue.pop_front() {
            for &child in self.children.get(&pid).into_iter().flatten() {
                if seen.insert(child) {
                    order.push(child);
                    queue.push_back(child);
                }
            }
        }
        order
    }

    /// Root plus descendants captured with identity for later sweeps
    pub fn capture(&self, root: u32) -> ProcessSnapshot {
        let descendants = self
            .descendants(root)
            .into_iter()
            .filter_map(|pid| self.get(pid).cloned())
            .collect();
        ProcessSnapshot {
            root: self.get(root).cloned(),
            descendants,
        }
    }
}

/// Identity-preserving capture of one process tree
#[derive(Debug, Clone, Default)]
pub struct ProcessSnapshot {
    pub root: Option<ProcessInfo>,
    /// Parents before children
    pub descendants: Vec<ProcessInfo>,
}

impl ProcessSnapshot {
    pub fn len(&self) -> usize {
        self.descendants.len() + usize::from(self.root.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.root.as_ref().is_some_and(|r| r.pid == pid) || self.descendants.iter().any(|d| d.pid == pid)
    }

    /// Children first, root last
    pub fn children_first(&self) -> Vec<&ProcessInfo> {
        self.descendants.iter().rev().chain(self.root.iter()).collect()
    }
}

/// Name/command-line signatures of browser automation processes
#[derive(Debug, Clone)]
pub struct AutomationSignature {
    driver_names: Vec<String>,
    browser_names: Vec<String>,
    automation_flags: Vec<String>,
}

impl AutomationSignature {
    pub fn new(driver_names: Vec<String>, browser_names: Vec<String>, automation_flags: Vec<String>) -> Self {
        let lower = |v: Vec<String>| v.into_iter().map(|s| s.to_lowercase()).collect();
        Self {
            driver_names: lower(driver_names),
            browser_names: lower(browser_names),
            automation_flags,
        }
    }

    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(
            config.driver_names.clone(),
            config.browser_names.clone(),
            config.automation_flags.clone(),
        )
    }

    /// Driver executable, or a browser started with an automation flag
    pub fn matches(&self, info: &ProcessInfo) -> bool {
        let name = normalize_name(&info.name);
        if self.driver_names.iter().any(|d| *d == name) {
            return true;
        }
        self.browser_names.iter().any(|b| *b == name)
            && self.automation_flags.iter().any(|flag| info.cmdline.contains(flag.as_str()))
    }
}

fn normalize_name(name: &str) -> String {
    let name = name.to_lowercase();
    name.strip_suffix(".exe").map(str::to_string).unwrap_or(name)
}

/// Whether a process started within `window` of now
pub fn started_within(info: &ProcessInfo, window: Duration) -> bool {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    now.saturating_sub(info.start_time) <= window.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_info(pid: u32, parent: Option<u32>, name: &str, cmdline: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            parent,
            name: name.to_string(),
            cmdline: cmdline.to_string(),
            start_time: 1_000 + pid as u64,
        }
    }

    fn sample_table() -> ProcessTable {
        // 1 -> 10 -> (20, 21) ; 21 -> 30 ; 2 unrelated
        ProcessTable::from_processes([
            proc_info(1, None, "robot", "python3 -m robot"),
            proc_info(10, Some(1), "chromedriver", "chromedriver --port=9515"),
            proc_info(20, Some(10), "chrome", "chrome --enable-automation"),
            proc_info(21, Some(10), "chrome", "chrome --type=renderer"),
            proc_info(30, Some(21), "chrome", "chrome --type=gpu"),
            proc_info(2, None, "sshd", "sshd -D"),
        ])
    }

    #[test]
    fn test_descendants_breadth_first() {
        let table = sample_table();
        assert_eq!(table.descendants(1), vec![10, 20, 21, 30]);
        assert_eq!(table.descendants(21), vec![30]);
        assert!(table.descendants(2).is_empty());
        assert!(table.descendants(999).is_empty());
    }

    #[test]
    fn test_descendants_tolerates_cycles() {
        let table = ProcessTable::from_processes([proc_info(5, Some(6), "a", ""), proc_info(6, Some(5), "b", "")]);
        assert_eq!(table.descendants(5), vec![6]);
    }

    #[test]
    fn test_capture_children_first() {
        let snapshot = sample_table().capture(10);
        assert_eq!(snapshot.len(), 4);
        let order: Vec<u32> = snapshot.children_first().iter().map(|p| p.pid).collect();
        assert_eq!(order, vec![30, 21, 20, 10]);
        assert!(snapshot.contains(30));
        assert!(!snapshot.contains(1));
    }

    #[test]
    fn test_is_alive_checks_start_time() {
        let table = sample_table();
        let original = table.get(20).cloned().unwrap();
        assert!(table.is_alive(&original));

        let recycled = ProcessInfo {
            start_time: original.start_time + 5,
            ..original
        };
        assert!(!table.is_alive(&recycled));
    }

    #[test]
    fn test_automation_signature() {
        let signature = AutomationSignature::from_config(&ProcessConfig::default());
        assert!(signature.matches(&proc_info(1, None, "chromedriver", "chromedriver")));
        assert!(signature.matches(&proc_info(1, None, "geckodriver.exe", "")));
        assert!(signature.matches(&proc_info(1, None, "chrome", "chrome --remote-debugging-port=0")));
        assert!(signature.matches(&proc_info(1, None, "firefox", "firefox --marionette")));
        assert!(!signature.matches(&proc_info(1, None, "chrome", "chrome https://example.com")));
        assert!(!signature.matches(&proc_info(1, None, "bash", "bash --headless")));
    }

    #[test]
    fn test_started_within() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let mut info = proc_info(1, None, "x", "");
        info.start_time = now - 30;
        assert!(started_within(&info, Duration::from_secs(600)));
        info.start_time = now - 3600;
        assert!(!started_within(&info, Duration::from_secs(600)));
    }

    #[test]
    fn test_snapshot_sees_current_process() {
        let table = ProcessTable::snapshot();
        assert!(table.contains(std::process::id()));
    }
}
