use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcUsage {
    pub pid: u32,
    pub ppid: u32,
    pub cpu_percent: f64,
    pub rss_bytes: u64,
}

/// Summed usage of a process and all of its descendants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeUsage {
    pub cpu: f64,
    pub mem: u64,
    pub total_cpu: f64,
    pub total_mem: u64,
    pub total_proc: usize,
}

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct ProcessTable {
    by_pid: HashMap<u32, ProcUsage>,
    children: HashMap<u32, Vec<u32>>,
}

impl ProcessTable {
    /// Parses `ps -A -o pid=,ppid=,pcpu=,rss=` output. Unparseable rows are skipped.
    pub fn parse(text: &str) -> Self {
        let mut table = ProcessTable::default();
        for row in text.lines() {
            let mut cols = row.split_whitespace();
            let (Some(pid), Some(ppid), Some(cpu), Some(rss)) =
                (cols.next(), cols.next(), cols.next(), cols.next())
            else {
                continue;
            };
            let (Ok(pid), Ok(ppid), Ok(cpu), Ok(rss_kb)) = (
                pid.parse::<u32>(),
                ppid.parse::<u32>(),
                cpu.parse::<f64>(),
                rss.parse::<u64>(),
            ) else {
                continue;
            };
            table.insert(ProcUsage {
                pid,
                ppid,
                cpu_percent: cpu,
                rss_bytes: rss_kb * 1024,
            });
        }
        table
    }

    fn insert(&mut self, usage: ProcUsage) {
        self.children.entry(usage.ppid).or_default().push(usage.pid);
        self.by_pid.insert(usage.pid, usage);
    }

    pub fn get(&self, pid: u32) -> Option<&ProcUsage> {
        self.by_pid.get(&pid)
    }

    /// `root` followed by every descendant, breadth first.
    pub fn tree(&self, root: u32) -> Vec<&ProcUsage> {
        let Some(root_usage) = self.by_pid.get(&root) else {
            return Vec::new();
        };
        let mut out = vec![root_usage];
        let mut cursor = 0;
        while cursor < out.len() {
            let pid = out[cursor].pid;
            cursor += 1;
            if let Some(kids) = self.children.get(&pid) {
                out.extend(kids.iter().filter_map(|k| self.by_pid.get(k)));
            }
        }
        out
    }

    pub fn tree_usage(&self, root: u32) -> Option<TreeUsage> {
        let tree = self.tree(root);
        let own = tree.first()?;
        Some(TreeUsage {
            cpu: own.cpu_percent,
            mem: own.rss_bytes,
            total_cpu: tree.iter().map(|p| p.cpu_percent).sum(),
            total_mem: tree.iter().map(|p| p.rss_bytes).sum(),
            total_proc: tree.len(),
        })
    }
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

/// Enumerates every process on the machine. `None` if `ps` is unavailable.
pub async fn snapshot() -> Option<ProcessTable> {
    let output = tokio::process::Command::new("ps")
        .args(["-A", "-o", "pid=,ppid=,pcpu=,rss="])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    Some(ProcessTable::parse(&String::from_utf8_lossy(&output.stdout)))
}
