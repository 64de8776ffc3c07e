//! Per-op execution statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpStats {
    /// Times the implementation actually ran.
    pub count: u64,
    /// Times a cached result was used instead.
    pub cache_used: u64,
    /// Times the node was reached again after it was already evaluated in the
    /// same execution.
    pub already_executed: u64,
    pub total_time: Duration,
}

impl OpStats {
    pub fn average_time(&self) -> Option<Duration> {
        u32::try_from(self.count)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.total_time / n)
    }

    fn merge(&mut self, other: &OpStats) {
        self.count += other.count;
        self.cache_used += other.cache_used;
        self.already_executed += other.already_executed;
        self.total_time += other.total_time;
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecuteStats {
    ops: BTreeMap<String, OpStats>,
}

impl ExecuteStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, op: &str) -> &mut OpStats {
        self.ops.entry(op.to_string()).or_default()
    }

    pub fn record_run(&mut self, op: &str, elapsed: Duration) {
        let stats = self.entry(op);
        stats.count += 1;
        stats.total_time += elapsed;
    }

    pub fn record_cache_hit(&mut self, op: &str) {
        self.entry(op).cache_used += 1;
    }

    pub fn record_already_executed(&mut self, op: &str) {
        self.entry(op).already_executed += 1;
    }

    pub fn op(&self, op: &str) -> Option<&OpStats> {
        self.ops.get(op)
    }

    pub fn ops(&self) -> impl Iterator<Item = (&str, &OpStats)> {
        self.ops.iter().map(|(name, stats)| (name.as_str(), stats))
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn total_time(&self) -> Duration {
        self.ops.values().map(|s| s.total_time).sum()
    }

    pub fn merge(&mut self, other: &ExecuteStats) {
        for (name, stats) in &other.ops {
            self.entry(name).merge(stats);
        }
    }

    /// Ops sorted by total time, slowest first.
    pub fn summary(&self) -> Vec<(&str, &OpStats)> {
        let mut rows: Vec<_> = self.ops().collect();
        rows.sort_by(|a, b| b.1.total_time.cmp(&a.1.total_time).then(a.0.cmp(b.0)));
        rows
    }
}

impl fmt::Display for ExecuteStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{:<24} {:>6} {:>6} {:>6} {:>12}", "op", "runs", "cached", "again", "time")?;
        for (name, stats) in self.summary() {
            writeln!(
                f,
                "{:<24} {:>6} {:>6} {:>6} {:>12?}",
                name, stats.count, stats.cache_used, stats.already_executed, stats.total_time
            )?;
        }
        Ok(())
    }
}
