use std::collections::HashMap as StdHashMap;

use netconn_common::{Batch, BATCH_SIZE};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::{
    connection::{populate_conn_stats, update_tcp_stats, ConnectionStats, EphemeralRange},
    error::Error,
    maps::KernelMap,
};

pub const DEFAULT_EXPIRED_STATE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct BatchState {
    offset: usize,
    updated: Instant,
}

#[derive(Debug, Default)]
struct PerCpuState {
    // batch id -> records already handed out by the periodic path
    processed: StdHashMap<u64, BatchState>,
}

pub struct BatchManager<B> {
    batches: B,
    state_by_cpu: Vec<PerCpuState>,
    expired_state_interval: Duration,
    ephemeral: EphemeralRange,
}

impl<B: KernelMap<u32, Batch>> BatchManager<B> {
    pub fn new(
        mut batches: B,
        num_cpus: usize,
        expired_state_interval: Duration,
        ephemeral: EphemeralRange,
    ) -> Result<Self, Error> {
        if num_cpus == 0 {
            return Err(Error::Fault("no cpus to track batches for".into()));
        }
        for cpu in 0..num_cpus as u32 {
            batches.update(&cpu, &Batch::default())?;
        }

        Ok(BatchManager {
            batches,
            state_by_cpu: (0..num_cpus).map(|_| PerCpuState::default()).collect(),
            expired_state_interval,
            ephemeral,
        })
    }

    pub fn num_cpus(&self) -> usize {
        self.state_by_cpu.len()
    }

    pub fn drain_full(&mut self, cpu: usize, batch: &Batch, out: &mut Vec<ConnectionStats>) {
        let ephemeral = self.ephemeral;
        let state = match self.state_by_cpu.get_mut(cpu) {
            Some(state) => state,
            None => {
                warn!(
                    "batch for cpu {} dropped, only {} cpus configured",
                    cpu,
                    self.state_by_cpu.len()
                );
                return;
            }
        };

        let start = state.processed.get(&batch.id).map_or(0, |s| s.offset);
        extract_into(out, batch, start, BATCH_SIZE, &ephemeral);
        state.processed.remove(&batch.id);
    }

    /// Panics if `cpu` is outside the configured range.
    pub fn drain_pending(&mut self, cpu: usize, now: Instant, out: &mut Vec<ConnectionStats>) {
        assert!(
            cpu < self.state_by_cpu.len(),
            "cpu {} outside the {} configured cpus",
            cpu,
            self.state_by_cpu.len()
        );

        let batch = match self.batches.lookup(&(cpu as u32)) {
            Ok(Some(batch)) => batch,
            Ok(None) => return,
            Err(e) => {
                debug!("failed to read pending batch for cpu {}: {}", cpu, e);
                return;
            }
        };

        let len = batch.len as usize;
        if len == 0 {
            return;
        }

        let state = &mut self.state_by_cpu[cpu];
        let start = state.processed.get(&batch.id).map_or(0, |s| s.offset);
        extract_into(out, &batch, start, len, &self.ephemeral);
        // refreshed even when nothing was new: the partial batch still exists
        state.processed.insert(
            batch.id,
            BatchState {
                offset: len,
                updated: now,
            },
        );
    }

    pub fn pending_conns(&mut self, now: Instant, out: &mut Vec<ConnectionStats>) {
        for cpu in 0..self.state_by_cpu.len() {
            self.drain_pending(cpu, now, out);
        }
        self.evict_stale(now);
    }

    pub fn evict_stale(&mut self, now: Instant) {
        let interval = self.expired_state_interval;
        for (cpu, state) in self.state_by_cpu.iter_mut().enumerate() {
            state.processed.retain(|id, s| {
                let keep = now.saturating_duration_since(s.updated) < interval;
                if !keep {
                    trace!("evicting idle state for batch {} on cpu {}", id, cpu);
                }
                keep
            });
        }
    }

    #[cfg(test)]
    fn offset(&self, cpu: usize, id: u64) -> Option<usize> {
        self.state_by_cpu[cpu].processed.get(&id).map(|s| s.offset)
    }
}

fn extract_into(
    out: &mut Vec<ConnectionStats>,
    batch: &Batch,
    start: usize,
    end: usize,
    ephemeral: &EphemeralRange,
) {
    assert!(
        end <= BATCH_SIZE,
        "batch size is out of sync: {} records claimed, capacity {}",
        end,
        BATCH_SIZE
    );
    if start >= end {
        return;
    }

    for i in start..end {
        let ct = batch.slot(i);
        let mut conn = populate_conn_stats(&ct.tup, &ct.conn_stats, ephemeral);
        update_tcp_stats(&mut conn, ct.conn_stats.cookie, &ct.tcp_stats);
        out.push(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maps::MemoryMap;
    use netconn_common::{Conn, CONN_TYPE_TCP};

    fn batch(id: u64, len: u16) -> Batch {
        let mut b = Batch {
            id,
            len,
            ..Default::default()
        };
        for i in 0..BATCH_SIZE {
            let slot = b.slot_mut(i);
            *slot = Conn::default();
            slot.tup.pid = (id * 100 + i as u64) as u32;
            slot.tup.metadata = CONN_TYPE_TCP;
            slot.conn_stats.cookie = i as u32;
            slot.tcp_stats.retransmits = 1;
        }
        b
    }

    fn pids(conns: &[ConnectionStats]) -> Vec<u32> {
        conns.iter().map(|c| c.pid).collect()
    }

    fn manager(cpus: usize) -> (MemoryMap<u32, Batch>, BatchManager<MemoryMap<u32, Batch>>) {
        let kernel = MemoryMap::new();
        let mgr = BatchManager::new(
            kernel.clone(),
            cpus,
            DEFAULT_EXPIRED_STATE_INTERVAL,
            EphemeralRange::default(),
        )
        .unwrap();
        (kernel, mgr)
    }

    #[test]
    fn seeds_empty_batches() {
        let (kernel, mgr) = manager(4);
        assert_eq!(mgr.num_cpus(), 4);
        assert_eq!(kernel.len(), 4);
        assert_eq!(kernel.get(&3), Some(Batch::default()));
    }

    #[test]
    fn zero_cpus_rejected() {
        let kernel: MemoryMap<u32, Batch> = MemoryMap::new();
        let err = BatchManager::new(
            kernel.clone(),
            0,
            DEFAULT_EXPIRED_STATE_INTERVAL,
            EphemeralRange::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Fault(_)));
        assert_eq!(kernel.len(), 0);
    }

    #[test]
    fn full_batch_from_scratch() {
        let (_, mut mgr) = manager(2);
        let mut out = Vec::new();
        mgr.drain_full(1, &batch(3, BATCH_SIZE as u16), &mut out);
        assert_eq!(pids(&out), vec![300, 301, 302, 303]);
        assert_eq!(out[0].monotonic.get(0).unwrap().retransmits, 1);
    }

    #[test]
    fn pending_then_nothing_new() {
        let (kernel, mut mgr) = manager(1);
        kernel.insert(0, batch(5, 2));
        let now = Instant::now();

        let mut out = Vec::new();
        mgr.drain_pending(0, now, &mut out);
        assert_eq!(pids(&out), vec![500, 501]);

        out.clear();
        mgr.drain_pending(0, now, &mut out);
        assert!(out.is_empty());
        assert_eq!(mgr.offset(0, 5), Some(2));
    }

    #[test]
    fn pending_picks_up_new_writes() {
        let (kernel, mut mgr) = manager(1);
        let now = Instant::now();
        let mut out = Vec::new();

        kernel.insert(0, batch(5, 1));
        mgr.drain_pending(0, now, &mut out);
        kernel.insert(0, batch(5, 3));
        mgr.drain_pending(0, now, &mut out);
        assert_eq!(pids(&out), vec![500, 501, 502]);
    }

    #[test]
    fn empty_current_batch_is_skipped() {
        let (_, mut mgr) = manager(2);
        let mut out = Vec::new();
        mgr.pending_conns(Instant::now(), &mut out);
        assert!(out.is_empty());
        assert_eq!(mgr.offset(0, 0), None);
    }

    #[test]
    fn full_batch_supersedes_partial_bookkeeping() {
        let (kernel, mut mgr) = manager(1);
        kernel.insert(0, batch(7, 2));

        let mut out = Vec::new();
        mgr.drain_pending(0, Instant::now(), &mut out);
        assert_eq!(mgr.offset(0, 7), Some(2));

        out.clear();
        mgr.drain_full(0, &batch(7, BATCH_SIZE as u16), &mut out);
        assert_eq!(pids(&out), vec![702, 703]);
        assert_eq!(mgr.offset(0, 7), None);
    }

    #[test]
    fn redundant_full_after_complete_pending() {
        let (kernel, mut mgr) = manager(1);
        kernel.insert(0, batch(9, BATCH_SIZE as u16));

        let mut out = Vec::new();
        mgr.drain_pending(0, Instant::now(), &mut out);
        assert_eq!(out.len(), BATCH_SIZE);

        out.clear();
        mgr.drain_full(0, &batch(9, BATCH_SIZE as u16), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn full_batch_for_unknown_cpu() {
        let (_, mut mgr) = manager(2);
        let mut out = Vec::new();
        mgr.drain_full(2, &batch(1, BATCH_SIZE as u16), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn stale_state_is_evicted() {
        let (kernel, mut mgr) = manager(2);
        let start = Instant::now();
        let mut out = Vec::new();

        kernel.insert(0, batch(1, 1));
        kernel.insert(1, batch(1, 1));
        mgr.drain_pending(0, start, &mut out);
        mgr.drain_pending(1, start, &mut out);

        // only cpu 1 sees activity again
        let later = start + Duration::from_secs(30);
        mgr.drain_pending(1, later, &mut out);

        mgr.evict_stale(start + DEFAULT_EXPIRED_STATE_INTERVAL);
        assert_eq!(mgr.offset(0, 1), None);
        assert_eq!(mgr.offset(1, 1), Some(1));

        mgr.evict_stale(later + DEFAULT_EXPIRED_STATE_INTERVAL);
        assert_eq!(mgr.offset(1, 1), None);
    }

    #[test]
    fn lost_full_notification_is_evicted() {
        let (kernel, mut mgr) = manager(1);
        let start = Instant::now();
        let mut out = Vec::new();

        kernel.insert(0, batch(1, 2));
        mgr.pending_conns(start, &mut out);
        assert_eq!(mgr.offset(0, 1), Some(2));

        // batch 1 filled up but its perf event never arrived
        kernel.insert(0, batch(2, 1));
        let later = start + Duration::from_secs(10);
        out.clear();
        mgr.pending_conns(later, &mut out);
        assert_eq!(pids(&out), vec![200]);
        assert_eq!(mgr.offset(0, 1), Some(2));

        mgr.pending_conns(start + DEFAULT_EXPIRED_STATE_INTERVAL, &mut out);
        assert_eq!(mgr.offset(0, 1), None);
        assert_eq!(mgr.offset(0, 2), Some(1));
    }

    #[test]
    fn pull_never_evicts_what_it_just_touched() {
        let (kernel, mut mgr) = manager(1);
        kernel.insert(0, batch(4, 2));
        let start = Instant::now();
        let mut out = Vec::new();
        mgr.pending_conns(start, &mut out);

        let much_later = start + DEFAULT_EXPIRED_STATE_INTERVAL * 10;
        out.clear();
        mgr.pending_conns(much_later, &mut out);
        assert!(out.is_empty());
        assert_eq!(mgr.offset(0, 4), Some(2));
    }

    #[test]
    #[should_panic(expected = "batch size is out of sync")]
    fn malformed_batch_len() {
        let (kernel, mut mgr) = manager(1);
        kernel.insert(0, batch(1, BATCH_SIZE as u16 + 1));
        mgr.drain_pending(0, Instant::now(), &mut Vec::new());
    }

    #[test]
    #[should_panic(expected = "outside the 1 configured cpus")]
    fn pending_for_unknown_cpu() {
        let (_, mut mgr) = manager(1);
        mgr.drain_pending(1, Instant::now(), &mut Vec::new());
    }
}
