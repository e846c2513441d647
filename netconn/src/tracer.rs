use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use netconn_common::{Batch, ConnStats, ConnTuple, ConnType, TcpStats};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

use crate::{
    batch::BatchManager,
    closed::{CloseConsumer, ClosedConnHandler, Message},
    connection::{populate_conn_stats, update_tcp_stats, ConnectionStats, EphemeralRange},
    error::Error,
    maps::KernelMap,
    telemetry::{ConnCounts, Telemetry, TelemetrySnapshot},
};

#[derive(Clone, Copy, Debug)]
pub struct TracerConfig {
    pub pending_interval: tokio::time::Duration,
    pub expired_state_interval: tokio::time::Duration,
    pub ephemeral: EphemeralRange,
}

/// `C` is the live connection table, `S` the TCP stats table (keyed by tuple
/// with the pid zeroed) and `B` the per-CPU batch table.
pub struct Tracer<C, S, B> {
    conns: Mutex<C>,
    tcp_stats: Mutex<S>,
    closed: CloseConsumer<B>,
    telemetry: Arc<Telemetry>,
    ephemeral: EphemeralRange,
}

impl<C, S, B> Tracer<C, S, B>
where
    C: KernelMap<ConnTuple, ConnStats>,
    S: KernelMap<ConnTuple, TcpStats>,
    B: KernelMap<u32, Batch> + Send + 'static,
{
    pub fn new(
        conns: C,
        tcp_stats: S,
        batches: B,
        num_cpus: usize,
        config: TracerConfig,
    ) -> Result<Self, Error> {
        let manager = BatchManager::new(
            batches,
            num_cpus,
            config.expired_state_interval,
            config.ephemeral,
        )?;

        Ok(Tracer {
            conns: Mutex::new(conns),
            tcp_stats: Mutex::new(tcp_stats),
            closed: CloseConsumer::new(manager, config.pending_interval),
            telemetry: Arc::new(Telemetry::new()),
            ephemeral: config.ephemeral,
        })
    }

    pub fn batch_sender(&self) -> UnboundedSender<Message> {
        self.closed.sender()
    }

    pub fn start(&self, handler: ClosedConnHandler) {
        self.closed.start(handler);
    }

    pub async fn flush_pending(&self) {
        self.closed.flush_pending().await;
    }

    pub async fn stop(&self) {
        self.closed.stop().await;
    }

    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }

    pub fn telemetry_handle(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Appends every live connection accepted by `filter` to `buffer`.
    ///
    /// An iteration error aborts the scan; whatever was appended before it
    /// stays in `buffer` and the connection counts keep their previous value.
    pub fn get_connections(
        &self,
        buffer: &mut Vec<ConnectionStats>,
        filter: Option<&dyn Fn(&ConnectionStats) -> bool>,
    ) -> Result<(), Error> {
        let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        let tcp_stats = self.tcp_stats.lock().unwrap_or_else(|e| e.into_inner());

        // masked tuples that already received TCP stats in this scan
        let mut seen = HashSet::new();
        let mut counts = ConnCounts::default();

        for entry in conns.entries() {
            let (key, stats) = entry.map_err(|e| Error::Iteration(Box::new(e)))?;
            let mut conn = populate_conn_stats(&key, &stats, &self.ephemeral);
            counts.add(&conn);

            // rejected records must not claim the socket's tcp stats
            if let Some(filter) = filter {
                if !filter(&conn) {
                    continue;
                }
            }

            if let Some(tcp) = self.tcp_stats_for(&*tcp_stats, &key, &mut seen) {
                update_tcp_stats(&mut conn, stats.cookie, &tcp);
            }
            buffer.push(conn);
        }

        self.telemetry.assign_conns(counts);
        trace!("live scan: {:?}", counts);
        Ok(())
    }

    // Several tracked tuples can differ only by pid and still point at one
    // socket. Its retransmits and state transitions are reported on the first
    // of them only.
    fn tcp_stats_for(
        &self,
        tcp_stats: &S,
        tuple: &ConnTuple,
        seen: &mut HashSet<ConnTuple>,
    ) -> Option<TcpStats> {
        if tuple.conn_type() != ConnType::Tcp {
            return None;
        }

        let key = tuple.without_pid();
        let mut stats = match tcp_stats.lookup(&key) {
            Ok(Some(stats)) => stats,
            Ok(None) => return Some(TcpStats::default()),
            Err(e) => {
                debug!("tcp stats lookup failed: {}", e);
                return Some(TcpStats::default());
            }
        };

        if !seen.insert(key) {
            self.telemetry.pid_collision();
            stats.retransmits = 0;
            stats.state_transitions = 0;
        }
        Some(stats)
    }

    /// Returns [`Error::NotFound`] if the kernel already dropped `conn`; the
    /// close path owns it then.
    pub fn remove(&self, conn: &ConnectionStats) -> Result<(), Error> {
        let mut tuple = conn.tuple();

        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.delete(&tuple)?;
        self.telemetry.remove_connection(conn);
        drop(conns);

        tuple.pid = 0;
        let mut tcp_stats = self.tcp_stats.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = tcp_stats.delete(&tuple) {
            if !e.is_not_found() {
                debug!("failed to delete tcp stats for {}: {}", conn, e);
            }
        }
        Ok(())
    }
}
