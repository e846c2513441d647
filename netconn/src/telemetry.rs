use std::sync::{
    atomic::{AtomicI64, AtomicU64, Ordering},
    RwLock,
};

use metrics::gauge;
use netconn_common::{ConnFamily, ConnType};

use crate::connection::ConnectionStats;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnCounts {
    pub tcp4: i64,
    pub tcp6: i64,
    pub udp4: i64,
    pub udp6: i64,
}

impl ConnCounts {
    pub fn add(&mut self, conn: &ConnectionStats) {
        *self.slot(conn) += 1;
    }

    pub fn remove(&mut self, conn: &ConnectionStats) {
        *self.slot(conn) -= 1;
    }

    fn slot(&mut self, conn: &ConnectionStats) -> &mut i64 {
        match (conn.conn_type, conn.family) {
            (ConnType::Tcp, ConnFamily::V4) => &mut self.tcp4,
            (ConnType::Tcp, ConnFamily::V6) => &mut self.tcp6,
            (ConnType::Udp, ConnFamily::V4) => &mut self.udp4,
            (ConnType::Udp, ConnFamily::V6) => &mut self.udp6,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub conns: ConnCounts,
    pub pid_collisions: i64,
    pub closed_conn_polling_received: u64,
    pub closed_conn_polling_lost: u64,
}

// conns is replaced as a whole at the end of each scan
#[derive(Debug, Default)]
pub struct Telemetry {
    conns: RwLock<ConnCounts>,
    pid_collisions: AtomicI64,
    perf_received: AtomicU64,
    perf_lost: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn assign_conns(&self, counts: ConnCounts) {
        *self.conns.write().unwrap_or_else(|e| e.into_inner()) = counts;
    }

    pub(crate) fn remove_connection(&self, conn: &ConnectionStats) {
        self.conns
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(conn);
    }

    pub(crate) fn pid_collision(&self) {
        self.pid_collisions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn perf_events(&self, received: u64, lost: u64) {
        self.perf_received.fetch_add(received, Ordering::Relaxed);
        self.perf_lost.fetch_add(lost, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            conns: *self.conns.read().unwrap_or_else(|e| e.into_inner()),
            pid_collisions: self.pid_collisions.load(Ordering::Relaxed),
            closed_conn_polling_received: self.perf_received.load(Ordering::Relaxed),
            closed_conn_polling_lost: self.perf_lost.load(Ordering::Relaxed),
        }
    }
}

pub fn publish(snapshot: &TelemetrySnapshot) {
    gauge!("netconn_tcp_conns", snapshot.conns.tcp4 as f64, "family" => "v4");
    gauge!("netconn_tcp_conns", snapshot.conns.tcp6 as f64, "family" => "v6");
    gauge!("netconn_udp_conns", snapshot.conns.udp4 as f64, "family" => "v4");
    gauge!("netconn_udp_conns", snapshot.conns.udp6 as f64, "family" => "v6");
    gauge!("netconn_pid_collisions", snapshot.pid_collisions as f64);
    gauge!(
        "netconn_closed_conn_polling_received",
        snapshot.closed_conn_polling_received as f64
    );
    gauge!(
        "netconn_closed_conn_polling_lost",
        snapshot.closed_conn_polling_lost as f64
    );
}
