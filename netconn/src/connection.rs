use std::{
    fmt, fs,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    path::Path,
    str::FromStr,
};

use netconn_common::{
    ConnFamily, ConnStats, ConnTuple, ConnType, TcpStats, CONN_TYPE_TCP, CONN_V6,
    DIRECTION_INCOMING, DIRECTION_OUTGOING, TCP_CLOSE, TCP_ESTABLISHED,
};
use tracing::debug;

const DEFAULT_EPHEMERAL_RANGE: EphemeralRange = EphemeralRange {
    low: 32768,
    high: 60999,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Incoming => write!(f, "incoming"),
            Direction::Outgoing => write!(f, "outgoing"),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatCounters {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub retransmits: u32,
    pub tcp_established: u32,
    pub tcp_closed: u32,
}

// a tuple almost always maps to a single socket
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatCountersByCookie(Vec<(u32, StatCounters)>);

impl StatCountersByCookie {
    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    pub fn get(&self, cookie: u32) -> Option<StatCounters> {
        self.0
            .iter()
            .find(|(c, _)| *c == cookie)
            .map(|(_, counters)| *counters)
    }

    pub fn put(&mut self, cookie: u32, counters: StatCounters) {
        match self.0.iter_mut().find(|(c, _)| *c == cookie) {
            Some(entry) => entry.1 = counters,
            None => self.0.push((cookie, counters)),
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn total(&self) -> StatCounters {
        self.0
            .iter()
            .fold(StatCounters::default(), |mut acc, (_, c)| {
                acc.sent_bytes += c.sent_bytes;
                acc.recv_bytes += c.recv_bytes;
                acc.sent_packets += c.sent_packets;
                acc.recv_packets += c.recv_packets;
                acc.retransmits += c.retransmits;
                acc.tcp_established += c.tcp_established;
                acc.tcp_closed += c.tcp_closed;
                acc
            })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStats {
    pub pid: u32,
    pub netns: u32,
    pub source: IpAddr,
    pub dest: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub sport_is_ephemeral: bool,
    pub monotonic: StatCountersByCookie,
    pub last_update_epoch: u64,
    pub is_assured: bool,
    pub conn_type: ConnType,
    pub family: ConnFamily,
    pub direction: Direction,
    pub rtt: u32,
    pub rtt_var: u32,
}

impl ConnectionStats {
    pub fn tuple(&self) -> ConnTuple {
        let (saddr_l, saddr_h) = to_low_high(self.source);
        let (daddr_l, daddr_h) = to_low_high(self.dest);
        let mut metadata = match self.family {
            ConnFamily::V4 => 0,
            ConnFamily::V6 => CONN_V6,
        };
        if self.conn_type == ConnType::Tcp {
            metadata |= CONN_TYPE_TCP;
        }
        ConnTuple {
            saddr_h,
            saddr_l,
            daddr_h,
            daddr_l,
            sport: self.sport,
            dport: self.dport,
            netns: self.netns,
            pid: self.pid,
            metadata,
        }
    }
}

impl fmt::Display for ConnectionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.conn_type {
            ConnType::Tcp => "tcp",
            ConnType::Udp => "udp",
        };
        write!(
            f,
            "[{}] pid={} {}:{} -> {}:{} ({})",
            proto, self.pid, self.source, self.sport, self.dest, self.dport, self.direction
        )?;
        if self.sport_is_ephemeral {
            write!(f, " ephemeral")?;
        }
        if self.is_assured {
            write!(f, " assured")?;
        }
        if self.conn_type == ConnType::Tcp {
            write!(f, " rtt={}us/{}us", self.rtt, self.rtt_var)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EphemeralRange {
    pub low: u16,
    pub high: u16,
}

impl EphemeralRange {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }

    /// Falls back to the Linux default when procfs cannot be read.
    pub fn from_procfs(proc_root: &Path) -> Self {
        let path = proc_root.join("sys/net/ipv4/ip_local_port_range");
        match fs::read_to_string(&path) {
            Ok(contents) => contents.parse().unwrap_or_else(|e| {
                debug!("ignoring {}: {}", path.display(), e);
                DEFAULT_EPHEMERAL_RANGE
            }),
            Err(e) => {
                debug!("cannot read {}: {}", path.display(), e);
                DEFAULT_EPHEMERAL_RANGE
            }
        }
    }
}

impl Default for EphemeralRange {
    fn default() -> Self {
        DEFAULT_EPHEMERAL_RANGE
    }
}

impl FromStr for EphemeralRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s
            .split(|c: char| c == '-' || c.is_whitespace())
            .filter(|p| !p.is_empty());
        let (low, high) = match (parts.next(), parts.next(), parts.next()) {
            (Some(low), Some(high), None) => (low, high),
            _ => return Err(format!("invalid port range: {:?}", s)),
        };
        let low: u16 = low.parse().map_err(|e| format!("invalid low port: {}", e))?;
        let high: u16 = high.parse().map_err(|e| format!("invalid high port: {}", e))?;
        if low > high {
            return Err(format!("empty port range: {}-{}", low, high));
        }
        Ok(EphemeralRange { low, high })
    }
}

pub fn populate_conn_stats(
    t: &ConnTuple,
    s: &ConnStats,
    ephemeral: &EphemeralRange,
) -> ConnectionStats {
    let family = t.family();
    let mut monotonic = StatCountersByCookie::with_capacity(3);
    monotonic.put(
        s.cookie,
        StatCounters {
            sent_bytes: s.sent_bytes,
            recv_bytes: s.recv_bytes,
            sent_packets: s.sent_packets,
            recv_packets: s.recv_packets,
            ..Default::default()
        },
    );

    ConnectionStats {
        pid: t.pid,
        netns: t.netns,
        source: address(family, t.saddr_l, t.saddr_h),
        dest: address(family, t.daddr_l, t.daddr_h),
        sport: t.sport,
        dport: t.dport,
        sport_is_ephemeral: ephemeral.contains(t.sport),
        monotonic,
        last_update_epoch: s.timestamp,
        is_assured: s.is_assured(),
        conn_type: t.conn_type(),
        family,
        direction: direction(s.direction),
        rtt: 0,
        rtt_var: 0,
    }
}

pub fn update_tcp_stats(conn: &mut ConnectionStats, cookie: u32, tcp: &TcpStats) {
    if conn.conn_type != ConnType::Tcp {
        return;
    }

    let mut m = conn.monotonic.get(cookie).unwrap_or_default();
    m.retransmits = tcp.retransmits;
    m.tcp_established = tcp.reached(TCP_ESTABLISHED) as u32;
    m.tcp_closed = tcp.reached(TCP_CLOSE) as u32;
    conn.monotonic.put(cookie, m);
    conn.rtt = tcp.rtt;
    conn.rtt_var = tcp.rtt_var;
}

// The kernel heuristic leaves some sockets unclassified; those are reported
// as outgoing.
fn direction(raw: u8) -> Direction {
    match raw {
        DIRECTION_INCOMING => Direction::Incoming,
        DIRECTION_OUTGOING => Direction::Outgoing,
        _ => Direction::Outgoing,
    }
}

fn address(family: ConnFamily, low: u64, high: u64) -> IpAddr {
    match family {
        ConnFamily::V4 => IpAddr::V4(Ipv4Addr::from((low as u32).to_le_bytes())),
        ConnFamily::V6 => {
            let mut octets = [0u8; 16];
            octets[..8].copy_from_slice(&high.to_le_bytes());
            octets[8..].copy_from_slice(&low.to_le_bytes());
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

fn to_low_high(addr: IpAddr) -> (u64, u64) {
    match addr {
        IpAddr::V4(v4) => (u32::from_le_bytes(v4.octets()) as u64, 0),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut high = [0u8; 8];
            let mut low = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            low.copy_from_slice(&octets[8..]);
            (u64::from_le_bytes(low), u64::from_le_bytes(high))
        }
    }
}
