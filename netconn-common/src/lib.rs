#![cfg_attr(not(test), no_std)]

pub const BATCH_SIZE: usize = 4;

// metadata bits
pub const CONN_TYPE_TCP: u32 = 1;
pub const CONN_V6: u32 = 1 << 1;

pub const CONN_ASSURED: u32 = 1;

pub const DIRECTION_UNKNOWN: u8 = 0;
pub const DIRECTION_INCOMING: u8 = 1;
pub const DIRECTION_OUTGOING: u8 = 2;

pub const TCP_ESTABLISHED: u16 = 1;
pub const TCP_CLOSE: u16 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnType {
    Tcp,
    Udp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnFamily {
    V4,
    V6,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ConnTuple {
    pub saddr_h: u64,
    pub saddr_l: u64,
    pub daddr_h: u64,
    pub daddr_l: u64,
    pub sport: u16,
    pub dport: u16,
    pub netns: u32,
    pub pid: u32,
    pub metadata: u32,
}

impl ConnTuple {
    pub fn conn_type(&self) -> ConnType {
        if self.metadata & CONN_TYPE_TCP != 0 {
            ConnType::Tcp
        } else {
            ConnType::Udp
        }
    }

    pub fn family(&self) -> ConnFamily {
        if self.metadata & CONN_V6 != 0 {
            ConnFamily::V6
        } else {
            ConnFamily::V4
        }
    }

    /// Key of the TCP stats table, which is not keyed by pid.
    pub fn without_pid(&self) -> ConnTuple {
        ConnTuple { pid: 0, ..*self }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ConnStats {
    pub sent_bytes: u64,
    pub recv_bytes: u64,
    pub timestamp: u64,
    pub flags: u32,
    pub cookie: u32,
    pub sent_packets: u64,
    pub recv_packets: u64,
    pub direction: u8,
    pub _pad: [u8; 7],
}

impl ConnStats {
    pub fn is_assured(&self) -> bool {
        self.flags & CONN_ASSURED != 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct TcpStats {
    pub rtt: u32,
    pub rtt_var: u32,
    pub retransmits: u32,
    pub state_transitions: u16,
    pub _pad: u16,
}

impl TcpStats {
    pub fn reached(&self, state: u16) -> bool {
        (self.state_transitions >> state) & 1 == 1
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Conn {
    pub tup: ConnTuple,
    pub conn_stats: ConnStats,
    pub tcp_stats: TcpStats,
}

// filled c0..c3 in order; once full, copied to the perf buffer, then len is
// reset and id bumped
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Batch {
    pub c0: Conn,
    pub c1: Conn,
    pub c2: Conn,
    pub c3: Conn,
    pub len: u16,
    pub _pad: [u8; 6],
    pub id: u64,
}

impl Batch {
    /// Panics if `index` is outside the batch: the userspace mirror no longer
    /// matches the kernel struct.
    pub fn slot(&self, index: usize) -> &Conn {
        match index {
            0 => &self.c0,
            1 => &self.c1,
            2 => &self.c2,
            3 => &self.c3,
            _ => panic!("batch size is out of sync: slot {} requested", index),
        }
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Conn {
        match index {
            0 => &mut self.c0,
            1 => &mut self.c1,
            2 => &mut self.c2,
            3 => &mut self.c3,
            _ => panic!("batch size is out of sync: slot {} requested", index),
        }
    }
}

const _: () = assert!(core::mem::size_of::<ConnTuple>() == 48);
const _: () = assert!(core::mem::size_of::<ConnStats>() == 56);
const _: () = assert!(core::mem::size_of::<TcpStats>() == 16);
const _: () = assert!(core::mem::size_of::<Conn>() == 120);
const _: () = assert!(core::mem::size_of::<Batch>() == 120 * BATCH_SIZE + 16);

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ConnTuple {}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for ConnStats {}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for TcpStats {}

#[cfg(feature = "userspace")]
unsafe impl aya::Pod for Batch {}
