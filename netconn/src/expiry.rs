use netconn_common::ConnType;
use tokio::time::Duration;

use crate::connection::ConnectionStats;

#[derive(Clone, Copy, Debug)]
pub struct ExpiryPolicy {
    pub tcp: Duration,
    pub udp: Duration,
}

impl ExpiryPolicy {
    // kernel timestamps are monotonic ns, so age is taken against the newest
    // update of the scan
    pub fn expired<'a>(&self, conns: &'a [ConnectionStats]) -> Vec<&'a ConnectionStats> {
        let latest = match conns.iter().map(|c| c.last_update_epoch).max() {
            Some(latest) => latest,
            None => return Vec::new(),
        };

        conns
            .iter()
            .filter(|c| {
                let timeout = match c.conn_type {
                    ConnType::Tcp => self.tcp,
                    ConnType::Udp => self.udp,
                };
                latest.saturating_sub(c.last_update_epoch) > timeout.as_nanos() as u64
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{populate_conn_stats, EphemeralRange};
    use netconn_common::{ConnStats, ConnTuple, CONN_TYPE_TCP};

    const SEC: u64 = 1_000_000_000;

    fn conn(sport: u16, metadata: u32, timestamp: u64) -> ConnectionStats {
        let tuple = ConnTuple {
            sport,
            metadata,
            ..Default::default()
        };
        let stats = ConnStats {
            timestamp,
            ..Default::default()
        };
        populate_conn_stats(&tuple, &stats, &EphemeralRange::default())
    }

    #[test]
    fn timeouts_per_protocol() {
        let policy = ExpiryPolicy {
            tcp: Duration::from_secs(120),
            udp: Duration::from_secs(30),
        };
        let now = 1000 * SEC;
        let conns = vec![
            conn(1, CONN_TYPE_TCP, now),
            conn(2, CONN_TYPE_TCP, now - 60 * SEC),
            conn(3, CONN_TYPE_TCP, now - 121 * SEC),
            conn(4, 0, now - 20 * SEC),
            conn(5, 0, now - 31 * SEC),
        ];

        let ports: Vec<u16> = policy.expired(&conns).iter().map(|c| c.sport).collect();
        assert_eq!(ports, vec![3, 5]);
    }

    #[test]
    fn nothing_to_expire_in_empty_scan() {
        let policy = ExpiryPolicy {
            tcp: Duration::from_secs(1),
            udp: Duration::from_secs(1),
        };
        assert!(policy.expired(&[]).is_empty());
    }
}
