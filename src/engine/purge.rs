//! Idle expiry and pressure-driven LRU eviction.

use super::conn::{self, ConnStatus};
use super::NatEngine;
use crate::host::HostCallbacks;
use crate::logger::{self, BreadcrumbFlags};
use crate::packet::FiveTuple;

impl<H: HostCallbacks> NatEngine<H> {
    /// Harvest closed flows, expire idle ones, and under socket pressure
    /// evict the least-recently-active flows down to the purge target.
    /// This is the only place flows are actually freed.
    pub fn purge_expired(&mut self, now: u64) {
        let expired: Vec<FiveTuple> = self
            .table
            .iter()
            .filter_map(|(tuple, conn)| {
                let timeout = conn::idle_timeout_secs(tuple.proto);
                (conn.status == ConnStatus::Closed || now >= conn.tstamp + timeout)
                    .then_some(*tuple)
            })
            .collect();
        for tuple in &expired {
            logger::breadcrumb(BreadcrumbFlags::PURGE, format!("expiring {tuple}"));
            self.destroy_conn(tuple);
        }

        if self.num_open_socks >= self.max_open_sockets {
            let mut to_purge = self.num_open_socks.saturating_sub(self.purge_target);
            if to_purge == 0 {
                return;
            }
            logger::breadcrumb(
                BreadcrumbFlags::PURGE,
                format!("socket pressure, force purging {to_purge} flows"),
            );
            let mut by_age: Vec<(u64, FiveTuple)> = self
                .table
                .iter()
                .map(|(tuple, conn)| (conn.tstamp, *tuple))
                .collect();
            by_age.sort_unstable_by_key(|(tstamp, _)| *tstamp);
            for (_, tuple) in by_age {
                if to_purge == 0 {
                    break;
                }
                self.destroy_conn(&tuple);
                to_purge -= 1;
            }
        }
    }
}
