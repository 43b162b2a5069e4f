// Known peers, exchanged through GADD / RADD

use std::collections::HashMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use tokio::net::lookup_host;
use uuid::Uuid;

use crate::core::now;
use crate::network::AddressPayload;

/// A peer we have seen, and when we last saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub node_identifier: Uuid,
    pub time_stamp: DateTime<Utc>,
    pub supported_services: BigUint,
    pub ip_address: String,
    pub port: u16,
}

impl PeerRecord {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }

    /// Resolve the record's address without blocking the runtime
    pub async fn resolve(&self) -> Option<SocketAddr> {
        match lookup_host((self.ip_address.as_str(), self.port)).await {
            Ok(mut addrs) => addrs.next(),
            Err(e) => {
                log::debug!("Could not resolve {}: {}", self.endpoint(), e);
                None
            }
        }
    }
}

impl From<AddressPayload> for PeerRecord {
    fn from(payload: AddressPayload) -> Self {
        Self {
            node_identifier: payload.node_identifier,
            time_stamp: payload.timestamp,
            supported_services: payload.services,
            ip_address: payload.ip_address,
            port: payload.port,
        }
    }
}

impl From<&PeerRecord> for AddressPayload {
    fn from(record: &PeerRecord) -> Self {
        Self {
            node_identifier: record.node_identifier,
            timestamp: record.time_stamp,
            services: record.supported_services.clone(),
            ip_address: record.ip_address.clone(),
            port: record.port,
        }
    }
}

/// Bounded set of peer records.
///
/// At most one record per node identifier and per `ip:port`; when full the
/// least recently seen record goes first. Our own identifier is never stored.
#[derive(Debug)]
pub struct PeerDirectory {
    local_id: Uuid,
    limit: usize,
    records: HashMap<Uuid, PeerRecord>,
}

impl PeerDirectory {
    pub fn new(local_id: Uuid, limit: usize) -> Self {
        Self {
            local_id,
            limit,
            records: HashMap::new(),
        }
    }

    /// Insert or refresh a record. Returns whether the directory changed.
    pub fn add(&mut self, record: PeerRecord) -> bool {
        if record.node_identifier == self.local_id || self.limit == 0 {
            return false;
        }

        if let Some(existing) = self.records.get(&record.node_identifier) {
            if existing.time_stamp >= record.time_stamp {
                return false;
            }
            self.records.insert(record.node_identifier, record);
            return true;
        }

        let endpoint = record.endpoint();
        let same_endpoint = self
            .records
            .values()
            .find(|existing| existing.endpoint() == endpoint)
            .map(|existing| (existing.node_identifier, existing.time_stamp));
        if let Some((old_id, seen)) = same_endpoint {
            if seen >= record.time_stamp {
                return false;
            }
            self.records.remove(&old_id);
        }

        if self.records.len() >= self.limit {
            let Some(oldest) = self.oldest() else {
                return false;
            };
            if oldest.time_stamp >= record.time_stamp {
                return false;
            }
            let evicted = oldest.node_identifier;
            self.records.remove(&evicted);
            log::trace!("Evicted peer record {evicted}");
        }

        self.records.insert(record.node_identifier, record);
        true
    }

    /// Mark a peer as seen now
    pub fn touch(&mut self, node_identifier: &Uuid) {
        if let Some(record) = self.records.get_mut(node_identifier) {
            record.time_stamp = now();
        }
    }

    pub fn remove(&mut self, node_identifier: &Uuid) -> Option<PeerRecord> {
        self.records.remove(node_identifier)
    }

    pub fn get(&self, node_identifier: &Uuid) -> Option<&PeerRecord> {
        self.records.get(node_identifier)
    }

    /// Up to `count` records, most recently seen first
    pub fn records(&self, count: usize) -> Vec<PeerRecord> {
        let mut records: Vec<PeerRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| b.time_stamp.cmp(&a.time_stamp));
        records.truncate(count);
        records
    }

    pub fn address_payloads(&self, count: usize) -> Vec<AddressPayload> {
        self.records(count).iter().map(AddressPayload::from).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn oldest(&self) -> Option<&PeerRecord> {
        self.records.values().min_by_key(|record| record.time_stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(ip: &str, port: u16, age_secs: i64) -> PeerRecord {
        PeerRecord {
            node_identifier: Uuid::new_v4(),
            time_stamp: now() - Duration::seconds(age_secs),
            supported_services: BigUint::from(1u8),
            ip_address: ip.to_string(),
            port,
        }
    }

    #[test]
    fn test_ignores_own_identifier() {
        let local = Uuid::new_v4();
        let mut directory = PeerDirectory::new(local, 4);
        let mut own = record("127.0.0.1", 1, 0);
        own.node_identifier = local;

        assert!(!directory.add(own));
        assert!(directory.is_empty());
    }

    #[test]
    fn test_evicts_least_recently_seen() {
        let mut directory = PeerDirectory::new(Uuid::new_v4(), 2);
        let old = record("10.0.0.1", 1, 100);
        let mid = record("10.0.0.2", 1, 50);
        let fresh = record("10.0.0.3", 1, 0);

        assert!(directory.add(old.clone()));
        assert!(directory.add(mid.clone()));
        assert!(directory.add(fresh.clone()));

        assert_eq!(directory.len(), 2);
        assert!(directory.get(&old.node_identifier).is_none());
        assert!(directory.get(&fresh.node_identifier).is_some());

        let stale = record("10.0.0.4", 1, 1000);
        assert!(!directory.add(stale));
        assert_eq!(directory.len(), 2);
    }

    #[test]
    fn test_same_endpoint_replaced_by_newer() {
        let mut directory = PeerDirectory::new(Uuid::new_v4(), 8);
        let old = record("10.0.0.1", 7400, 60);
        let restarted = record("10.0.0.1", 7400, 0);

        directory.add(old.clone());
        assert!(directory.add(restarted.clone()));
        assert_eq!(directory.len(), 1);
        assert!(directory.get(&restarted.node_identifier).is_some());

        assert!(!directory.add(old));
    }

    #[test]
    fn test_same_identifier_keeps_newest() {
        let mut directory = PeerDirectory::new(Uuid::new_v4(), 8);
        let first = record("10.0.0.1", 1, 30);
        let mut moved = first.clone();
        moved.ip_address = "10.0.0.9".to_string();
        moved.time_stamp = now();

        directory.add(first.clone());
        assert!(directory.add(moved.clone()));
        assert_eq!(directory.get(&first.node_identifier), Some(&moved));
        assert!(!directory.add(first));
    }

    #[test]
    fn test_records_most_recent_first() {
        let mut directory = PeerDirectory::new(Uuid::new_v4(), 8);
        for (i, age) in [30, 10, 20].into_iter().enumerate() {
            directory.add(record(&format!("10.0.0.{i}"), 1, age));
        }

        let records = directory.records(2);
        assert_eq!(records.len(), 2);
        assert!(records[0].time_stamp > records[1].time_stamp);
        assert_eq!(records[0].ip_address, "10.0.0.1");
    }

    #[test]
    fn test_payload_conversion() {
        let original = record("172.16.0.5", 9000, 5);
        let payload = AddressPayload::from(&original);
        assert_eq!(PeerRecord::from(payload), original);
    }

    #[tokio::test]
    async fn test_resolve() {
        let literal = record("172.16.0.5", 9000, 5);
        assert_eq!(literal.resolve().await, Some("172.16.0.5:9000".parse().unwrap()));

        let malformed = record("not an address", 9000, 5);
        assert_eq!(malformed.resolve().await, None);
    }

    #[test]
    fn test_touch_refreshes() {
        let mut directory = PeerDirectory::new(Uuid::new_v4(), 8);
        let old = record("10.0.0.1", 1, 600);
        directory.add(old.clone());
        directory.touch(&old.node_identifier);
        assert!(directory.get(&old.node_identifier).unwrap().time_stamp > old.time_stamp);
    }
}
