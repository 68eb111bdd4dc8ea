//! # Endpoint Table
//!
//! The registry worker's authoritative endpoint state. Only the worker
//! touches it, so nothing here locks or awaits.
//!
//! ## Record Slots
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  EndpointRecord                                                         │
//! │                                                                         │
//! │   pending:   Option<AddOrUpdate(cfg) | Delete(cfg)>   accepted, unsent │
//! │   in_flight: Option<AddOrUpdate(cfg) | Delete(cfg)>   in the live batch│
//! │   confirmed: Option<cfg>                              acked + stored   │
//! │   registration: Option<Registration>                  immutable once set│
//! │                                                                         │
//! │   accept ──► pending ──select──► in_flight ──complete──► confirmed     │
//! │                 ▲                    │                                  │
//! │                 └──── reclaim ───────┘   (retryable / detached batch)  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The Dedup Group is every record carrying a registration and some config.
//! It must fit in one AddOrUpdateReport, so batch selection never splits it.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, error};

use discovery_core::format::{carries_registration, delete_report_endpoint_config};
use discovery_core::{
    EndpointConfig, EndpointConfigMap, EndpointId, Registration, MAX_DEDUP_GROUP_ENDPOINTS,
    MAX_ENDPOINTS_PER_ADD_OR_UPDATE_REPORT, MAX_ENDPOINTS_SIZE_IN_PAYLOAD,
};

use crate::error::RejectReason;

// =============================================================================
// Records
// =============================================================================

/// One queued or transmitting operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PendingOp {
    AddOrUpdate(EndpointConfig),
    /// Carries the DeleteReport config `{"endpointId": ...}`.
    Delete(EndpointConfig),
}

impl PendingOp {
    fn add_config(&self) -> Option<&EndpointConfig> {
        match self {
            PendingOp::AddOrUpdate(config) => Some(config),
            PendingOp::Delete(_) => None,
        }
    }

    fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete(_))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct EndpointRecord {
    registration: Option<Registration>,
    confirmed: Option<EndpointConfig>,
    pending: Option<PendingOp>,
    in_flight: Option<PendingOp>,
}

impl EndpointRecord {
    fn is_vacant(&self) -> bool {
        self.confirmed.is_none() && self.pending.is_none() && self.in_flight.is_none()
    }

    /// Most recent AddOrUpdate config: pending, then in flight, then confirmed.
    fn latest_config(&self) -> Option<&EndpointConfig> {
        self.pending
            .as_ref()
            .and_then(PendingOp::add_config)
            .or_else(|| self.in_flight.as_ref().and_then(PendingOp::add_config))
            .or(self.confirmed.as_ref())
    }

    fn has_delete(&self) -> bool {
        self.pending.as_ref().is_some_and(PendingOp::is_delete)
            || self.in_flight.as_ref().is_some_and(PendingOp::is_delete)
    }

    fn is_dedup_member(&self) -> bool {
        self.registration.is_some() && self.latest_config().is_some()
    }
}

/// Endpoints moved into flight by one selection.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    pub add_or_update: EndpointConfigMap,
    pub delete: EndpointConfigMap,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.add_or_update.is_empty() && self.delete.is_empty()
    }
}

/// Point-in-time view of the registry partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    pub pending_add_or_update: BTreeSet<EndpointId>,
    pub pending_delete: BTreeSet<EndpointId>,
    pub in_flight_add_or_update: BTreeSet<EndpointId>,
    pub in_flight_delete: BTreeSet<EndpointId>,
    pub confirmed: BTreeSet<EndpointId>,
    pub dedup_group: BTreeSet<EndpointId>,
}

// =============================================================================
// Endpoint Table
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct EndpointTable {
    records: BTreeMap<EndpointId, EndpointRecord>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn dedup_members(&self) -> impl Iterator<Item = (&EndpointId, &EndpointRecord)> {
        self.records.iter().filter(|(_, record)| record.is_dedup_member())
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Accepts an AddOrUpdate into the pending slot.
    ///
    /// Returns the other Dedup Group members queued again alongside it.
    pub fn accept_add_or_update(
        &mut self,
        endpoint_id: &str,
        registration: Option<Registration>,
        config: EndpointConfig,
    ) -> Result<Vec<EndpointId>, RejectReason> {
        if let Some(record) = self.records.get(endpoint_id) {
            if record.pending.as_ref().is_some_and(PendingOp::is_delete) {
                return Err(RejectReason::PendingDeletion(endpoint_id.to_string()));
            }
            if record.registration != registration {
                return Err(RejectReason::RegistrationChanged(endpoint_id.to_string()));
            }
            if record.pending.is_some() {
                return Err(RejectReason::PendingAddOrUpdate(endpoint_id.to_string()));
            }
        }

        if let Some(registration) = &registration {
            self.check_dedup_admission(endpoint_id, registration, &config)?;
        }

        let record = self.records.entry(endpoint_id.to_string()).or_default();
        record.registration = registration.clone();
        record.pending = Some(PendingOp::AddOrUpdate(config));

        let mut requeued = Vec::new();
        if registration.is_some() {
            for (id, member) in self.records.iter_mut() {
                if id == endpoint_id || member.registration.is_none() || member.pending.is_some() {
                    continue;
                }
                let copy = member
                    .in_flight
                    .as_ref()
                    .and_then(PendingOp::add_config)
                    .or(member.confirmed.as_ref())
                    .cloned();
                if let Some(copy) = copy {
                    member.pending = Some(PendingOp::AddOrUpdate(copy));
                    requeued.push(id.clone());
                }
            }
        }

        if !requeued.is_empty() {
            debug!(
                endpoint_id = %endpoint_id,
                requeued = requeued.len(),
                "Re-queued dedup group members"
            );
        }
        Ok(requeued)
    }

    fn check_dedup_admission(
        &self,
        endpoint_id: &str,
        registration: &Registration,
        config: &EndpointConfig,
    ) -> Result<(), RejectReason> {
        let members: Vec<(&EndpointId, &EndpointRecord)> =
            self.dedup_members().filter(|(id, _)| id.as_str() != endpoint_id).collect();

        if members.iter().any(|(_, m)| m.registration.as_ref() != Some(registration)) {
            return Err(RejectReason::SecondDedupGroup(endpoint_id.to_string()));
        }

        if members.len() + 1 > MAX_DEDUP_GROUP_ENDPOINTS {
            return Err(RejectReason::DedupGroupFull {
                max: MAX_DEDUP_GROUP_ENDPOINTS,
            });
        }

        let own_delete = self.records.get(endpoint_id).is_some_and(EndpointRecord::has_delete);
        let member_delete = self
            .records
            .iter()
            .filter(|(id, record)| id.as_str() != endpoint_id && record.registration.is_some())
            .find(|(_, record)| record.has_delete());
        if own_delete {
            return Err(RejectReason::DedupDeletionCollision(endpoint_id.to_string()));
        }
        if let Some((id, _)) = member_delete {
            return Err(RejectReason::DedupDeletionCollision(id.clone()));
        }

        let size = config.len()
            + members
                .iter()
                .filter_map(|(_, m)| m.latest_config())
                .map(EndpointConfig::len)
                .sum::<usize>();
        if size > MAX_ENDPOINTS_SIZE_IN_PAYLOAD {
            return Err(RejectReason::DedupGroupTooLarge {
                size,
                max: MAX_ENDPOINTS_SIZE_IN_PAYLOAD,
            });
        }

        Ok(())
    }

    /// Accepts a Delete into the pending slot.
    pub fn accept_delete(
        &mut self,
        endpoint_id: &str,
        registration: Option<Registration>,
    ) -> Result<(), RejectReason> {
        let Some(record) = self.records.get_mut(endpoint_id) else {
            return Err(RejectReason::NotRegistered(endpoint_id.to_string()));
        };

        if record.pending.as_ref().and_then(PendingOp::add_config).is_some() {
            return Err(RejectReason::PendingAddOrUpdate(endpoint_id.to_string()));
        }
        if record.confirmed.is_none() {
            return Err(RejectReason::NotRegistered(endpoint_id.to_string()));
        }
        if record.registration != registration {
            return Err(RejectReason::RegistrationChanged(endpoint_id.to_string()));
        }
        if record.registration.is_some() {
            return Err(RejectReason::DedupMember(endpoint_id.to_string()));
        }
        if record.pending.is_some() {
            return Err(RejectReason::PendingDeletion(endpoint_id.to_string()));
        }

        record.pending = Some(PendingOp::Delete(delete_report_endpoint_config(endpoint_id)));
        Ok(())
    }

    // =========================================================================
    // Batches
    // =========================================================================

    /// Returns abandoned in-flight ops to pending. An op whose endpoint got a
    /// newer pending op is dropped.
    pub fn reclaim_in_flight(&mut self) -> usize {
        let mut reclaimed = 0;
        for record in self.records.values_mut() {
            if let Some(op) = record.in_flight.take() {
                if record.pending.is_none() {
                    record.pending = Some(op);
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            debug!(reclaimed, "Returned in-flight endpoints to pending");
        }
        reclaimed
    }

    /// Moves the next batch from pending to in flight.
    ///
    /// Everything goes when the pending AddOrUpdate set fits one event.
    /// Otherwise the Dedup Group stays pending for a later batch of its own
    /// and the rest goes now.
    pub fn select_batch(&mut self) -> Option<Batch> {
        let (count, bytes) = self
            .records
            .values()
            .filter_map(|r| r.pending.as_ref().and_then(PendingOp::add_config))
            .fold((0usize, 0usize), |(n, b), c| (n + 1, b + c.len()));

        let fits_one_event = count <= MAX_ENDPOINTS_PER_ADD_OR_UPDATE_REPORT
            && bytes <= MAX_ENDPOINTS_SIZE_IN_PAYLOAD;

        let mut batch = self.take_pending(|record| {
            fits_one_event
                || record.registration.is_none()
                || record.pending.as_ref().is_some_and(PendingOp::is_delete)
        });
        if batch.is_empty() && !fits_one_event {
            batch = self.take_pending(|_| true);
        }

        if batch.is_empty() {
            return None;
        }
        if !fits_one_event {
            debug!(
                add_or_update = batch.add_or_update.len(),
                delete = batch.delete.len(),
                "Pending set exceeds one event, dedup group deferred"
            );
        }
        Some(batch)
    }

    /// Moves every pending op to in flight.
    pub fn take_all_pending(&mut self) -> Option<Batch> {
        let batch = self.take_pending(|_| true);
        (!batch.is_empty()).then_some(batch)
    }

    fn take_pending(&mut self, select: impl Fn(&EndpointRecord) -> bool) -> Batch {
        let mut batch = Batch::default();
        for (id, record) in self.records.iter_mut() {
            if record.pending.is_none() || record.in_flight.is_some() || !select(record) {
                continue;
            }
            if let Some(op) = record.pending.take() {
                match &op {
                    PendingOp::AddOrUpdate(config) => {
                        batch.add_or_update.insert(id.clone(), config.clone())
                    }
                    PendingOp::Delete(config) => batch.delete.insert(id.clone(), config.clone()),
                };
                record.in_flight = Some(op);
            }
        }
        batch
    }

    /// Applies an accepted batch: adds become confirmed, deletes are removed.
    ///
    /// Returns the affected AddOrUpdate and Delete ids.
    pub fn complete_in_flight(&mut self) -> (Vec<EndpointId>, Vec<EndpointId>) {
        let mut added = Vec::new();
        let mut deleted = Vec::new();

        for (id, record) in self.records.iter_mut() {
            match record.in_flight.take() {
                Some(PendingOp::AddOrUpdate(config)) => {
                    record.confirmed = Some(config);
                    added.push(id.clone());
                }
                Some(PendingOp::Delete(_)) => {
                    record.confirmed = None;
                    deleted.push(id.clone());
                }
                None => {}
            }
        }

        self.records.retain(|_, record| !record.is_vacant());
        (added, deleted)
    }

    /// Forgets the in-flight batch after a fatal failure.
    pub fn drop_in_flight(&mut self) -> usize {
        let dropped = self
            .records
            .values_mut()
            .filter_map(|record| record.in_flight.take())
            .count();
        self.records.retain(|_, record| !record.is_vacant());
        dropped
    }

    // =========================================================================
    // Bootstrap Reconciliation
    // =========================================================================

    /// Reconciles pending state against the persisted configs.
    ///
    /// Returns the ids whose pending config was already stored and so needs
    /// no round trip.
    pub fn reconcile_with_store(&mut self, stored: &EndpointConfigMap) -> Vec<EndpointId> {
        if stored.is_empty() {
            let mut seeded = 0;
            for record in self.records.values_mut() {
                if record.pending.is_none() {
                    if let Some(config) = record.confirmed.clone() {
                        record.pending = Some(PendingOp::AddOrUpdate(config));
                        seeded += 1;
                    }
                }
            }
            debug!(seeded, "Store empty, publishing every confirmed endpoint");
            return Vec::new();
        }

        let mut unchanged = Vec::new();
        for (id, record) in self.records.iter_mut() {
            let Some(stored_config) = stored.get(id) else { continue };
            let equivalent = record
                .pending
                .as_ref()
                .and_then(PendingOp::add_config)
                .is_some_and(|config| config.is_equivalent(stored_config));
            if equivalent {
                if let Some(PendingOp::AddOrUpdate(config)) = record.pending.take() {
                    record.confirmed = Some(config);
                    unchanged.push(id.clone());
                }
            }
        }

        for (id, stored_config) in stored {
            let known = self
                .records
                .get(id)
                .is_some_and(|record| record.pending.is_some() || record.confirmed.is_some());
            if known {
                continue;
            }
            if carries_registration(stored_config) {
                error!(
                    endpoint_id = %id,
                    "Stored deduplicated endpoint is no longer registered, not deleting it"
                );
                continue;
            }
            debug!(endpoint_id = %id, "Stale stored endpoint queued for deletion");
            let delete = PendingOp::Delete(delete_report_endpoint_config(id));
            self.records.entry(id.clone()).or_default().pending = Some(delete);
        }

        unchanged
    }

    // =========================================================================
    // Views
    // =========================================================================

    pub fn has_pending(&self) -> bool {
        self.records.values().any(|r| r.pending.is_some())
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut snapshot = RegistrySnapshot::default();
        for (id, record) in &self.records {
            match &record.pending {
                Some(PendingOp::AddOrUpdate(_)) => {
                    snapshot.pending_add_or_update.insert(id.clone())
                }
                Some(PendingOp::Delete(_)) => snapshot.pending_delete.insert(id.clone()),
                None => false,
            };
            match &record.in_flight {
                Some(PendingOp::AddOrUpdate(_)) => {
                    snapshot.in_flight_add_or_update.insert(id.clone())
                }
                Some(PendingOp::Delete(_)) => snapshot.in_flight_delete.insert(id.clone()),
                None => false,
            };
            if record.confirmed.is_some() {
                snapshot.confirmed.insert(id.clone());
            }
            if record.is_dedup_member() {
                snapshot.dedup_group.insert(id.clone());
            }
        }
        snapshot
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(id: &str, name: &str) -> EndpointConfig {
        EndpointConfig::from_raw(format!(
            "{{\"endpointId\":\"{}\",\"friendlyName\":\"{}\"}}",
            id, name
        ))
    }

    fn padded(id: &str, size: usize) -> EndpointConfig {
        EndpointConfig::from_raw(format!(
            "{{\"endpointId\":\"{}\",\"pad\":\"{}\"}}",
            id,
            "x".repeat(size)
        ))
    }

    fn reg(serial: &str) -> Registration {
        Registration::new("product", serial, "registration", "productId")
    }

    fn confirm(table: &mut EndpointTable) {
        table.reclaim_in_flight();
        table.take_all_pending();
        table.complete_in_flight();
    }

    #[test]
    fn test_accept_then_confirm() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "Lamp")).unwrap();

        assert!(table.snapshot().pending_add_or_update.contains("e1"));

        let batch = table.select_batch().unwrap();
        assert_eq!(batch.add_or_update.keys().collect::<Vec<_>>(), vec!["e1"]);
        assert!(table.snapshot().in_flight_add_or_update.contains("e1"));

        let (added, deleted) = table.complete_in_flight();
        assert_eq!(added, vec!["e1".to_string()]);
        assert!(deleted.is_empty());
        assert!(table.snapshot().confirmed.contains("e1"));
        assert!(!table.has_pending());
    }

    #[test]
    fn test_rejections_leave_state_unchanged() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "Lamp")).unwrap();
        let before = table.snapshot();

        assert_eq!(
            table.accept_add_or_update("e1", None, cfg("e1", "Lamp 2")),
            Err(RejectReason::PendingAddOrUpdate("e1".into()))
        );
        assert_eq!(
            table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "Lamp")),
            Err(RejectReason::RegistrationChanged("e1".into()))
        );
        assert_eq!(
            table.accept_delete("e1", None),
            Err(RejectReason::PendingAddOrUpdate("e1".into()))
        );
        assert_eq!(
            table.accept_delete("nope", None),
            Err(RejectReason::NotRegistered("nope".into()))
        );
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn test_delete_lifecycle() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "Lamp")).unwrap();
        confirm(&mut table);

        table.accept_delete("e1", None).unwrap();
        assert_eq!(
            table.accept_delete("e1", None),
            Err(RejectReason::PendingDeletion("e1".into()))
        );
        assert_eq!(
            table.accept_add_or_update("e1", None, cfg("e1", "Lamp")),
            Err(RejectReason::PendingDeletion("e1".into()))
        );

        let batch = table.select_batch().unwrap();
        assert_eq!(batch.delete["e1"].as_str(), "{\"endpointId\":\"e1\"}");

        let (_, deleted) = table.complete_in_flight();
        assert_eq!(deleted, vec!["e1".to_string()]);
        assert_eq!(table.snapshot(), RegistrySnapshot::default());
    }

    #[test]
    fn test_dedup_member_requeued_and_not_deletable() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "One")).unwrap();
        confirm(&mut table);

        let requeued = table.accept_add_or_update("e2", Some(reg("s1")), cfg("e2", "Two")).unwrap();
        assert_eq!(requeued, vec!["e1".to_string()]);

        let batch = table.select_batch().unwrap();
        assert_eq!(batch.add_or_update.keys().cloned().collect::<Vec<_>>(), vec!["e1", "e2"]);
        assert_eq!(batch.add_or_update["e1"], cfg("e1", "One"));
        table.complete_in_flight();

        assert_eq!(
            table.accept_delete("e1", Some(reg("s1"))),
            Err(RejectReason::DedupMember("e1".into()))
        );
        assert_eq!(table.snapshot().dedup_group.len(), 2);
    }

    #[test]
    fn test_requeue_prefers_in_flight_copy() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "Old")).unwrap();
        confirm(&mut table);

        let newer = PendingOp::AddOrUpdate(cfg("e1", "New"));
        table.records.get_mut("e1").unwrap().in_flight = Some(newer);
        table.accept_add_or_update("e2", Some(reg("s1")), cfg("e2", "Two")).unwrap();

        assert_eq!(
            table.records["e1"].pending,
            Some(PendingOp::AddOrUpdate(cfg("e1", "New")))
        );
    }

    #[test]
    fn test_second_dedup_group_rejected() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "One")).unwrap();

        assert_eq!(
            table.accept_add_or_update("e2", Some(reg("s2")), cfg("e2", "Two")),
            Err(RejectReason::SecondDedupGroup("e2".into()))
        );
    }

    #[test]
    fn test_dedup_group_size_limit() {
        let mut table = EndpointTable::new();
        let half = MAX_ENDPOINTS_SIZE_IN_PAYLOAD / 2;
        table.accept_add_or_update("e1", Some(reg("s1")), padded("e1", half)).unwrap();

        let result = table.accept_add_or_update("e2", Some(reg("s1")), padded("e2", half));
        assert!(matches!(result, Err(RejectReason::DedupGroupTooLarge { .. })));
        assert!(!table.snapshot().pending_add_or_update.contains("e2"));
    }

    #[test]
    fn test_dedup_group_member_limit() {
        let mut table = EndpointTable::new();
        for i in 0..MAX_DEDUP_GROUP_ENDPOINTS {
            let id = format!("d{}", i);
            table.accept_add_or_update(&id, Some(reg("s1")), cfg(&id, "Member")).unwrap();
        }
        let before = table.snapshot();
        assert_eq!(before.dedup_group.len(), MAX_DEDUP_GROUP_ENDPOINTS);

        assert_eq!(
            table.accept_add_or_update("extra", Some(reg("s1")), cfg("extra", "Member")),
            Err(RejectReason::DedupGroupFull {
                max: MAX_DEDUP_GROUP_ENDPOINTS
            })
        );
        assert_eq!(table.snapshot(), before);
        assert!(table.accept_add_or_update("plain", None, cfg("plain", "Lamp")).is_ok());
    }

    #[test]
    fn test_dedup_collides_with_pending_delete() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "One")).unwrap();
        confirm(&mut table);
        table.accept_delete("e1", None).unwrap();
        table.select_batch().unwrap();

        // In-flight delete on e1 blocks re-registering it with a registration.
        assert_eq!(
            table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "One")),
            Err(RejectReason::RegistrationChanged("e1".into()))
        );
        table.records.get_mut("e1").unwrap().registration = Some(reg("s1"));
        assert_eq!(
            table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "One")),
            Err(RejectReason::DedupDeletionCollision("e1".into()))
        );
    }

    #[test]
    fn test_oversized_pending_set_defers_dedup_group() {
        let mut table = EndpointTable::new();
        let third = MAX_ENDPOINTS_SIZE_IN_PAYLOAD / 3;
        table.accept_add_or_update("d1", Some(reg("s1")), padded("d1", third)).unwrap();
        table.accept_add_or_update("n1", None, padded("n1", third)).unwrap();
        table.accept_add_or_update("n2", None, padded("n2", third)).unwrap();

        let first = table.select_batch().unwrap();
        assert_eq!(first.add_or_update.keys().cloned().collect::<Vec<_>>(), vec!["n1", "n2"]);
        assert!(table.snapshot().pending_add_or_update.contains("d1"));

        table.complete_in_flight();
        let second = table.select_batch().unwrap();
        assert_eq!(second.add_or_update.keys().cloned().collect::<Vec<_>>(), vec!["d1"]);
    }

    #[test]
    fn test_reclaim_keeps_newer_pending() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "One")).unwrap();
        table.accept_add_or_update("e2", None, cfg("e2", "Two")).unwrap();
        table.select_batch().unwrap();

        table.accept_add_or_update("e1", None, cfg("e1", "One v2")).unwrap();
        assert_eq!(table.reclaim_in_flight(), 1);

        assert_eq!(table.records["e1"].pending, Some(PendingOp::AddOrUpdate(cfg("e1", "One v2"))));
        assert_eq!(table.records["e2"].pending, Some(PendingOp::AddOrUpdate(cfg("e2", "Two"))));
    }

    #[test]
    fn test_drop_in_flight_prunes_unconfirmed() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "One")).unwrap();
        table.select_batch().unwrap();

        assert_eq!(table.drop_in_flight(), 1);
        assert_eq!(table.snapshot(), RegistrySnapshot::default());
        table.accept_add_or_update("e1", Some(reg("s1")), cfg("e1", "One")).unwrap();
    }

    #[test]
    fn test_reconcile_with_empty_store_seeds_confirmed() {
        let mut table = EndpointTable::new();
        table.accept_add_or_update("e1", None, cfg("e1", "One")).unwrap();
        confirm(&mut table);

        assert!(table.reconcile_with_store(&EndpointConfigMap::new()).is_empty());
        assert!(table.snapshot().pending_add_or_update.contains("e1"));
    }

    #[test]
    fn test_reconcile_skips_unchanged_and_deletes_stale() {
        let mut table = EndpointTable::new();
        let same = EndpointConfig::from_raw("{\"endpointId\":\"same\",\"a\":1,\"b\":2}");
        table.accept_add_or_update("same", None, same).unwrap();
        table.accept_add_or_update("changed", None, cfg("changed", "New")).unwrap();

        let mut stored = EndpointConfigMap::new();
        let reordered = EndpointConfig::from_raw("{\"b\":2,\"a\":1,\"endpointId\":\"same\"}");
        stored.insert("same".into(), reordered);
        stored.insert("changed".into(), cfg("changed", "Old"));
        stored.insert("stale".into(), cfg("stale", "Gone"));
        stored.insert(
            "stale-dedup".into(),
            EndpointConfig::from_raw(
                "{\"endpointId\":\"stale-dedup\",\
                 \"registration\":{\"productId\":\"p\",\"deviceSerialNumber\":\"s\"}}",
            ),
        );

        let unchanged = table.reconcile_with_store(&stored);
        assert_eq!(unchanged, vec!["same".to_string()]);

        let snapshot = table.snapshot();
        assert!(snapshot.confirmed.contains("same"));
        assert_eq!(
            snapshot.pending_add_or_update.iter().cloned().collect::<Vec<_>>(),
            vec!["changed"]
        );
        assert_eq!(snapshot.pending_delete.iter().cloned().collect::<Vec<_>>(), vec!["stale"]);
    }
}
