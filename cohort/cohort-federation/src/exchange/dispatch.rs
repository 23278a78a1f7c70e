//! Inbound event dispatch: one match over every event variant.

use super::outbound::OutboundPublisher;
use super::sequencer::InstanceSequencer;
use crate::registry::CohortRegistry;
use crate::stats::ExchangeStats;
use crate::typedef_store::{TypeDefApplied, TypeDefStore};
use cohort_core::audit::AuditReport;
use cohort_core::event::{RegistrationAction, RegistrationEvent, ReplicationEvent, TypeDefEvent};
use cohort_core::traits::{AuditSink, MetadataCollection};
use cohort_core::types::CohortMember;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

pub struct EventDispatcher {
    local_member: CohortMember,
    type_defs: Arc<TypeDefStore>,
    local: Arc<dyn MetadataCollection>,
    registry: Arc<CohortRegistry>,
    sequencer: Arc<InstanceSequencer>,
    outbound: OutboundPublisher,
    audit: Arc<dyn AuditSink>,
    stats: Arc<ExchangeStats>,
    /// Held across the TypeDef Store and local repository writes
    type_def_writes: Arc<Mutex<()>>,
}

impl EventDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_member: CohortMember,
        type_defs: Arc<TypeDefStore>,
        local: Arc<dyn MetadataCollection>,
        registry: Arc<CohortRegistry>,
        sequencer: Arc<InstanceSequencer>,
        outbound: OutboundPublisher,
        audit: Arc<dyn AuditSink>,
        stats: Arc<ExchangeStats>,
        type_def_writes: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            local_member,
            type_defs,
            local,
            registry,
            sequencer,
            outbound,
            audit,
            stats,
            type_def_writes,
        }
    }

    pub fn sequencer(&self) -> &InstanceSequencer {
        &self.sequencer
    }

    /// Handle one inbound event. Events this server published are skipped,
    /// as are data events from members deregistered since their last
    /// registration.
    pub async fn dispatch(&self, event: ReplicationEvent) {
        if event.origin() == &self.local_member.metadata_collection_id {
            trace!(kind = event.kind(), "Skipping own event");
            return;
        }
        if !matches!(event, ReplicationEvent::Registration(_)) && self.registry.is_departed(event.origin()) {
            debug!(kind = event.kind(), origin = %event.origin(), "Dropped event from departed member");
            self.stats.record_rejected();
            return;
        }

        match event {
            ReplicationEvent::Registration(event) => self.on_registration(event),
            ReplicationEvent::TypeDef(event) => {
                self.registry.record_success(&event.origin);
                self.on_type_def(event).await;
            }
            ReplicationEvent::InstanceEntity(event) => {
                self.registry.record_success(&event.origin);
                self.sequencer.handle(event).await;
            }
            ReplicationEvent::InstanceRelationship(event) => {
                self.registry.record_success(&event.origin);
                self.sequencer.handle(event).await;
            }
        }
    }

    fn on_registration(&self, event: RegistrationEvent) {
        match event.action {
            RegistrationAction::Register | RegistrationAction::ReRegister => {
                if let Err(reason) = self.check_registration(&event) {
                    warn!(member = %event.origin, "Rejected registration: {}", reason);
                    self.stats.record_rejected();
                    self.audit.report(AuditReport::RegistrationRejected {
                        member: event.origin.clone(),
                        reason,
                    });
                    return;
                }

                self.registry.register(event.member);
                self.stats.record_applied();

                if event.action == RegistrationAction::Register {
                    debug!(member = %event.origin, "Answering registration");
                    self.outbound.publish(ReplicationEvent::registration(
                        self.local_member.metadata_collection_id.clone(),
                        RegistrationAction::ReRegister,
                        self.local_member.clone(),
                    ));
                }
            }
            RegistrationAction::Unregister => {
                if self.registry.deregister(&event.origin).is_some() {
                    self.stats.record_applied();
                } else {
                    self.stats.record_duplicate();
                }
            }
        }
    }

    fn check_registration(&self, event: &RegistrationEvent) -> Result<(), String> {
        if event.member.metadata_collection_id != event.origin {
            return Err(format!(
                "registration for {} published by {}",
                event.member.metadata_collection_id, event.origin
            ));
        }
        let local = self.local_member.protocol_version;
        if !local.is_compatible_with(&event.member.protocol_version) {
            return Err(format!(
                "protocol {} is incompatible with local protocol {}",
                event.member.protocol_version, local
            ));
        }
        Ok(())
    }

    async fn on_type_def(&self, event: TypeDefEvent) {
        let name = event.type_def.name.clone();
        let _writes = self.type_def_writes.lock().await;
        match self.type_defs.apply_remote(event.type_def.clone(), &event.origin) {
            Ok(TypeDefApplied::Added | TypeDefApplied::Replaced) => {
                self.stats.record_applied();
                info!(type_def = %name, version = event.type_def.version, origin = %event.origin, "Adopted type definition");
                if let Err(e) = self.local.add_type_def(event.type_def).await {
                    warn!(type_def = %name, "Local repository refused type definition: {}", e);
                }
            }
            Ok(TypeDefApplied::Duplicate) => self.stats.record_duplicate(),
            Err(e) if e.is_conflict() => self.stats.record_conflict(),
            Err(e) => {
                warn!(type_def = %name, origin = %event.origin, "Type definition not applied: {}", e);
                self.stats.record_rejected();
            }
        }
    }
}
