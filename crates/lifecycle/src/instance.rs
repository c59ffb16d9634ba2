//! The provisioned cloud instance owned by the provisioning boundary.

use chrono::{DateTime, Duration, Utc};
use common::{InstanceId, ResourceId};
use serde::{Deserialize, Serialize};

use crate::stage::Stage;

/// Grace window added on top of the reserved hours before an instance is
/// considered expired.
pub const GRACE_MINUTES: i64 = 5;

/// A cloud instance provisioned for a paid resource.
///
/// Created once provisioning succeeds, mutated by the expiry scanner and
/// the termination handler, never deleted (the record is the audit trail).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedInstance {
    pub id: InstanceId,
    pub resource_id: ResourceId,
    /// The identifier assigned by the cloud provider.
    pub provider_instance_id: String,
    /// Fixed at creation: reservation length plus the grace window.
    pub expires_at: DateTime<Utc>,
    pub termination_scheduled_at: Option<DateTime<Utc>>,
    pub terminated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisionedInstance {
    /// Creates a new instance record with its expiry computed from the
    /// reservation length.
    pub fn new(
        resource_id: ResourceId,
        provider_instance_id: impl Into<String>,
        hours_reserved: u32,
    ) -> Self {
        let now = Utc::now();
        let expires_at =
            now + Duration::hours(i64::from(hours_reserved)) + Duration::minutes(GRACE_MINUTES);

        Self {
            id: InstanceId::new(),
            resource_id,
            provider_instance_id: provider_instance_id.into(),
            expires_at,
            termination_scheduled_at: None,
            terminated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the instance has outlived its reservation.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Marks the instance as scheduled for teardown.
    ///
    /// Returns false if termination was already scheduled (or already
    /// happened); overlapping scanner runs hit this path.
    pub fn schedule_termination(&mut self, at: DateTime<Utc>) -> bool {
        if self.termination_scheduled_at.is_some() || self.terminated_at.is_some() {
            return false;
        }
        self.termination_scheduled_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Marks the instance as torn down.
    ///
    /// Returns false on a redelivered termination event. A terminated
    /// instance always carries a schedule timestamp: if termination was
    /// triggered externally without going through the scanner, the
    /// schedule time is backfilled to the termination time.
    pub fn terminate(&mut self, at: DateTime<Utc>) -> bool {
        if self.terminated_at.is_some() {
            return false;
        }
        if self.termination_scheduled_at.is_none() {
            self.termination_scheduled_at = Some(at);
        }
        self.terminated_at = Some(at);
        self.updated_at = at;
        true
    }

    /// Returns the lifecycle stage of this instance.
    pub fn stage(&self) -> Stage {
        if self.terminated_at.is_some() {
            Stage::Terminated
        } else if self.termination_scheduled_at.is_some() {
            Stage::TerminationScheduled
        } else {
            Stage::Provisioned
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_hours_plus_grace() {
        let before = Utc::now();
        let instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 3);
        let after = Utc::now();

        let lower = before + Duration::hours(3) + Duration::minutes(GRACE_MINUTES);
        let upper = after + Duration::hours(3) + Duration::minutes(GRACE_MINUTES);
        assert!(instance.expires_at >= lower);
        assert!(instance.expires_at <= upper);
    }

    #[test]
    fn fresh_instance_is_provisioned_and_not_expired() {
        let instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 1);
        assert_eq!(instance.stage(), Stage::Provisioned);
        assert!(!instance.is_expired(Utc::now()));
    }

    #[test]
    fn instance_expires_after_window() {
        let instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 1);
        let past_window = Utc::now() + Duration::hours(1) + Duration::minutes(GRACE_MINUTES + 1);
        assert!(instance.is_expired(past_window));
    }

    #[test]
    fn schedule_termination_once() {
        let mut instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 1);
        let now = Utc::now();

        assert!(instance.schedule_termination(now));
        assert_eq!(instance.stage(), Stage::TerminationScheduled);

        assert!(!instance.schedule_termination(Utc::now()));
        assert_eq!(instance.termination_scheduled_at, Some(now));
    }

    #[test]
    fn terminate_after_schedule() {
        let mut instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 1);
        let scheduled = Utc::now();
        instance.schedule_termination(scheduled);

        let terminated = Utc::now();
        assert!(instance.terminate(terminated));
        assert_eq!(instance.stage(), Stage::Terminated);
        assert_eq!(instance.termination_scheduled_at, Some(scheduled));
        assert_eq!(instance.terminated_at, Some(terminated));
        assert!(instance.termination_scheduled_at.unwrap() <= instance.terminated_at.unwrap());
    }

    #[test]
    fn terminate_twice_is_noop() {
        let mut instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 1);
        let first = Utc::now();
        instance.schedule_termination(first);
        assert!(instance.terminate(first));

        assert!(!instance.terminate(Utc::now()));
        assert_eq!(instance.terminated_at, Some(first));
    }

    #[test]
    fn external_terminate_backfills_schedule() {
        let mut instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 1);
        let now = Utc::now();

        assert!(instance.terminate(now));
        assert_eq!(instance.termination_scheduled_at, Some(now));
        assert_eq!(instance.terminated_at, Some(now));
    }

    #[test]
    fn serialization_roundtrip() {
        let instance = ProvisionedInstance::new(ResourceId::new(), "i-0abc", 10);
        let json = serde_json::to_string(&instance).unwrap();
        let deserialized: ProvisionedInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(instance, deserialized);
    }
}
