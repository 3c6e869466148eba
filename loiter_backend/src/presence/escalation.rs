//! Per-user offense counting that turns repeated hostility into a punitive action.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::transport::UserId;

use super::session::secs_between;
use super::triggers::TriggerCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffenseReason {
    IdentityDenial,
    Hostility,
    Requested,
}

impl OffenseReason {
    pub fn from_trigger(category: TriggerCategory) -> Option<Self> {
        match category {
            TriggerCategory::IdentityDenial => Some(Self::IdentityDenial),
            TriggerCategory::Hostility => Some(Self::Hostility),
            TriggerCategory::EscalationRequest => Some(Self::Requested),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdentityDenial => "identity_denial",
            Self::Hostility => "hostility",
            Self::Requested => "requested",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::IdentityDenial => "insisting the agent isn't real",
            Self::Hostility => "being hostile",
            Self::Requested => "asking for it",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub count: u32,
    pub last_time: DateTime<Utc>,
    pub warned: bool,
    pub reasons: BTreeSet<OffenseReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationVerdict {
    /// Below the warning threshold.
    Counting(u32),
    /// At or past the warning threshold; the reply should carry a warning.
    Warn(u32),
    /// Restrict the user.
    Execute,
}

pub struct EscalationTracker {
    records: HashMap<UserId, EscalationRecord>,
    warn_threshold: u32,
    execute_threshold: u32,
    timeout_secs: f64,
}

impl EscalationTracker {
    pub fn new(warn_threshold: u32, execute_threshold: u32, timeout_secs: f64) -> Self {
        Self {
            records: HashMap::new(),
            warn_threshold,
            execute_threshold,
            timeout_secs,
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        Self::new(
            engine.escalation_warn_threshold,
            engine.escalation_execute_threshold,
            engine.escalation_timeout_secs,
        )
    }

    /// Count an offense. Records older than the timeout restart at 1.
    pub fn record_offense(
        &mut self,
        user: UserId,
        reason: OffenseReason,
        now: DateTime<Utc>,
    ) -> EscalationVerdict {
        let timeout = self.timeout_secs;
        let record = self
            .records
            .entry(user)
            .and_modify(|r| {
                if secs_between(r.last_time, now) > timeout {
                    *r = EscalationRecord {
                        count: 0,
                        last_time: now,
                        warned: false,
                        reasons: BTreeSet::new(),
                    };
                }
            })
            .or_insert_with(|| EscalationRecord {
                count: 0,
                last_time: now,
                warned: false,
                reasons: BTreeSet::new(),
            });

        record.count += 1;
        record.last_time = now;
        record.reasons.insert(reason);

        if record.count >= self.execute_threshold {
            EscalationVerdict::Execute
        } else if record.count >= self.warn_threshold {
            record.warned = true;
            EscalationVerdict::Warn(record.count)
        } else {
            EscalationVerdict::Counting(record.count)
        }
    }

    /// Explicit requests skip the counter entirely.
    pub fn request(&mut self, user: UserId, now: DateTime<Utc>) -> EscalationVerdict {
        let record = self
            .records
            .entry(user)
            .or_insert_with(|| EscalationRecord {
                count: 0,
                last_time: now,
                warned: false,
                reasons: BTreeSet::new(),
            });
        record.last_time = now;
        record.reasons.insert(OffenseReason::Requested);
        EscalationVerdict::Execute
    }

    /// Drop the record after execution or a manual clear.
    pub fn clear(&mut self, user: UserId) -> Option<EscalationRecord> {
        self.records.remove(&user)
    }

    pub fn get(&self, user: UserId) -> Option<&EscalationRecord> {
        self.records.get(&user)
    }

    pub fn active(&self, now: DateTime<Utc>) -> Vec<(UserId, EscalationRecord)> {
        let mut active: Vec<_> = self
            .records
            .iter()
            .filter(|(_, r)| secs_between(r.last_time, now) <= self.timeout_secs)
            .map(|(id, r)| (*id, r.clone()))
            .collect();
        active.sort_by_key(|(id, _)| *id);
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn tracker() -> EscalationTracker {
        EscalationTracker::new(3, 4, 300.0)
    }

    #[test]
    fn three_hostile_messages_within_a_minute_warn() {
        let mut t = tracker();
        let start = Utc::now();
        assert_eq!(
            t.record_offense(5, OffenseReason::Hostility, start),
            EscalationVerdict::Counting(1)
        );
        assert_eq!(
            t.record_offense(5, OffenseReason::Hostility, start + Duration::seconds(20)),
            EscalationVerdict::Counting(2)
        );
        assert_eq!(
            t.record_offense(5, OffenseReason::Hostility, start + Duration::seconds(50)),
            EscalationVerdict::Warn(3)
        );
        let record = t.get(5).expect("record exists");
        assert_eq!(record.count, 3);
        assert!(record.warned);

        assert_eq!(
            t.record_offense(5, OffenseReason::IdentityDenial, start + Duration::seconds(55)),
            EscalationVerdict::Execute
        );
        let reasons: Vec<_> = t.get(5).expect("record").reasons.iter().copied().collect();
        assert_eq!(
            reasons,
            vec![OffenseReason::IdentityDenial, OffenseReason::Hostility]
        );
    }

    #[test]
    fn offense_after_timeout_restarts_count() {
        let mut t = tracker();
        let start = Utc::now();
        for i in 0..3 {
            t.record_offense(5, OffenseReason::Hostility, start + Duration::seconds(i * 10));
        }
        let late = start + Duration::seconds(20 + 301);
        assert_eq!(
            t.record_offense(5, OffenseReason::Hostility, late),
            EscalationVerdict::Counting(1)
        );
        assert!(!t.get(5).expect("record").warned);
    }

    #[test]
    fn request_executes_immediately_and_clear_removes() {
        let mut t = tracker();
        let now = Utc::now();
        assert_eq!(t.request(9, now), EscalationVerdict::Execute);
        assert!(t.clear(9).is_some());
        assert!(t.get(9).is_none());
        assert!(t.clear(9).is_none());
    }

    #[test]
    fn active_lists_only_unexpired_records() {
        let mut t = tracker();
        let now = Utc::now();
        t.record_offense(1, OffenseReason::Hostility, now - Duration::seconds(400));
        t.record_offense(2, OffenseReason::Hostility, now - Duration::seconds(10));
        let active = t.active(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, 2);
    }
}
