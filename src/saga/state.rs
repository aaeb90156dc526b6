//! Saga FSM definitions
//!
//! Step order and compensations are tables, not branching code: adding a
//! step means adding a row.

use std::fmt;
use std::str::FromStr;

/// Saga lifecycle status, stored as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum SagaStatus {
    Started = 0,
    InProgress = 10,
    /// Terminal
    Completed = 20,
    /// Compensation running or interrupted
    Compensating = -10,
    /// Terminal unless a bounded retry is granted
    Failed = -20,
}

impl SagaStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    /// Still executing forward steps
    #[inline]
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SagaStatus::Started | SagaStatus::InProgress)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(SagaStatus::Started),
            10 => Some(SagaStatus::InProgress),
            20 => Some(SagaStatus::Completed),
            -10 => Some(SagaStatus::Compensating),
            -20 => Some(SagaStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "STARTED",
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Failed => "FAILED",
        }
    }

    /// Allowed status moves. FAILED -> IN_PROGRESS is the retry edge.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        STATUS_TRANSITIONS
            .iter()
            .any(|(from, to)| *from == *self && *to == next)
    }
}

const STATUS_TRANSITIONS: &[(SagaStatus, SagaStatus)] = &[
    (SagaStatus::Started, SagaStatus::InProgress),
    (SagaStatus::Started, SagaStatus::Compensating),
    (SagaStatus::InProgress, SagaStatus::InProgress),
    (SagaStatus::InProgress, SagaStatus::Completed),
    (SagaStatus::InProgress, SagaStatus::Compensating),
    (SagaStatus::Compensating, SagaStatus::Failed),
    (SagaStatus::Failed, SagaStatus::InProgress),
];

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SagaStep {
    Validate,
    ReserveAssets,
    QueueOrder,
    Complete,
}

/// step -> next step; `None` marks the last step.
const STEP_TRANSITIONS: &[(SagaStep, Option<SagaStep>)] = &[
    (SagaStep::Validate, Some(SagaStep::ReserveAssets)),
    (SagaStep::ReserveAssets, Some(SagaStep::QueueOrder)),
    (SagaStep::QueueOrder, Some(SagaStep::Complete)),
    (SagaStep::Complete, None),
];

/// Inverse action of a committed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compensation {
    /// Cancel the matching-queue entry and capture its remaining size
    CancelQueueEntry,
    /// Release what is still blocked for the order
    ReleaseReservation,
}

const COMPENSATIONS: &[(SagaStep, Compensation)] = &[
    (SagaStep::QueueOrder, Compensation::CancelQueueEntry),
    (SagaStep::ReserveAssets, Compensation::ReleaseReservation),
];

impl SagaStep {
    pub const FIRST: SagaStep = SagaStep::Validate;

    pub fn next(&self) -> Option<SagaStep> {
        STEP_TRANSITIONS
            .iter()
            .find(|(step, _)| step == self)
            .and_then(|(_, next)| *next)
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }

    pub fn compensation(&self) -> Option<Compensation> {
        COMPENSATIONS
            .iter()
            .find(|(step, _)| step == self)
            .map(|(_, c)| *c)
    }

    /// A failure here may have taken effect anyway (timeout, lost reply),
    /// so the step's own inverse must run too.
    pub fn outcome_uncertain_on_failure(&self, transient: bool) -> bool {
        match self {
            SagaStep::ReserveAssets => transient,
            SagaStep::QueueOrder => true,
            SagaStep::Validate | SagaStep::Complete => false,
        }
    }

    /// Can a failure at this step be retried after compensation?
    ///
    /// A canceled queue entry can't be re-queued under the same order id.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, SagaStep::QueueOrder)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::Validate => "VALIDATE",
            SagaStep::ReserveAssets => "RESERVE_ASSETS",
            SagaStep::QueueOrder => "QUEUE_ORDER",
            SagaStep::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for SagaStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaStep {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "VALIDATE" => Ok(SagaStep::Validate),
            "RESERVE_ASSETS" => Ok(SagaStep::ReserveAssets),
            "QUEUE_ORDER" => Ok(SagaStep::QueueOrder),
            "COMPLETE" => Ok(SagaStep::Complete),
            other => Err(format!("unknown saga step: {}", other)),
        }
    }
}

/// Compensations owed for `completed` plus the failing step, in reverse order of commitment.
pub fn compensation_plan(
    completed: &[SagaStep],
    failed_step: SagaStep,
    transient: bool,
) -> Vec<(SagaStep, Compensation)> {
    let mut steps: Vec<SagaStep> = completed.to_vec();
    if failed_step.outcome_uncertain_on_failure(transient) && !steps.contains(&failed_step) {
        steps.push(failed_step);
    }
    steps
        .into_iter()
        .rev()
        .filter_map(|s| s.compensation().map(|c| (s, c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_chain() {
        let mut step = SagaStep::FIRST;
        let mut seen = vec![step];
        while let Some(next) = step.next() {
            seen.push(next);
            step = next;
        }
        assert_eq!(
            seen,
            vec![
                SagaStep::Validate,
                SagaStep::ReserveAssets,
                SagaStep::QueueOrder,
                SagaStep::Complete
            ]
        );
        assert!(SagaStep::Complete.is_last());
    }

    #[test]
    fn test_status_transitions() {
        assert!(SagaStatus::Started.can_transition_to(SagaStatus::Compensating));
        assert!(SagaStatus::Compensating.can_transition_to(SagaStatus::Failed));
        assert!(SagaStatus::Failed.can_transition_to(SagaStatus::InProgress));
        assert!(!SagaStatus::Completed.can_transition_to(SagaStatus::InProgress));
        assert!(!SagaStatus::Started.can_transition_to(SagaStatus::Failed));
        assert!(!SagaStatus::Compensating.can_transition_to(SagaStatus::Completed));
    }

    #[test]
    fn test_status_ids() {
        for s in [
            SagaStatus::Started,
            SagaStatus::InProgress,
            SagaStatus::Completed,
            SagaStatus::Compensating,
            SagaStatus::Failed,
        ] {
            assert_eq!(SagaStatus::from_id(s.id()), Some(s));
        }
        assert!(SagaStatus::from_id(99).is_none());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
    }

    #[test]
    fn test_compensation_plan_reverse_order() {
        let plan = compensation_plan(
            &[SagaStep::Validate, SagaStep::ReserveAssets, SagaStep::QueueOrder],
            SagaStep::Complete,
            false,
        );
        assert_eq!(
            plan,
            vec![
                (SagaStep::QueueOrder, Compensation::CancelQueueEntry),
                (SagaStep::ReserveAssets, Compensation::ReleaseReservation),
            ]
        );
    }

    #[test]
    fn test_business_reserve_failure_has_nothing_to_undo() {
        let plan = compensation_plan(&[SagaStep::Validate], SagaStep::ReserveAssets, false);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_transient_reserve_failure_releases() {
        let plan = compensation_plan(&[SagaStep::Validate], SagaStep::ReserveAssets, true);
        assert_eq!(plan, vec![(SagaStep::ReserveAssets, Compensation::ReleaseReservation)]);
    }

    #[test]
    fn test_queue_failure_cancels_then_releases() {
        let plan = compensation_plan(
            &[SagaStep::Validate, SagaStep::ReserveAssets],
            SagaStep::QueueOrder,
            false,
        );
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].1, Compensation::CancelQueueEntry);
        assert_eq!(plan[1].1, Compensation::ReleaseReservation);
    }

    #[test]
    fn test_step_parse() {
        for s in [SagaStep::Validate, SagaStep::QueueOrder] {
            assert_eq!(s.as_str().parse::<SagaStep>().unwrap(), s);
        }
        assert!("NOPE".parse::<SagaStep>().is_err());
    }
}
