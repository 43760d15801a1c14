//! Status enums for runs, snapshots, environments and waitpoints.

use serde::{Deserialize, Serialize};

/// Execution status recorded on every snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    RunCreated,
    Queued,
    QueuedExecuting,
    PendingExecuting,
    Executing,
    ExecutingWithWaitpoints,
    Suspended,
    PendingCancel,
    Finished,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 9] = [
        Self::RunCreated,
        Self::Queued,
        Self::QueuedExecuting,
        Self::PendingExecuting,
        Self::Executing,
        Self::ExecutingWithWaitpoints,
        Self::Suspended,
        Self::PendingCancel,
        Self::Finished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunCreated => "RUN_CREATED",
            Self::Queued => "QUEUED",
            Self::QueuedExecuting => "QUEUED_EXECUTING",
            Self::PendingExecuting => "PENDING_EXECUTING",
            Self::Executing => "EXECUTING",
            Self::ExecutingWithWaitpoints => "EXECUTING_WITH_WAITPOINTS",
            Self::Suspended => "SUSPENDED",
            Self::PendingCancel => "PENDING_CANCEL",
            Self::Finished => "FINISHED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// A checkpoint may only be attached while the run is blocked or was just re-queued.
    pub fn is_checkpointable(&self) -> bool {
        matches!(self, Self::ExecutingWithWaitpoints | Self::QueuedExecuting)
    }

    pub fn is_pending_executing(&self) -> bool {
        matches!(self, Self::PendingExecuting)
    }

    /// States in which a deferred concurrency release may still be applied.
    pub fn can_release_concurrency(&self) -> bool {
        matches!(self, Self::ExecutingWithWaitpoints | Self::Suspended)
    }

    /// States where a runner process may be alive for the run.
    pub fn is_executing(&self) -> bool {
        matches!(
            self,
            Self::PendingExecuting
                | Self::Executing
                | Self::ExecutingWithWaitpoints
                | Self::QueuedExecuting
        )
    }

    /// States where cancelling only needs the queue entry removed.
    pub fn is_cancellable_without_runner(&self) -> bool {
        matches!(self, Self::RunCreated | Self::Queued | Self::Suspended)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        match self {
            Finished => false,
            PendingCancel => next == Finished,
            _ if matches!(next, PendingCancel | Finished) => true,
            RunCreated => next == Queued,
            Queued => matches!(next, Queued | PendingExecuting),
            QueuedExecuting => matches!(next, Queued | Executing),
            PendingExecuting => matches!(next, Executing | Queued),
            Executing => matches!(next, ExecutingWithWaitpoints | Queued),
            ExecutingWithWaitpoints => matches!(next, Executing | Suspended | QueuedExecuting),
            Suspended => matches!(next, Queued | PendingExecuting),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Coarse run status kept on the run record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Dequeued,
    Executing,
    WaitingToResume,
    CompletedSuccessfully,
    CompletedWithErrors,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Dequeued => "DEQUEUED",
            Self::Executing => "EXECUTING",
            Self::WaitingToResume => "WAITING_TO_RESUME",
            Self::CompletedSuccessfully => "COMPLETED_SUCCESSFULLY",
            Self::CompletedWithErrors => "COMPLETED_WITH_ERRORS",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Self::CompletedSuccessfully | Self::CompletedWithErrors | Self::Canceled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Deployment environment kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvironmentType {
    Production,
    Staging,
    Development,
    Preview,
}

impl EnvironmentType {
    pub const ALL: [EnvironmentType; 4] = [
        Self::Production,
        Self::Staging,
        Self::Development,
        Self::Preview,
    ];

    /// Single-character wire code; the mapping is a bijection.
    pub fn code(&self) -> char {
        match self {
            Self::Production => 'P',
            Self::Staging => 'S',
            Self::Development => 'D',
            Self::Preview => 'V',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        Self::ALL.into_iter().find(|env| env.code() == code)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "PRODUCTION",
            Self::Staging => "STAGING",
            Self::Development => "DEVELOPMENT",
            Self::Preview => "PREVIEW",
        }
    }
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a checkpoint image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckpointType {
    Docker,
    Kubernetes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WaitpointStatus {
    Pending,
    Completed,
}

/// Which concurrency counters a blocked run gives back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseConcurrencyScope {
    /// Environment and queue concurrency.
    All,
    /// Environment concurrency only; the queue slot stays held.
    EnvironmentOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_codes_are_a_bijection() {
        for env in EnvironmentType::ALL {
            assert_eq!(EnvironmentType::from_code(env.code()), Some(env));
        }
        assert_eq!(EnvironmentType::from_code('X'), None);
    }

    #[test]
    fn execution_status_parse_matches_as_str() {
        for status in ExecutionStatus::ALL {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        let json = serde_json::to_string(&ExecutionStatus::QueuedExecuting).expect("serialize");
        assert_eq!(json, "\"QUEUED_EXECUTING\"");
    }

    #[test]
    fn finished_is_terminal() {
        for status in ExecutionStatus::ALL {
            assert!(!ExecutionStatus::Finished.can_transition_to(status));
        }
        assert!(ExecutionStatus::PendingCancel.can_transition_to(ExecutionStatus::Finished));
        assert!(!ExecutionStatus::PendingCancel.can_transition_to(ExecutionStatus::Queued));
    }

    #[test]
    fn suspend_resume_path_is_allowed() {
        use ExecutionStatus::*;
        let path = [
            RunCreated,
            Queued,
            PendingExecuting,
            Executing,
            ExecutingWithWaitpoints,
            Suspended,
            PendingExecuting,
            Executing,
            Finished,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(QueuedExecuting.can_transition_to(Queued));
        assert!(!RunCreated.can_transition_to(Executing));
    }
}
