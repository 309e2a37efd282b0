//! Lifecycle statuses for requests, transforms, processings and commands.
//!
//! Every status carries a stable numeric code (used in event payloads and
//! by external tooling) and a snake_case name (used for persistence).

use crate::error::Error;
use serde::{Deserialize, Serialize};

macro_rules! status_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal => $text:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> i32 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(Error::Other(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    ))),
                }
            }
        }
    };
}

status_enum! {
    /// Status of a user request.
    RequestStatus {
        New = 0 => "new",
        Ready = 1 => "ready",
        Transforming = 2 => "transforming",
        Finished = 3 => "finished",
        SubFinished = 4 => "sub_finished",
        Failed = 5 => "failed",
        Extend = 6 => "extend",
        ToCancel = 7 => "to_cancel",
        Cancelling = 8 => "cancelling",
        Cancelled = 9 => "cancelled",
        ToSuspend = 10 => "to_suspend",
        Suspending = 11 => "suspending",
        Suspended = 12 => "suspended",
        ToResume = 13 => "to_resume",
        Resuming = 14 => "resuming",
        ToExpire = 15 => "to_expire",
        Expiring = 16 => "expiring",
        Expired = 17 => "expired",
        ToFinish = 18 => "to_finish",
        ToForceFinish = 19 => "to_force_finish",
        Terminating = 20 => "terminating",
        Building = 21 => "building",
        Built = 22 => "built",
        Throttling = 23 => "throttling",
    }
}

status_enum! {
    /// Status of a transform (one unit of a request's workflow).
    TransformStatus {
        New = 0 => "new",
        Ready = 1 => "ready",
        Transforming = 2 => "transforming",
        Finished = 3 => "finished",
        SubFinished = 4 => "sub_finished",
        Failed = 5 => "failed",
        Extend = 6 => "extend",
        ToCancel = 7 => "to_cancel",
        Cancelling = 8 => "cancelling",
        Cancelled = 9 => "cancelled",
        ToSuspend = 10 => "to_suspend",
        Suspending = 11 => "suspending",
        Suspended = 12 => "suspended",
        ToResume = 13 => "to_resume",
        Resuming = 14 => "resuming",
        ToExpire = 15 => "to_expire",
        Expiring = 16 => "expiring",
        Expired = 17 => "expired",
        ToFinish = 18 => "to_finish",
        ToForceFinish = 19 => "to_force_finish",
        Terminating = 20 => "terminating",
        Building = 21 => "building",
        Built = 22 => "built",
    }
}

status_enum! {
    /// Status of a processing, the handle on one external workload.
    ProcessingStatus {
        New = 0 => "new",
        Submitting = 1 => "submitting",
        Submitted = 2 => "submitted",
        Running = 3 => "running",
        Finished = 4 => "finished",
        Failed = 5 => "failed",
        Lost = 6 => "lost",
        Cancel = 7 => "cancel",
        FinishedOnStep = 8 => "finished_on_step",
        FinishedOnExec = 9 => "finished_on_exec",
        FinishedTerm = 10 => "finished_term",
        SubFinished = 11 => "sub_finished",
        ToCancel = 12 => "to_cancel",
        Cancelling = 13 => "cancelling",
        Cancelled = 14 => "cancelled",
        ToSuspend = 15 => "to_suspend",
        Suspending = 16 => "suspending",
        Suspended = 17 => "suspended",
        ToResume = 18 => "to_resume",
        Resuming = 19 => "resuming",
        ToExpire = 20 => "to_expire",
        Expiring = 21 => "expiring",
        Expired = 22 => "expired",
        TimeOut = 23 => "time_out",
        ToFinish = 24 => "to_finish",
        ToForceFinish = 25 => "to_force_finish",
        Broken = 26 => "broken",
        Terminating = 27 => "terminating",
        ToTrigger = 28 => "to_trigger",
        Triggering = 29 => "triggering",
        Synchronizing = 30 => "synchronizing",
    }
}

status_enum! {
    /// Row claim flag. A row in `Locking` is owned by exactly one worker.
    Locking {
        Idle = 0 => "idle",
        Locking = 1 => "locking",
    }
}

status_enum! {
    CommandType {
        AbortRequest = 0 => "abort_request",
        ResumeRequest = 1 => "resume_request",
        ExpireRequest = 2 => "expire_request",
    }
}

status_enum! {
    CommandStatus {
        New = 0 => "new",
        Processing = 1 => "processing",
        Processed = 2 => "processed",
        Failed = 3 => "failed",
        UnknownCommand = 4 => "unknown_command",
    }
}

impl RequestStatus {
    /// Statuses picked up by the new-request poller.
    pub const NEW: &'static [RequestStatus] = &[
        RequestStatus::New,
        RequestStatus::Extend,
        RequestStatus::Built,
        RequestStatus::Throttling,
    ];

    /// Statuses picked up by the running-request poller.
    pub const RUNNING: &'static [RequestStatus] = &[
        RequestStatus::Transforming,
        RequestStatus::ToCancel,
        RequestStatus::Cancelling,
        RequestStatus::ToSuspend,
        RequestStatus::Suspending,
        RequestStatus::ToExpire,
        RequestStatus::Expiring,
        RequestStatus::ToFinish,
        RequestStatus::ToForceFinish,
        RequestStatus::ToResume,
        RequestStatus::Resuming,
        RequestStatus::Building,
    ];

    /// Counted against a site's throttler.
    pub const ACTIVE: &'static [RequestStatus] = &[
        RequestStatus::Transforming,
        RequestStatus::Building,
        RequestStatus::Resuming,
        RequestStatus::Terminating,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Finished
                | RequestStatus::SubFinished
                | RequestStatus::Failed
                | RequestStatus::Cancelled
                | RequestStatus::Suspended
                | RequestStatus::Expired
        )
    }
}

impl TransformStatus {
    pub const NEW: &'static [TransformStatus] = &[
        TransformStatus::New,
        TransformStatus::Ready,
        TransformStatus::Extend,
    ];

    pub const RUNNING: &'static [TransformStatus] = &[
        TransformStatus::Transforming,
        TransformStatus::ToCancel,
        TransformStatus::Cancelling,
        TransformStatus::ToSuspend,
        TransformStatus::Suspending,
        TransformStatus::ToExpire,
        TransformStatus::Expiring,
        TransformStatus::ToResume,
        TransformStatus::Resuming,
        TransformStatus::ToFinish,
        TransformStatus::ToForceFinish,
        TransformStatus::Terminating,
    ];

    /// Terminal statuses a resume command can bring back.
    pub const RESUMABLE: &'static [TransformStatus] = &[
        TransformStatus::SubFinished,
        TransformStatus::Failed,
        TransformStatus::Cancelled,
        TransformStatus::Suspended,
        TransformStatus::Expired,
    ];

    pub const ACTIVE: &'static [TransformStatus] = &[
        TransformStatus::Transforming,
        TransformStatus::Resuming,
        TransformStatus::Terminating,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransformStatus::Finished
                | TransformStatus::SubFinished
                | TransformStatus::Failed
                | TransformStatus::Cancelled
                | TransformStatus::Suspended
                | TransformStatus::Expired
        )
    }

    /// Derive a transform's status from its current processing.
    pub fn from_processing(status: ProcessingStatus) -> Self {
        use ProcessingStatus as P;
        match status {
            P::New
            | P::Submitting
            | P::Submitted
            | P::Running
            | P::ToTrigger
            | P::Triggering
            | P::Synchronizing => TransformStatus::Transforming,
            P::Finished | P::FinishedOnStep | P::FinishedOnExec | P::FinishedTerm => {
                TransformStatus::Finished
            }
            P::Failed | P::Lost | P::TimeOut | P::Broken => TransformStatus::Failed,
            P::Cancel | P::Cancelled => TransformStatus::Cancelled,
            P::SubFinished => TransformStatus::SubFinished,
            P::ToCancel => TransformStatus::ToCancel,
            P::Cancelling => TransformStatus::Cancelling,
            P::ToSuspend => TransformStatus::ToSuspend,
            P::Suspending => TransformStatus::Suspending,
            P::Suspended => TransformStatus::Suspended,
            P::ToResume => TransformStatus::ToResume,
            P::Resuming => TransformStatus::Resuming,
            P::ToExpire => TransformStatus::ToExpire,
            P::Expiring => TransformStatus::Expiring,
            P::Expired => TransformStatus::Expired,
            P::ToFinish => TransformStatus::ToFinish,
            P::ToForceFinish => TransformStatus::ToForceFinish,
            P::Terminating => TransformStatus::Terminating,
        }
    }
}

impl ProcessingStatus {
    pub const NEW: &'static [ProcessingStatus] = &[ProcessingStatus::New];

    pub const RUNNING: &'static [ProcessingStatus] = &[
        ProcessingStatus::Submitting,
        ProcessingStatus::Submitted,
        ProcessingStatus::Running,
        ProcessingStatus::ToCancel,
        ProcessingStatus::Cancelling,
        ProcessingStatus::ToSuspend,
        ProcessingStatus::Suspending,
        ProcessingStatus::ToResume,
        ProcessingStatus::Resuming,
        ProcessingStatus::ToExpire,
        ProcessingStatus::Expiring,
        ProcessingStatus::ToFinish,
        ProcessingStatus::ToForceFinish,
        ProcessingStatus::Terminating,
        ProcessingStatus::ToTrigger,
        ProcessingStatus::Triggering,
        ProcessingStatus::Synchronizing,
    ];

    pub const RESUMABLE: &'static [ProcessingStatus] = &[
        ProcessingStatus::SubFinished,
        ProcessingStatus::Failed,
        ProcessingStatus::Lost,
        ProcessingStatus::Cancelled,
        ProcessingStatus::Suspended,
        ProcessingStatus::Expired,
        ProcessingStatus::TimeOut,
        ProcessingStatus::Broken,
    ];

    pub const ACTIVE: &'static [ProcessingStatus] = &[
        ProcessingStatus::Submitting,
        ProcessingStatus::Submitted,
        ProcessingStatus::Running,
    ];

    pub fn is_terminal(self) -> bool {
        TransformStatus::from_processing(self).is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_names_round_trip() {
        for status in ProcessingStatus::ALL {
            assert_eq!(ProcessingStatus::from_code(status.code()), Some(*status));
            assert_eq!(status.as_str().parse::<ProcessingStatus>().unwrap(), *status);
        }
        assert_eq!(RequestStatus::Throttling.code(), 23);
        assert_eq!(TransformStatus::from_code(23), None);
    }

    #[test]
    fn processing_maps_onto_transform() {
        use ProcessingStatus as P;
        assert_eq!(TransformStatus::from_processing(P::Submitted), TransformStatus::Transforming);
        assert_eq!(TransformStatus::from_processing(P::FinishedOnExec), TransformStatus::Finished);
        assert_eq!(TransformStatus::from_processing(P::Broken), TransformStatus::Failed);
        assert_eq!(TransformStatus::from_processing(P::Cancel), TransformStatus::Cancelled);
        assert_eq!(TransformStatus::from_processing(P::Expiring), TransformStatus::Expiring);
    }

    #[test]
    fn terminal_sets() {
        assert!(ProcessingStatus::Lost.is_terminal());
        assert!(ProcessingStatus::TimeOut.is_terminal());
        assert!(!ProcessingStatus::Submitted.is_terminal());
        assert!(RequestStatus::SubFinished.is_terminal());
        assert!(!RequestStatus::Throttling.is_terminal());
        assert!(!TransformStatus::Built.is_terminal());
    }
}
