//! Scheduler error types.
//!
//! Every variant here is a request error: the caller supplied inputs
//! that violate the contract, and no engine state was mutated. Soft
//! placement failures (no free cells) are not errors; they come back as
//! wait results. Internal invariant violations panic, because the
//! engine cannot continue correctly past them.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("virtual cluster {0} does not exist")]
    UnknownVirtualCluster(String),

    #[error("virtual cluster {vc} does not have reservation {id}")]
    UnknownReservation { vc: String, id: String },

    #[error("opportunistic pod not supported to use reservation {0}")]
    OpportunisticReservation(String),

    #[error("pod requesting GPU type {0} which the whole cluster does not have")]
    UnknownGpuType(String),

    #[error("pod requesting GPU type {gpu_type} which virtual cluster {vc} does not have")]
    GpuTypeNotInVc { gpu_type: String, vc: String },

    #[error("virtual cluster {vc} has no quota cell large enough for {gpu_number} GPUs")]
    QuotaTooSmall { vc: String, gpu_number: u32 },

    #[error(
        "requesting more pods than the configured number for {gpu_number} GPUs \
         in affinity group {group}"
    )]
    TooManyPods { group: String, gpu_number: u32 },

    #[error("affinity group {0} does not exist since it is not allocated")]
    UnknownAffinityGroup(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
