//! The purpose of this module is to alleviate the need to import many of the `jobfabrik` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use jobfabrik::prelude::*;
//! ```
pub use crate::backend::{Backend, BackendError};
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::catalog::{JobCatalog, Runnable, Services};
pub use crate::config::{JobsConfig, SchedulerConfig};
pub use crate::job::run::{Completion, JobRun};
pub use crate::job::{Job, JobData, JobKind};
pub use crate::manager::{ScheduleAttributes, ScheduleManager};
pub use crate::notifier::{Event, EventBus};
pub use crate::repository::{Repository, User};
pub use crate::scheduler::{Scheduler, SchedulerState};
pub use crate::{JobFabrikError, Result};
