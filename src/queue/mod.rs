//! L1: one priority-and-aging ordered queue per resource group.

pub mod group_queue;
pub mod ordering;

pub use group_queue::{
    CancelOutcome, FactoryRegistry, InternalQueue, OperationFactory, OperationOutcome,
    run_dispatch_loop,
};
