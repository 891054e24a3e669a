//! Approval chain construction and progression for leave requests.

pub mod chain;
pub mod progression;
pub mod resolver;
pub mod store;

pub use chain::StepChainBuilder;
pub use progression::{
    CancelOutcome, ChainState, FanOutRule, PolicyChain, ProgressionError, ProgressionTracker,
    RequestChains, Transition, TransitionOutcome,
};
pub use resolver::{
    ApproverResolver, DepartmentSupervision, DirectoryUser, InMemoryUserDirectory,
    ProjectMembership, UserDirectory,
};
pub use store::StepStore;
