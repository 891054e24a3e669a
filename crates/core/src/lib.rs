pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod notify;
pub mod policy;
pub mod watchers;

pub use approvals::{
    ApproverResolver, CancelOutcome, ChainState, FanOutRule, InMemoryUserDirectory,
    ProgressionError, ProgressionTracker, RequestChains, StepChainBuilder, StepStore,
    Transition, TransitionOutcome, UserDirectory,
};
pub use domain::leave_request::{LeaveRequest, LeaveRequestId, LeaveRequestStatus};
pub use domain::org::{Actor, CompanyId, DepartmentId, ProjectId, RoleId, UserId};
pub use domain::policy::{ApproverScope, Policy, PolicyId, RequestEvent, WatcherRule};
pub use domain::step::{ApprovalStep, Decision, StepId, StepStatus};
pub use engine::{ApprovalEngine, EnginePorts, EngineSettings, SubmissionOutcome};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use notify::{InMemoryNotificationSink, NotificationEventType, NotificationSink};
pub use policy::{PolicyMatcher, PolicyStore};
pub use watchers::WatcherNotifier;
