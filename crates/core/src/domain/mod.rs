pub mod leave_request;
pub mod org;
pub mod policy;
pub mod step;
