pub mod document;
pub mod matcher;
pub mod store;
pub mod validation;

pub use document::{parse_bundle, DocumentError, DocumentFormat, PolicyBundle};
pub use matcher::{trigger_matches, PolicyMatcher};
pub use store::PolicyStore;
pub use validation::{validate_policy, validate_watcher_rule, PolicyValidationError};
