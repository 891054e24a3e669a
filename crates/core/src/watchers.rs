//! Status-change fan-out to watchers, independent of approval progression.

use std::collections::BTreeSet;

use tracing::warn;

use crate::approvals::resolver::ApproverResolver;
use crate::domain::leave_request::LeaveRequest;
use crate::domain::org::UserId;
use crate::domain::policy::{Policy, RequestEvent, WatcherRule, WatcherSpec, WatcherTarget};
use crate::policy::matcher::trigger_matches;
use crate::policy::validation::validate_watcher_rule;

#[derive(Clone)]
pub struct WatcherNotifier {
    resolver: ApproverResolver,
}

impl WatcherNotifier {
    pub fn new(resolver: ApproverResolver) -> Self {
        Self { resolver }
    }

    /// Everyone who should hear about `event` on `request`: the watchers of the matched
    /// policies plus those of every active watcher rule whose trigger accepts the request.
    /// Unresolvable watchers are logged and skipped. The requester is never included.
    pub async fn recipients(
        &self,
        request: &LeaveRequest,
        event: RequestEvent,
        matched_policies: &[Policy],
        rules: &[WatcherRule],
    ) -> Vec<UserId> {
        let trigger = request.trigger_context();
        let mut specs: Vec<(&str, &WatcherSpec)> = matched_policies
            .iter()
            .flat_map(|policy| policy.watchers.iter().map(move |spec| (policy.id.0.as_str(), spec)))
            .collect();

        for rule in rules.iter().filter(|rule| rule.is_active) {
            if let Err(error) = validate_watcher_rule(rule) {
                warn!(
                    event_name = "watcher.rule.skipped_corrupt",
                    watcher_rule_id = %rule.id,
                    error = %error,
                    "skipping watcher rule with invalid definition"
                );
                continue;
            }
            if trigger_matches(&rule.trigger, &trigger) {
                specs.extend(rule.watchers.iter().map(|spec| (rule.id.0.as_str(), spec)));
            }
        }

        let mut recipients = BTreeSet::new();
        for (owner, spec) in specs.into_iter().filter(|(_, spec)| spec.applies_to(event)) {
            recipients.extend(self.resolve(request, owner, spec).await);
        }
        recipients.remove(&request.requester_id);
        recipients.into_iter().collect()
    }

    async fn resolve(&self, request: &LeaveRequest, owner: &str, spec: &WatcherSpec) -> Vec<UserId> {
        match &spec.target {
            WatcherTarget::User { user_id } => vec![user_id.clone()],
            WatcherTarget::Role { role_id, scope } => {
                match self.resolver.resolve_scope(role_id, scope, &request.resolution_context()).await
                {
                    Ok(users) => {
                        if users.is_empty() {
                            warn!(
                                event_name = "watcher.resolve.empty",
                                leave_request_id = %request.id,
                                owner,
                                role_id = %role_id,
                                scope = scope.kind(),
                                "watcher role resolved to nobody"
                            );
                        }
                        users
                    }
                    Err(error) => {
                        warn!(
                            event_name = "watcher.resolve.failed",
                            leave_request_id = %request.id,
                            owner,
                            role_id = %role_id,
                            error = %error,
                            "skipping unresolvable watcher"
                        );
                        Vec::new()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use chrono::Utc;

    use super::WatcherNotifier;
    use crate::approvals::resolver::{ApproverResolver, DirectoryUser, InMemoryUserDirectory};
    use crate::domain::leave_request::{LeaveRequest, LeaveRequestId, LeaveRequestStatus};
    use crate::domain::org::{CompanyId, RoleId, UserId};
    use crate::domain::policy::{
        ApproverScope, Policy, PolicyId, RequestEvent, StepTemplate, TriggerAxis,
        TriggerPredicate, WatcherRule, WatcherRuleId, WatcherSpec, WatcherTarget,
    };

    fn request() -> LeaveRequest {
        LeaveRequest {
            id: LeaveRequestId("LR-1".to_string()),
            company_id: CompanyId("acme".to_string()),
            requester_id: UserId("u-req".to_string()),
            request_type: "vacation".to_string(),
            project_id: None,
            project_type: None,
            department_id: None,
            contract_type_id: None,
            subject_role_id: None,
            status: LeaveRequestStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn hr_user(id: &str) -> DirectoryUser {
        DirectoryUser {
            id: UserId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            default_role_id: Some(RoleId("hr".to_string())),
            is_active: true,
        }
    }

    fn notifier() -> WatcherNotifier {
        let directory = InMemoryUserDirectory::new(
            vec![hr_user("u-hr-1"), hr_user("u-hr-2"), hr_user("u-req")],
            Vec::new(),
            Vec::new(),
        );
        WatcherNotifier::new(ApproverResolver::new(Arc::new(directory)))
    }

    fn user_watcher(id: &str, events: &[RequestEvent]) -> WatcherSpec {
        WatcherSpec {
            target: WatcherTarget::User { user_id: UserId(id.to_string()) },
            events: events.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    fn policy(watchers: Vec<WatcherSpec>) -> Policy {
        Policy {
            id: PolicyId("P1".to_string()),
            company_id: CompanyId("acme".to_string()),
            name: "Vacation".to_string(),
            is_active: true,
            trigger: TriggerPredicate::default(),
            steps: vec![StepTemplate {
                sequence_order: 1,
                approver_role_id: RoleId("hr".to_string()),
                scope: ApproverScope::CompanyWide,
            }],
            watchers,
        }
    }

    fn rule(id: &str, trigger: TriggerPredicate, watchers: Vec<WatcherSpec>) -> WatcherRule {
        WatcherRule {
            id: WatcherRuleId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            name: id.to_string(),
            is_active: true,
            trigger,
            watchers,
        }
    }

    #[tokio::test]
    async fn combines_policy_and_rule_watchers_filtered_by_event() {
        let policies = vec![policy(vec![
            user_watcher("u-manager", &[RequestEvent::Approved]),
            WatcherSpec {
                target: WatcherTarget::Role {
                    role_id: RoleId("hr".to_string()),
                    scope: ApproverScope::CompanyWide,
                },
                events: BTreeSet::new(),
            },
        ])];
        let rules = vec![
            rule(
                "wr-vacation",
                TriggerPredicate::default().with_values(TriggerAxis::RequestType, ["vacation"]),
                vec![user_watcher("u-payroll", &[]), user_watcher("u-hr-1", &[])],
            ),
            rule(
                "wr-sick",
                TriggerPredicate::default().with_values(TriggerAxis::RequestType, ["sick"]),
                vec![user_watcher("u-nurse", &[])],
            ),
        ];

        let recipients = notifier()
            .recipients(&request(), RequestEvent::Submitted, &policies, &rules)
            .await;

        let ids: Vec<&str> = recipients.iter().map(|user| user.0.as_str()).collect();
        assert_eq!(ids, vec!["u-hr-1", "u-hr-2", "u-payroll"]);
    }

    #[tokio::test]
    async fn requester_is_never_their_own_watcher() {
        let policies = vec![policy(vec![user_watcher("u-req", &[])])];
        let recipients =
            notifier().recipients(&request(), RequestEvent::Canceled, &policies, &[]).await;
        assert!(recipients.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_watchers_are_skipped() {
        let notifier =
            WatcherNotifier::new(ApproverResolver::new(Arc::new(InMemoryUserDirectory::unavailable())));
        let policies = vec![policy(vec![
            WatcherSpec {
                target: WatcherTarget::Role {
                    role_id: RoleId("hr".to_string()),
                    scope: ApproverScope::CompanyWide,
                },
                events: BTreeSet::new(),
            },
            user_watcher("u-direct", &[]),
        ])];

        let recipients = notifier.recipients(&request(), RequestEvent::Rejected, &policies, &[]).await;
        assert_eq!(recipients, vec![UserId("u-direct".to_string())]);
    }

    #[tokio::test]
    async fn inactive_rules_are_ignored() {
        let mut inactive = rule("wr-off", TriggerPredicate::default(), vec![user_watcher("u-x", &[])]);
        inactive.is_active = false;
        let recipients =
            notifier().recipients(&request(), RequestEvent::Submitted, &[], &[inactive]).await;
        assert!(recipients.is_empty());
    }
}
