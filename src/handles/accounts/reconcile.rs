//! The decision core: compare each desired spec with the probed account
//! store and issue the corrective actions.
//!
//! Specs are handled one at a time in the order produced by
//! [`dedup_and_order`](super::order::dedup_and_order). A failure for one
//! account is reported and never stops the next one.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::backends::accounts::{AccountStore, ShadowRecord, UserChanges, UserRecord};

use super::action::{Action, ActionRecord, ActionStatus, Executor};
use super::config::ReconcilerConfig;
use super::entry::{AccountSpec, Mode};
use super::error::{AccountError, Diagnostic, Severity};

/// Everything one reconciliation pass did or would do
#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub actions: Vec<ActionRecord>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ReconcileReport {
    /// True when a probe or a mutation failed for some account.
    pub fn has_failures(&self) -> bool {
        self.diagnostics.iter().any(|d| {
            matches!(
                d.error,
                AccountError::ProbeError { .. } | AccountError::MutationFailure { .. }
            )
        })
    }

    pub fn count(&self, status: ActionStatus) -> usize {
        self.actions.iter().filter(|a| a.status == status).count()
    }

    pub fn count_severity(&self, severity: Severity) -> usize {
        self.diagnostics.iter().filter(|d| d.severity == severity).count()
    }

    fn warn(&mut self, error: AccountError) {
        self.diagnostics.push(Diagnostic::warning(error));
    }

    fn fail(&mut self, error: AccountError) {
        self.diagnostics.push(Diagnostic::error(error));
    }
}

/// Fields that must be passed explicitly to bring the account in line.
///
/// Password hashes are compared as raw strings; home is only considered
/// when the spec names one.
pub fn diff_account(spec: &AccountSpec, user: Option<&UserRecord>, shadow: Option<&ShadowRecord>) -> UserChanges {
    let mut changes = UserChanges::default();

    if user.map(|u| u.uid) != Some(spec.uid) {
        changes.uid = Some(spec.uid);
    }
    if user.map(|u| u.gid) != Some(spec.gid) {
        changes.gid = Some(spec.gid);
    }
    if shadow.map(|s| s.password_hash.as_str()) != Some(spec.password_hash.as_str()) {
        changes.password_hash = Some(spec.password_hash.clone());
    }
    if let Some(home) = &spec.home_dir {
        if user.and_then(|u| u.home.as_deref()) != Some(home.as_str()) {
            changes.home_dir = Some(home.clone());
        }
    }

    changes
}

pub struct Reconciler {
    config: ReconcilerConfig,
    executor: Executor,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig, dry_run: bool) -> Self {
        Self {
            config,
            executor: Executor::new(dry_run),
        }
    }

    pub fn reconcile(&self, specs: &[AccountSpec], store: &mut dyn AccountStore) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        // gids a dry run has already planned to create; nothing is created yet
        let mut planned_groups = BTreeSet::new();
        for spec in specs {
            self.reconcile_spec(spec, store, &mut report, &mut planned_groups);
        }
        log::info!(
            "reconciled {} spec(s): {} applied, {} planned, {} failed",
            specs.len(),
            report.count(ActionStatus::Applied),
            report.count(ActionStatus::Planned),
            report.count(ActionStatus::Failed)
        );
        report
    }

    fn reconcile_spec(
        &self,
        spec: &AccountSpec,
        store: &mut dyn AccountStore,
        report: &mut ReconcileReport,
        planned_groups: &mut BTreeSet<u32>,
    ) {
        let username = spec.username.as_str();

        if spec.gid == 0 && username != "root" {
            report.fail(AccountError::PolicyViolation {
                username: username.to_string(),
                reason: "refusing to add non-root user to group 0".to_string(),
            });
            return;
        }

        if spec.mode == Mode::Delete {
            self.reconcile_delete(spec, store, report);
            return;
        }

        let Some((user, shadow)) = probe_account(username, store, report) else {
            return;
        };
        let group_exists = match store.group_exists(spec.gid) {
            Ok(exists) => exists || planned_groups.contains(&spec.gid),
            Err(e) => {
                report.fail(probe_error(username, &e));
                return;
            }
        };

        if !group_exists {
            let action = Action::CreateGroup {
                gid: spec.gid,
                name: username.to_string(),
            };
            // the user step may still succeed, e.g. when the gid shows up via NSS late
            if self.run(action, store, report, Severity::Warning) && self.executor.dry_run {
                planned_groups.insert(spec.gid);
            }
        }

        let changes = diff_account(spec, user.as_ref(), shadow.as_ref());
        let exists = user.is_some() || shadow.is_some();
        let user_action = if !exists {
            Some(Action::CreateUser {
                username: username.to_string(),
                changes,
            })
        } else if !changes.is_empty() {
            Some(Action::ModifyUser {
                username: username.to_string(),
                changes,
            })
        } else {
            log::debug!("{}: account already matches desired state", username);
            None
        };

        if let Some(action) = user_action {
            if !self.run(action, store, report, Severity::Error) {
                return;
            }
        }

        if spec.mode == Mode::ExpireNever {
            self.enforce_no_expiration(username, store, report);
        }
    }

    fn reconcile_delete(&self, spec: &AccountSpec, store: &mut dyn AccountStore, report: &mut ReconcileReport) {
        let username = spec.username.as_str();

        if self.config.is_protected(username) {
            report.warn(AccountError::PolicyViolation {
                username: username.to_string(),
                reason: "refusing to delete protected account".to_string(),
            });
            return;
        }
        if spec.uid == 0 {
            report.warn(AccountError::PolicyViolation {
                username: username.to_string(),
                reason: "refusing to delete an account with uid 0".to_string(),
            });
            return;
        }

        let Some((user, shadow)) = probe_account(username, store, report) else {
            return;
        };
        if user.as_ref().is_some_and(|u| u.uid == 0) {
            report.warn(AccountError::PolicyViolation {
                username: username.to_string(),
                reason: "refusing to delete an account with uid 0".to_string(),
            });
            return;
        }

        if user.is_none() && shadow.is_none() {
            log::debug!("{}: already absent", username);
            return;
        }

        let action = Action::DeleteUser {
            username: username.to_string(),
            remove_home: true,
        };
        self.run(action, store, report, Severity::Error);
    }

    fn enforce_no_expiration(&self, username: &str, store: &mut dyn AccountStore, report: &mut ReconcileReport) {
        // fresh read: the create/modify step may have reset aging fields
        let shadow = match store.lookup_shadow(username) {
            Ok(shadow) => shadow,
            Err(e) => {
                report.fail(probe_error(username, &e));
                return;
            }
        };

        if shadow.as_ref().is_some_and(ShadowRecord::is_non_expiring) {
            return;
        }

        let action = Action::ClearExpiration {
            username: username.to_string(),
        };
        self.run(action, store, report, Severity::Error);
    }

    /// Execute and record one action; a failure is reported at `severity`.
    fn run(&self, action: Action, store: &mut dyn AccountStore, report: &mut ReconcileReport, severity: Severity) -> bool {
        let record = self.executor.run(action, store);
        let ok = record.succeeded();
        if !ok {
            let err = AccountError::MutationFailure {
                username: record.action.subject().to_string(),
                operation: record.action.operation().to_string(),
                cause: record.error.clone().unwrap_or_default(),
            };
            match severity {
                Severity::Warning => report.warn(err),
                Severity::Error => report.fail(err),
            }
        }
        report.actions.push(record);
        ok
    }
}

fn probe_error(username: &str, e: &anyhow::Error) -> AccountError {
    AccountError::ProbeError {
        username: username.to_string(),
        cause: format!("{:#}", e),
    }
}

/// Read the user and shadow records. `None` means the probe failed and was
/// already reported; existence is not guessed in that case.
fn probe_account(
    username: &str,
    store: &dyn AccountStore,
    report: &mut ReconcileReport,
) -> Option<(Option<UserRecord>, Option<ShadowRecord>)> {
    let user = match store.lookup_user(username) {
        Ok(user) => user,
        Err(e) => {
            report.fail(probe_error(username, &e));
            return None;
        }
    };
    let shadow = match store.lookup_shadow(username) {
        Ok(shadow) => shadow,
        Err(e) => {
            report.fail(probe_error(username, &e));
            return None;
        }
    };
    Some((user, shadow))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::accounts::{MockBackend, MockOp, NO_LIMIT};
    use crate::handles::accounts::config::ModeChars;
    use crate::handles::accounts::entry::parse_entries;
    use crate::handles::accounts::order::dedup_and_order;

    fn ordered(lines: &[&str]) -> Vec<AccountSpec> {
        let parsed = parse_entries(lines, &ModeChars::default());
        assert!(parsed.issues.is_empty(), "{:?}", parsed.issues);
        dedup_and_order(parsed.specs).specs
    }

    fn apply(lines: &[&str], backend: &MockBackend) -> ReconcileReport {
        let mut store = backend.clone();
        Reconciler::new(ReconcilerConfig::default(), false).reconcile(&ordered(lines), &mut store)
    }

    fn plan(lines: &[&str], backend: &MockBackend) -> ReconcileReport {
        let mut store = backend.clone();
        Reconciler::new(ReconcilerConfig::default(), true).reconcile(&ordered(lines), &mut store)
    }

    fn actions(report: &ReconcileReport) -> Vec<Action> {
        report.actions.iter().map(|r| r.action.clone()).collect()
    }

    fn jdoe_in_sync() -> MockBackend {
        MockBackend::new()
            .with_group(1500, "jdoe")
            .with_user("jdoe", 1500, 1500, Some("/home/jdoe"))
            .with_shadow("jdoe", "abc123hash", NO_LIMIT, NO_LIMIT, 99999)
    }

    #[test]
    fn test_new_account_without_home() {
        let backend = MockBackend::new();
        let report = plan(&["jdoe,1500,1500,,abc123hash"], &backend);

        assert_eq!(
            actions(&report),
            vec![
                Action::CreateGroup {
                    gid: 1500,
                    name: "jdoe".to_string()
                },
                Action::CreateUser {
                    username: "jdoe".to_string(),
                    changes: UserChanges {
                        uid: Some(1500),
                        gid: Some(1500),
                        password_hash: Some("abc123hash".to_string()),
                        home_dir: None,
                    },
                },
            ]
        );
        assert!(report.diagnostics.is_empty());
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_in_sync_account_only_clears_expiration() {
        let backend = jdoe_in_sync();
        let report = apply(&["!jdoe,1500,1500,/home/jdoe,abc123hash"], &backend);

        assert_eq!(
            actions(&report),
            vec![Action::ClearExpiration {
                username: "jdoe".to_string()
            }]
        );
        assert!(backend.shadow("jdoe").unwrap().is_non_expiring());
    }

    #[test]
    fn test_protected_account_is_never_deleted() {
        let backend = MockBackend::new()
            .with_group(0, "root")
            .with_user("root", 0, 0, Some("/root"))
            .with_shadow("root", "x", NO_LIMIT, NO_LIMIT, NO_LIMIT)
            .with_user("daemon", 1, 1, None);

        let report = apply(&["-root,0,0,,x", "-daemon,1,1,,x", "-puppet,52,52,,x"], &backend);

        assert!(report.actions.is_empty());
        assert_eq!(report.count_severity(Severity::Warning), 3);
        assert!(report
            .diagnostics
            .iter()
            .all(|d| d.code == "accounts.policy_violation"));
        assert!(backend.user("root").is_some());
        assert!(!report.has_failures());
    }

    #[test]
    fn test_custom_protected_set() {
        let backend = MockBackend::new().with_user("svc", 900, 900, None);
        let mut config = ReconcilerConfig::default();
        config.protected_users.insert("svc".to_string());

        let mut store = backend.clone();
        let report = Reconciler::new(config, false).reconcile(&ordered(&["-svc,900,900,,x"]), &mut store);
        assert!(report.actions.is_empty());
        assert!(backend.user("svc").is_some());
    }

    #[test]
    fn test_uid_zero_is_never_deleted() {
        let backend = MockBackend::new().with_user("toor", 0, 5, None);
        let report = apply(&["-toor,0,5,,x", "-toor2,1000,5,,x"], &backend);
        assert!(report.actions.is_empty());
        assert_eq!(report.count_severity(Severity::Warning), 1);

        // desired uid is harmless but the live account is uid 0
        let report = apply(&["-toor,1000,5,,x"], &backend);
        assert!(report.actions.is_empty());
        assert_eq!(report.count_severity(Severity::Warning), 1);
        assert!(backend.user("toor").is_some());
    }

    #[test]
    fn test_non_root_group_zero_is_refused() {
        let backend = MockBackend::new().with_group(0, "root");
        for line in ["eve,1600,0,,h", "!eve,1600,0,,h", "-eve,1600,0,,h", "+eve,1600,0,/home/eve,h"] {
            let report = apply(&[line], &backend);
            assert!(report.actions.is_empty(), "{}", line);
            assert_eq!(report.diagnostics.len(), 1);
            assert_eq!(report.diagnostics[0].severity, Severity::Error);
            assert_eq!(report.diagnostics[0].code, "accounts.policy_violation");
        }
        assert!(backend.calls().is_empty());

        // root itself may have gid 0
        let report = plan(&["root,0,0,/root,h"], &MockBackend::new().with_group(0, "root"));
        assert_eq!(report.actions.len(), 1);
    }

    #[test]
    fn test_delete_existing_and_absent() {
        let backend = MockBackend::new()
            .with_group(2000, "old")
            .with_user("old", 2000, 2000, None)
            .with_shadow("old", "h", NO_LIMIT, NO_LIMIT, NO_LIMIT);

        let report = apply(&["-old,2000,2000,,h", "-ghost,2001,2001,,h"], &backend);
        assert_eq!(
            actions(&report),
            vec![Action::DeleteUser {
                username: "old".to_string(),
                remove_home: true
            }]
        );
        assert!(backend.user("old").is_none());
        assert!(backend.group(2000).is_none());
    }

    #[test]
    fn test_deletes_run_before_creates() {
        // the new account reuses the uid and gid of the one being removed
        let backend = MockBackend::new()
            .with_group(3000, "legacy")
            .with_user("legacy", 3000, 3000, None)
            .with_shadow("legacy", "h", NO_LIMIT, NO_LIMIT, NO_LIMIT);

        let report = apply(&["fresh,3000,3000,,h2", "-legacy,3000,3000,,h"], &backend);

        let kinds: Vec<&str> = report.actions.iter().map(|r| r.action.kind()).collect();
        assert_eq!(kinds, vec!["delete_user", "create_group", "create_user"]);
        assert!(report.actions.iter().all(ActionRecord::succeeded));
        assert_eq!(backend.user("fresh").unwrap().uid, 3000);
        assert_eq!(backend.calls()[0], "userdel -r legacy");
    }

    #[test]
    fn test_modify_only_changed_fields() {
        let backend = jdoe_in_sync();
        let report = apply(&["jdoe,1500,1500,/srv/jdoe,newhash"], &backend);

        assert_eq!(
            actions(&report),
            vec![Action::ModifyUser {
                username: "jdoe".to_string(),
                changes: UserChanges {
                    uid: None,
                    gid: None,
                    password_hash: Some("newhash".to_string()),
                    home_dir: Some("/srv/jdoe".to_string()),
                },
            }]
        );
        assert_eq!(backend.calls(), vec!["usermod -p ***REDACTED*** -d /srv/jdoe jdoe"]);
    }

    #[test]
    fn test_identical_account_produces_nothing() {
        let backend = jdoe_in_sync();
        for line in ["jdoe,1500,1500,/home/jdoe,abc123hash", "+jdoe,1500,1500,,abc123hash"] {
            let report = apply(&[line], &backend);
            assert!(report.actions.is_empty(), "{}", line);
            assert!(report.diagnostics.is_empty());
        }
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_shadow_only_account_counts_as_existing() {
        let backend = MockBackend::new()
            .with_group(1500, "jdoe")
            .with_shadow("jdoe", "abc123hash", NO_LIMIT, NO_LIMIT, NO_LIMIT);
        let report = plan(&["jdoe,1500,1500,,abc123hash"], &backend);
        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action.kind(), "modify_user");
        assert_eq!(report.actions[0].action.fields(), vec!["uid", "gid"]);
    }

    #[test]
    fn test_second_run_is_idempotent() {
        let backend = MockBackend::new().with_group(0, "root").with_user("gone", 4000, 4000, None);
        let lines = [
            "alice,1001,1001,/home/alice,h1",
            "!bob,1002,1002,,h2",
            "+carol,1003,1003,,h3",
            "-gone,4000,4000,,x",
            "-root,0,0,,x",
        ];

        let first = apply(&lines, &backend);
        assert!(!first.actions.is_empty());
        assert!(first.actions.iter().all(ActionRecord::succeeded));

        let calls_after_first = backend.calls().len();
        let second = apply(&lines, &backend);
        assert!(second.actions.is_empty(), "{:?}", actions(&second));
        assert_eq!(backend.calls().len(), calls_after_first);
    }

    #[test]
    fn test_group_failure_does_not_block_user_step() {
        let backend = MockBackend::new().failing_on(MockOp::CreateGroup);
        let report = apply(&["jdoe,1500,1500,,h"], &backend);

        let statuses: Vec<ActionStatus> = report.actions.iter().map(|r| r.status).collect();
        // group missing, so the mock also rejects the user
        assert_eq!(statuses, vec![ActionStatus::Failed, ActionStatus::Failed]);
        assert_eq!(report.diagnostics[0].severity, Severity::Warning);
        assert_eq!(report.diagnostics[1].severity, Severity::Error);
        assert!(report.has_failures());
    }

    #[test]
    fn test_failed_user_step_skips_expiration_and_batch_continues() {
        let backend = MockBackend::new()
            .with_group(1500, "jdoe")
            .with_group(1600, "kim")
            .failing_on(MockOp::CreateUser);
        let report = apply(&["!jdoe,1500,1500,,h", "-kim,1600,1600,,h", "lee,1700,1700,,h"], &backend);

        let kinds: Vec<&str> = report.actions.iter().map(|r| r.action.kind()).collect();
        assert_eq!(kinds, vec!["create_user", "create_group", "create_user"]);
        assert!(report.actions.iter().all(|r| r.status == ActionStatus::Failed || r.action.kind() == "create_group"));

        let failures: Vec<&str> = report
            .diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].starts_with("jdoe: create user failed"));
        assert!(failures[1].starts_with("lee: create user failed"));
    }

    #[test]
    fn test_probe_failure_aborts_only_that_spec() {
        let backend = MockBackend::new().with_group(1, "a").with_group(2, "b").failing_lookup("a");
        let report = plan(&["a,1,1,,h", "b,2,2,,h"], &backend);

        assert_eq!(report.actions.len(), 1);
        assert_eq!(report.actions[0].action.subject(), "b");
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].code, "accounts.probe_error");
        assert!(report.has_failures());
    }

    #[test]
    fn test_group_lookup_failure_aborts_only_that_spec() {
        let backend = MockBackend::new().with_group(2, "b").failing_group_lookup(1);
        let report = apply(&["!a,1,1,,h", "b,2,2,,h"], &backend);

        let subjects: Vec<(&str, &str)> = report
            .actions
            .iter()
            .map(|r| (r.action.kind(), r.action.subject()))
            .collect();
        assert_eq!(subjects, vec![("create_user", "b")]);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].code, "accounts.probe_error");
        assert_eq!(report.diagnostics[0].severity, Severity::Error);
        assert!(report.has_failures());
        assert!(backend.user("a").is_none());
        assert!(backend.user("b").is_some());
    }

    #[test]
    fn test_shadow_reprobe_failure_skips_clear_expiration() {
        // the first shadow lookup is the initial probe, the second the re-read
        let backend = jdoe_in_sync()
            .with_group(1600, "kim")
            .failing_shadow_lookup_after("jdoe", 1);
        let report = apply(&["!jdoe,1500,1500,/home/jdoe,abc123hash", "kim,1600,1600,,h"], &backend);

        let subjects: Vec<(&str, &str)> = report
            .actions
            .iter()
            .map(|r| (r.action.kind(), r.action.subject()))
            .collect();
        assert_eq!(subjects, vec![("create_user", "kim")]);
        assert_eq!(report.diagnostics.len(), 1);
        assert_eq!(report.diagnostics[0].code, "accounts.probe_error");
        assert!(!backend.shadow("jdoe").unwrap().is_non_expiring());
        assert!(backend.user("kim").is_some());
    }

    #[test]
    fn test_plan_creates_shared_group_once() {
        let lines = ["a,1001,100,,h1", "b,1002,100,,h2"];
        let planned = plan(&lines, &MockBackend::new());
        let planned_kinds: Vec<&str> = planned.actions.iter().map(|r| r.action.kind()).collect();
        assert_eq!(planned_kinds, vec!["create_group", "create_user", "create_user"]);

        let backend = MockBackend::new();
        let applied = apply(&lines, &backend);
        let applied_kinds: Vec<&str> = applied.actions.iter().map(|r| r.action.kind()).collect();
        assert_eq!(applied_kinds, planned_kinds);
        assert!(applied.actions.iter().all(ActionRecord::succeeded));
        assert_eq!(backend.group(100).as_deref(), Some("a"));
    }

    #[test]
    fn test_plan_new_expire_never_account_includes_clear() {
        let backend = MockBackend::new().with_group(1500, "jdoe");
        let report = plan(&["!jdoe,1500,1500,,h"], &backend);
        let kinds: Vec<&str> = report.actions.iter().map(|r| r.action.kind()).collect();
        assert_eq!(kinds, vec!["create_user", "clear_expiration"]);
        assert_eq!(report.count(ActionStatus::Planned), 2);
    }

    #[test]
    fn test_duplicate_keeps_first_values() {
        let backend = MockBackend::new();
        let parsed = parse_entries(&["bob,100,100,,h1", "bob,200,200,,h2"], &ModeChars::default());
        let ordered = dedup_and_order(parsed.specs);
        assert_eq!(ordered.duplicates.len(), 1);

        let mut store = backend.clone();
        let report = Reconciler::new(ReconcilerConfig::default(), false).reconcile(&ordered.specs, &mut store);
        assert_eq!(report.count(ActionStatus::Applied), 2);
        assert_eq!(backend.user("bob").unwrap().uid, 100);
        assert_eq!(backend.shadow("bob").unwrap().password_hash, "h1");
    }

    #[test]
    fn test_diff_account() {
        let spec = ordered(&["jdoe,1500,1500,,abc123hash"]).remove(0);
        let user = UserRecord {
            username: "jdoe".to_string(),
            uid: 1500,
            gid: 100,
            home: Some("/home/jdoe".to_string()),
        };
        let changes = diff_account(&spec, Some(&user), None);
        assert_eq!(changes.fields(), vec!["gid", "password"]);

        let changes = diff_account(&spec, None, None);
        assert_eq!(changes.fields(), vec!["uid", "gid", "password"]);
    }
}
