//! Reconciliation scenarios across the whole core
//!
//! Each test builds a desired set from declarations, runs passes against a
//! [`MockStore`] seeded with an iptables-save dump, and checks both the
//! report and the resulting store contents.

use crate::audit;
use crate::core::codec::CodecOptions;
use crate::core::desired::{Declaration, DesiredSet, Scalar, build};
use crate::core::error::Error;
use crate::core::live::KeyMode;
use crate::core::reconcile::{
    OperationKind, PassState, PersistStatus, ReconcileOptions, ReconcileReport, Reconciler,
};
use crate::core::rule::{Chain, Table};
use crate::core::test_helpers::{MockStore, StaticResolver, decl, web_decl};

const STALE_DUMP: &str = "*filter
:INPUT ACCEPT [0:0]
:FORWARD ACCEPT [0:0]
:OUTPUT ACCEPT [0:0]
-A INPUT -p tcp -m comment --comment \"stale\" -m tcp --dport 22 -j ACCEPT
COMMIT
";

fn desired(declarations: &[Declaration]) -> DesiredSet {
    build(declarations, CodecOptions::default(), StaticResolver::default())
}

fn ssh_decl() -> Declaration {
    Declaration {
        dport: vec![Scalar::Number(22)],
        ..decl("ssh")
    }
}

async fn run(set: &DesiredSet, store: &mut MockStore) -> ReconcileReport {
    run_with(ReconcileOptions::default(), set, store).await
}

async fn run_with(
    options: ReconcileOptions,
    set: &DesiredSet,
    store: &mut MockStore,
) -> ReconcileReport {
    Reconciler::new(options)
        .reconcile(set, store)
        .await
        .expect("pass should not abort")
}

#[tokio::test]
async fn test_single_rule_inserted_once_then_idempotent() {
    let set = desired(&[web_decl()]);
    let mut store = MockStore::default();

    let first = run(&set, &mut store).await;
    assert_eq!(first.state(), PassState::Converged);
    assert_eq!(store.inserts(), 1);
    assert_eq!(store.deletes(), 0);
    assert_eq!(first.inserted.len(), 1);
    assert_eq!(first.inserted[0].ordinal, 1);
    assert_eq!(
        store.chain_lines(Table::Filter, Chain::Input),
        vec!["-A INPUT -t filter -p tcp --dport 80 -m comment --comment \"web\" -j ACCEPT"]
    );

    store.clear_log();
    let second = run(&set, &mut store).await;
    assert_eq!(second.state(), PassState::Converged);
    assert_eq!(second.changes(), 0);
    assert!(store.log.is_empty(), "second pass issued {:?}", store.log);
    assert_eq!(second.persist, PersistStatus::Skipped);
}

#[tokio::test]
async fn test_stale_rule_deleted() {
    let set = desired(&[]);
    let mut store = MockStore::from_dump(STALE_DUMP);

    let report = run(&set, &mut store).await;
    assert_eq!(report.state(), PassState::Converged);
    assert_eq!(store.deletes(), 1);
    assert_eq!(store.inserts(), 0);
    assert_eq!(report.deleted[0].kind, OperationKind::Delete);
    assert!(report.deleted[0].text.contains("\"stale\""));
    assert!(store.chain_lines(Table::Filter, Chain::Input).is_empty());
}

#[tokio::test]
async fn test_save_output_with_reordered_flags_is_not_replaced() {
    // iptables-save style line for the web rule, without -t and with -m tcp
    let dump = "*filter\n-A INPUT -p tcp -m comment --comment \"web\" -m tcp --dport 80 -j ACCEPT\nCOMMIT\n";
    let set = desired(&[web_decl()]);
    let mut store = MockStore::from_dump(dump);

    let report = run(&set, &mut store).await;
    assert_eq!(report.changes(), 0);
    assert!(store.log.is_empty());
}

#[tokio::test]
async fn test_dry_run_reports_without_mutating() {
    let set = desired(&[web_decl()]);
    let mut store = MockStore::from_dump(STALE_DUMP);
    let options = ReconcileOptions {
        dry_run: true,
        ..ReconcileOptions::default()
    };

    let report = run_with(options, &set, &mut store).await;
    assert!(report.dry_run);
    assert!(store.log.is_empty());
    assert_eq!(store.dumps, 1);
    assert_eq!(store.persists, 0);
    assert_eq!(store.chain_lines(Table::Filter, Chain::Input).len(), 1);

    let kinds: Vec<OperationKind> = report.pending().iter().map(|op| op.kind).collect();
    assert_eq!(kinds, vec![OperationKind::Delete, OperationKind::Insert]);
    assert!(report.pending()[1].text.contains("\"web\""));
    assert!(report.inserted.is_empty());
    assert!(report.deleted.is_empty());
    assert_eq!(report.persist, PersistStatus::Skipped);
}

#[tokio::test]
async fn test_dry_run_of_converged_state_has_nothing_pending() {
    let set = desired(&[web_decl()]);
    let mut store = MockStore::default();
    run(&set, &mut store).await;

    let options = ReconcileOptions {
        dry_run: true,
        ..ReconcileOptions::default()
    };
    let report = run_with(options, &set, &mut store).await;
    assert!(report.pending().is_empty());
}

#[tokio::test]
async fn test_all_declarations_rejected_aborts_before_reading() {
    let bad = Declaration {
        chain: Some("OUTPUT".into()),
        iniface: Some("eth0".into()),
        ..decl("bad")
    };
    let set = desired(&[bad]);
    assert_eq!(set.rejected.len(), 1);

    let mut store = MockStore::from_dump(STALE_DUMP);
    let result = Reconciler::default().reconcile(&set, &mut store).await;
    assert!(matches!(result, Err(Error::NoValidDeclarations(1))));
    assert_eq!(store.dumps, 0);
    assert!(store.log.is_empty());
}

#[tokio::test]
async fn test_rejected_declaration_does_not_block_the_rest() {
    let bad = Declaration {
        table: Some("nat".into()),
        chain: Some("INPUT".into()),
        ..decl("bad")
    };
    let set = desired(&[bad, web_decl()]);
    let mut store = MockStore::default();

    let report = run(&set, &mut store).await;
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].rule, "bad");
    assert_eq!(report.inserted.len(), 1);
    assert_eq!(report.state(), PassState::Converged);
}

#[tokio::test]
async fn test_dump_failure_is_fatal() {
    let set = desired(&[web_decl()]);
    let mut store = MockStore {
        fail_dump: true,
        ..MockStore::default()
    };

    let result = Reconciler::default().reconcile(&set, &mut store).await;
    assert!(matches!(result, Err(Error::DumpUnavailable(_))));
    assert!(store.log.is_empty());
}

#[tokio::test]
async fn test_reread_failure_aborts_pass() {
    let set = desired(&[web_decl()]);
    let mut store = MockStore::from_dump(STALE_DUMP);
    store.fail_dump_after = Some(1);

    let report = run(&set, &mut store).await;
    assert!(report.aborted.is_some());
    assert_eq!(report.state(), PassState::Failed);
    assert_eq!(store.deletes(), 1);
    assert_eq!(store.inserts(), 0);
}

#[tokio::test]
async fn test_failed_insert_is_collected_and_others_proceed() {
    let set = desired(&[web_decl(), ssh_decl()]);
    let mut store = MockStore {
        fail_on: vec!["--comment ssh".to_string()],
        ..MockStore::default()
    };

    let report = run(&set, &mut store).await;
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.operation.kind, OperationKind::Insert);
    assert!(failure.operation.text.contains("\"ssh\""));
    assert_eq!(failure.exit_code, Some(1));

    // web was planned after ssh; it moves up into the failed slot
    assert_eq!(report.inserted.len(), 1);
    assert_eq!(report.inserted[0].ordinal, 1);
    assert_eq!(report.missing.len(), 1);
    assert_eq!(report.state(), PassState::Failed);
}

#[tokio::test]
async fn test_failed_positional_delete_retried_by_rule_match() {
    let set = desired(&[]);
    let mut store = MockStore::from_dump(STALE_DUMP);
    store.fail_on.push("\"stale\"".to_string());

    let report = run(&set, &mut store).await;
    assert_eq!(report.state(), PassState::Converged);
    assert_eq!(report.deleted.len(), 1);
    assert!(store.log[0].starts_with("delete filter INPUT matching"));
    assert!(store.chain_lines(Table::Filter, Chain::Input).is_empty());
}

#[tokio::test]
async fn test_delete_failing_both_ways_is_reported() {
    let set = desired(&[]);
    let mut store = MockStore::from_dump(STALE_DUMP);
    store.fail_on.push("\"stale\"".to_string());
    store.fail_matching = true;

    let report = run(&set, &mut store).await;
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].operation.kind, OperationKind::Delete);
    assert_eq!(report.state(), PassState::Failed);
    assert_eq!(store.chain_lines(Table::Filter, Chain::Input).len(), 1);
}

#[tokio::test]
async fn test_delete_loop_is_bounded() {
    let set = desired(&[]);
    let mut store = MockStore::from_dump(STALE_DUMP);
    store.ignore_deletes = true;

    let report = run(&set, &mut store).await;
    assert!(report.loop_bounded);
    assert_eq!(report.state(), PassState::Failed);
    // One round per delete loop, each bounded by the single live rule
    assert!(store.deletes() <= 2, "issued {} deletes", store.deletes());
}

#[tokio::test]
async fn test_duplicate_live_copies_collapse_to_one() {
    let line = "-A INPUT -p tcp -m tcp --dport 80 -m comment --comment \"web\" -j ACCEPT";
    let dump = format!("*filter\n{line}\n{line}\n{line}\nCOMMIT\n");
    let set = desired(&[web_decl()]);
    let mut store = MockStore::from_dump(&dump);

    let report = run(&set, &mut store).await;
    assert_eq!(report.state(), PassState::Converged);
    assert_eq!(store.deletes(), 2);
    assert_eq!(store.inserts(), 0);
    assert_eq!(store.chain_lines(Table::Filter, Chain::Input).len(), 1);
}

#[tokio::test]
async fn test_replaced_rule_deleted_after_its_replacement_is_in_place() {
    let dump = "*filter\n-A INPUT -p tcp -m tcp --dport 8080 -m comment --comment \"web\" -j ACCEPT\nCOMMIT\n";
    let set = desired(&[web_decl()]);
    let mut store = MockStore::from_dump(dump);

    let report = run(&set, &mut store).await;
    assert_eq!(report.state(), PassState::Converged);
    assert_eq!(store.log.len(), 2);
    assert!(store.log[0].starts_with("insert filter INPUT 1"));
    assert!(store.log[1].starts_with("delete filter INPUT 2"));

    let lines = store.chain_lines(Table::Filter, Chain::Input);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("--dport 80 "));
}

#[tokio::test]
async fn test_unmanaged_rules_untouched_and_counted_in_positions() {
    let dump = "*filter
:INPUT ACCEPT [0:0]
:f2b-sshd - [0:0]
-A INPUT -j f2b-sshd
-A INPUT -p tcp -m comment --comment \"stale\" -m tcp --dport 22 -j ACCEPT
-A f2b-sshd -s 192.0.2.7/32 -j REJECT --reject-with icmp-port-unreachable
COMMIT
";
    let set = desired(&[web_decl()]);
    let mut store = MockStore::from_dump(dump);

    let report = run(&set, &mut store).await;
    assert_eq!(report.state(), PassState::Converged);
    assert_eq!(report.unmanaged.len(), 2);
    assert_eq!(report.deleted.len(), 1);
    assert_eq!(report.deleted[0].ordinal, 2);

    let input = store.chain_lines(Table::Filter, Chain::Input);
    assert_eq!(input.len(), 2);
    assert!(input.contains(&"-A INPUT -j f2b-sshd".to_string()));
    assert!(input.iter().any(|l| l.contains("\"web\"")));

    let dump = crate::core::store::RuleStore::dump(&mut store.inner).await.unwrap();
    assert!(dump.contains("-A f2b-sshd -s 192.0.2.7/32"));
}

#[tokio::test]
async fn test_ordinal_mode_restores_declared_order() {
    let dump = "*filter
-A INPUT -p tcp -m tcp --dport 80 -m comment --comment \"web\" -j ACCEPT
-A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"ssh\" -j ACCEPT
COMMIT
";
    let set = desired(&[web_decl(), ssh_decl()]);
    let mut store = MockStore::from_dump(dump);

    let report = run(&set, &mut store).await;
    assert_eq!(report.state(), PassState::Converged);
    assert_eq!(store.inserts(), 1);
    assert_eq!(store.deletes(), 1);

    let lines = store.chain_lines(Table::Filter, Chain::Input);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("\"ssh\""));
    assert!(lines[1].contains("\"web\""));
}

#[tokio::test]
async fn test_text_mode_ignores_order() {
    let dump = "*filter
-A INPUT -p tcp -m tcp --dport 80 -m comment --comment \"web\" -j ACCEPT
-A INPUT -p tcp -m tcp --dport 22 -m comment --comment \"ssh\" -j ACCEPT
COMMIT
";
    let set = desired(&[web_decl(), ssh_decl()]);
    let mut store = MockStore::from_dump(dump);
    let options = ReconcileOptions {
        mode: KeyMode::Text,
        ..ReconcileOptions::default()
    };

    let report = run_with(options, &set, &mut store).await;
    assert_eq!(report.changes(), 0);
    assert!(store.log.is_empty());
}

#[tokio::test]
async fn test_nat_rule_round_trips_through_its_own_table() {
    let masq = Declaration {
        table: Some("nat".into()),
        chain: Some("POSTROUTING".into()),
        proto: Some("all".into()),
        outiface: Some("eth0".into()),
        jump: Some("MASQUERADE".into()),
        ..decl("masq")
    };
    let set = desired(&[masq, web_decl()]);
    let mut store = MockStore::default();

    let first = run(&set, &mut store).await;
    assert_eq!(first.inserted.len(), 2);
    assert_eq!(store.chain_lines(Table::Nat, Chain::Postrouting).len(), 1);

    store.clear_log();
    let second = run(&set, &mut store).await;
    assert_eq!(second.changes(), 0);
    assert!(store.log.is_empty());
}

#[tokio::test]
async fn test_persist_outcomes() {
    let set = desired(&[web_decl()]);

    let mut store = MockStore {
        persist_command: Some("/sbin/service iptables save".to_string()),
        ..MockStore::default()
    };
    let report = run(&set, &mut store).await;
    assert_eq!(
        report.persist,
        PersistStatus::Saved {
            command: "/sbin/service iptables save".to_string()
        }
    );

    let mut store = MockStore::default();
    let report = run(&set, &mut store).await;
    assert!(matches!(report.persist, PersistStatus::Unavailable { .. }));
    assert_eq!(report.state(), PassState::Converged);

    let mut store = MockStore {
        fail_persist: true,
        ..MockStore::default()
    };
    let report = run(&set, &mut store).await;
    assert!(matches!(report.persist, PersistStatus::Failed { .. }));
    assert_eq!(report.state(), PassState::Converged);

    let mut store = MockStore::default();
    let options = ReconcileOptions {
        persist: false,
        ..ReconcileOptions::default()
    };
    let report = run_with(options, &set, &mut store).await;
    assert_eq!(report.persist, PersistStatus::Skipped);
    assert_eq!(store.persists, 0);
}

#[tokio::test]
async fn test_audit_event_for_failed_pass() {
    let set = desired(&[web_decl(), ssh_decl()]);
    let mut store = MockStore {
        fail_on: vec!["--comment ssh".to_string()],
        ..MockStore::default()
    };
    let report = run(&set, &mut store).await;

    let event = audit::reconcile_event(&report, "abc123");
    assert!(!event.success);
    assert_eq!(event.event_type, audit::EventType::Reconcile);
    assert_eq!(event.details["inserted"], 1);
    assert_eq!(event.details["failures"], 1);
    assert_eq!(event.details["desired_sha256"], "abc123");
    assert_eq!(event.error.as_deref(), Some("1 operation(s) failed"));
}

#[test]
fn test_report_serializes_for_machine_consumers() {
    let report = tokio::runtime::Runtime::new().unwrap().block_on(async {
        let set = desired(&[web_decl()]);
        let mut store = MockStore::default();
        run(&set, &mut store).await
    });
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["inserted"][0]["kind"], "insert");
    assert_eq!(json["inserted"][0]["table"], "filter");
    assert_eq!(json["persist"]["status"], "unavailable");
    assert!(json.get("unmanaged").is_none());
}
