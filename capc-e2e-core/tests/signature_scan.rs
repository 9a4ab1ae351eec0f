//! Log tree scanning behaviour over generated trees.

mod common;

use capc_e2e_core::signature::{CAPC_CONTROLLER_MARKER, NO_MATCH_FOUND_PREFIX};
use capc_e2e_core::{ExpectedSignature, LogFileFilter, PollResult, SignatureMatcher};
use common::LogTree;
use common::fixtures::{BAD_OFFERING, CONTROLLER_LOG, rejection_log};
use proptest::prelude::*;

fn signature() -> ExpectedSignature {
    ExpectedSignature::new(NO_MATCH_FOUND_PREFIX, BAD_OFFERING)
}

fn matcher(tree: &LogTree) -> SignatureMatcher {
    SignatureMatcher::new(
        tree.root(),
        LogFileFilter::controller_manager_log(CAPC_CONTROLLER_MARKER),
        signature(),
    )
}

fn component() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("capc-controller-manager".to_string()),
        Just("capi-controller-manager".to_string()),
        Just("capi-kubeadm-control-plane".to_string()),
        "[a-z]{1,6}",
    ]
}

fn file_name() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("manager.log".to_string()),
        Just("kube-rbac-proxy.log".to_string()),
        Just("events.log".to_string()),
        "[a-z]{1,6}\\.yaml",
    ]
}

/// Relative file path between one and five directories deep.
fn log_path() -> impl Strategy<Value = String> {
    (prop::collection::vec(component(), 1..5), file_name())
        .prop_map(|(dirs, file)| format!("{}/{file}", dirs.join("/")))
}

/// Lowercase noise can never contain the capitalised signature.
fn noise() -> impl Strategy<Value = String> {
    "[a-z0-9 :=\\n]{0,200}"
}

fn tree_strategy() -> impl Strategy<Value = Vec<(String, String)>> {
    prop::collection::vec((log_path(), noise()), 0..24)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_tree_without_signature_is_not_found(files in tree_strategy()) {
        let tree = LogTree::new();
        for (rel, contents) in &files {
            tree.write(rel, contents);
        }
        prop_assert_eq!(matcher(&tree).scan_once(), PollResult::NotFound);
    }

    #[test]
    fn test_single_injected_signature_is_found(
        files in tree_strategy(),
        prefix in prop::collection::vec("[a-z]{1,6}", 0..4),
        pod in "[a-z0-9]{5}",
    ) {
        let tree = LogTree::new();
        for (rel, contents) in &files {
            tree.write(rel, contents);
        }
        let mut rel: Vec<String> = prefix;
        rel.push(CAPC_CONTROLLER_MARKER.to_string());
        rel.push(format!("capc-controller-manager-{pod}"));
        rel.push("manager.log".to_string());
        let injected = tree.write(&rel.join("/"), rejection_log(BAD_OFFERING));

        prop_assert_eq!(
            matcher(&tree).scan_once(),
            PollResult::Found(injected.display().to_string())
        );
    }

    #[test]
    fn test_signature_outside_matching_files_is_ignored(
        files in tree_strategy(),
        dir in "[a-z]{1,6}",
        file in prop_oneof![Just("kube-rbac-proxy.log"), Just("events.log")],
    ) {
        let tree = LogTree::new();
        for (rel, contents) in &files {
            tree.write(rel, contents);
        }
        // Right component with the wrong file, and the right file in the wrong component.
        tree.write(&format!("{dir}/capc-controller-manager/pod/{file}"), rejection_log(BAD_OFFERING));
        tree.write(&format!("{dir}/capi-controller-manager/pod/manager.log"), rejection_log(BAD_OFFERING));

        prop_assert_eq!(matcher(&tree).scan_once(), PollResult::NotFound);
    }
}

#[test]
fn test_missing_root_is_not_found() {
    let tree = LogTree::new();
    let absent = SignatureMatcher::new(
        tree.root().join("clusters/bootstrap"),
        LogFileFilter::controller_manager_log(CAPC_CONTROLLER_MARKER),
        signature(),
    );
    assert_eq!(absent.scan_once(), PollResult::NotFound);
}

#[test]
fn test_rescan_sees_appended_lines() {
    let tree = LogTree::new();
    let path = tree.write(CONTROLLER_LOG, "I1016 10:00:00 starting manager\n");
    let matcher = matcher(&tree);
    assert_eq!(matcher.scan_once(), PollResult::NotFound);

    tree.write(CONTROLLER_LOG, rejection_log(BAD_OFFERING));
    assert_eq!(matcher.scan_once(), PollResult::Found(path.display().to_string()));
}

#[test]
fn test_offering_names_match_by_substring() {
    let tree = LogTree::new();
    tree.write(CONTROLLER_LOG, rejection_log("bad-offering-large"));
    // The needle is a substring of the longer offering name, so this matches.
    assert!(matches!(matcher(&tree).scan_once(), PollResult::Found(_)));

    let tree = LogTree::new();
    tree.write(CONTROLLER_LOG, rejection_log("good-offering"));
    assert_eq!(matcher(&tree).scan_once(), PollResult::NotFound);
}
