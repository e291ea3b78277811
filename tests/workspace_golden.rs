//! The default workspace document is consumed verbatim by generated test
//! workspaces; compare it against the checked-in golden copy.

use emx_blackbox::{compare_golden, workspace_with_default_repos};

const GOLDEN: &str = include_str!("testdata/default_workspace.golden");

#[test]
fn default_workspace_matches_golden() {
    if let Err(diff) = compare_golden(GOLDEN, &workspace_with_default_repos(), "WORKSPACE") {
        panic!("{}", diff);
    }
}

#[test]
fn default_workspace_is_deterministic() {
    let first = workspace_with_default_repos();
    for _ in 0..10 {
        assert_eq!(workspace_with_default_repos(), first);
    }
    assert!(!first.ends_with('\n'));
}
