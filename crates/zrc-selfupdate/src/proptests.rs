//! Property-based tests for zrc-selfupdate.
//!
//! These tests use proptest to verify correctness properties across
//! randomly generated inputs.
//!
//! # Properties Tested
//!
//! - Version display/parse round trip
//! - Version ordering is a strict total order
//! - Trailing zero components do not change a version
//! - The state machine never leaves `Applying`

#![cfg(test)]

use proptest::prelude::*;
use std::cmp::Ordering;
use std::path::PathBuf;

use crate::download::DownloadProgress;
use crate::release::ReleaseInfo;
use crate::state::{TransitionError, UpdateEvent, UpdateState};
use crate::version::{is_newer, Version};

// =============================================================================
// Generators
// =============================================================================

/// Generate a version with 1 to 6 components.
fn arb_version() -> impl Strategy<Value = Version> {
    prop::collection::vec(0u64..1000, 1..6).prop_map(|c| Version::from_components(c))
}

/// Generate a version string with an optional prefix character.
fn arb_version_string() -> impl Strategy<Value = String> {
    (
        prop::option::of(prop::sample::select(vec!['v', 'V', 'r'])),
        prop::collection::vec(0u64..100_000, 1..6),
    )
        .prop_map(|(prefix, parts)| {
            let body = parts
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(".");
            match prefix {
                Some(c) => format!("{}{}", c, body),
                None => body,
            }
        })
}

fn arb_release() -> impl Strategy<Value = ReleaseInfo> {
    arb_version().prop_map(|version| ReleaseInfo {
        tag: version.to_string(),
        version,
        download_url: "https://example.com/rdp".to_string(),
        asset_name: "rdp".to_string(),
        published_at: None,
        size: None,
        release_notes: String::new(),
        checksum_url: None,
    })
}

fn arb_event() -> impl Strategy<Value = UpdateEvent> {
    prop_oneof![
        prop::option::of(arb_release()).prop_map(UpdateEvent::CheckCompleted),
        any::<bool>().prop_map(|user_initiated| UpdateEvent::CheckFailed {
            reason: "failed".to_string(),
            user_initiated,
        }),
        Just(UpdateEvent::Accepted),
        (0u64..1000).prop_map(|n| UpdateEvent::Progress(DownloadProgress::new(n, Some(1000)))),
        Just(UpdateEvent::DownloadCompleted(PathBuf::from("/tmp/rdp-update"))),
        Just(UpdateEvent::DownloadFailed("reset".to_string())),
        Just(UpdateEvent::DownloadCancelled),
        Just(UpdateEvent::InstallConfirmed),
        Just(UpdateEvent::Dismissed),
        Just(UpdateEvent::Failed("boom".to_string())),
        Just(UpdateEvent::Retry),
    ]
}

// =============================================================================
// Version properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Displaying and re-parsing a version yields the same version.
    #[test]
    fn prop_display_parse_roundtrip(text in arb_version_string()) {
        let parsed = Version::parse(&text).unwrap();
        let reparsed = Version::parse(&parsed.to_display_string()).unwrap();
        prop_assert_eq!(&reparsed, &parsed);
        prop_assert_eq!(reparsed.components(), parsed.components());
    }

    /// No version is newer than itself.
    #[test]
    fn prop_is_newer_irreflexive(a in arb_version()) {
        prop_assert!(!is_newer(&a, &a));
    }

    /// At most one of two versions is newer than the other.
    #[test]
    fn prop_is_newer_antisymmetric(a in arb_version(), b in arb_version()) {
        prop_assert!(!(is_newer(&a, &b) && is_newer(&b, &a)));
        if !is_newer(&a, &b) && !is_newer(&b, &a) {
            prop_assert_eq!(&a, &b);
        }
    }

    /// Newer-than chains.
    #[test]
    fn prop_is_newer_transitive(a in arb_version(), b in arb_version(), c in arb_version()) {
        if is_newer(&a, &b) && is_newer(&b, &c) {
            prop_assert!(is_newer(&a, &c));
        }
    }

    /// Appending zero components never changes a version.
    #[test]
    fn prop_zero_padding_is_equal(a in arb_version(), zeros in 1usize..4) {
        let mut padded = a.components().to_vec();
        padded.extend(std::iter::repeat(0).take(zeros));
        let padded = Version::from_components(padded);

        prop_assert_eq!(a.cmp(&padded), Ordering::Equal);
        prop_assert!(!is_newer(&a, &padded));
        prop_assert!(!is_newer(&padded, &a));
    }

    /// Ordering agrees with comparing the zero-padded component lists.
    #[test]
    fn prop_order_matches_padded_components(a in arb_version(), b in arb_version()) {
        let len = a.components().len().max(b.components().len());
        let pad = |v: &Version| {
            let mut c = v.components().to_vec();
            c.resize(len, 0);
            c
        };
        prop_assert_eq!(a.cmp(&b), pad(&a).cmp(&pad(&b)));
    }

    /// Parsing never panics on arbitrary input.
    #[test]
    fn prop_parse_never_panics(text in ".{0,20}") {
        let _ = Version::parse(&text);
    }
}

// =============================================================================
// State machine properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Any event sequence leaves the state in one of its variants, rejected
    /// events leave it unchanged, and once `Applying` it stays there.
    #[test]
    fn prop_state_machine_event_sequences(events in prop::collection::vec(arb_event(), 0..40)) {
        let mut state = UpdateState::Idle;
        for event in &events {
            match state.apply(event) {
                Ok(next) => {
                    prop_assert!(state != UpdateState::Applying);
                    state = next;
                }
                Err(TransitionError::Terminal { .. }) => {
                    prop_assert_eq!(&state, &UpdateState::Applying);
                }
                Err(TransitionError::Invalid { state: name, .. }) => {
                    prop_assert_eq!(name, state.name());
                }
            }
        }
    }
}
