use super::*;
use crate::test_support::{at, conversation};

fn directory() -> ConversationDirectory {
    let mut directory = ConversationDirectory::new();
    directory.replace(vec![
        conversation("u-1", "Alice Moreau", 10),
        conversation("u-2", "Bob", 20),
        conversation("u-3", "Natalia", 30),
    ]);
    directory
}

#[test]
fn local_update_touches_only_the_matching_entry() {
    let mut directory = directory();

    assert!(directory.apply_local_update(&UserId::from("u-2"), "see you", at(100)));

    let bob = directory.get(&UserId::from("u-2")).expect("bob");
    assert_eq!(bob.last_message, "see you");
    assert_eq!(bob.last_updated_at, at(100));
    let alice = directory.get(&UserId::from("u-1")).expect("alice");
    assert_eq!(alice.last_message, "");
    assert_eq!(alice.last_updated_at, at(10));
}

#[test]
fn unknown_counterpart_is_applied_once_it_appears() {
    let mut directory = directory();

    assert!(!directory.apply_local_update(&UserId::from("u-9"), "first contact", at(100)));
    assert!(directory.get(&UserId::from("u-9")).is_none());
    assert!(directory
        .list()
        .iter()
        .all(|entry| entry.last_message.is_empty()));

    directory.replace(vec![
        conversation("u-1", "Alice Moreau", 10),
        conversation("u-9", "Zoe", 50),
    ]);
    let zoe = directory.get(&UserId::from("u-9")).expect("zoe");
    assert_eq!(zoe.last_message, "first contact");
    assert_eq!(zoe.last_updated_at, at(100));
}

#[test]
fn unknown_counterpart_is_forgotten_after_a_few_unlisted_refreshes() {
    let mut directory = directory();
    directory.apply_local_update(&UserId::from("u-9"), "stray", at(100));

    for _ in 0..MAX_UNLISTED_REFRESHES {
        directory.replace(vec![conversation("u-1", "Alice Moreau", 10)]);
    }
    assert!(directory.overlay.is_empty());

    directory.replace(vec![conversation("u-9", "Zoe", 50)]);
    let zoe = directory.get(&UserId::from("u-9")).expect("zoe");
    assert_eq!(zoe.last_message, "");
    assert_eq!(zoe.last_updated_at, at(50));
}

#[test]
fn overlay_survives_refresh_until_the_server_catches_up() {
    let mut directory = directory();
    directory.apply_local_update(&UserId::from("u-1"), "on my way", at(100));

    directory.replace(vec![conversation("u-1", "Alice Moreau", 10)]);
    let alice = directory.get(&UserId::from("u-1")).expect("alice");
    assert_eq!(alice.last_message, "on my way");

    let mut caught_up = conversation("u-1", "Alice Moreau", 120);
    caught_up.last_message = "server copy".to_string();
    directory.replace(vec![caught_up]);
    assert_eq!(
        directory.get(&UserId::from("u-1")).expect("alice").last_message,
        "server copy"
    );

    // Overlay was dropped, so an older refresh no longer resurrects it.
    directory.replace(vec![conversation("u-1", "Alice Moreau", 10)]);
    assert_eq!(
        directory.get(&UserId::from("u-1")).expect("alice").last_message,
        ""
    );
}

#[test]
fn filter_is_case_insensitive_and_leaves_the_list_alone() {
    let directory = directory();

    let names: Vec<String> = directory
        .filter("ali")
        .into_iter()
        .map(|entry| entry.display_name)
        .collect();
    assert_eq!(names, vec!["Alice Moreau".to_string(), "Natalia".to_string()]);
    assert_eq!(directory.filter("ALI").len(), 2);
    assert_eq!(directory.list().len(), 3);
}

#[test]
fn blank_query_matches_everything() {
    let directory = directory();
    assert_eq!(directory.filter("").len(), 3);
    assert_eq!(directory.filter("   ").len(), 3);
    assert!(directory.filter("nobody").is_empty());
}

#[test]
fn starts_unloaded() {
    let directory = ConversationDirectory::new();
    assert!(!directory.is_loaded());
    assert!(directory.list().is_empty());
}
