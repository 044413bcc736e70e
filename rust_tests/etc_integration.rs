//! Enumeration Integration Tests: the host's user and group databases
//!
//! These run against `Etc::system()`, so they assert shape and consistency
//! rather than specific accounts. Ids are not unique in every database, so
//! lookups are checked for membership, not for equality with the first hit.
//!
//! libc keeps one position per database for the whole process, and a held
//! domain fails fast with `Busy` on other threads, so every test that
//! touches `Etc::system()` runs under `SYSTEM_DB`.

use probe_harness::etc::{getlogin, Etc, EtcError, Group, Passwd};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::{Mutex, MutexGuard};

static SYSTEM_DB: Mutex<()> = Mutex::new(());

/// Serialize access to the process-wide system databases
fn system_db() -> MutexGuard<'static, ()> {
    SYSTEM_DB.lock().unwrap_or_else(|e| e.into_inner())
}

fn all_passwd(etc: &Etc) -> Vec<Passwd> {
    etc.passwd().to_vec().expect("passwd enumeration")
}

fn all_groups(etc: &Etc) -> Vec<Group> {
    etc.group().to_vec().expect("group enumeration")
}

/// Names with a leading `+` are NIS compat markers, not resolvable accounts
fn resolvable(name: &str) -> bool {
    !name.starts_with('+')
}

#[test]
fn test_getlogin_is_name_or_none() {
    if let Some(name) = getlogin() {
        assert!(!name.is_empty());
    }
}

#[test]
fn test_passwd_records_have_names() {
    let _db = system_db();
    let etc = Etc::system();
    let entries = all_passwd(&etc);
    assert!(!entries.is_empty(), "passwd database is empty");
    for entry in &entries {
        assert!(!entry.name.is_empty());
    }
}

#[test]
fn test_nested_passwd_iteration_fails() {
    let _db = system_db();
    let etc = Etc::system();
    let mut nested = None;
    etc.passwd()
        .each(|_| {
            nested = Some(etc.passwd().each(|_| ControlFlow::Continue(())));
            ControlFlow::Break(())
        })
        .unwrap();
    match nested {
        Some(Err(EtcError::Reentrancy { domain })) => assert_eq!(domain, "passwd"),
        other => panic!("expected reentrancy error, got {:?}", other),
    }
}

#[test]
fn test_system_lease_is_process_wide() {
    let _db = system_db();
    // Two handles share libc's single position, so they share the lease
    let outer = Etc::system();
    let inner = Etc::system();
    let mut nested = None;
    outer
        .group()
        .each(|_| {
            nested = Some(inner.group().open().map(|_| ()));
            ControlFlow::Break(())
        })
        .unwrap();
    assert!(matches!(nested, Some(Err(EtcError::Reentrancy { .. }))));
}

#[test]
fn test_getpwuid_returns_an_enumerated_record() {
    let _db = system_db();
    let etc = Etc::system();
    let mut by_uid: HashMap<u32, Vec<Passwd>> = HashMap::new();
    for entry in all_passwd(&etc) {
        by_uid.entry(entry.uid).or_default().push(entry);
    }
    for (uid, candidates) in &by_uid {
        let found = etc.getpwuid(*uid).unwrap().expect("enumerated uid resolves");
        assert!(
            candidates.contains(&found),
            "getpwuid({}) returned {:?}, not among {:?}",
            uid,
            found,
            candidates
        );
    }

    let uid = nix::unistd::getuid().as_raw();
    if let Some(candidates) = by_uid.get(&uid) {
        let me = etc.current_user().unwrap().expect("current user resolves");
        assert!(candidates.contains(&me));
    }
}

#[test]
fn test_getpwnam_matches_first_enumerated() {
    let _db = system_db();
    let etc = Etc::system();
    let mut first: HashMap<String, Passwd> = HashMap::new();
    for entry in all_passwd(&etc) {
        if resolvable(&entry.name) {
            first.entry(entry.name.clone()).or_insert(entry);
        }
    }
    for (name, entry) in &first {
        assert_eq!(etc.getpwnam(name).unwrap().as_ref(), Some(entry));
    }
}

#[test]
fn test_passwd_cursor_matches_block() {
    let _db = system_db();
    let etc = Etc::system();
    let block = all_passwd(&etc);

    let mut cursor = etc.passwd().open().unwrap();
    let mut stepped = Vec::new();
    while let Some(entry) = cursor.next().unwrap() {
        stepped.push(entry);
    }
    cursor.close();

    assert_eq!(block, stepped);
}

#[test]
fn test_nested_group_iteration_fails() {
    let _db = system_db();
    let etc = Etc::system();
    let mut nested = None;
    etc.group()
        .each(|_| {
            nested = Some(etc.group().each(|_| ControlFlow::Continue(())));
            ControlFlow::Break(())
        })
        .unwrap();
    match nested {
        Some(Err(EtcError::Reentrancy { domain })) => assert_eq!(domain, "group"),
        other => panic!("expected reentrancy error, got {:?}", other),
    }
}

#[test]
fn test_other_domain_inside_iteration_succeeds() {
    let _db = system_db();
    let etc = Etc::system();
    let mut groups = None;
    etc.passwd()
        .each(|_| {
            groups = Some(etc.group().to_vec());
            ControlFlow::Break(())
        })
        .unwrap();
    assert!(matches!(groups, Some(Ok(_))));
}

#[test]
fn test_getgrgid_matches_first_enumerated() {
    let _db = system_db();
    let etc = Etc::system();
    let mut first: HashMap<u32, Group> = HashMap::new();
    for entry in all_groups(&etc) {
        first.entry(entry.gid).or_insert(entry);
    }
    for (gid, entry) in &first {
        assert_eq!(etc.getgrgid(*gid).unwrap().as_ref(), Some(entry));
    }

    let gid = nix::unistd::getgid().as_raw();
    if let Some(entry) = first.get(&gid) {
        assert_eq!(etc.current_group().unwrap().as_ref(), Some(entry));
    }
}

#[test]
fn test_getgrnam_matches_first_enumerated() {
    let _db = system_db();
    let etc = Etc::system();
    let mut first: HashMap<String, Group> = HashMap::new();
    for entry in all_groups(&etc) {
        if resolvable(&entry.name) {
            first.entry(entry.name.clone()).or_insert(entry);
        }
    }
    for (name, entry) in &first {
        assert_eq!(etc.getgrnam(name).unwrap().as_ref(), Some(entry));
    }
}

#[test]
fn test_group_cursor_matches_block() {
    let _db = system_db();
    let etc = Etc::system();
    let block = all_groups(&etc);

    let mut cursor = etc.group().open().unwrap();
    let mut stepped = Vec::new();
    while let Some(entry) = cursor.next().unwrap() {
        stepped.push(entry);
    }
    drop(cursor);

    assert_eq!(block, stepped);
}
