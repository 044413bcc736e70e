//! User and group database enumeration
//!
//! Two domains, `passwd` and `group`, each traversable in two styles:
//! - [`Domain::each`]: block form, the domain is opened, rewound, walked and
//!   closed around the callback
//! - [`Domain::open`]: a [`Cursor`] whose lifetime brackets one traversal
//!
//! A domain has a single position. While a traversal is open, another
//! traversal of the same domain from the same thread fails with
//! [`EtcError::Reentrancy`]; from another thread it fails with
//! [`EtcError::Busy`]. Neither case blocks. Point lookups
//! (`getpwuid`, `getgrnam`, ...) never touch the position and are always
//! allowed.
//!
//! Backends: [`Etc::system`] reads the host's name service through libc,
//! [`Etc::from_files`] parses colon-delimited files directly.

mod files;
mod lease;
mod system;

pub use files::{parse_group_line, parse_passwd_line, FileLookup, FileSource};
pub use system::{getlogin, SystemGroup, SystemPasswd};

use lease::{IterationLock, Lease};
use serde::Serialize;
use std::fmt;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EtcError {
    #[error("{domain} enumeration is already in progress on this thread")]
    Reentrancy { domain: &'static str },

    #[error("{domain} enumeration is open on another thread")]
    Busy { domain: &'static str },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{domain} lookup failed: {source}")]
    Lookup {
        domain: &'static str,
        #[source]
        source: nix::errno::Errno,
    },
}

pub type Result<T> = std::result::Result<T, EtcError>;

// =============================================================================
// Records
// =============================================================================

/// One user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Passwd {
    pub name: String,
    pub passwd: Option<String>,
    pub uid: u32,
    pub gid: u32,
    pub gecos: Option<String>,
    pub dir: String,
    pub shell: String,
}

/// One group
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub name: String,
    pub passwd: Option<String>,
    pub gid: u32,
    pub members: Vec<String>,
}

/// What a domain needs to know about its record type
pub trait DbRecord: Clone + Send + fmt::Debug + 'static {
    const DOMAIN: &'static str;

    fn id(&self) -> u32;
    fn name(&self) -> &str;
    fn parse_line(line: &str) -> Option<Self>;
}

impl DbRecord for Passwd {
    const DOMAIN: &'static str = "passwd";

    fn id(&self) -> u32 {
        self.uid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parse_line(line: &str) -> Option<Self> {
        parse_passwd_line(line)
    }
}

impl DbRecord for Group {
    const DOMAIN: &'static str = "group";

    fn id(&self) -> u32 {
        self.gid
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn parse_line(line: &str) -> Option<Self> {
        parse_group_line(line)
    }
}

// =============================================================================
// Backend seams
// =============================================================================

/// Sequential access with a single position
pub trait RecordSource: Send {
    type Record;

    /// Reset to the first record (setpwent)
    fn rewind(&mut self) -> Result<()>;
    /// Next record, `None` at the end (getpwent)
    fn next_record(&mut self) -> Result<Option<Self::Record>>;
    /// Release backend resources (endpwent)
    fn close(&mut self);
}

/// Point lookups, independent of any traversal
pub trait RecordLookup: Send + Sync {
    type Record;

    fn by_id(&self, id: u32) -> Result<Option<Self::Record>>;
    fn by_name(&self, name: &str) -> Result<Option<Self::Record>>;
}

type BoxedSource<R> = Box<dyn RecordSource<Record = R>>;
type BoxedLookup<R> = Box<dyn RecordLookup<Record = R>>;

// =============================================================================
// Domain
// =============================================================================

/// One enumerable database
pub struct Domain<R: DbRecord> {
    lock: Arc<IterationLock>,
    source: Mutex<BoxedSource<R>>,
    lookup: BoxedLookup<R>,
}

impl<R: DbRecord> fmt::Debug for Domain<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain").field("name", &R::DOMAIN).finish()
    }
}

impl<R: DbRecord> Domain<R> {
    fn new(lock: Arc<IterationLock>, source: BoxedSource<R>, lookup: BoxedLookup<R>) -> Self {
        Self {
            lock,
            source: Mutex::new(source),
            lookup,
        }
    }

    pub fn name(&self) -> &'static str {
        R::DOMAIN
    }

    /// Visit every record in backend order until `visit` breaks.
    ///
    /// The domain is closed afterwards whether the walk finished, broke
    /// early, failed or the callback panicked.
    pub fn each<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&R) -> ControlFlow<()>,
    {
        let _lease = self.lock.acquire()?;
        let mut source = OpenSource::rewound(&self.source)?;
        let mut visited = 0usize;
        while let Some(record) = source.next()? {
            visited += 1;
            if visit(&record).is_break() {
                debug!(domain = R::DOMAIN, visited, "enumeration stopped early");
                return Ok(());
            }
        }
        debug!(domain = R::DOMAIN, visited, "enumeration complete");
        Ok(())
    }

    /// Every record, in backend order
    pub fn to_vec(&self) -> Result<Vec<R>> {
        let mut all = Vec::new();
        self.each(|record| {
            all.push(record.clone());
            ControlFlow::Continue(())
        })?;
        Ok(all)
    }

    /// Open a traversal; the domain stays claimed until the cursor is closed
    /// or dropped
    pub fn open(&self) -> Result<Cursor<'_, R>> {
        let lease = self.lock.acquire()?;
        lock_source(&self.source).rewind()?;
        Ok(Cursor {
            domain: self,
            lease: Some(lease),
        })
    }

    pub fn by_id(&self, id: u32) -> Result<Option<R>> {
        self.lookup.by_id(id)
    }

    pub fn by_name(&self, name: &str) -> Result<Option<R>> {
        self.lookup.by_name(name)
    }
}

fn lock_source<R>(source: &Mutex<BoxedSource<R>>) -> MutexGuard<'_, BoxedSource<R>> {
    source.lock().unwrap_or_else(|e| e.into_inner())
}

/// Source guard that closes the backend on every exit path
struct OpenSource<'a, R> {
    guard: MutexGuard<'a, BoxedSource<R>>,
}

impl<'a, R> OpenSource<'a, R> {
    fn rewound(source: &'a Mutex<BoxedSource<R>>) -> Result<Self> {
        let mut guard = lock_source(source);
        guard.rewind()?;
        Ok(Self { guard })
    }

    fn next(&mut self) -> Result<Option<R>> {
        self.guard.next_record()
    }
}

impl<R> Drop for OpenSource<'_, R> {
    fn drop(&mut self) {
        self.guard.close();
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// An open traversal of one domain
pub struct Cursor<'a, R: DbRecord> {
    domain: &'a Domain<R>,
    lease: Option<Lease>,
}

impl<R: DbRecord> fmt::Debug for Cursor<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("domain", &R::DOMAIN)
            .field("open", &self.lease.is_some())
            .finish()
    }
}

impl<R: DbRecord> Cursor<'_, R> {
    /// Next record, `None` once exhausted (and on every call after)
    pub fn next(&mut self) -> Result<Option<R>> {
        if self.lease.is_none() {
            return Ok(None);
        }
        lock_source(&self.domain.source).next_record()
    }

    /// Start over from the first record
    pub fn rewind(&mut self) -> Result<()> {
        if self.lease.is_none() {
            return Ok(());
        }
        lock_source(&self.domain.source).rewind()
    }

    /// Release the domain; later `next` calls return `None`
    pub fn close(&mut self) {
        if let Some(lease) = self.lease.take() {
            lock_source(&self.domain.source).close();
            drop(lease);
        }
    }
}

impl<R: DbRecord> Drop for Cursor<'_, R> {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Facade
// =============================================================================

/// Process-wide leases for the libc databases: every system-backed `Etc`
/// shares the one position libc keeps per database
fn system_lock(domain: &'static str) -> Arc<IterationLock> {
    static PASSWD: OnceLock<Arc<IterationLock>> = OnceLock::new();
    static GROUP: OnceLock<Arc<IterationLock>> = OnceLock::new();
    let cell = if domain == Passwd::DOMAIN {
        &PASSWD
    } else {
        &GROUP
    };
    Arc::clone(cell.get_or_init(|| IterationLock::new(domain)))
}

/// Entry point for both databases
#[derive(Debug)]
pub struct Etc {
    passwd: Domain<Passwd>,
    group: Domain<Group>,
}

impl Etc {
    /// The host's user and group databases
    pub fn system() -> Self {
        Self {
            passwd: Domain::new(
                system_lock(Passwd::DOMAIN),
                Box::new(SystemPasswd),
                Box::new(SystemPasswd),
            ),
            group: Domain::new(
                system_lock(Group::DOMAIN),
                Box::new(SystemGroup),
                Box::new(SystemGroup),
            ),
        }
    }

    /// Databases read from explicit files in `/etc/passwd` format
    pub fn from_files(passwd: impl Into<PathBuf>, group: impl Into<PathBuf>) -> Self {
        let passwd = passwd.into();
        let group = group.into();
        Self {
            passwd: Domain::new(
                IterationLock::new(Passwd::DOMAIN),
                Box::new(FileSource::<Passwd>::new(passwd.clone())),
                Box::new(FileLookup::<Passwd>::new(passwd)),
            ),
            group: Domain::new(
                IterationLock::new(Group::DOMAIN),
                Box::new(FileSource::<Group>::new(group.clone())),
                Box::new(FileLookup::<Group>::new(group)),
            ),
        }
    }

    pub fn passwd(&self) -> &Domain<Passwd> {
        &self.passwd
    }

    pub fn group(&self) -> &Domain<Group> {
        &self.group
    }

    pub fn getpwuid(&self, uid: u32) -> Result<Option<Passwd>> {
        self.passwd.by_id(uid)
    }

    pub fn getpwnam(&self, name: &str) -> Result<Option<Passwd>> {
        self.passwd.by_name(name)
    }

    pub fn getgrgid(&self, gid: u32) -> Result<Option<Group>> {
        self.group.by_id(gid)
    }

    pub fn getgrnam(&self, name: &str) -> Result<Option<Group>> {
        self.group.by_name(name)
    }

    /// Account of the real user id of this process
    pub fn current_user(&self) -> Result<Option<Passwd>> {
        self.getpwuid(nix::unistd::getuid().as_raw())
    }

    /// Group of the real group id of this process
    pub fn current_group(&self) -> Result<Option<Group>> {
        self.getgrgid(nix::unistd::getgid().as_raw())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{mpsc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tempfile::{NamedTempFile, TempDir};

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
alice:x:1000:1000:Alice,,,:/home/alice:/bin/zsh
bob:x:1001:1001::/home/bob:/bin/sh
";

    const GROUP: &str = "\
root:x:0:
daemon:x:1:
alice:x:1000:
devs:x:2000:alice,bob
";

    struct Fixture {
        _dir: TempDir,
        etc: Etc,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let passwd = dir.path().join("passwd");
        let group = dir.path().join("group");
        std::fs::write(&passwd, PASSWD).unwrap();
        std::fs::write(&group, GROUP).unwrap();
        Fixture {
            etc: Etc::from_files(passwd, group),
            _dir: dir,
        }
    }

    fn names<R: DbRecord>(records: &[R]) -> Vec<String> {
        records.iter().map(|r| r.name().to_string()).collect()
    }

    #[test]
    fn test_each_visits_every_record_in_order() {
        let fx = fixture();
        let mut seen = Vec::new();
        fx.etc
            .passwd()
            .each(|entry| {
                seen.push(entry.name.clone());
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(seen, vec!["root", "daemon", "alice", "bob"]);
    }

    #[test]
    fn test_cursor_matches_block_traversal() {
        let fx = fixture();
        let block = fx.etc.group().to_vec().unwrap();

        let mut cursor = fx.etc.group().open().unwrap();
        let mut stepped = Vec::new();
        while let Some(entry) = cursor.next().unwrap() {
            stepped.push(entry);
        }
        cursor.close();

        assert_eq!(block, stepped);
    }

    #[test]
    fn test_early_break_then_fresh_traversal() {
        let fx = fixture();
        let mut first = None;
        fx.etc
            .passwd()
            .each(|entry| {
                first = Some(entry.name.clone());
                ControlFlow::Break(())
            })
            .unwrap();
        assert_eq!(first.as_deref(), Some("root"));

        // The break released the domain and the next walk starts over
        assert_eq!(fx.etc.passwd().to_vec().unwrap().len(), 4);
    }

    #[test]
    fn test_nested_same_domain_is_reentrancy() {
        let fx = fixture();
        let mut nested = None;
        fx.etc
            .passwd()
            .each(|_| {
                nested = Some(fx.etc.passwd().each(|_| ControlFlow::Continue(())));
                ControlFlow::Break(())
            })
            .unwrap();
        assert!(matches!(
            nested,
            Some(Err(EtcError::Reentrancy { domain: "passwd" }))
        ));
    }

    #[test]
    fn test_cursor_open_during_block_is_reentrancy() {
        let fx = fixture();
        let mut opened = None;
        fx.etc
            .group()
            .each(|_| {
                opened = Some(fx.etc.group().open().map(|_| ()));
                ControlFlow::Break(())
            })
            .unwrap();
        assert!(matches!(
            opened,
            Some(Err(EtcError::Reentrancy { domain: "group" }))
        ));
    }

    #[test]
    fn test_nested_other_domain_is_allowed() {
        let fx = fixture();
        let mut pairs = 0;
        fx.etc
            .passwd()
            .each(|_| {
                fx.etc
                    .group()
                    .each(|_| {
                        pairs += 1;
                        ControlFlow::Continue(())
                    })
                    .unwrap();
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(pairs, 16);
    }

    #[test]
    fn test_lookups_inside_traversal_are_allowed() {
        let fx = fixture();
        fx.etc
            .passwd()
            .each(|entry| {
                let again = fx.etc.getpwuid(entry.uid).unwrap().unwrap();
                assert_eq!(&again, entry);
                let by_name = fx.etc.getpwnam(&entry.name).unwrap().unwrap();
                assert_eq!(&by_name, entry);
                ControlFlow::Continue(())
            })
            .unwrap();
    }

    #[test]
    fn test_group_lookups_match_enumeration() {
        let fx = fixture();
        for entry in fx.etc.group().to_vec().unwrap() {
            assert_eq!(fx.etc.getgrgid(entry.gid).unwrap().as_ref(), Some(&entry));
            assert_eq!(fx.etc.getgrnam(&entry.name).unwrap().as_ref(), Some(&entry));
        }
        let devs = fx.etc.getgrnam("devs").unwrap().unwrap();
        assert_eq!(devs.members, vec!["alice", "bob"]);
        assert!(fx.etc.getgrnam("nobody-here").unwrap().is_none());
    }

    #[test]
    fn test_cursor_rewind_restarts() {
        let fx = fixture();
        let mut cursor = fx.etc.passwd().open().unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().name, "root");
        assert_eq!(cursor.next().unwrap().unwrap().name, "daemon");
        cursor.rewind().unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().name, "root");
    }

    #[test]
    fn test_closed_cursor_yields_nothing_and_releases() {
        let fx = fixture();
        let mut cursor = fx.etc.passwd().open().unwrap();
        cursor.close();
        assert!(cursor.next().unwrap().is_none());
        // Domain is free again even though the cursor value is still alive
        assert_eq!(names(&fx.etc.passwd().to_vec().unwrap()).len(), 4);
    }

    #[test]
    fn test_dropped_cursor_releases_domain() {
        let fx = fixture();
        {
            let mut cursor = fx.etc.passwd().open().unwrap();
            cursor.next().unwrap();
        }
        assert!(fx.etc.passwd().open().is_ok());
    }

    #[test]
    fn test_panicking_callback_releases_domain() {
        let fx = fixture();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = fx.etc.passwd().each(|_| panic!("callback failure"));
        }));
        assert!(result.is_err());
        assert_eq!(fx.etc.passwd().to_vec().unwrap().len(), 4);
    }

    #[test]
    fn test_snapshot_taken_at_rewind() {
        let mut passwd = NamedTempFile::new().unwrap();
        passwd.write_all(PASSWD.as_bytes()).unwrap();
        let group = NamedTempFile::new().unwrap();
        let etc = Etc::from_files(passwd.path(), group.path());

        let mut cursor = etc.passwd().open().unwrap();
        assert_eq!(cursor.next().unwrap().unwrap().name, "root");
        passwd.write_all(b"late:x:5000:5000::/:/bin/sh\n").unwrap();
        let mut rest = 0;
        while cursor.next().unwrap().is_some() {
            rest += 1;
        }
        assert_eq!(rest, 3);

        cursor.rewind().unwrap();
        let mut all = 0;
        while cursor.next().unwrap().is_some() {
            all += 1;
        }
        assert_eq!(all, 5);
    }

    #[test]
    fn test_other_thread_fails_fast_on_open_cursor() {
        let fx = Arc::new(fixture());
        let cursor_holder = Arc::clone(&fx);
        let (opened_tx, opened_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let holder = thread::spawn(move || {
            let cursor = cursor_holder.etc.passwd().open().unwrap();
            opened_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            drop(cursor);
        });
        opened_rx.recv().unwrap();

        let walker_fx = Arc::clone(&fx);
        let walked = thread::spawn(move || walker_fx.etc.passwd().to_vec().map(|v| v.len()))
            .join()
            .unwrap();
        assert!(matches!(walked, Err(EtcError::Busy { domain: "passwd" })));
        // Lookups are not traversals
        assert_eq!(fx.etc.getpwuid(0).unwrap().unwrap().name, "root");

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert_eq!(fx.etc.passwd().to_vec().unwrap().len(), 4);
    }

    #[test]
    fn test_opposite_nesting_on_two_threads_does_not_deadlock() {
        let fx = Arc::new(fixture());
        // Both outer cursors stay open until both inner walks were tried
        let both_open = Arc::new(Barrier::new(2));
        let both_tried = Arc::new(Barrier::new(2));
        let (done_tx, done_rx) = mpsc::channel();

        let spawn_nested = |outer_is_passwd: bool| {
            let fx = Arc::clone(&fx);
            let both_open = Arc::clone(&both_open);
            let both_tried = Arc::clone(&both_tried);
            let done_tx = done_tx.clone();
            thread::spawn(move || {
                let etc = &fx.etc;
                if outer_is_passwd {
                    let _outer = etc.passwd().open().unwrap();
                    both_open.wait();
                    done_tx.send(etc.group().to_vec().map(|v| v.len())).unwrap();
                    both_tried.wait();
                } else {
                    let _outer = etc.group().open().unwrap();
                    both_open.wait();
                    done_tx.send(etc.passwd().to_vec().map(|v| v.len())).unwrap();
                    both_tried.wait();
                }
            })
        };
        let first = spawn_nested(true);
        let second = spawn_nested(false);

        for _ in 0..2 {
            let inner = done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
            assert!(matches!(inner, Err(EtcError::Busy { .. })));
        }
        first.join().unwrap();
        second.join().unwrap();
    }

    #[test]
    fn test_missing_file_surfaces_io_error() {
        let etc = Etc::from_files("/nonexistent/passwd", "/nonexistent/group");
        assert!(matches!(etc.passwd().to_vec(), Err(EtcError::Io { .. })));
        assert!(matches!(etc.getgrgid(0), Err(EtcError::Io { .. })));
        // A failed open does not leave the domain claimed
        assert!(matches!(etc.passwd().open(), Err(EtcError::Io { .. })));
        assert!(matches!(etc.passwd().open(), Err(EtcError::Io { .. })));
    }
}
