//! Per-domain iteration lease
//!
//! A domain has one sequential position, so only one traversal may be open
//! at a time. Acquiring a held lease never blocks:
//! - same thread asks again: `EtcError::Reentrancy`
//! - another thread asks: `EtcError::Busy`
//!
//! Waiting would deadlock two threads that nest traversals of `passwd` and
//! `group` in opposite orders.
//!
//! Mutex poison is ignored throughout; the lease must still be released
//! after a callback panicked.

use super::EtcError;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug)]
pub(crate) struct IterationLock {
    domain: &'static str,
    owner: Mutex<Option<ThreadId>>,
}

impl IterationLock {
    pub(crate) fn new(domain: &'static str) -> Arc<Self> {
        Arc::new(Self {
            domain,
            owner: Mutex::new(None),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> Result<Lease, EtcError> {
        let me = thread::current().id();
        let mut owner = self.owner.lock().unwrap_or_else(|e| e.into_inner());
        match *owner {
            Some(holder) if holder == me => Err(EtcError::Reentrancy {
                domain: self.domain,
            }),
            Some(_) => Err(EtcError::Busy {
                domain: self.domain,
            }),
            None => {
                *owner = Some(me);
                Ok(Lease {
                    lock: Arc::clone(self),
                })
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self) -> bool {
        self.owner.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// Proof of exclusive traversal rights; released on drop
#[derive(Debug)]
pub(crate) struct Lease {
    lock: Arc<IterationLock>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut owner = self.lock.owner.lock().unwrap_or_else(|e| e.into_inner());
        *owner = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_thread_reentry_fails() {
        let lock = IterationLock::new("passwd");
        let _lease = lock.acquire().unwrap();
        match lock.acquire() {
            Err(EtcError::Reentrancy { domain }) => assert_eq!(domain, "passwd"),
            other => panic!("expected reentrancy error, got {:?}", other),
        }
    }

    #[test]
    fn test_release_on_drop() {
        let lock = IterationLock::new("group");
        let lease = lock.acquire().unwrap();
        assert!(lock.is_held());
        drop(lease);
        assert!(!lock.is_held());
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_other_thread_fails_fast() {
        let lock = IterationLock::new("passwd");
        let lease = lock.acquire().unwrap();

        let contender = Arc::clone(&lock);
        let attempt = thread::spawn(move || contender.acquire().map(drop))
            .join()
            .unwrap();
        match attempt {
            Err(EtcError::Busy { domain }) => assert_eq!(domain, "passwd"),
            other => panic!("expected busy error, got {:?}", other),
        }

        drop(lease);
        let contender = Arc::clone(&lock);
        assert!(thread::spawn(move || contender.acquire().is_ok())
            .join()
            .unwrap());
    }
}
