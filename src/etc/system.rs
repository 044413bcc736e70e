//! System backend: the host's name-service databases through libc
//!
//! Enumeration uses `setpwent`/`getpwent`/`endpwent` (and the group
//! equivalents), whose position is process-global; the `Domain` lease makes
//! that safe. Point lookups use the reentrant `*_r` calls, which do not touch
//! the enumeration position. Both paths go through the same converters so a
//! looked-up record compares equal to the enumerated one.

use super::{EtcError, Group, Passwd, RecordLookup, RecordSource};
use nix::errno::Errno;
use std::ffi::{c_char, c_int, CStr, CString};
use std::ptr;

const INITIAL_BUFFER: usize = 1024;
const MAX_BUFFER: usize = 1 << 20;

unsafe fn text(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

/// SAFETY: `pw` must come from a successful libc passwd call
unsafe fn passwd_from_raw(pw: &libc::passwd) -> Passwd {
    Passwd {
        name: text(pw.pw_name).unwrap_or_default(),
        passwd: text(pw.pw_passwd),
        uid: pw.pw_uid,
        gid: pw.pw_gid,
        gecos: text(pw.pw_gecos),
        dir: text(pw.pw_dir).unwrap_or_default(),
        shell: text(pw.pw_shell).unwrap_or_default(),
    }
}

/// SAFETY: `gr` must come from a successful libc group call
unsafe fn group_from_raw(gr: &libc::group) -> Group {
    let mut members = Vec::new();
    if !gr.gr_mem.is_null() {
        let mut cursor = gr.gr_mem;
        while !(*cursor).is_null() {
            if let Some(member) = text(*cursor) {
                members.push(member);
            }
            cursor = cursor.add(1);
        }
    }
    Group {
        name: text(gr.gr_name).unwrap_or_default(),
        passwd: text(gr.gr_passwd),
        gid: gr.gr_gid,
        members,
    }
}

/// Drive a `get*_r` call, growing the buffer on `ERANGE`.
///
/// POSIX lets implementations report "not found" as 0 with a null result or
/// as one of ENOENT/ESRCH/EBADF/EPERM; all of those map to `None`.
fn lookup_r<T, R>(
    domain: &'static str,
    convert: unsafe fn(&T) -> R,
    mut call: impl FnMut(*mut T, *mut c_char, usize, *mut *mut T) -> c_int,
) -> Result<Option<R>, EtcError> {
    let mut len = INITIAL_BUFFER;
    loop {
        let mut buf: Vec<c_char> = vec![0; len];
        // SAFETY: libc entry structs are plain C data; all-zero is a valid
        // placeholder that the call overwrites on success
        let mut entry: T = unsafe { std::mem::zeroed() };
        let mut result: *mut T = ptr::null_mut();

        let rc = call(
            &mut entry as *mut T,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result as *mut *mut T,
        );
        match rc {
            0 if result.is_null() => return Ok(None),
            // SAFETY: success, `entry` points into `buf` which is still alive
            0 => return Ok(Some(unsafe { convert(&entry) })),
            libc::ERANGE if len < MAX_BUFFER => len *= 2,
            libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM => return Ok(None),
            rc => {
                return Err(EtcError::Lookup {
                    domain,
                    source: Errno::from_raw(rc),
                })
            }
        }
    }
}

// =============================================================================
// passwd
// =============================================================================

#[derive(Debug, Default)]
pub struct SystemPasswd;

impl RecordSource for SystemPasswd {
    type Record = Passwd;

    fn rewind(&mut self) -> Result<(), EtcError> {
        unsafe { libc::setpwent() };
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Passwd>, EtcError> {
        // SAFETY: the caller holds the passwd lease; the static entry is
        // copied out before any other enumeration call
        let entry = unsafe { libc::getpwent() };
        if entry.is_null() {
            return Ok(None);
        }
        Ok(Some(unsafe { passwd_from_raw(&*entry) }))
    }

    fn close(&mut self) {
        unsafe { libc::endpwent() };
    }
}

impl RecordLookup for SystemPasswd {
    type Record = Passwd;

    fn by_id(&self, uid: u32) -> Result<Option<Passwd>, EtcError> {
        lookup_r("passwd", passwd_from_raw, |pwd, buf, len, result| unsafe {
            libc::getpwuid_r(uid, pwd, buf, len, result)
        })
    }

    fn by_name(&self, name: &str) -> Result<Option<Passwd>, EtcError> {
        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        lookup_r("passwd", passwd_from_raw, |pwd, buf, len, result| unsafe {
            libc::getpwnam_r(name.as_ptr(), pwd, buf, len, result)
        })
    }
}

// =============================================================================
// group
// =============================================================================

#[derive(Debug, Default)]
pub struct SystemGroup;

impl RecordSource for SystemGroup {
    type Record = Group;

    fn rewind(&mut self) -> Result<(), EtcError> {
        unsafe { libc::setgrent() };
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<Group>, EtcError> {
        // SAFETY: as for getpwent, under the group lease
        let entry = unsafe { libc::getgrent() };
        if entry.is_null() {
            return Ok(None);
        }
        Ok(Some(unsafe { group_from_raw(&*entry) }))
    }

    fn close(&mut self) {
        unsafe { libc::endgrent() };
    }
}

impl RecordLookup for SystemGroup {
    type Record = Group;

    fn by_id(&self, gid: u32) -> Result<Option<Group>, EtcError> {
        lookup_r("group", group_from_raw, |grp, buf, len, result| unsafe {
            libc::getgrgid_r(gid, grp, buf, len, result)
        })
    }

    fn by_name(&self, name: &str) -> Result<Option<Group>, EtcError> {
        let Ok(name) = CString::new(name) else {
            return Ok(None);
        };
        lookup_r("group", group_from_raw, |grp, buf, len, result| unsafe {
            libc::getgrnam_r(name.as_ptr(), grp, buf, len, result)
        })
    }
}

/// Login name of the controlling session, if there is one
pub fn getlogin() -> Option<String> {
    // SAFETY: the static buffer is copied out immediately
    unsafe { text(libc::getlogin()) }.filter(|name| !name.is_empty())
}

// =============================================================================
// Unit Tests
// =============================================================================
