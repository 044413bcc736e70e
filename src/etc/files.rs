//! Files backend: colon-delimited `/etc/passwd` and `/etc/group`
//!
//! Formats:
//! - passwd: `name:passwd:uid:gid:gecos:dir:shell`
//! - group:  `name:passwd:gid:member,member,...`
//!
//! Comments, blank lines and malformed entries (wrong field count,
//! non-numeric ids, empty names, NIS `+`/`-` compat lines) are skipped.

use super::{DbRecord, EtcError, Group, Passwd, RecordLookup, RecordSource};
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

/// Parse a single passwd line
pub fn parse_passwd_line(line: &str) -> Option<Passwd> {
    let fields = split_fields(line, 7)?;
    let uid = fields[2].parse::<u32>().ok()?;
    let gid = fields[3].parse::<u32>().ok()?;

    Some(Passwd {
        name: fields[0].to_string(),
        passwd: Some(fields[1].to_string()),
        uid,
        gid,
        gecos: Some(fields[4].to_string()),
        dir: fields[5].to_string(),
        shell: fields[6].to_string(),
    })
}

/// Parse a single group line
pub fn parse_group_line(line: &str) -> Option<Group> {
    let fields = split_fields(line, 4)?;
    let gid = fields[2].parse::<u32>().ok()?;

    let members = if fields[3].is_empty() {
        Vec::new()
    } else {
        fields[3].split(',').map(str::to_owned).collect()
    };

    Some(Group {
        name: fields[0].to_string(),
        passwd: Some(fields[1].to_string()),
        gid,
        members,
    })
}

fn split_fields(line: &str, expected: usize) -> Option<Vec<&str>> {
    let line = line.strip_suffix('\n').unwrap_or(line);
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let fields: Vec<&str> = line.split(':').collect();
    if fields.len() != expected || fields[0].is_empty() {
        return None;
    }
    if fields[0].starts_with('+') || fields[0].starts_with('-') {
        return None;
    }
    Some(fields)
}

/// Parse every valid entry, in file order
pub fn parse_all<R: DbRecord>(content: &str) -> Vec<R> {
    content.lines().filter_map(R::parse_line).collect()
}

fn read_db(path: &Path) -> Result<String, EtcError> {
    // Database files may carry non-UTF-8 gecos fields
    fs::read(path)
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .map_err(|source| EtcError::Io {
            path: path.to_path_buf(),
            source,
        })
}

// =============================================================================
// Sequential source
// =============================================================================

/// Snapshot-on-rewind cursor over a database file
#[derive(Debug)]
pub struct FileSource<R> {
    path: PathBuf,
    entries: Vec<R>,
    position: usize,
}

impl<R: DbRecord> FileSource<R> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: Vec::new(),
            position: 0,
        }
    }
}

impl<R: DbRecord> RecordSource for FileSource<R> {
    type Record = R;

    fn rewind(&mut self) -> Result<(), EtcError> {
        self.entries = parse_all(&read_db(&self.path)?);
        self.position = 0;
        Ok(())
    }

    fn next_record(&mut self) -> Result<Option<R>, EtcError> {
        let entry = self.entries.get(self.position).cloned();
        if entry.is_some() {
            self.position += 1;
        }
        Ok(entry)
    }

    fn close(&mut self) {
        self.entries.clear();
        self.position = 0;
    }
}

// =============================================================================
// Point lookups
// =============================================================================

/// First-match lookups, rereading the file on every call
#[derive(Debug)]
pub struct FileLookup<R> {
    path: PathBuf,
    _record: PhantomData<fn() -> R>,
}

impl<R: DbRecord> FileLookup<R> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _record: PhantomData,
        }
    }

    fn find(&self, matches: impl Fn(&R) -> bool) -> Result<Option<R>, EtcError> {
        let content = read_db(&self.path)?;
        Ok(content
            .lines()
            .filter_map(R::parse_line)
            .find(|entry| matches(entry)))
    }
}

impl<R: DbRecord> RecordLookup for FileLookup<R> {
    type Record = R;

    fn by_id(&self, id: u32) -> Result<Option<R>, EtcError> {
        self.find(|entry| entry.id() == id)
    }

    fn by_name(&self, name: &str) -> Result<Option<R>, EtcError> {
        self.find(|entry| entry.name() == name)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
