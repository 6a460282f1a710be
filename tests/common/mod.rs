#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use dfs_client::{DfsConnection, DfsConnector, DfsError, DfsFile, DfsFileStatus};

/// Shared state backing the in-memory remote file system.
///
/// Tests keep a handle to this to inject out-of-band modifications (an
/// "other writer" appending between an eviction and a reopen) and to
/// observe backend traffic.
#[derive(Debug, Default)]
pub struct MemDfsState {
    /// `path -> content` for regular files.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Explicitly created directories.
    pub dirs: Vec<String>,
    /// `path -> mode` as applied by chmod.
    pub modes: BTreeMap<String, u32>,
    /// `path -> replication` as requested at create.
    pub replication: BTreeMap<String, u16>,
    /// How many connections were dialed.
    pub connect_count: usize,
    /// How many file handles were opened.
    pub open_count: usize,
    /// How many file handles were explicitly closed.
    pub close_count: usize,
    /// How many syncs were issued.
    pub sync_count: usize,
}

pub type SharedState = Rc<RefCell<MemDfsState>>;

/// Build a connector plus the shared state handle to drive it from tests.
pub fn mem_dfs() -> (Box<MemDfsConnector>, SharedState) {
    let state: SharedState = Rc::new(RefCell::new(MemDfsState::default()));
    (
        Box::new(MemDfsConnector {
            state: Rc::clone(&state),
        }),
        state,
    )
}

/// Seed a file with contents, as if some other client had written it.
pub fn seed_file(state: &SharedState, path: &str, contents: &[u8]) {
    state
        .borrow_mut()
        .files
        .insert(path.to_owned(), contents.to_vec());
}

/// Append out-of-band, bypassing every open handle.
pub fn append_out_of_band(state: &SharedState, path: &str, bytes: &[u8]) {
    state
        .borrow_mut()
        .files
        .get_mut(path)
        .expect("file must exist")
        .extend_from_slice(bytes);
}

pub fn contents(state: &SharedState, path: &str) -> Option<Vec<u8>> {
    state.borrow().files.get(path).cloned()
}

pub struct MemDfsConnector {
    state: SharedState,
}

impl DfsConnector for MemDfsConnector {
    fn connect(
        &self,
        _protocol: &str,
        _host: &str,
        _port: u16,
    ) -> Result<Rc<dyn DfsConnection>, DfsError> {
        self.state.borrow_mut().connect_count += 1;
        Ok(Rc::new(MemDfsConnection {
            state: Rc::clone(&self.state),
        }))
    }
}

struct MemDfsConnection {
    state: SharedState,
}

impl DfsConnection for MemDfsConnection {
    fn open(
        &self,
        path: &str,
        flags: i32,
        _buffer_size: u32,
        replication: u16,
        _block_size: u64,
    ) -> Result<Box<dyn DfsFile>, DfsError> {
        let write = flags & libc::O_ACCMODE == libc::O_WRONLY;
        let mut state = self.state.borrow_mut();
        state.open_count += 1;

        if !state.files.contains_key(path) {
            if flags & libc::O_CREAT != 0 {
                state.files.insert(path.to_owned(), Vec::new());
                if replication != 0 {
                    state.replication.insert(path.to_owned(), replication);
                }
            } else {
                return Err(DfsError::NotFound(path.to_owned()));
            }
        }

        Ok(Box::new(MemDfsFile {
            state: Rc::clone(&self.state),
            path: path.to_owned(),
            pos: 0,
            write,
        }))
    }

    fn delete(&self, path: &str, recursive: bool) -> Result<(), DfsError> {
        let mut state = self.state.borrow_mut();
        if state.files.remove(path).is_some() {
            return Ok(());
        }
        if let Some(i) = state.dirs.iter().position(|d| d == path) {
            if recursive {
                let prefix = format!("{path}/");
                state.files.retain(|p, _| !p.starts_with(&prefix));
            }
            state.dirs.remove(i);
            return Ok(());
        }
        Err(DfsError::NotFound(path.to_owned()))
    }

    fn mkdir(&self, path: &str) -> Result<(), DfsError> {
        self.state.borrow_mut().dirs.push(path.to_owned());
        Ok(())
    }

    fn chmod(&self, path: &str, mode: u32) -> Result<(), DfsError> {
        self.state.borrow_mut().modes.insert(path.to_owned(), mode);
        Ok(())
    }

    fn truncate(&self, path: &str, len: u64) -> Result<(), DfsError> {
        let mut state = self.state.borrow_mut();
        let file = state
            .files
            .get_mut(path)
            .ok_or_else(|| DfsError::NotFound(path.to_owned()))?;
        file.truncate(len as usize);
        Ok(())
    }

    fn list_directory(&self, path: &str) -> Result<Vec<DfsFileStatus>, DfsError> {
        let state = self.state.borrow();
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let listing: Vec<DfsFileStatus> = state
            .files
            .iter()
            .filter(|(p, _)| {
                p.starts_with(&prefix) && !p[prefix.len()..].contains('/')
            })
            .map(|(p, content)| DfsFileStatus {
                path: p.clone(),
                len: content.len() as u64,
                is_dir: false,
            })
            .collect();
        Ok(listing)
    }

    fn stat(&self, path: &str) -> Result<DfsFileStatus, DfsError> {
        let state = self.state.borrow();
        if let Some(content) = state.files.get(path) {
            return Ok(DfsFileStatus {
                path: path.to_owned(),
                len: content.len() as u64,
                is_dir: false,
            });
        }
        if state.dirs.iter().any(|d| d == path) {
            return Ok(DfsFileStatus {
                path: path.to_owned(),
                len: 0,
                is_dir: true,
            });
        }
        Err(DfsError::NotFound(path.to_owned()))
    }
}

struct MemDfsFile {
    state: SharedState,
    path: String,
    pos: u64,
    write: bool,
}

impl DfsFile for MemDfsFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DfsError> {
        if self.write {
            return Err(DfsError::Unsupported("read on a write handle"));
        }
        let state = self.state.borrow();
        let content = state
            .files
            .get(&self.path)
            .ok_or_else(|| DfsError::NotFound(self.path.clone()))?;
        let start = (self.pos as usize).min(content.len());
        let n = (content.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&content[start..start + n]);
        drop(state);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DfsError> {
        if !self.write {
            return Err(DfsError::Unsupported("write on a read handle"));
        }
        // Writes always append, whatever the cursor says.
        let mut state = self.state.borrow_mut();
        let content = state
            .files
            .get_mut(&self.path)
            .ok_or_else(|| DfsError::NotFound(self.path.clone()))?;
        content.extend_from_slice(buf);
        let len = content.len() as u64;
        drop(state);
        self.pos = len;
        Ok(buf.len())
    }

    fn seek(&mut self, pos: u64) -> Result<(), DfsError> {
        if self.write {
            return Err(DfsError::Unsupported("seek on an append stream"));
        }
        self.pos = pos;
        Ok(())
    }

    fn tell(&self) -> Result<u64, DfsError> {
        if self.write {
            // An append stream's position is the file length.
            let state = self.state.borrow();
            let content = state
                .files
                .get(&self.path)
                .ok_or_else(|| DfsError::NotFound(self.path.clone()))?;
            Ok(content.len() as u64)
        } else {
            Ok(self.pos)
        }
    }

    fn sync(&mut self) -> Result<(), DfsError> {
        self.state.borrow_mut().sync_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), DfsError> {
        self.state.borrow_mut().close_count += 1;
        Ok(())
    }
}
