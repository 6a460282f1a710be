//! The public face of the VFD layer.
//!
//! [`FileAccess`] owns every piece of process-wide file state: the VFD
//! cache, the allocated-desc table, the remote connection pool, the
//! descriptor budget and the temp-file counter. All operations are
//! synchronous and single-threaded; callers route every file they intend
//! to keep open through here so the layer can keep the process under its
//! kernel descriptor budget by transparently closing and reopening files
//! behind their handles.

use std::ffi::OsString;
use std::io::SeekFrom;
use std::os::unix::fs::DirBuilderExt as _;
use std::path::Path;

use dfs_client::DfsConnector;
use tracing::{debug, error, warn};

use crate::backend::{local, remote};
use crate::budget::FdBudget;
use crate::cache::{File, VfdCache};
use crate::config::FdConfig;
use crate::desc::{DescKind, DescTable, DirId, StreamId};
use crate::error::{FdError, FdResult, errno_error};
use crate::flags::{OpenFlags, VfdState};
use crate::path;
use crate::pool::{DfsPool, NoRemote};
use crate::temp;

/// Opaque identifier of a nested transactional scope, provisioned by the
/// surrounding transaction manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SubXactId(pub u64);

/// Process-lifetime file access state.
///
/// Created once at backend startup and torn down at process exit; the
/// [`Drop`] impl runs the proc-exit cleanup as a backstop, so temp files
/// cannot outlive the context even on unusual exit paths.
pub struct FileAccess {
    cache: VfdCache,
    descs: DescTable,
    pool: DfsPool,
    budget: FdBudget,
    config: FdConfig,
    /// Temporary files opened so far; feeds unique temp names.
    temp_file_counter: u64,
    current_subid: SubXactId,
}

impl FileAccess {
    /// Initialize the layer with a remote backend.
    pub fn new(config: FdConfig, connector: Box<dyn DfsConnector>) -> Self {
        Self {
            cache: VfdCache::new(),
            descs: DescTable::new(),
            pool: DfsPool::new(connector),
            budget: FdBudget::default(),
            config,
            temp_file_counter: 0,
            current_subid: SubXactId::default(),
        }
    }

    /// Initialize the layer without a remote backend; remote paths fail
    /// with an unreachable-endpoint error.
    pub fn local_only(config: FdConfig) -> Self {
        Self::new(config, Box::new(NoRemote))
    }

    /// Probe the OS descriptor limit and settle the budget. Call once,
    /// late in startup; a failure means the environment cannot support
    /// the process and should be treated as fatal.
    pub fn set_max_safe_fds(&mut self) -> FdResult<()> {
        self.budget.set_max_safe_fds(self.config.max_files_per_process)
    }

    /// Pin the descriptor budget instead of probing. Unlike
    /// [`set_max_safe_fds`](Self::set_max_safe_fds), no minimum floor is
    /// enforced; meant for tests and embedded callers that manage the
    /// real limit themselves.
    pub fn pin_max_safe_fds(&mut self, limit: usize) -> FdResult<()> {
        self.budget.pin_max_safe_fds(limit)
    }

    /// Descriptors this layer may hold open at once.
    pub fn max_safe_fds(&self) -> usize {
        self.budget.max_safe_fds()
    }

    /// Kernel descriptors currently held by VFD slots.
    pub fn open_file_count(&self) -> usize {
        self.cache.nfile
    }

    /// Current capacity of the VFD slot arena, sentinel included.
    pub fn cache_capacity(&self) -> usize {
        self.cache.len()
    }

    /// Allocated descs currently live.
    pub fn allocated_desc_count(&self) -> usize {
        self.descs.len()
    }

    /// Record the subtransaction scope for subsequently created temp files
    /// and allocated descs. Pushed by the transaction manager at scope
    /// changes.
    pub fn set_current_subxact(&mut self, subid: SubXactId) {
        self.current_subid = subid;
    }

    // ---- opening ----------------------------------------------------

    /// Open a file on whichever backend its path names.
    pub fn path_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> FdResult<File> {
        if path::is_local(path) {
            self.local_path_open(path, flags, mode)
        } else {
            self.remote_path_open(path, flags, mode)
        }
    }

    /// Open a file by a path relative to the configured temp root.
    pub fn file_name_open(&mut self, name: &str, flags: OpenFlags, mode: u32) -> FdResult<File> {
        debug_assert!(!Path::new(name).is_absolute());
        let full = self.config.temp_dir.join(name);
        let Some(full_str) = full.to_str() else {
            return Err(FdError::InvalidPath {
                path: full.to_string_lossy().into_owned(),
                reason: "path is not valid UTF-8",
            });
        };
        self.path_open(full_str, flags, mode)
    }

    fn local_path_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> FdResult<File> {
        debug!(path, ?flags, mode, "opening local file");

        let file = self.cache.allocate_vfd();
        let kernel = match self
            .release_room()
            .and_then(|()| self.basic_open(Path::new(path::native_local(path)), flags, mode))
        {
            Ok(kernel) => kernel,
            Err(e) => {
                self.cache.free_vfd(file);
                return Err(e);
            }
        };

        self.cache.nfile += 1;
        self.cache.ring_insert(file);

        let slot = self.cache.slot_mut(file);
        slot.fd = Some(kernel);
        slot.path = Some(path.to_owned());
        slot.protocol = None;
        slot.open_flags = flags.sanitize_local();
        slot.open_mode = mode;
        slot.seek_pos = Some(0);
        slot.state = VfdState::empty();
        slot.create_subid = SubXactId::default();
        Ok(file)
    }

    fn remote_path_open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> FdResult<File> {
        debug!(path, ?flags, mode, "opening remote file");

        let protocol = path::parse_remote(path)?.protocol.to_owned();
        let handle = remote::open(&mut self.pool, path, flags, mode)?;

        // The slot is allocated only after the remote handle exists: the
        // open above may itself open metadata files that allocate slots
        // and grow the arena.
        let file = self.cache.allocate_vfd();
        let slot = self.cache.slot_mut(file);
        slot.remote = Some(handle);
        slot.path = Some(path.to_owned());
        slot.protocol = Some(protocol);
        slot.open_flags = flags.sanitize_remote();
        slot.open_mode = mode;
        slot.seek_pos = Some(0);
        slot.state = VfdState::empty();
        slot.create_subid = SubXactId::default();
        Ok(file)
    }

    /// Open a temporary file under the temp root.
    ///
    /// With `make_name_unique` the name embeds the pid and a process-local
    /// counter (a fresh anonymous spill file; requires `create` and
    /// `del_on_close`); otherwise `(label, extent)` name a predictable
    /// file that cooperating processes may share. `O_EXCL` is never used,
    /// so an orphaned file of the same name is silently reused.
    pub fn open_temporary_file(
        &mut self,
        label: &str,
        extent: u32,
        make_name_unique: bool,
        create: bool,
        del_on_close: bool,
        close_at_eoxact: bool,
    ) -> FdResult<File> {
        debug_assert!(!make_name_unique || (create && del_on_close));

        let unique = if make_name_unique {
            let counter = self.temp_file_counter;
            self.temp_file_counter += 1;
            Some(counter)
        } else {
            None
        };
        let rel = temp::temp_file_path(label, extent, unique, std::process::id());

        let mut flags = OpenFlags::RDWR;
        if create {
            flags |= OpenFlags::TRUNC | OpenFlags::CREAT;
        }

        let file = match self.file_name_open(&rel, flags, 0o600) {
            Ok(file) => file,
            Err(first) => {
                if !create {
                    return Err(first);
                }
                // The pgsql_tmp subdirectory may not exist yet. Create it
                // without checking the result (another process may have
                // just done the same) and let the retry decide.
                let dirpath = self.config.temp_dir.join(temp::PG_TEMP_FILES_DIR);
                let mut builder = std::fs::DirBuilder::new();
                builder.mode(0o700);
                let _ = builder.create(&dirpath);

                self.file_name_open(&rel, flags, 0o600).map_err(|e| {
                    error!(path = %rel, error = %e, "could not create temporary file");
                    e
                })?
            }
        };

        let subid = self.current_subid;
        let slot = self.cache.slot_mut(file);
        if del_on_close {
            slot.state |= VfdState::TEMPORARY;
        }
        if close_at_eoxact {
            slot.state |= VfdState::CLOSE_AT_EOXACT;
            slot.create_subid = subid;
        }
        Ok(file)
    }

    // ---- descriptor budget ------------------------------------------

    /// Evict LRU entries until there is headroom for one more descriptor,
    /// or nothing is left to evict.
    fn release_room(&mut self) -> FdResult<()> {
        while self.cache.nfile + self.descs.len() >= self.budget.max_safe_fds() {
            if !self.cache.release_lru_file()? {
                break;
            }
        }
        Ok(())
    }

    /// `open(2)` that survives descriptor exhaustion: on EMFILE/ENFILE,
    /// evict one LRU entry and retry once.
    fn basic_open(&mut self, native: &Path, flags: OpenFlags, mode: u32) -> FdResult<std::fs::File> {
        match local::open(native, flags, mode) {
            Ok(kernel) => Ok(kernel),
            Err(e) if local::is_fd_exhaustion(&e) => {
                warn!(path = %native.display(), error = %e, "out of file handles; release and retry");
                if self.cache.release_lru_file()? {
                    match local::open(native, flags, mode) {
                        Ok(kernel) => Ok(kernel),
                        Err(e) if local::is_fd_exhaustion(&e) => Err(FdError::BudgetExhausted(e)),
                        Err(e) => Err(FdError::Backend(e)),
                    }
                } else {
                    Err(FdError::BudgetExhausted(e))
                }
            }
            Err(e) => Err(FdError::Backend(e)),
        }
    }

    // ---- the re-open protocol ---------------------------------------

    fn checked(&self, file: File, op: &'static str) -> FdResult<()> {
        if self.cache.is_valid(file) {
            Ok(())
        } else {
            warn!(?file, op, "operation on invalid file handle; programming bug");
            debug_assert!(false, "operation on invalid file handle");
            Err(errno_error(libc::EBADF))
        }
    }

    /// Make sure `file` is physically open, reopening it if eviction
    /// closed it, and record the access in the LRU ring. Remote slots
    /// never enter the ring; the local-only gate lives here and nowhere
    /// else.
    fn access(&mut self, file: File) -> FdResult<()> {
        if !self.cache.slot(file).physically_open() {
            return self.lru_insert(file);
        }
        if self.cache.slot(file).is_local() && self.cache.ring_head() != Some(file) {
            self.cache.ring_unlink(file);
            self.cache.ring_insert(file);
        }
        Ok(())
    }

    /// Reopen a kernel-closed slot and restore its position, then insert
    /// it at the head of the ring (local only).
    fn lru_insert(&mut self, file: File) -> FdResult<()> {
        let path = self
            .cache
            .slot(file)
            .path
            .clone()
            .expect("virtually open slot must have a path");
        debug!(?file, path = %path, "reopening evicted file");

        if let Err(e) = self.reopen_backend(file, &path) {
            warn!(?file, path = %path, error = %e, "reopen failed");
            return Err(FdError::Reopen {
                path,
                source: Box::new(e),
            });
        }

        if self.cache.slot(file).is_local() {
            self.cache.ring_insert(file);
        }
        Ok(())
    }

    fn reopen_backend(&mut self, file: File, uri: &str) -> FdResult<()> {
        let (flags, mode, is_local, seek_pos) = {
            let slot = self.cache.slot(file);
            (slot.open_flags, slot.open_mode, slot.is_local(), slot.seek_pos)
        };

        if is_local {
            self.release_room()?;
            let mut kernel = self.basic_open(Path::new(path::native_local(uri)), flags, mode)?;

            match seek_pos {
                Some(0) => {}
                Some(pos) => {
                    if let Err(e) = local::seek(&mut kernel, SeekFrom::Start(pos as u64)) {
                        local::close(kernel);
                        return Err(FdError::Backend(e));
                    }
                }
                None => {
                    // The position was lost to an earlier I/O failure; the
                    // caller must repair it with an explicit seek first.
                    local::close(kernel);
                    return Err(errno_error(libc::EIO));
                }
            }

            self.cache.nfile += 1;
            self.cache.slot_mut(file).fd = Some(kernel);
            return Ok(());
        }

        let mut handle = remote::open(&mut self.pool, uri, flags, mode)?;

        if flags.is_write() {
            // Remote write handles are append-only by contract; the only
            // valid restored position is the current end of file.
            debug_assert!(flags.contains(OpenFlags::APPEND));
            let len = handle.file.tell().map_err(FdError::from)? as i64;
            if seek_pos != Some(len) {
                warn!(
                    path = uri,
                    server_len = len,
                    logical_pos = ?seek_pos,
                    "remote file length does not match logical position"
                );
                let _ = handle.file.close();
                return Err(FdError::PositionMismatch {
                    path: uri.to_owned(),
                    expected: seek_pos.unwrap_or(-1),
                    actual: len,
                });
            }
        } else {
            match seek_pos {
                Some(pos) => handle.file.seek(pos as u64).map_err(FdError::from)?,
                None => {
                    let _ = handle.file.close();
                    return Err(errno_error(libc::EIO));
                }
            }
        }

        self.cache.slot_mut(file).remote = Some(handle);
        Ok(())
    }

    // ---- data plane -------------------------------------------------

    /// Read at the current position, retrying interrupts.
    pub fn file_read(&mut self, file: File, buf: &mut [u8]) -> FdResult<usize> {
        self.file_read_intr(file, buf, true)
    }

    /// Read at the current position. `retry_intr` opts into retrying
    /// `EINTR` at this layer.
    pub fn file_read_intr(&mut self, file: File, buf: &mut [u8], retry_intr: bool) -> FdResult<usize> {
        self.checked(file, "file_read")?;
        self.access(file)?;

        let slot = self.cache.slot_mut(file);
        let result = if let Some(fd) = slot.fd.as_mut() {
            local::read(fd, buf, retry_intr).map_err(FdError::from)
        } else {
            let handle = slot.remote.as_mut().expect("access left the slot open");
            handle.file.read(buf).map_err(FdError::from)
        };

        self.note_io(file, result, "read")
    }

    /// Write at the current position. Interrupts are always retried; a
    /// short write with no OS error surfaces as `ENOSPC`.
    pub fn file_write(&mut self, file: File, buf: &[u8]) -> FdResult<usize> {
        self.checked(file, "file_write")?;
        self.access(file)?;

        let slot = self.cache.slot_mut(file);
        let result = if let Some(fd) = slot.fd.as_mut() {
            local::write(fd, buf).map_err(FdError::from)
        } else {
            let handle = slot.remote.as_mut().expect("access left the slot open");
            handle.file.write(buf).map_err(FdError::from)
        };

        self.note_io(file, result, "write")
    }

    /// Advance the logical position after an I/O, or poison it after a
    /// failure so the next access has to restore it explicitly.
    fn note_io(&mut self, file: File, result: FdResult<usize>, op: &'static str) -> FdResult<usize> {
        let slot = self.cache.slot_mut(file);
        match result {
            Ok(n) => {
                if let Some(pos) = slot.seek_pos.as_mut() {
                    *pos += n as i64;
                }
                Ok(n)
            }
            Err(e) => {
                slot.seek_pos = None;
                warn!(?file, path = slot.path.as_deref(), op, error = %e, "file i/o failed");
                Err(e)
            }
        }
    }

    /// Reposition a handle. Returns the resulting logical position.
    ///
    /// Seeks on kernel-closed local slots are virtual where possible:
    /// `Start`/`Current` just adjust the stored position and the file is
    /// not reopened. Remote write handles track the position logically
    /// only (the backend cannot seek an append stream); remote `End`
    /// consults `stat` for the file size.
    pub fn file_seek(&mut self, file: File, pos: SeekFrom) -> FdResult<i64> {
        self.checked(file, "file_seek")?;
        if self.cache.slot(file).is_local() {
            self.local_seek(file, pos)
        } else {
            self.remote_seek(file, pos)
        }
    }

    fn local_seek(&mut self, file: File, pos: SeekFrom) -> FdResult<i64> {
        if !self.cache.slot(file).physically_open() {
            match pos {
                SeekFrom::Start(offset) => {
                    self.cache.slot_mut(file).seek_pos = Some(offset as i64);
                }
                SeekFrom::Current(delta) => {
                    let slot = self.cache.slot_mut(file);
                    match slot.seek_pos {
                        Some(current) => slot.seek_pos = Some(current + delta),
                        // Position already lost; nothing to add to.
                        None => return Err(errno_error(libc::EIO)),
                    }
                }
                SeekFrom::End(_) => {
                    self.access(file)?;
                    return self.local_seek_physical(file, pos);
                }
            }
            let slot = self.cache.slot(file);
            return Ok(slot.seek_pos.expect("just set"));
        }

        // Skip the syscall when it cannot move the cursor.
        let known = self.cache.slot(file).seek_pos;
        match pos {
            SeekFrom::Start(offset) if known == Some(offset as i64) => Ok(offset as i64),
            SeekFrom::Current(0) if known.is_some() => Ok(known.expect("just checked")),
            _ => self.local_seek_physical(file, pos),
        }
    }

    fn local_seek_physical(&mut self, file: File, pos: SeekFrom) -> FdResult<i64> {
        let slot = self.cache.slot_mut(file);
        let fd = slot.fd.as_mut().expect("physically open local slot");
        match local::seek(fd, pos) {
            Ok(result) => {
                slot.seek_pos = Some(result);
                Ok(result)
            }
            Err(e) => {
                slot.seek_pos = None;
                Err(FdError::Backend(e))
            }
        }
    }

    fn remote_seek(&mut self, file: File, pos: SeekFrom) -> FdResult<i64> {
        let (known, flags, path) = {
            let slot = self.cache.slot(file);
            (
                slot.seek_pos,
                slot.open_flags,
                slot.path.clone().expect("virtually open slot must have a path"),
            )
        };

        let desired = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => match known {
                Some(current) => current + delta,
                None => return Err(errno_error(libc::EIO)),
            },
            SeekFrom::End(delta) => remote::size(&mut self.pool, &path)? + delta,
        };
        if desired < 0 {
            return Err(errno_error(libc::EINVAL));
        }

        if flags.is_write() {
            // Append streams cannot seek; the logical position is kept for
            // the re-open equality check only.
            self.cache.slot_mut(file).seek_pos = Some(desired);
            return Ok(desired);
        }

        self.access(file)?;
        let slot = self.cache.slot_mut(file);
        let handle = slot.remote.as_mut().expect("access left the slot open");
        match handle.file.seek(desired as u64) {
            Ok(()) => {
                slot.seek_pos = Some(desired);
                Ok(desired)
            }
            Err(e) => {
                warn!(?file, path = slot.path.as_deref(), error = %e, "remote seek failed");
                slot.seek_pos = None;
                Err(e.into())
            }
        }
    }

    /// The backend's idea of the current position, bypassing the cached
    /// logical one.
    pub fn file_non_virtual_tell(&mut self, file: File) -> FdResult<i64> {
        self.checked(file, "file_non_virtual_tell")?;
        self.access(file)?;

        let slot = self.cache.slot_mut(file);
        if let Some(fd) = slot.fd.as_mut() {
            local::tell(fd).map_err(FdError::from)
        } else {
            let handle = slot.remote.as_mut().expect("access left the slot open");
            Ok(handle.file.tell().map_err(FdError::from)? as i64)
        }
    }

    /// Flush a handle per the configured sync policy. Remote sync only
    /// guarantees visibility to other readers, not durability.
    pub fn file_sync(&mut self, file: File) -> FdResult<()> {
        self.checked(file, "file_sync")?;
        self.access(file)?;

        let (method, enable) = (self.config.sync_method, self.config.enable_fsync);
        let slot = self.cache.slot_mut(file);
        if let Some(fd) = slot.fd.as_ref() {
            local::sync(fd, method, enable).map_err(FdError::from)
        } else {
            let handle = slot.remote.as_mut().expect("access left the slot open");
            handle.file.sync().map_err(|e| {
                warn!(?file, path = slot.path.as_deref(), error = %e, "cannot flush remote file");
                FdError::from(e)
            })
        }
    }

    /// Cut a file down to `len` bytes.
    ///
    /// Locally this is `ftruncate`; remotely the handle is closed, the
    /// path truncated through the connection, and the file reopened for
    /// append — if the reopened length differs from `len`, someone else
    /// wrote in between and the operation fails with a position mismatch.
    /// The logical position is considered unknown afterwards in the local
    /// case.
    pub fn file_truncate(&mut self, file: File, len: i64) -> FdResult<()> {
        self.checked(file, "file_truncate")?;
        if len < 0 {
            return Err(errno_error(libc::EINVAL));
        }

        if self.cache.slot(file).is_local() {
            self.access(file)?;
            let slot = self.cache.slot_mut(file);
            let fd = slot.fd.as_ref().expect("access left the slot open");
            let result = local::truncate(fd, len as u64).map_err(FdError::from);
            // The kernel cursor did not move, but treat the position as
            // unknown so the next access restores it explicitly.
            slot.seek_pos = None;
            return result;
        }

        self.remote_truncate(file, len)
    }

    fn remote_truncate(&mut self, file: File, len: i64) -> FdResult<()> {
        let (path, flags, mode) = {
            let slot = self.cache.slot_mut(file);
            // Remote slots are not ring members; just drop the handle.
            if let Some(mut handle) = slot.remote.take() {
                if let Err(e) = handle.file.close() {
                    warn!(?file, error = %e, "could not close remote file before truncate");
                    return Err(e.into());
                }
            }
            (
                slot.path.clone().expect("virtually open slot must have a path"),
                slot.open_flags,
                slot.open_mode,
            )
        };

        if !(flags.is_write() && flags.contains(OpenFlags::APPEND)) {
            return Err(errno_error(libc::EINVAL));
        }

        let parsed = path::parse_remote(&path)?;
        let conn = self.pool.get(&parsed)?;
        let unix_path = path::to_unix_path(&path)?;
        conn.truncate(unix_path, len as u64).map_err(FdError::from)?;

        // Close-truncate-reopen is not atomic; verify nobody appended in
        // between by checking the reopened length.
        let handle = remote::open(&mut self.pool, &path, flags, mode)?;
        let actual = handle.file.tell().map_err(FdError::from)? as i64;
        let slot = self.cache.slot_mut(file);
        slot.remote = Some(handle);
        slot.seek_pos = Some(actual);

        if actual != len {
            return Err(FdError::PositionMismatch {
                path,
                expected: len,
                actual,
            });
        }
        Ok(())
    }

    // ---- closing ----------------------------------------------------

    /// Close a handle, releasing its slot. A slot flagged TEMPORARY has
    /// its underlying file unlinked as well (unlink errors are logged,
    /// not returned).
    pub fn file_close(&mut self, file: File) -> FdResult<()> {
        self.checked(file, "file_close")?;
        if self.cache.slot(file).is_local() {
            self.local_file_close(file)
        } else {
            self.remote_file_close(file, true)
        }
    }

    /// Close a handle and forcibly delete the underlying file.
    pub fn file_unlink(&mut self, file: File) -> FdResult<()> {
        self.checked(file, "file_unlink")?;
        self.cache.slot_mut(file).state |= VfdState::TEMPORARY;
        self.file_close(file)
    }

    fn local_file_close(&mut self, file: File) -> FdResult<()> {
        debug!(?file, path = self.cache.slot(file).path.as_deref(), "closing local file");

        let mut close_result = Ok(());
        if self.cache.slot(file).physically_open() {
            self.cache.ring_unlink(file);
            let kernel = self.cache.slot_mut(file).fd.take().expect("physically open local slot");
            close_result = local::close_reporting(kernel);
            self.cache.nfile -= 1;
        }

        let slot = self.cache.slot_mut(file);
        if slot.state.contains(VfdState::TEMPORARY) {
            // Reset the flag first so an interrupt cannot double-unlink.
            slot.state -= VfdState::TEMPORARY;
            let native = path::native_local(slot.path.as_deref().expect("valid slot")).to_owned();
            if let Err(e) = std::fs::remove_file(&native) {
                debug!(path = %native, error = %e, "failed to unlink temporary file");
            }
        }

        self.cache.free_vfd(file);
        close_result.map_err(FdError::from)
    }

    fn remote_file_close(&mut self, file: File, report_errors: bool) -> FdResult<()> {
        debug!(?file, path = self.cache.slot(file).path.as_deref(), "closing remote file");

        let close_error = {
            let slot = self.cache.slot_mut(file);
            match slot.remote.take() {
                Some(mut handle) => handle.file.close().err(),
                None => None,
            }
        };

        let slot = self.cache.slot_mut(file);
        let temp_path = if slot.state.contains(VfdState::TEMPORARY) {
            slot.state -= VfdState::TEMPORARY;
            slot.path.clone()
        } else {
            None
        };
        let path = slot.path.clone();
        self.cache.free_vfd(file);

        if let Some(temp_path) = temp_path {
            if let Err(e) = self.remove_remote(&temp_path, false) {
                debug!(path = %temp_path, error = %e, "failed to unlink temporary remote file");
            }
        }

        match close_error {
            None => Ok(()),
            Some(e) if report_errors => {
                error!(?file, path = path.as_deref(), error = %e, "could not close remote file");
                Err(e.into())
            }
            Some(e) => {
                warn!(?file, path = path.as_deref(), error = %e, "could not close remote file");
                Ok(())
            }
        }
    }

    // ---- path-level operations --------------------------------------

    fn remove_remote(&mut self, path: &str, recursive: bool) -> FdResult<()> {
        let parsed = path::parse_remote(path)?;
        let conn = self.pool.get(&parsed)?;
        let unix_path = path::to_unix_path(path)?;
        conn.delete(unix_path, recursive).map_err(FdError::from)
    }

    /// Remove a file, or a tree when `recursive` is set.
    ///
    /// NOTE: the return polarity is the opposite of the POSIX convention:
    /// `true` means success and `false` means failure. Long-standing
    /// published behavior; do not "fix".
    pub fn remove_path(&mut self, path: &str, recursive: bool) -> bool {
        if path::is_local(path) {
            let native = path::native_local(path);
            let result = if recursive {
                std::fs::remove_dir_all(native)
            } else {
                std::fs::remove_file(native)
            };
            match result {
                Ok(()) => true,
                Err(e) => {
                    warn!(path, recursive, error = %e, "cannot remove path");
                    false
                }
            }
        } else {
            match self.remove_remote(path, recursive) {
                Ok(()) => true,
                Err(e) => {
                    warn!(path, recursive, error = %e, "cannot remove remote path");
                    false
                }
            }
        }
    }

    /// Create a directory on whichever backend the path names.
    pub fn make_directory(&mut self, path: &str, mode: u32) -> FdResult<()> {
        if path::is_local(path) {
            let mut builder = std::fs::DirBuilder::new();
            builder.mode(mode);
            builder.create(path::native_local(path)).map_err(FdError::from)
        } else {
            let parsed = path::parse_remote(path)?;
            let conn = self.pool.get(&parsed)?;
            let unix_path = path::to_unix_path(path)?;
            conn.mkdir(unix_path).map_err(FdError::from)?;
            conn.chmod(unix_path, mode).map_err(|e| {
                warn!(path, mode, error = %e, "cannot set mode on remote directory");
                FdError::from(e)
            })
        }
    }

    // ---- allocated descs --------------------------------------------

    /// Open a scoped stream through the descriptor budget. Meant for
    /// short-lived files (config-style reads); anything held open for
    /// long belongs in a VFD. The stream is closed automatically at
    /// transaction end.
    pub fn allocate_file(&mut self, name: &Path, opts: &std::fs::OpenOptions) -> FdResult<StreamId> {
        if !self.descs.has_room(self.budget.max_safe_fds()) {
            return Err(FdError::BudgetExhausted(std::io::Error::from_raw_os_error(
                libc::EMFILE,
            )));
        }
        self.release_room()?;

        let file = match opts.open(name) {
            Ok(file) => file,
            Err(e) if local::is_fd_exhaustion(&e) => {
                warn!(path = %name.display(), error = %e, "out of file handles; release and retry");
                if self.cache.release_lru_file()? {
                    match opts.open(name) {
                        Ok(file) => file,
                        Err(e) if local::is_fd_exhaustion(&e) => {
                            return Err(FdError::BudgetExhausted(e));
                        }
                        Err(e) => return Err(FdError::Backend(e)),
                    }
                } else {
                    return Err(FdError::BudgetExhausted(e));
                }
            }
            Err(e) => return Err(FdError::Backend(e)),
        };

        Ok(StreamId(self.descs.push(DescKind::Stream(file), self.current_subid)))
    }

    /// Access the stream behind an allocated descriptor.
    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut std::fs::File> {
        self.descs.stream_mut(id)
    }

    /// Close a stream opened with [`allocate_file`](Self::allocate_file).
    pub fn free_file(&mut self, id: StreamId) -> FdResult<()> {
        if self.descs.free(id.0) {
            Ok(())
        } else {
            warn!(?id, "stream to be closed was not allocated through the virtual file descriptor system");
            debug_assert!(false, "free_file on unknown stream");
            Err(errno_error(libc::EBADF))
        }
    }

    /// Open a scoped directory iterator. Remote directories are listed
    /// eagerly; local ones stream from the OS.
    pub fn allocate_dir(&mut self, path: &str) -> FdResult<DirId> {
        if !self.descs.has_room(self.budget.max_safe_fds()) {
            return Err(FdError::BudgetExhausted(std::io::Error::from_raw_os_error(
                libc::EMFILE,
            )));
        }
        self.release_room()?;

        if !path::is_local(path) {
            let parsed = path::parse_remote(path)?;
            let conn = self.pool.get(&parsed)?;
            let unix_path = path::to_unix_path(path)?;
            let listing = conn.list_directory(unix_path).map_err(FdError::from)?;
            return Ok(DirId(self.descs.push(
                DescKind::RemoteDir { listing, cursor: 0 },
                self.current_subid,
            )));
        }

        let native = path::native_local(path);
        let read_dir = match std::fs::read_dir(native) {
            Ok(read_dir) => read_dir,
            Err(e) if local::is_fd_exhaustion(&e) => {
                warn!(path, error = %e, "out of file handles; release and retry");
                if self.cache.release_lru_file()? {
                    match std::fs::read_dir(native) {
                        Ok(read_dir) => read_dir,
                        Err(e) if local::is_fd_exhaustion(&e) => {
                            return Err(FdError::BudgetExhausted(e));
                        }
                        Err(e) => return Err(FdError::Backend(e)),
                    }
                } else {
                    return Err(FdError::BudgetExhausted(e));
                }
            }
            Err(e) => return Err(FdError::Backend(e)),
        };

        Ok(DirId(self.descs.push(DescKind::LocalDir(read_dir), self.current_subid)))
    }

    /// Next entry of a directory iterator, or `None` at the end. `path`
    /// is only used in error reports.
    pub fn read_dir(&mut self, dir: DirId, path: &str) -> FdResult<Option<OsString>> {
        self.descs.read_dir(dir, path).map_err(FdError::from)
    }

    /// Close a directory opened with [`allocate_dir`](Self::allocate_dir).
    pub fn free_dir(&mut self, id: DirId) -> FdResult<()> {
        if self.descs.free(id.0) {
            Ok(())
        } else {
            warn!(?id, "directory to be closed was not allocated through the virtual file descriptor system");
            debug_assert!(false, "free_dir on unknown directory");
            Err(errno_error(libc::EBADF))
        }
    }

    // ---- lifecycle --------------------------------------------------

    /// Force every VFD into the kernel-closed state, releasing all kernel
    /// descriptors while leaving the handles logically open.
    pub fn close_all_vfds(&mut self) -> FdResult<()> {
        for file in self.cache.files() {
            if !self.cache.is_valid(file) || !self.cache.slot(file).physically_open() {
                continue;
            }
            if self.cache.slot(file).is_local() {
                self.cache.lru_delete(file)?;
            } else {
                self.remote_suspend(file);
            }
        }
        Ok(())
    }

    /// Drop a remote handle while keeping the slot virtually open,
    /// capturing the position for the later reopen check.
    fn remote_suspend(&mut self, file: File) {
        let slot = self.cache.slot_mut(file);
        let mut handle = slot.remote.take().expect("physically open remote slot");
        match handle.file.tell() {
            Ok(pos) => slot.seek_pos = Some(pos as i64),
            Err(e) => {
                warn!(?file, path = slot.path.as_deref(), error = %e, "cannot capture remote position");
                slot.seek_pos = None;
            }
        }
        if let Err(e) = handle.file.close() {
            warn!(?file, path = slot.path.as_deref(), error = %e, "could not close remote file");
        }
    }

    /// Subtransaction boundary: on commit, temp files created in the
    /// ending scope move to the parent scope; on abort they are closed.
    pub fn at_eosubxact(&mut self, is_commit: bool, my_subid: SubXactId, parent_subid: SubXactId) {
        for file in self.cache.files() {
            if !self.cache.is_valid(file) {
                continue;
            }
            let (state, subid) = {
                let slot = self.cache.slot(file);
                (slot.state, slot.create_subid)
            };
            if !state.contains(VfdState::CLOSE_AT_EOXACT) || subid != my_subid {
                continue;
            }
            if is_commit {
                self.cache.slot_mut(file).create_subid = parent_subid;
            } else if let Err(e) = self.file_close(file) {
                warn!(?file, error = %e, "could not close file at subtransaction abort");
            }
        }

        self.descs.at_eosubxact(is_commit, my_subid, parent_subid);
    }

    /// Top-level transaction end (commit or abort): close every VFD
    /// flagged to end with the transaction, and release every allocated
    /// desc.
    pub fn at_eoxact(&mut self) {
        self.cleanup_temp_files(false);
    }

    /// Transaction abort: additionally drop every open remote handle
    /// without reporting backend errors — the endpoints may be the reason
    /// the transaction is aborting.
    pub fn at_xact_cancel(&mut self) {
        for file in self.cache.files() {
            if !self.cache.is_valid(file) {
                continue;
            }
            let slot = self.cache.slot(file);
            if slot.is_local() || !slot.physically_open() {
                continue;
            }
            let _ = self.remote_file_close(file, false);
        }
    }

    /// Process-exit hook: close all transaction-scoped and temporary
    /// VFDs and every allocated desc. Errors are logged, never raised.
    pub fn at_proc_exit(&mut self) {
        self.cleanup_temp_files(true);
    }

    fn cleanup_temp_files(&mut self, is_proc_exit: bool) {
        for file in self.cache.files() {
            if !self.cache.is_valid(file) {
                continue;
            }
            let state = self.cache.slot(file).state;
            if state.contains(VfdState::CLOSE_AT_EOXACT)
                || (is_proc_exit && state.contains(VfdState::TEMPORARY))
            {
                if let Err(e) = self.file_close(file) {
                    warn!(?file, error = %e, "could not close file during cleanup");
                }
            }
        }

        self.descs.free_all();
    }

    /// Remove temporary files left over from an earlier incarnation of
    /// the process manager. Call once at startup; only files carrying the
    /// temp prefix are touched.
    pub fn remove_pg_temp_files(&self) {
        for target in temp::sweep_targets(&self.config.data_dir, &self.config.temp_dir) {
            temp::remove_temp_files_in_dir(&target);
        }
    }

    // ---- self-checks ------------------------------------------------

    /// Verify the cache's structural invariants, panicking on violation.
    /// A debugging aid: randomized tests call this after every operation.
    pub fn check_invariants(&self) {
        let ring: Vec<File> = self.cache.ring_members();

        let open_local: Vec<File> = self
            .cache
            .files()
            .filter(|f| {
                let slot = self.cache.slot(*f);
                !slot.is_free() && slot.is_local() && slot.physically_open()
            })
            .collect();

        assert_eq!(self.cache.nfile, ring.len(), "nfile must equal LRU ring length");
        assert_eq!(
            self.cache.nfile,
            open_local.len(),
            "nfile must equal the number of physically open local slots"
        );
        for member in &ring {
            let slot = self.cache.slot(*member);
            assert!(
                !slot.is_free() && slot.is_local() && slot.physically_open(),
                "LRU ring may only hold physically open local slots"
            );
        }

        assert!(
            self.cache.nfile + self.descs.len() <= self.budget.max_safe_fds(),
            "descriptor budget exceeded"
        );

        let free = self.cache.free_list();
        let free_count = self.cache.files().filter(|f| self.cache.slot(*f).is_free()).count();
        assert_eq!(free.len(), free_count, "free list must enumerate all free slots");
        let distinct: std::collections::HashSet<usize> = free.iter().copied().collect();
        assert_eq!(distinct.len(), free.len(), "free list must not contain cycles");
        for index in free {
            assert!(self.cache.slot(File(index)).is_free(), "free list entry must be free");
        }

        for file in self.cache.files() {
            let slot = self.cache.slot(file);
            if slot.is_free() {
                continue;
            }
            assert!(
                !slot
                    .open_flags
                    .intersects(OpenFlags::CREAT | OpenFlags::TRUNC | OpenFlags::EXCL),
                "saved reopen flags must be sanitized"
            );
            if slot.state.contains(VfdState::TEMPORARY) {
                let path = slot.path.as_deref().expect("valid slot");
                let name = Path::new(path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                assert!(
                    temp::has_temp_file_prefix(&name),
                    "temporary slot path must carry the temp prefix: {path}"
                );
            }
        }
    }
}

impl Drop for FileAccess {
    fn drop(&mut self) {
        // Backstop: equivalent to the proc-exit hook, so temp files are
        // gone even when the embedding application forgets the hook.
        self.at_proc_exit();
    }
}
