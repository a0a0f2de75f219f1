//! Passthrough operation handlers over one mounted session.
//!
//! Every handler translates incoming virtual names to real paths, resolves
//! parent inodes through the inode table, performs the real syscall and
//! patches the inode/handle tables to match. The whole session is driven by
//! a single dispatch thread (see `main`), so no locking is needed around the
//! tables or the digest database connection.

use crate::handle_table::HandleTable;
use crate::inode_table::InodeTable;
use crate::namedb::NameDb;
use crate::pathmap::{make_child_path, to_real, to_virtual};
use crate::util::{
    errno_from_io, errno_from_nix, file_attr_from_stat, file_type_from_mode, oflag_from_bits,
    retry_eintr, system_time_from_raw, timespec_from_system_time,
};
use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, warn};
use nix::fcntl::{open, readlink, OFlag};
use nix::sys::stat::{fchmod, fstat, lstat, mknod, Mode, SFlag};
use nix::sys::statvfs::statvfs;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{fchown, mkdir, truncate, unlink, Gid, Uid};
use std::ffi::{CString, OsStr, OsString};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::{Duration, SystemTime};

const TTL: Duration = Duration::from_secs(1);
const GENERATION: u64 = 0;

fn db_errno(err: rusqlite::Error) -> c_int {
    warn!("name database error: {err}");
    libc::EIO
}

/// Identity of the process issuing the current request.
#[derive(Clone, Copy, Debug)]
struct Caller {
    uid: u32,
    gid: u32,
}

impl Caller {
    fn from_request(req: &Request<'_>) -> Self {
        Self {
            uid: req.uid(),
            gid: req.gid(),
        }
    }
}

/// Attribute mutations requested by one setattr call.
#[derive(Debug, Default)]
struct SetAttrRequest {
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    size: Option<u64>,
    atime: Option<TimeOrNow>,
    mtime: Option<TimeOrNow>,
    fh: Option<u64>,
}

enum AttrTarget<'a> {
    Fd(BorrowedFd<'a>),
    Path(OsString),
}

pub struct LongNameFs {
    db: NameDb,
    inodes: InodeTable,
    handles: HandleTable,
    source: OsString,
}

impl LongNameFs {
    pub fn new(source: &Path, db: NameDb) -> Self {
        let source = source.as_os_str().to_owned();
        Self {
            db,
            inodes: InodeTable::new(source.clone()),
            handles: HandleTable::new(),
            source,
        }
    }

    /// Real on-disk path of `name` under a tracked parent directory.
    fn real_child_path(&self, parent: u64, name: &OsStr) -> Result<OsString, c_int> {
        let real_name = to_real(&self.db, name).map_err(db_errno)?;
        let parent_path = self.inodes.resolve(parent)?;
        Ok(make_child_path(parent_path, &real_name))
    }

    fn lookup_entry(&mut self, parent: u64, name: &OsStr) -> Result<FileAttr, c_int> {
        debug!("lookup for {:?} in {}", name, parent);
        let path = self.real_child_path(parent, name)?;
        let stat = lstat(Path::new(&path)).map_err(errno_from_nix)?;
        if name != OsStr::new(".") && name != OsStr::new("..") {
            self.inodes.record_lookup(stat.st_ino, path);
        }
        Ok(file_attr_from_stat(&stat))
    }

    fn getattr_inode(&self, ino: u64) -> Result<FileAttr, c_int> {
        // An open descriptor is authoritative; the path may have been
        // unlinked or renamed since it was recorded.
        if let Some(fd) = self.handles.descriptor_for(ino) {
            let stat = fstat(fd).map_err(errno_from_nix)?;
            return Ok(file_attr_from_stat(&stat));
        }
        let path = self.inodes.resolve(ino)?;
        let stat = lstat(Path::new(path)).map_err(errno_from_nix)?;
        Ok(file_attr_from_stat(&stat))
    }

    fn setattr_inode(&self, ino: u64, set: SetAttrRequest) -> Result<FileAttr, c_int> {
        let target = match set
            .fh
            .and_then(|fh| self.handles.get(fh))
            .or_else(|| self.handles.descriptor_for(ino))
        {
            Some(fd) => AttrTarget::Fd(fd),
            None => AttrTarget::Path(self.inodes.resolve(ino)?.to_owned()),
        };

        if let Some(size) = set.size {
            match &target {
                AttrTarget::Fd(fd) => {
                    nix::unistd::ftruncate(fd, size as i64).map_err(errno_from_nix)?
                }
                AttrTarget::Path(path) => {
                    truncate(Path::new(path), size as i64).map_err(errno_from_nix)?
                }
            }
        }

        if let Some(mode) = set.mode {
            match &target {
                AttrTarget::Fd(fd) => {
                    fchmod(fd, Mode::from_bits_truncate(mode)).map_err(errno_from_nix)?
                }
                AttrTarget::Path(path) => std::fs::set_permissions(
                    Path::new(path),
                    std::fs::Permissions::from_mode(mode & 0o7777),
                )
                .map_err(errno_from_io)?,
            }
        }

        if set.uid.is_some() || set.gid.is_some() {
            match &target {
                AttrTarget::Fd(fd) => {
                    fchown(fd, set.uid.map(Uid::from_raw), set.gid.map(Gid::from_raw))
                        .map_err(errno_from_nix)?
                }
                AttrTarget::Path(path) => {
                    std::os::unix::fs::lchown(Path::new(path), set.uid, set.gid)
                        .map_err(errno_from_io)?
                }
            }
        }

        if set.atime.is_some() || set.mtime.is_some() {
            self.apply_times(&target, set.atime, set.mtime)?;
        }

        self.getattr_inode(ino)
    }

    /// The syscall can only set both timestamps at once, so a single-sided
    /// update first reads the other side's current value.
    fn apply_times(
        &self,
        target: &AttrTarget<'_>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
    ) -> Result<(), c_int> {
        let now = SystemTime::now();
        let resolve_time = |t: TimeOrNow| match t {
            TimeOrNow::SpecificTime(time) => time,
            TimeOrNow::Now => now,
        };

        let (atime, mtime) = match (atime, mtime) {
            (Some(atime), Some(mtime)) => (resolve_time(atime), resolve_time(mtime)),
            (atime, mtime) => {
                let stat = match target {
                    AttrTarget::Fd(fd) => fstat(*fd),
                    AttrTarget::Path(path) => lstat(Path::new(path)),
                }
                .map_err(errno_from_nix)?;
                (
                    atime
                        .map(resolve_time)
                        .unwrap_or_else(|| system_time_from_raw(stat.st_atime, stat.st_atime_nsec)),
                    mtime
                        .map(resolve_time)
                        .unwrap_or_else(|| system_time_from_raw(stat.st_mtime, stat.st_mtime_nsec)),
                )
            }
        };

        let times = [
            timespec_from_system_time(atime),
            timespec_from_system_time(mtime),
        ];
        let res = match target {
            AttrTarget::Fd(fd) => unsafe { libc::futimens(fd.as_raw_fd(), times.as_ptr()) },
            AttrTarget::Path(path) => {
                let c_path = CString::new(path.as_bytes()).map_err(|_| libc::EINVAL)?;
                unsafe {
                    libc::utimensat(
                        libc::AT_FDCWD,
                        c_path.as_ptr(),
                        times.as_ptr(),
                        libc::AT_SYMLINK_NOFOLLOW,
                    )
                }
            }
        };
        if res < 0 {
            return Err(errno_from_io(io::Error::last_os_error()));
        }
        Ok(())
    }

    fn readlink_inode(&self, ino: u64) -> Result<Vec<u8>, c_int> {
        let path = self.inodes.resolve(ino)?;
        let target = readlink(Path::new(path)).map_err(errno_from_nix)?;
        Ok(target.into_vec())
    }

    /// Real directory entries with virtual names, sorted by inode number so
    /// the inode doubles as a best-effort resume cursor. Only entries
    /// strictly after `offset` are returned; entries that vanish between the
    /// listing and the stat are skipped.
    fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, OsString)>, c_int> {
        let dir_path = self.inodes.resolve(ino)?;
        debug!("reading {:?} starting after {}", dir_path, offset);
        let mut entries = Vec::new();
        for item in std::fs::read_dir(Path::new(dir_path)).map_err(errno_from_io)? {
            let item = match item {
                Ok(item) => item,
                Err(_) => continue,
            };
            let real_name = item.file_name();
            let full = make_child_path(dir_path, &real_name);
            let stat = match lstat(Path::new(&full)) {
                Ok(stat) => stat,
                Err(_) => continue,
            };
            let name = to_virtual(&self.db, &real_name).map_err(db_errno)?;
            entries.push((stat.st_ino, file_type_from_mode(stat.st_mode), name));
        }
        // With hardlinks two entries can share an inode; the cursor cannot
        // distinguish them, so both are skipped once the offset passes them.
        entries.sort_by(|a, b| (a.0, &a.2).cmp(&(b.0, &b.2)));
        entries.retain(|(ino, _, _)| *ino as i64 > offset);
        Ok(entries)
    }

    fn remove_entry(&mut self, parent: u64, name: &OsStr, rmdir: bool) -> Result<(), c_int> {
        let path = self.real_child_path(parent, name)?;
        let stat = lstat(Path::new(&path)).map_err(errno_from_nix)?;
        if rmdir {
            std::fs::remove_dir(Path::new(&path)).map_err(errno_from_io)?;
        } else {
            unlink(Path::new(&path)).map_err(errno_from_nix)?;
        }
        self.inodes.remove_path(stat.st_ino, &path);
        Ok(())
    }

    fn rename_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> Result<(), c_int> {
        let from = self.real_child_path(parent, name)?;
        let to = self.real_child_path(new_parent, new_name)?;
        std::fs::rename(Path::new(&from), Path::new(&to)).map_err(errno_from_io)?;
        let stat = lstat(Path::new(&to)).map_err(errno_from_nix)?;
        self.inodes.rename_path(stat.st_ino, &from, to);
        Ok(())
    }

    fn link_entry(&mut self, ino: u64, new_parent: u64, new_name: &OsStr) -> Result<FileAttr, c_int> {
        let target = self.inodes.resolve(ino)?.to_owned();
        let path = self.real_child_path(new_parent, new_name)?;
        std::fs::hard_link(Path::new(&target), Path::new(&path)).map_err(errno_from_io)?;
        self.inodes.record_lookup(ino, path);
        self.getattr_inode(ino)
    }

    fn symlink_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        target: &Path,
        caller: Caller,
    ) -> Result<FileAttr, c_int> {
        let path = self.real_child_path(parent, name)?;
        std::os::unix::fs::symlink(target, Path::new(&path)).map_err(errno_from_io)?;
        std::os::unix::fs::lchown(Path::new(&path), Some(caller.uid), Some(caller.gid))
            .map_err(errno_from_io)?;
        let stat = lstat(Path::new(&path)).map_err(errno_from_nix)?;
        self.inodes.record_lookup(stat.st_ino, path);
        Ok(file_attr_from_stat(&stat))
    }

    fn mknod_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        caller: Caller,
    ) -> Result<FileAttr, c_int> {
        let path = self.real_child_path(parent, name)?;
        mknod(
            Path::new(&path),
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode & !umask),
            rdev as libc::dev_t,
        )
        .map_err(errno_from_nix)?;
        std::os::unix::fs::chown(Path::new(&path), Some(caller.uid), Some(caller.gid))
            .map_err(errno_from_io)?;
        let stat = lstat(Path::new(&path)).map_err(errno_from_nix)?;
        self.inodes.record_lookup(stat.st_ino, path);
        Ok(file_attr_from_stat(&stat))
    }

    fn mkdir_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        caller: Caller,
    ) -> Result<FileAttr, c_int> {
        let path = self.real_child_path(parent, name)?;
        mkdir(Path::new(&path), Mode::from_bits_truncate(mode & !umask))
            .map_err(errno_from_nix)?;
        std::os::unix::fs::chown(Path::new(&path), Some(caller.uid), Some(caller.gid))
            .map_err(errno_from_io)?;
        let stat = lstat(Path::new(&path)).map_err(errno_from_nix)?;
        self.inodes.record_lookup(stat.st_ino, path);
        Ok(file_attr_from_stat(&stat))
    }

    fn open_inode(&mut self, ino: u64, flags: i32) -> Result<u64, c_int> {
        let path = self.inodes.resolve(ino)?.to_owned();
        self.handles.acquire(ino, &path, flags)
    }

    fn create_entry(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        caller: Caller,
    ) -> Result<(FileAttr, u64), c_int> {
        let path = self.real_child_path(parent, name)?;
        let oflag = oflag_from_bits(flags) | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC;
        let fd = open(
            Path::new(&path),
            oflag,
            Mode::from_bits_truncate(mode & !umask),
        )
        .map_err(errno_from_nix)?;
        std::os::unix::fs::chown(Path::new(&path), Some(caller.uid), Some(caller.gid))
            .map_err(errno_from_io)?;
        let stat = fstat(fd.as_fd()).map_err(errno_from_nix)?;
        let attr = file_attr_from_stat(&stat);
        self.inodes.record_lookup(stat.st_ino, path);
        let fh = self.handles.adopt(stat.st_ino, fd);
        Ok((attr, fh))
    }

    fn read_handle(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, c_int> {
        let fd = self.handles.get(fh).ok_or(libc::EBADF)?;
        let mut buf = vec![0u8; size as usize];
        let read_len = retry_eintr(|| pread(fd, &mut buf, offset)).map_err(errno_from_nix)?;
        buf.truncate(read_len);
        Ok(buf)
    }

    fn write_handle(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32, c_int> {
        let fd = self.handles.get(fh).ok_or(libc::EBADF)?;
        let written = retry_eintr(|| pwrite(fd, data, offset)).map_err(errno_from_nix)?;
        Ok(written as u32)
    }

    fn release_handle(&mut self, fh: u64) -> Result<(), c_int> {
        self.handles.release(fh)
    }

    fn forget_inode(&mut self, ino: u64, nlookup: u64) {
        if self.inodes.forget(ino, nlookup) {
            assert!(
                !self.handles.has_handle(ino),
                "inode {ino} forgotten while a handle is open"
            );
        }
    }

    fn statfs_source(&self) -> Result<FsStats, c_int> {
        let stats = statvfs(Path::new(&self.source)).map_err(errno_from_nix)?;
        // Everything the mount exposes lives under the source prefix, so
        // that many bytes of each real path are not available to names.
        let prefix = self.source.as_bytes().len() as u64 + 1;
        Ok(FsStats {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            namelen: (stats.name_max() as u64).saturating_sub(prefix) as u32,
            frsize: stats.fragment_size() as u32,
        })
    }
}

struct FsStats {
    blocks: u64,
    bfree: u64,
    bavail: u64,
    files: u64,
    ffree: u64,
    bsize: u32,
    namelen: u32,
    frsize: u32,
}

impl Filesystem for LongNameFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, GENERATION),
            Err(code) => reply.error(code),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.forget_inode(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_inode(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let set = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
            fh,
        };
        match self.setattr_inode(ino, set) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.readlink_inode(ino) {
            Ok(target) => reply.data(&target),
            Err(code) => reply.error(code),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        match self.mknod_entry(parent, name, mode, umask, rdev, Caller::from_request(req)) {
            Ok(attr) => reply.entry(&TTL, &attr, GENERATION),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self.mkdir_entry(parent, name, mode, umask, Caller::from_request(req)) {
            Ok(attr) => reply.entry(&TTL, &attr, GENERATION),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(parent, name, false) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.remove_entry(parent, name, true) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        match self.symlink_entry(parent, link_name, target, Caller::from_request(req)) {
            Ok(attr) => reply.entry(&TTL, &attr, GENERATION),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.rename_entry(parent, name, new_parent, new_name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
        reply: ReplyEntry,
    ) {
        match self.link_entry(ino, new_parent, new_name) {
            Ok(attr) => reply.entry(&TTL, &attr, GENERATION),
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.open_inode(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.create_entry(parent, name, mode, umask, flags, Caller::from_request(req)) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, GENERATION, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_handle(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_handle(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_handle(fh) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (entry_ino, kind, name) in entries {
                    if reply.add(entry_ino, entry_ino as i64, kind, &name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.statfs_source() {
            Ok(stats) => reply.statfs(
                stats.blocks,
                stats.bfree,
                stats.bavail,
                stats.files,
                stats.ffree,
                stats.bsize,
                stats.namelen,
                stats.frsize,
            ),
            Err(code) => reply.error(code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode_table::ROOT_INODE;
    use crate::namedb::digest_hex;
    use crate::pathmap::{DIGEST_HEX_LENGTH, SURROGATE_PREFIX};
    use nix::unistd::{getgid, getuid};
    use std::time::UNIX_EPOCH;

    fn fixture() -> (tempfile::TempDir, LongNameFs) {
        let dir = tempfile::tempdir().unwrap();
        let fs = LongNameFs::new(dir.path(), NameDb::in_memory().unwrap());
        (dir, fs)
    }

    fn caller() -> Caller {
        Caller {
            uid: getuid().as_raw(),
            gid: getgid().as_raw(),
        }
    }

    fn long_name(fill: char) -> String {
        std::iter::repeat(fill).take(300).collect()
    }

    fn create(
        fs: &mut LongNameFs,
        name: &str,
    ) -> (FileAttr, u64) {
        fs.create_entry(
            ROOT_INODE,
            OsStr::new(name),
            0o644,
            0o022,
            libc::O_WRONLY,
            caller(),
        )
        .unwrap()
    }

    #[test]
    fn long_name_create_stores_surrogate_and_lists_virtual() {
        let (dir, mut fs) = fixture();
        let name = long_name('a');
        let (attr, fh) = create(&mut fs, &name);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o644);
        fs.release_handle(fh).unwrap();

        let real: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(real.len(), 1);
        let real = real[0].as_bytes();
        assert!(real.starts_with(SURROGATE_PREFIX.as_bytes()));
        assert_eq!(real.len(), SURROGATE_PREFIX.len() + DIGEST_HEX_LENGTH);
        assert!(real[SURROGATE_PREFIX.len()..]
            .iter()
            .all(|b| b.is_ascii_hexdigit()));

        let listing = fs.readdir_entries(ROOT_INODE, 0).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].2, OsStr::new(&name));
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, mut fs) = fixture();
        let (_attr, fh) = create(&mut fs, "file");
        // Descriptor was opened O_WRONLY; reopening read-write would share
        // it, so create with O_RDWR instead for the read back.
        fs.release_handle(fh).unwrap();
        let (attr, fh) = fs
            .create_entry(
                ROOT_INODE,
                OsStr::new("file"),
                0o644,
                0o022,
                libc::O_RDWR,
                caller(),
            )
            .unwrap();
        assert_eq!(fs.write_handle(fh, 0, b"abc").unwrap(), 3);
        assert_eq!(fs.read_handle(fh, 0, 3).unwrap(), b"abc");
        assert_eq!(fs.getattr_inode(attr.ino).unwrap().size, 3);
        fs.release_handle(fh).unwrap();
    }

    #[test]
    fn rename_between_long_names_swaps_surrogates() {
        let (dir, mut fs) = fixture();
        let old = long_name('b');
        let new = long_name('c');
        let (_attr, fh) = create(&mut fs, &old);
        fs.release_handle(fh).unwrap();

        fs.rename_entry(ROOT_INODE, OsStr::new(&old), ROOT_INODE, OsStr::new(&new))
            .unwrap();

        let expected = format!("{}{}", SURROGATE_PREFIX, digest_hex(new.as_bytes()));
        assert!(dir.path().join(&expected).exists());
        assert!(!dir
            .path()
            .join(format!("{}{}", SURROGATE_PREFIX, digest_hex(old.as_bytes())))
            .exists());

        assert_eq!(
            fs.lookup_entry(ROOT_INODE, OsStr::new(&old)).unwrap_err(),
            libc::ENOENT
        );
        let attr = fs.lookup_entry(ROOT_INODE, OsStr::new(&new)).unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);

        let listing = fs.readdir_entries(ROOT_INODE, 0).unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].2, OsStr::new(&new));
    }

    #[test]
    fn hardlink_keeps_both_names_resolvable() {
        let (_dir, mut fs) = fixture();
        let (attr, fh) = create(&mut fs, "a");
        fs.release_handle(fh).unwrap();

        let linked = fs.link_entry(attr.ino, ROOT_INODE, OsStr::new("b")).unwrap();
        assert_eq!(linked.ino, attr.ino);
        assert_eq!(linked.nlink, 2);

        let a = fs.lookup_entry(ROOT_INODE, OsStr::new("a")).unwrap();
        let b = fs.lookup_entry(ROOT_INODE, OsStr::new("b")).unwrap();
        assert_eq!(a.ino, b.ino);

        fs.remove_entry(ROOT_INODE, OsStr::new("a"), false).unwrap();
        assert!(fs.getattr_inode(attr.ino).is_ok());
        assert!(fs.lookup_entry(ROOT_INODE, OsStr::new("b")).is_ok());
    }

    #[test]
    fn forget_releases_bookkeeping() {
        let (dir, mut fs) = fixture();
        std::fs::write(dir.path().join("f"), b"").unwrap();
        let attr = fs.lookup_entry(ROOT_INODE, OsStr::new("f")).unwrap();
        fs.forget_inode(attr.ino, 1);
        assert_eq!(fs.getattr_inode(attr.ino).unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn open_descriptor_outlives_unlink() {
        let (dir, mut fs) = fixture();
        std::fs::write(dir.path().join("f"), b"content").unwrap();
        let attr = fs.lookup_entry(ROOT_INODE, OsStr::new("f")).unwrap();

        let fh = fs.open_inode(attr.ino, libc::O_RDONLY).unwrap();
        let again = fs.open_inode(attr.ino, libc::O_RDONLY).unwrap();
        assert_eq!(fh, again);

        fs.remove_entry(ROOT_INODE, OsStr::new("f"), false).unwrap();
        // getattr must keep working through the descriptor.
        assert_eq!(fs.getattr_inode(attr.ino).unwrap().size, 7);
        assert_eq!(fs.read_handle(fh, 0, 7).unwrap(), b"content");

        fs.release_handle(fh).unwrap();
        fs.release_handle(fh).unwrap();
        assert_eq!(fs.getattr_inode(attr.ino).unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn readdir_resumes_strictly_after_cursor() {
        let (dir, fs) = fixture();
        std::fs::write(dir.path().join("one"), b"").unwrap();
        std::fs::write(dir.path().join("two"), b"").unwrap();
        std::fs::write(dir.path().join("three"), b"").unwrap();

        let all = fs.readdir_entries(ROOT_INODE, 0).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].0 <= w[1].0));

        let rest = fs.readdir_entries(ROOT_INODE, all[0].0 as i64).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest, all[1..]);
    }

    #[test]
    fn mkdir_and_rmdir() {
        let (_dir, mut fs) = fixture();
        let attr = fs
            .mkdir_entry(ROOT_INODE, OsStr::new("sub"), 0o755, 0o022, caller())
            .unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.perm, 0o755);

        fs.remove_entry(ROOT_INODE, OsStr::new("sub"), true).unwrap();
        assert_eq!(
            fs.lookup_entry(ROOT_INODE, OsStr::new("sub")).unwrap_err(),
            libc::ENOENT
        );
    }

    #[test]
    fn mknod_creates_a_fifo() {
        let (_dir, mut fs) = fixture();
        let attr = fs
            .mknod_entry(
                ROOT_INODE,
                OsStr::new("fifo"),
                libc::S_IFIFO | 0o644,
                0o022,
                0,
                caller(),
            )
            .unwrap();
        assert_eq!(attr.kind, FileType::NamedPipe);
        assert_eq!(attr.perm, 0o644);
    }

    #[test]
    fn symlink_and_readlink() {
        let (_dir, mut fs) = fixture();
        let attr = fs
            .symlink_entry(
                ROOT_INODE,
                OsStr::new("l"),
                Path::new("target/elsewhere"),
                caller(),
            )
            .unwrap();
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(fs.readlink_inode(attr.ino).unwrap(), b"target/elsewhere");
    }

    #[test]
    fn setattr_truncates_and_sets_single_sided_mtime() {
        let (_dir, mut fs) = fixture();
        let (attr, fh) = create(&mut fs, "file");
        fs.write_handle(fh, 0, b"abcdef").unwrap();
        fs.release_handle(fh).unwrap();

        let updated = fs
            .setattr_inode(
                attr.ino,
                SetAttrRequest {
                    size: Some(2),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.size, 2);

        let stamp = UNIX_EPOCH + Duration::from_secs(12_345);
        let updated = fs
            .setattr_inode(
                attr.ino,
                SetAttrRequest {
                    mtime: Some(TimeOrNow::SpecificTime(stamp)),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.mtime, stamp);

        let updated = fs
            .setattr_inode(
                attr.ino,
                SetAttrRequest {
                    mode: Some(0o600),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.perm, 0o600);
    }

    #[test]
    fn statfs_reserves_the_source_prefix_from_namelen() {
        let (dir, fs) = fixture();
        let stats = fs.statfs_source().unwrap();
        let raw = statvfs(dir.path()).unwrap();
        let prefix = dir.path().as_os_str().as_bytes().len() as u64 + 1;
        assert_eq!(stats.namelen as u64, (raw.name_max() as u64) - prefix);
        assert!(stats.bsize > 0);
    }
}
