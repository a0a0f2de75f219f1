//! Open descriptor bookkeeping. At most one real descriptor is held per
//! inode; concurrent logical opens share it through an open-count and the
//! descriptor is closed when the last open is released.

use crate::util::{errno_from_nix, oflag_from_bits};
use libc::c_int;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::path::Path;

#[derive(Debug)]
struct FileHandle {
    fd: OwnedFd,
    inode: u64,
    open_count: u32,
}

#[derive(Debug, Default)]
pub struct HandleTable {
    by_fh: HashMap<u64, FileHandle>,
    fh_by_inode: HashMap<u64, u64>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path` for the inode, or joins the descriptor already open for
    /// it. Creation never goes through here (see the create path).
    pub fn acquire(&mut self, ino: u64, path: &OsStr, flags: i32) -> Result<u64, c_int> {
        if let Some(&fh) = self.fh_by_inode.get(&ino) {
            let handle = self.by_fh.get_mut(&fh).expect("handle maps diverged");
            handle.open_count += 1;
            return Ok(fh);
        }
        let oflag = oflag_from_bits(flags) | OFlag::O_CLOEXEC;
        assert!(
            !oflag.contains(OFlag::O_CREAT),
            "open with O_CREAT must use the create path"
        );
        let fd = open(Path::new(path), oflag, Mode::empty()).map_err(errno_from_nix)?;
        Ok(self.insert(ino, fd))
    }

    /// Registers a descriptor produced by create. If the inode is already
    /// open the fresh descriptor is dropped and the existing one shared.
    pub fn adopt(&mut self, ino: u64, fd: OwnedFd) -> u64 {
        if let Some(&fh) = self.fh_by_inode.get(&ino) {
            let handle = self.by_fh.get_mut(&fh).expect("handle maps diverged");
            handle.open_count += 1;
            return fh;
        }
        self.insert(ino, fd)
    }

    fn insert(&mut self, ino: u64, fd: OwnedFd) -> u64 {
        let fh = fd.as_raw_fd() as u64;
        self.by_fh.insert(
            fh,
            FileHandle {
                fd,
                inode: ino,
                open_count: 1,
            },
        );
        self.fh_by_inode.insert(ino, fh);
        fh
    }

    pub fn get(&self, fh: u64) -> Option<BorrowedFd<'_>> {
        self.by_fh.get(&fh).map(|handle| handle.fd.as_fd())
    }

    /// The descriptor already open for an inode, if any.
    pub fn descriptor_for(&self, ino: u64) -> Option<BorrowedFd<'_>> {
        self.fh_by_inode
            .get(&ino)
            .and_then(|fh| self.by_fh.get(fh))
            .map(|handle| handle.fd.as_fd())
    }

    pub fn has_handle(&self, ino: u64) -> bool {
        self.fh_by_inode.contains_key(&ino)
    }

    /// Drops one logical open; closes the descriptor when the count hits
    /// zero. An unknown handle id is EBADF.
    pub fn release(&mut self, fh: u64) -> Result<(), c_int> {
        let Some(handle) = self.by_fh.get_mut(&fh) else {
            return Err(libc::EBADF);
        };
        if handle.open_count > 1 {
            handle.open_count -= 1;
            return Ok(());
        }
        let handle = self.by_fh.remove(&fh).expect("handle just looked up");
        let mapped = self.fh_by_inode.remove(&handle.inode);
        assert_eq!(mapped, Some(fh), "handle maps diverged");
        nix::unistd::close(handle.fd.into_raw_fd()).map_err(errno_from_nix)
    }
}
