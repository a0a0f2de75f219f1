use fuser::{FileAttr, FileType};
use libc::c_int;
use nix::errno::Errno as NixErrno;
use nix::fcntl::OFlag;
use nix::sys::stat::FileStat;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn errno_from_nix(err: nix::Error) -> c_int {
    err as c_int
}

pub fn errno_from_io(err: io::Error) -> c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

pub fn file_type_from_mode(mode: libc::mode_t) -> FileType {
    match mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

pub fn system_time_from_raw(sec: i64, nsec: i64) -> SystemTime {
    if sec < 0 {
        return UNIX_EPOCH;
    }
    let nanos = if nsec < 0 { 0 } else { nsec as u32 };
    UNIX_EPOCH + Duration::new(sec as u64, nanos)
}

pub fn file_attr_from_stat(stat: &FileStat) -> FileAttr {
    FileAttr {
        ino: stat.st_ino,
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: system_time_from_raw(stat.st_atime, stat.st_atime_nsec),
        mtime: system_time_from_raw(stat.st_mtime, stat.st_mtime_nsec),
        ctime: system_time_from_raw(stat.st_ctime, stat.st_ctime_nsec),
        crtime: UNIX_EPOCH,
        kind: file_type_from_mode(stat.st_mode),
        perm: (stat.st_mode & 0o7777) as u16,
        nlink: stat.st_nlink as u32,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
        flags: 0,
    }
}

pub fn oflag_from_bits(flags: i32) -> OFlag {
    OFlag::from_bits_truncate(flags)
}

pub fn timespec_from_system_time(time: SystemTime) -> libc::timespec {
    match time.duration_since(UNIX_EPOCH) {
        Ok(since) => libc::timespec {
            tv_sec: since.as_secs() as libc::time_t,
            tv_nsec: since.subsec_nanos() as libc::c_long,
        },
        Err(err) => {
            // Pre-epoch timestamps have negative tv_sec and tv_nsec
            // normalized into [0, 1e9).
            let before = err.duration();
            let mut sec = -(before.as_secs() as i64);
            let mut nsec = i64::from(before.subsec_nanos());
            if nsec > 0 {
                sec -= 1;
                nsec = 1_000_000_000 - nsec;
            }
            libc::timespec {
                tv_sec: sec as libc::time_t,
                tv_nsec: nsec as libc::c_long,
            }
        }
    }
}

pub fn retry_eintr<T, F>(mut op: F) -> Result<T, nix::Error>
where
    F: FnMut() -> Result<T, nix::Error>,
{
    loop {
        match op() {
            Err(err) if err == NixErrno::EINTR => continue,
            other => return other,
        }
    }
}
