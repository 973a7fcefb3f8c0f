/// Descriptor-confined filesystem primitives.
///
/// Every mutating operation inside the sandbox tree is expressed relative
/// to the already-open work directory descriptor, never by resolving an
/// absolute host path at write time. A destination path with `..` segments
/// or other attacker-influenced content therefore cannot traverse outside
/// the subtree the descriptor is rooted in.
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{openat, AtFlags, OFlag};
use nix::sys::sendfile::sendfile;
use nix::sys::stat::{fstatat, mkdirat, FileStat, Mode, SFlag};
use nix::unistd::dup;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Process-wide zero-copy support flag: assumed supported until the kernel
/// rejects a transfer, then downgraded once and never re-probed.
static ZERO_COPY_OK: AtomicBool = AtomicBool::new(true);

fn errno_to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn is_dir(st: &FileStat) -> bool {
    st.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFDIR.bits()
}

fn is_regular(st: &FileStat) -> bool {
    st.st_mode & SFlag::S_IFMT.bits() == SFlag::S_IFREG.bits()
}

/// Ensure the work directory descriptor still refers to a directory,
/// creating it in place if the isolation primitive has not yet done so.
pub(crate) fn ensure_work_dir(dirfd: RawFd) -> io::Result<()> {
    match fstatat(dirfd, ".", AtFlags::empty()) {
        Ok(st) if is_dir(&st) => Ok(()),
        Ok(_) => Err(errno_to_io(Errno::ENOTDIR)),
        Err(_) => mkdirat(dirfd, ".", Mode::from_bits_truncate(0o755)).map_err(errno_to_io),
    }
}

/// `mkdir -p` relative to `dirfd`.
///
/// Fast path is a single relative stat. Creation tolerates the benign race
/// where a concurrent staging task created the same directory first:
/// existence as a directory is the success condition, not exclusivity.
pub(crate) fn mkdir_all_at(dirfd: RawFd, path: &Path, mode: Mode) -> io::Result<()> {
    if path.as_os_str().is_empty() || path == Path::new(".") {
        return Ok(());
    }
    if let Ok(st) = fstatat(dirfd, path, AtFlags::empty()) {
        if is_dir(&st) {
            return Ok(());
        }
        return Err(errno_to_io(Errno::ENOTDIR));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            mkdir_all_at(dirfd, parent, mode)?;
        }
    }
    match mkdirat(dirfd, path, mode) {
        Ok(()) => Ok(()),
        Err(e) => match fstatat(dirfd, path, AtFlags::empty()) {
            Ok(st) if is_dir(&st) => Ok(()),
            _ => Err(errno_to_io(e)),
        },
    }
}

/// Recursively clone the host directory `src` to `dst_rel` under the work
/// directory, creating `dst_rel` if absent.
///
/// Regular files and directories are cloned; symlinks, devices, sockets and
/// fifos are skipped so trees containing special files degrade gracefully
/// instead of failing the whole copy.
pub(crate) fn copy_dir_into(work_dir: &File, src: &Path, dst_rel: &Path) -> io::Result<()> {
    let wd = work_dir.as_raw_fd();
    mkdir_all_at(wd, dst_rel, Mode::from_bits_truncate(0o777))?;

    let src_fd = nix::fcntl::open(
        src,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(errno_to_io)?;
    let src_dir = unsafe { OwnedFd::from_raw_fd(src_fd) };

    let dst_fd = openat(
        wd,
        dst_rel,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(errno_to_io)?;
    let dst_dir = unsafe { OwnedFd::from_raw_fd(dst_fd) };

    copy_tree(src_dir.as_raw_fd(), dst_dir.as_raw_fd())
}

fn copy_tree(src_dir: RawFd, dst_dir: RawFd) -> io::Result<()> {
    for name in read_names(src_dir)? {
        let st = fstatat(src_dir, name.as_os_str(), AtFlags::AT_SYMLINK_NOFOLLOW)
            .map_err(errno_to_io)?;
        if is_regular(&st) {
            copy_regular(src_dir, dst_dir, &name, st.st_size as u64)?;
        } else if is_dir(&st) {
            match mkdirat(dst_dir, name.as_os_str(), Mode::from_bits_truncate(0o777)) {
                Ok(()) | Err(Errno::EEXIST) => {}
                Err(e) => return Err(errno_to_io(e)),
            }
            let sub_src = open_dir_at(src_dir, &name)?;
            let sub_dst = open_dir_at(dst_dir, &name)?;
            copy_tree(sub_src.as_raw_fd(), sub_dst.as_raw_fd())?;
        }
        // Other file types (symlink, fifo, device, socket) are skipped.
    }
    Ok(())
}

fn open_dir_at(dirfd: RawFd, name: &OsStr) -> io::Result<OwnedFd> {
    let fd = openat(
        dirfd,
        name,
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(errno_to_io)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Directory entry names relative to `dirfd`, `.` and `..` excluded.
///
/// Iterates over a dup so the caller's descriptor keeps its position and
/// stays usable for relative opens.
fn read_names(dirfd: RawFd) -> io::Result<Vec<OsString>> {
    let dup_fd = dup(dirfd).map_err(errno_to_io)?;
    let mut dir = Dir::from_fd(dup_fd).map_err(errno_to_io)?;
    let mut names = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(errno_to_io)?;
        let bytes = entry.file_name().to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(OsStr::from_bytes(bytes).to_os_string());
    }
    Ok(names)
}

fn copy_regular(src_dir: RawFd, dst_dir: RawFd, name: &OsStr, size: u64) -> io::Result<()> {
    let in_fd = openat(
        src_dir,
        name,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(errno_to_io)?;
    let mut src = unsafe { File::from_raw_fd(in_fd) };

    let out_fd = openat(
        dst_dir,
        name,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o777),
    )
    .map_err(errno_to_io)?;
    let mut dst = unsafe { File::from_raw_fd(out_fd) };

    if ZERO_COPY_OK.load(Ordering::Relaxed) {
        match send_all(&dst, &src, size as usize) {
            Ok(()) => return Ok(()),
            Err(Errno::EINVAL) | Err(Errno::ENOSYS) => {
                ZERO_COPY_OK.store(false, Ordering::Relaxed);
                log::warn!("zero-copy transfer unsupported, using buffered copies");
                // The kernel may have moved the offsets before rejecting.
                src.seek(SeekFrom::Start(0))?;
                dst.seek(SeekFrom::Start(0))?;
                dst.set_len(0)?;
            }
            Err(e) => return Err(errno_to_io(e)),
        }
    }
    io::copy(&mut src, &mut dst)?;
    Ok(())
}

fn send_all(dst: &File, src: &File, mut remaining: usize) -> nix::Result<()> {
    while remaining > 0 {
        let n = sendfile(dst, src, None, remaining)?;
        if n == 0 {
            break;
        }
        remaining -= n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::OpenOptionsExt;
    use tempfile::TempDir;

    fn open_dir(path: &Path) -> File {
        fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
            .open(path)
            .unwrap()
    }

    fn mode777() -> Mode {
        Mode::from_bits_truncate(0o777)
    }

    #[test]
    fn test_mkdir_all_creates_nested_tree() {
        let root = TempDir::new().unwrap();
        let wd = open_dir(root.path());
        mkdir_all_at(wd.as_raw_fd(), Path::new("a/b/c"), mode777()).unwrap();
        assert!(root.path().join("a/b/c").is_dir());
    }

    #[test]
    fn test_mkdir_all_is_idempotent() {
        let root = TempDir::new().unwrap();
        let wd = open_dir(root.path());
        mkdir_all_at(wd.as_raw_fd(), Path::new("x/y"), mode777()).unwrap();
        mkdir_all_at(wd.as_raw_fd(), Path::new("x/y"), mode777()).unwrap();
        assert!(root.path().join("x/y").is_dir());
    }

    #[test]
    fn test_mkdir_all_rejects_non_directory_occupant() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("occupied"), b"file").unwrap();
        let wd = open_dir(root.path());
        let err = mkdir_all_at(wd.as_raw_fd(), Path::new("occupied"), mode777()).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
    }

    #[test]
    fn test_copy_dir_clones_files_and_subdirs() {
        let host = TempDir::new().unwrap();
        fs::write(host.path().join("data.txt"), b"payload bytes").unwrap();
        fs::create_dir(host.path().join("sub")).unwrap();
        fs::write(host.path().join("sub/inner.txt"), b"inner").unwrap();

        let root = TempDir::new().unwrap();
        let wd = open_dir(root.path());
        copy_dir_into(&wd, host.path(), Path::new("staged")).unwrap();

        assert_eq!(
            fs::read(root.path().join("staged/data.txt")).unwrap(),
            b"payload bytes"
        );
        assert_eq!(
            fs::read(root.path().join("staged/sub/inner.txt")).unwrap(),
            b"inner"
        );
    }

    #[test]
    fn test_copy_dir_skips_special_files() {
        let host = TempDir::new().unwrap();
        fs::write(host.path().join("regular"), b"ok").unwrap();
        fs::create_dir(host.path().join("sub")).unwrap();
        nix::unistd::mkfifo(&host.path().join("pipe"), mode777()).unwrap();

        let root = TempDir::new().unwrap();
        let wd = open_dir(root.path());
        copy_dir_into(&wd, host.path(), Path::new("out")).unwrap();

        assert_eq!(fs::read(root.path().join("out/regular")).unwrap(), b"ok");
        assert!(root.path().join("out/sub").is_dir());
        assert!(!root.path().join("out/pipe").exists());
    }

    #[test]
    fn test_copy_dir_overwrites_existing_destination_files() {
        let host = TempDir::new().unwrap();
        fs::write(host.path().join("f"), b"new").unwrap();

        let root = TempDir::new().unwrap();
        fs::create_dir(root.path().join("dst")).unwrap();
        fs::write(root.path().join("dst/f"), b"old longer content").unwrap();

        let wd = open_dir(root.path());
        copy_dir_into(&wd, host.path(), Path::new("dst")).unwrap();
        assert_eq!(fs::read(root.path().join("dst/f")).unwrap(), b"new");
    }
}
