//! Pipe classification and pending-data probing
//!
//! A capture written into a FIFO cannot be seeked and reaches end-of-file
//! whenever its writer detaches. [`PipeProbe`] holds a non-blocking read
//! handle on the FIFO so the reader can ask "has a writer produced bytes?"
//! without blocking, and later turns that same handle into the new medium.
//!
//! Only Unix FIFOs are recognized; elsewhere [`is_pipe`] is always false.

use std::fs::File;
use std::io;
use std::path::Path;

/// Whether `path` names a FIFO.
#[cfg(unix)]
pub fn is_pipe(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;
    std::fs::metadata(path).map(|m| m.file_type().is_fifo()).unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_pipe(_path: &Path) -> bool {
    false
}

/// Non-blocking read handle on a pipe.
#[derive(Debug)]
pub struct PipeProbe {
    #[cfg(unix)]
    fd: std::os::fd::OwnedFd,
}

#[cfg(unix)]
impl PipeProbe {
    /// Open `path` for reading without waiting for a writer.
    pub fn open(path: &Path) -> io::Result<Self> {
        use std::ffi::CString;
        use std::os::fd::{FromRawFd, OwnedFd};
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))?;
        // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
        let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd was just returned by open and is owned by nobody else.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }

    /// True when at least one byte can be read right now.
    pub fn has_pending_data(&self) -> io::Result<bool> {
        use std::os::fd::AsRawFd;

        let mut pfd = libc::pollfd { fd: self.fd.as_raw_fd(), events: libc::POLLIN, revents: 0 };
        loop {
            // SAFETY: pfd points to exactly one initialized pollfd.
            let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
            if rc >= 0 {
                return Ok(rc > 0 && pfd.revents & libc::POLLIN != 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    /// Switch the handle to blocking mode and hand it over as a file.
    pub fn into_file(self) -> io::Result<File> {
        use std::os::fd::AsRawFd;

        let raw = self.fd.as_raw_fd();
        // SAFETY: raw is a valid open descriptor owned by self.fd.
        let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above; only the O_NONBLOCK status flag changes.
        if unsafe { libc::fcntl(raw, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(File::from(self.fd))
    }
}

#[cfg(not(unix))]
impl PipeProbe {
    pub fn open(_path: &Path) -> io::Result<Self> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe probing requires a Unix platform"))
    }

    pub fn has_pending_data(&self) -> io::Result<bool> {
        Ok(false)
    }

    pub fn into_file(self) -> io::Result<File> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "pipe probing requires a Unix platform"))
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::path::PathBuf;

    /// Create a FIFO inside `dir`.
    pub(crate) fn make_fifo(dir: &Path, name: &str) -> io::Result<PathBuf> {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let path = dir.join(name);
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in path"))?;
        // SAFETY: c_path is a valid NUL-terminated string.
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(path)
    }

    #[test]
    fn fifos_are_classified_as_pipes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = make_fifo(dir.path(), "capture.pango")?;
        let regular = dir.path().join("plain.pango");
        std::fs::write(&regular, b"PANGO")?;

        assert!(is_pipe(&fifo));
        assert!(!is_pipe(&regular));
        assert!(!is_pipe(&dir.path().join("missing")));
        Ok(())
    }

    #[test]
    fn probe_sees_bytes_only_after_a_write() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let fifo = make_fifo(dir.path(), "live.pango")?;

        let probe = PipeProbe::open(&fifo)?;
        assert!(!probe.has_pending_data()?);

        let mut writer = std::fs::OpenOptions::new().write(true).open(&fifo)?;
        writer.write_all(b"PANGO")?;
        drop(writer);

        assert!(probe.has_pending_data()?);
        let mut file = probe.into_file()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        assert_eq!(buf, b"PANGO");
        Ok(())
    }
}
