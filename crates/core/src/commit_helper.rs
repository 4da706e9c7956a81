//! Cross-process commit wake-ups.
//!
//! Inter-thread and inter-process notification of commits is done with a
//! named pipe next to the database file. Anyone interested in commits polls
//! the pipe for readability; whoever commits writes a byte into it after
//! releasing the write lock. The byte's value carries no meaning: a single
//! byte can wake any number of pollers, and the listener drains the pipe on
//! wake so the channel stays edge-triggered with no loss.

#[cfg(unix)]
pub(crate) use unix::ExternalCommitHelper;

#[cfg(unix)]
mod unix {
    use std::fs::{File, OpenOptions};
    use std::hash::Hasher;
    use std::io::{self, Read, Write};
    use std::os::fd::AsFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::thread::JoinHandle;

    use nix::errno::Errno;
    use nix::fcntl::OFlag;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::stat::Mode;
    use rustc_hash::FxHasher;

    pub(crate) struct ExternalCommitHelper {
        notify: Arc<File>,
        shutdown_tx: File,
        listener: Option<JoinHandle<()>>,
    }

    impl ExternalCommitHelper {
        pub(crate) fn new(db_path: &Path, on_change: Box<dyn Fn() + Send>) -> io::Result<Self> {
            let pipe_path = create_notify_pipe(db_path)?;

            // Opening read-write means we never see EOF from other processes
            // closing their ends, and writes can be observed locally too
            let notify = Arc::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .custom_flags(OFlag::O_NONBLOCK.bits())
                    .open(&pipe_path)?,
            );

            let (shutdown_rx, shutdown_tx) = nix::unistd::pipe().map_err(io::Error::from)?;
            let shutdown_rx = File::from(shutdown_rx);
            let shutdown_tx = File::from(shutdown_tx);

            let listener = {
                let notify = Arc::clone(&notify);
                std::thread::Builder::new()
                    .name("lodestone-notify-listener".into())
                    .spawn(move || listen(&notify, &shutdown_rx, &*on_change))?
            };

            Ok(Self {
                notify,
                shutdown_tx,
                listener: Some(listener),
            })
        }

        /// Wake every process (including this one) waiting on the channel.
        pub(crate) fn notify_others(&self) {
            loop {
                match (&*self.notify).write(&[0]) {
                    Ok(_) => return,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // The pipe's buffer is full. Drain some of the old
                        // data to make room; since one byte wakes every
                        // waiter, dropping the backlog loses nothing.
                        let mut buf = [0u8; 1024];
                        let _ = (&*self.notify).read(&mut buf);
                    }
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        tracing::error!(%err, "failed to write commit notification");
                        return;
                    }
                }
            }
        }
    }

    impl Drop for ExternalCommitHelper {
        fn drop(&mut self) {
            let _ = self.shutdown_tx.write(&[0]);
            if let Some(listener) = self.listener.take() {
                let _ = listener.join();
            }
        }
    }

    /// Create the notification pipe next to the database file, falling back
    /// to the temp directory when the filesystem does not support FIFOs.
    /// Hash collisions on the fallback name only cause spurious wake-ups.
    fn create_notify_pipe(db_path: &Path) -> io::Result<PathBuf> {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(".note");
        let path = PathBuf::from(name);

        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        match nix::unistd::mkfifo(&path, mode) {
            Ok(()) | Err(Errno::EEXIST) => return Ok(path),
            Err(Errno::ENOTSUP) => {}
            Err(err) => return Err(err.into()),
        }

        let mut hasher = FxHasher::default();
        hasher.write(db_path.as_os_str().as_encoded_bytes());
        let path = std::env::temp_dir().join(format!("lodestone_{:016x}.note", hasher.finish()));
        match nix::unistd::mkfifo(&path, mode) {
            Ok(()) | Err(Errno::EEXIST) => Ok(path),
            Err(err) => Err(err.into()),
        }
    }

    fn listen(notify: &File, shutdown: &File, on_change: &(dyn Fn() + Send)) {
        loop {
            let mut fds = [
                PollFd::new(notify.as_fd(), PollFlags::POLLIN),
                PollFd::new(shutdown.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    tracing::error!(%err, "commit notification listener failed");
                    return;
                }
            }

            let ready = |fd: &PollFd<'_>| {
                fd.revents().is_some_and(|r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                })
            };
            if ready(&fds[1]) {
                return;
            }
            if ready(&fds[0]) {
                // Drain before dispatching so the level-triggered poll goes
                // quiet; coalesced wake-ups still trigger one full run
                let mut buf = [0u8; 1024];
                let mut reader = notify;
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
                on_change();
            }
        }
    }
}
