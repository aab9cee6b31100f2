//! Filesystem watch session on top of inotify.

use std::{
    collections::{HashMap, VecDeque},
    ffi::{OsStr, OsString},
    io,
    os::{fd::BorrowedFd, unix::ffi::OsStrExt},
    path::{Path, PathBuf},
};

use rustix::fs::inotify::{self, CreateFlags};
pub use rustix::fs::inotify::{ReadFlags, WatchFlags};
use snafu::ResultExt;
use tokio::{
    io::unix::AsyncFd,
    sync::{mpsc, oneshot},
};
use tracing::{debug, warn};

use crate::{
    protocol_common::{
        INOTIFY_EVENT_HDR_LEN, InotifyEventHeader, KernelResourceSnafu,
        SessionClosedSnafu, WatchError,
    },
    reader::{EventStream, KernelSource, ReaderHandle},
    record::{Malformed, Record, read_pod, records},
    shutdown::Shutdown,
};

/// Room for a large batch of events from one read.
const INOTIFY_BUF_LEN: usize = INOTIFY_EVENT_HDR_LEN * 4096;
/// The kernel pads names to a multiple of the header size but never beyond
/// `NAME_MAX` plus the terminator.
const MAX_NAME_FIELD: usize = libc::NAME_MAX as usize + 1;
const COMMAND_QUEUE_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEvent {
    pub descriptor: i32,
    pub mask: ReadFlags,
    /// Ties `MOVED_FROM` to its `MOVED_TO`.
    pub cookie: u32,
    /// Entry name within a watched directory.
    pub name: Option<OsString>,
    /// The registered path the descriptor maps to, if it still does.
    pub watch_path: Option<PathBuf>,
    /// `watch_path` joined with `name`.
    pub path: Option<PathBuf>,
}

impl FsEvent {
    pub fn is_create(&self) -> bool {
        self.mask.contains(ReadFlags::CREATE)
    }

    pub fn is_delete(&self) -> bool {
        self.mask.contains(ReadFlags::DELETE)
    }

    pub fn is_modify(&self) -> bool {
        self.mask.contains(ReadFlags::MODIFY)
    }

    pub fn is_dir(&self) -> bool {
        self.mask.contains(ReadFlags::ISDIR)
    }

    pub fn is_overflow(&self) -> bool {
        self.mask.bits() & libc::IN_Q_OVERFLOW != 0
    }
}

/// One `inotify_event` as it sits in the read buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInotifyEvent {
    pub header: InotifyEventHeader,
    pub name: Option<OsString>,
}

impl Record for RawInotifyEvent {
    fn decode(buf: &[u8]) -> Result<(Self, usize), Malformed> {
        let header: InotifyEventHeader = read_pod(buf, 0)
            .ok_or(Malformed::fatal("truncated inotify event header"))?;

        let name_len = header.name_len as usize;
        let total = INOTIFY_EVENT_HDR_LEN
            .checked_add(name_len)
            .ok_or(Malformed::fatal("inotify name length overflows"))?;
        if total > buf.len() {
            return Err(Malformed::fatal(
                "inotify name runs past end of buffer",
            ));
        }
        if name_len > MAX_NAME_FIELD {
            // length is in bounds so the next event is still where it says
            return Err(Malformed::skip(
                "inotify name longer than NAME_MAX",
                total,
            ));
        }

        let raw_name = &buf[INOTIFY_EVENT_HDR_LEN..total];
        let trimmed = match raw_name.iter().position(|b| *b == 0) {
            Some(nul) => &raw_name[..nul],
            None => raw_name,
        };
        let name = (!trimmed.is_empty())
            .then(|| OsStr::from_bytes(trimmed).to_os_string());

        Ok((Self { header, name }, total))
    }
}

/// Strip trailing separators, keeping a lone `/`.
pub fn normalize_path(path: &Path) -> PathBuf {
    let bytes = path.as_os_str().as_bytes();
    let mut end = bytes.len();
    while end > 1 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    PathBuf::from(OsStr::from_bytes(&bytes[..end]))
}

/// Watched path <-> watch descriptor, kept as inverse maps.
#[derive(Debug, Default)]
pub(crate) struct WatchTable {
    by_path: HashMap<PathBuf, i32>,
    by_wd: HashMap<i32, PathBuf>,
}

impl WatchTable {
    pub(crate) fn descriptor(&self, path: &Path) -> Option<i32> {
        self.by_path.get(path).copied()
    }

    pub(crate) fn path(&self, wd: i32) -> Option<&Path> {
        self.by_wd.get(&wd).map(PathBuf::as_path)
    }

    pub(crate) fn insert(&mut self, path: PathBuf, wd: i32) {
        // the kernel hands back the same wd when a second path names the
        // same inode; the newer path wins
        if let Some(old) = self.by_wd.insert(wd, path.clone()) {
            self.by_path.remove(&old);
        }
        if let Some(old_wd) = self.by_path.insert(path, wd) {
            if old_wd != wd {
                self.by_wd.remove(&old_wd);
            }
        }
    }

    pub(crate) fn remove_path(&mut self, path: &Path) -> Option<i32> {
        let wd = self.by_path.remove(path)?;
        self.by_wd.remove(&wd);
        Some(wd)
    }

    pub(crate) fn remove_descriptor(&mut self, wd: i32) -> Option<PathBuf> {
        let path = self.by_wd.remove(&wd)?;
        self.by_path.remove(&path);
        Some(path)
    }

    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.by_path.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub(crate) fn drain(&mut self) -> Vec<(PathBuf, i32)> {
        self.by_wd.clear();
        self.by_path.drain().collect()
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        self.by_path.len() == self.by_wd.len()
            && self
                .by_path
                .iter()
                .all(|(p, wd)| self.by_wd.get(wd) == Some(p))
    }
}

pub(crate) enum Command {
    Add {
        path: PathBuf,
        mask: WatchFlags,
        reply: oneshot::Sender<Result<(), WatchError>>,
    },
    Remove {
        path: PathBuf,
        reply: oneshot::Sender<Result<(), WatchError>>,
    },
    List {
        reply: oneshot::Sender<Vec<PathBuf>>,
    },
}

#[derive(Default)]
struct InotifySource {
    table: WatchTable,
}

impl InotifySource {
    fn add(
        &mut self,
        fd: BorrowedFd<'_>,
        path: PathBuf,
        mask: WatchFlags,
    ) -> Result<(), WatchError> {
        if self.table.descriptor(&path).is_some() {
            return Ok(());
        }
        let wd = inotify::add_watch(fd, path.as_path(), mask)
            .map_err(io::Error::from)
            .context(KernelResourceSnafu {
                op: "inotify_add_watch",
            })?;
        debug!(wd, path = %path.display(), "added watch");
        self.table.insert(path, wd);
        Ok(())
    }

    fn remove(
        &mut self,
        fd: BorrowedFd<'_>,
        path: &Path,
    ) -> Result<(), WatchError> {
        let Some(wd) = self.table.descriptor(path) else {
            return Ok(());
        };
        match inotify::remove_watch(fd, wd) {
            // EINVAL means the kernel already dropped it, the IN_IGNORED is
            // still queued behind us
            Ok(()) | Err(rustix::io::Errno::INVAL) => {}
            Err(e) => {
                return Err(io::Error::from(e)).context(KernelResourceSnafu {
                    op: "inotify_rm_watch",
                });
            }
        }
        self.table.remove_path(path);
        debug!(wd, path = %path.display(), "removed watch");
        Ok(())
    }
}

impl KernelSource for InotifySource {
    type Item = FsEvent;
    type Command = Command;

    fn ingest(&mut self, buf: &[u8], out: &mut VecDeque<FsEvent>) {
        for record in records::<RawInotifyEvent>(buf) {
            let raw = match record {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(error = %e, "skipping malformed inotify record");
                    continue;
                }
            };
            let RawInotifyEvent { header, name } = raw;
            let mask = ReadFlags::from_bits_retain(header.mask);

            let watch_path = self.table.path(header.wd).map(Path::to_path_buf);
            if mask.contains(ReadFlags::IGNORED) {
                if let Some(gone) = self.table.remove_descriptor(header.wd) {
                    debug!(
                        wd = header.wd,
                        path = %gone.display(),
                        "kernel dropped watch"
                    );
                }
            }
            if header.mask & libc::IN_Q_OVERFLOW != 0 {
                warn!("inotify queue overflowed, events were lost");
            }

            let path = match (&watch_path, &name) {
                (Some(dir), Some(name)) => Some(dir.join(name)),
                (Some(dir), None) => Some(dir.clone()),
                (None, _) => None,
            };
            out.push_back(FsEvent {
                descriptor: header.wd,
                mask,
                cookie: header.cookie,
                name,
                watch_path,
                path,
            });
        }
    }

    fn handle(&mut self, fd: BorrowedFd<'_>, cmd: Command) {
        // a dropped reply just means the caller stopped waiting
        match cmd {
            Command::Add { path, mask, reply } => {
                let _ = reply.send(self.add(fd, path, mask));
            }
            Command::Remove { path, reply } => {
                let _ = reply.send(self.remove(fd, &path));
            }
            Command::List { reply } => {
                let _ = reply.send(self.table.paths());
            }
        }
    }

    fn teardown(&mut self, fd: BorrowedFd<'_>) {
        for (path, wd) in self.table.drain() {
            if let Err(e) = inotify::remove_watch(fd, wd) {
                debug!(
                    wd,
                    path = %path.display(),
                    error = %e,
                    "watch already gone at close"
                );
            }
        }
    }
}

/// An open inotify instance plus the task that reads it.
pub struct FsWatchSession {
    reader: ReaderHandle<FsEvent>,
    commands: mpsc::Sender<Command>,
}

impl FsWatchSession {
    /// Acquire an inotify descriptor and start its reader. Must be called
    /// from within a Tokio runtime.
    pub fn open() -> Result<Self, WatchError> {
        let fd = inotify::init(CreateFlags::NONBLOCK | CreateFlags::CLOEXEC)
            .map_err(io::Error::from)
            .context(KernelResourceSnafu {
                op: "inotify_init1",
            })?;
        let fd = AsyncFd::new(fd).context(KernelResourceSnafu {
            op: "register inotify descriptor",
        })?;

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_LEN);
        let reader = ReaderHandle::spawn(
            "inotify-reader",
            InotifySource::default(),
            fd,
            Some(rx),
            INOTIFY_BUF_LEN,
        );
        Ok(Self {
            reader,
            commands: tx,
        })
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> Result<R, WatchError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| SessionClosedSnafu.build())?;
        rx.await.map_err(|_| SessionClosedSnafu.build())
    }

    /// Watch `path` for `mask`. Registering an already watched path is a
    /// no-op, whatever the mask.
    pub async fn add(
        &self,
        path: impl AsRef<Path>,
        mask: WatchFlags,
    ) -> Result<(), WatchError> {
        let path = normalize_path(path.as_ref());
        self.request(|reply| Command::Add { path, mask, reply })
            .await?
    }

    /// Stop watching `path`. Unknown paths are ignored.
    pub async fn remove(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<(), WatchError> {
        let path = normalize_path(path.as_ref());
        self.request(|reply| Command::Remove { path, reply }).await?
    }

    pub async fn watched_paths(&self) -> Result<Vec<PathBuf>, WatchError> {
        self.request(|reply| Command::List { reply }).await
    }

    /// Take the event stream. Only the first call succeeds.
    pub fn events(&mut self) -> Result<EventStream<FsEvent>, WatchError> {
        self.reader.events()
    }

    /// Token that ends the session, and any wait on its events, when
    /// triggered.
    pub fn shutdown_token(&self) -> Shutdown {
        self.reader.shutdown_token()
    }

    /// Drop every watch and release the descriptor. Reports the reader's
    /// error if it had already given up.
    pub async fn close(self) -> Result<(), WatchError> {
        self.reader.close().await
    }
}
