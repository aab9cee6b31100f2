//! The background task behind every watch session.
//!
//! The reader owns the kernel descriptor and whatever bookkeeping the session
//! needs (the inotify watch table). Callers talk to it through a command
//! channel and receive decoded records through a bounded event channel, so
//! nothing is shared mutably between the reader and the consumer.

use std::{
    collections::VecDeque,
    io,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use snafu::ResultExt;
use tokio::{io::unix::AsyncFd, sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::{
    protocol_common::{
        EventsTakenSnafu, ReadRetriesExhaustedSnafu, ReaderJoinSnafu,
        WatchError,
    },
    shutdown::Shutdown,
    spawn_named,
};

/// Slots in the channel between reader and consumer.
pub const EVENT_QUEUE_LEN: usize = 64;
/// Decoded records the reader holds back before it stops reading.
const MAX_PENDING: usize = 4096;
/// Consecutive failed reads tolerated before the reader gives up.
pub const MAX_READ_RETRIES: u32 = 8;
const BACKOFF_BASE: Duration = Duration::from_millis(10);
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// What a reader needs to know about one kind of kernel descriptor.
pub(crate) trait KernelSource: Send + 'static {
    type Item: Send + 'static;
    type Command: Send + 'static;

    /// Decode one read's worth of bytes.
    fn ingest(&mut self, buf: &[u8], out: &mut VecDeque<Self::Item>);

    fn handle(&mut self, fd: BorrowedFd<'_>, cmd: Self::Command);

    /// The kernel dropped notifications before they could be read.
    fn overrun(&mut self, _out: &mut VecDeque<Self::Item>) {}

    /// Runs once, before the descriptor is closed.
    fn teardown(&mut self, _fd: BorrowedFd<'_>) {}
}

pub(crate) fn backoff(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1 << exp).min(BACKOFF_CAP)
}

async fn next_command<C>(
    commands: &mut Option<mpsc::Receiver<C>>,
) -> Option<C> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn read_ready(
    fd: &AsyncFd<OwnedFd>,
    buf: &mut [u8],
) -> io::Result<usize> {
    loop {
        let mut guard = fd.readable().await?;
        match guard.try_io(|inner| {
            rustix::io::read(inner.get_ref(), &mut *buf)
                .map_err(io::Error::from)
        }) {
            Ok(res) => return res,
            Err(_would_block) => continue,
        }
    }
}

async fn run<S: KernelSource>(
    mut source: S,
    fd: AsyncFd<OwnedFd>,
    mut commands: Option<mpsc::Receiver<S::Command>>,
    events: mpsc::Sender<S::Item>,
    shutdown: Shutdown,
    buf_len: usize,
) -> Result<(), WatchError> {
    let mut buf = vec![0u8; buf_len];
    let mut pending: VecDeque<S::Item> = VecDeque::new();
    let mut failures = 0u32;

    let result = loop {
        tokio::select! {
            biased;
            () = shutdown.wait() => break Ok(()),
            Some(cmd) = next_command(&mut commands) => {
                source.handle(fd.get_ref().as_fd(), cmd);
            }
            permit = events.reserve(), if !pending.is_empty() => {
                match permit {
                    Ok(permit) => {
                        if let Some(item) = pending.pop_front() {
                            permit.send(item);
                        }
                    }
                    Err(_) => {
                        debug!("event consumer went away, stopping reader");
                        break Ok(());
                    }
                }
            }
            res = read_ready(&fd, &mut buf),
                if pending.len() < MAX_PENDING =>
            {
                let err = match res {
                    Ok(0) => io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "kernel descriptor returned no data",
                    ),
                    Ok(n) => {
                        failures = 0;
                        source.ingest(&buf[..n], &mut pending);
                        continue;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        continue;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                        warn!("kernel dropped notifications, buffer overran");
                        source.overrun(&mut pending);
                        continue;
                    }
                    Err(e) => e,
                };

                failures += 1;
                if failures >= MAX_READ_RETRIES {
                    error!(
                        attempts = failures,
                        error = %err,
                        "giving up on kernel descriptor"
                    );
                    break Err(err).context(ReadRetriesExhaustedSnafu {
                        attempts: failures,
                    });
                }
                let delay = backoff(failures);
                warn!(
                    attempts = failures,
                    ?delay,
                    error = %err,
                    "read failed, retrying"
                );
                tokio::select! {
                    () = shutdown.wait() => break Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    };

    source.teardown(fd.get_ref().as_fd());
    result
}

/// The session-side half of a running reader.
pub(crate) struct ReaderHandle<T> {
    shutdown: Shutdown,
    events: Option<mpsc::Receiver<T>>,
    task: Option<JoinHandle<Result<(), WatchError>>>,
}

impl<T: Send + 'static> ReaderHandle<T> {
    /// Must be called from within a Tokio runtime.
    pub(crate) fn spawn<S>(
        name: &str,
        source: S,
        fd: AsyncFd<OwnedFd>,
        commands: Option<mpsc::Receiver<S::Command>>,
        buf_len: usize,
    ) -> Self
    where
        S: KernelSource<Item = T>,
    {
        let shutdown = Shutdown::new();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_LEN);
        let task = spawn_named(
            name,
            run(source, fd, commands, tx, shutdown.clone(), buf_len),
        );
        Self {
            shutdown,
            events: Some(rx),
            task: Some(task),
        }
    }

    pub(crate) fn events(&mut self) -> Result<EventStream<T>, WatchError> {
        let rx = self.events.take().ok_or_else(|| EventsTakenSnafu.build())?;
        Ok(EventStream {
            inner: ReceiverStream::new(rx),
            shutdown: self.shutdown.clone(),
        })
    }

    pub(crate) fn shutdown_token(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub(crate) async fn close(mut self) -> Result<(), WatchError> {
        self.shutdown.trigger();
        match self.task.take() {
            Some(task) => task.await.context(ReaderJoinSnafu)?,
            None => Ok(()),
        }
    }
}

impl<T> Drop for ReaderHandle<T> {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

/// Decoded records from a watch session, in kernel delivery order.
///
/// Single pass: each record is yielded once. Once the session's shutdown
/// token fires the stream ends, even if records are still queued.
pub struct EventStream<T> {
    inner: ReceiverStream<T>,
    shutdown: Shutdown,
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.shutdown.is_shutdown() {
            return Poll::Ready(None);
        }
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(2), Duration::from_millis(20));
        assert_eq!(backoff(4), Duration::from_millis(80));
        assert_eq!(backoff(MAX_READ_RETRIES), Duration::from_secs(1));
        assert_eq!(backoff(u32::MAX), BACKOFF_CAP);
    }
}
