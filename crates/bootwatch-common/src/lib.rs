use tokio::task::JoinHandle;

pub mod protocol_common;
pub mod record;
pub mod shutdown;

// both watch sessions only exist on linux
#[cfg(target_os = "linux")]
pub mod inotify_session;
#[cfg(target_os = "linux")]
pub mod netlink_session;
#[cfg(target_os = "linux")]
pub mod reader;

pub use protocol_common::WatchError;
pub use shutdown::Shutdown;

use tracing::Instrument;

#[allow(unexpected_cfgs)]
pub fn spawn_named<F>(name: &str, fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let span = tracing::info_span!("task", task_name = %name);

    let fut = fut.instrument(span);
    use futures::FutureExt;

    #[cfg(tokio_unstable)]
    {
        tokio::task::Builder::new()
            .name(name)
            .spawn(fut.boxed())
            .expect("failed to spawn task")
    }

    #[cfg(not(tokio_unstable))]
    {
        tokio::spawn(fut.boxed())
    }
}
