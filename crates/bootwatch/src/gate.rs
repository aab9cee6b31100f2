//! Boot gating: block until the board support package has created the SSD
//! symlink and assigned the control-plane address.

use std::{
    backtrace::Backtrace,
    ffi::OsStr,
    fs, io,
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
};

use bootwatch_common::{
    Shutdown, WatchError,
    inotify_session::{FsEvent, FsWatchSession, WatchFlags},
    netlink_session::{
        MessageKind, NetWatchSession, RoutingMessage, classify,
        parse_address_change,
    },
};
use futures::{Stream, StreamExt};
use nix::ifaddrs::getifaddrs;
use snafu::{OptionExt, ResultExt, Snafu};
use tracing::{debug, info, warn};

pub use crate::cli::DEFAULT_SYMLINK_PATH;

/// First octet of every control-plane address handed out by the BSP.
pub const CONTROL_PLANE_FIRST_OCTET: u8 = 173;
/// Octets 2 and 3 of the master node's exclusive address.
pub const EXCLUSIVE_TRAILING_OCTETS: [u8; 2] = [95, 16];

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum GateError {
    #[snafu(display("watch failed: {source}"))]
    Watch {
        source: WatchError,
        backtrace: Backtrace,
    },
    #[snafu(display("failed to list interface addresses: {source}"))]
    Interfaces {
        source: nix::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("{} has no file name to wait for", path.display()))]
    NoFileName { path: PathBuf, backtrace: Backtrace },
    #[snafu(display("{what} watch ended before the condition was met"))]
    SessionEnded {
        what: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("wait was cancelled"))]
    Cancelled,
}

impl From<WatchError> for GateError {
    fn from(source: WatchError) -> Self {
        GateError::Watch {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub symlink_path: PathBuf,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            symlink_path: PathBuf::from(DEFAULT_SYMLINK_PATH),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateOutcome {
    pub control_plane: Ipv4Addr,
    pub exclusive: Ipv4Addr,
}

/// Anything other than "not found" counts as present, a dangling symlink
/// included.
pub fn path_exists(path: &Path) -> bool {
    !matches!(
        fs::symlink_metadata(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound
    )
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Fold a session's close result into the wait's result. A close failure
/// only surfaces when the wait itself succeeded.
fn settle<T>(
    outcome: Result<T, GateError>,
    closed: Result<(), WatchError>,
    what: &'static str,
) -> Result<T, GateError> {
    match (outcome, closed) {
        (outcome, Ok(())) => outcome,
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(err), Err(e)) => {
            warn!(error = %e, "failed to close {what} watch");
            Err(err)
        }
    }
}

/// Consume filesystem events until `name` is created next to `path`. Lost
/// events may include the one we wait for, so an overflow re-checks `path`.
async fn next_creation<S>(events: &mut S, path: &Path, name: &OsStr) -> bool
where
    S: Stream<Item = FsEvent> + Unpin,
{
    while let Some(event) = events.next().await {
        debug!(?event, "filesystem event");
        if event.is_overflow() {
            warn!("filesystem events lost, checking {}", path.display());
            if path_exists(path) {
                return true;
            }
        } else if event.is_create() && event.name.as_deref() == Some(name) {
            return true;
        }
    }
    false
}

/// Block until `path` exists.
pub async fn wait_for_path(
    path: &Path,
    shutdown: &Shutdown,
) -> Result<(), GateError> {
    if path_exists(path) {
        info!("{} already exists", path.display());
        return Ok(());
    }
    let name = path.file_name().context(NoFileNameSnafu { path })?;
    info!("{} does not exist, waiting for it to be created", path.display());

    let mut session = FsWatchSession::open()?;
    session.add(watch_dir(path), WatchFlags::CREATE).await?;
    let mut events = session.events()?;

    // it may have shown up between the first check and the watch
    let found = if path_exists(path) {
        Some(true)
    } else {
        shutdown
            .run_until(next_creation(&mut events, path, name))
            .await
    };
    let closed = session.close().await;

    let outcome = match found {
        Some(true) => Ok(()),
        Some(false) => SessionEndedSnafu { what: "filesystem" }.fail(),
        None => Err(GateError::Cancelled),
    };
    settle(outcome, closed, "filesystem")?;
    info!("{} created", path.display());
    Ok(())
}

/// The address as IPv4 if it belongs to the control plane. IPv4-mapped IPv6
/// addresses count.
pub fn as_control_plane(addr: IpAddr) -> Option<Ipv4Addr> {
    let v4 = match addr {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(v6) => v6.to_ipv4_mapped()?,
    };
    (v4.octets()[0] == CONTROL_PLANE_FIRST_OCTET).then_some(v4)
}

pub fn is_control_plane(addr: IpAddr) -> bool {
    as_control_plane(addr).is_some()
}

/// The master node's exclusive address: the control-plane address with its
/// last two octets replaced.
pub fn exclusive_address(control_plane: Ipv4Addr) -> Ipv4Addr {
    let mut octets = control_plane.octets();
    octets[2] = EXCLUSIVE_TRAILING_OCTETS[0];
    octets[3] = EXCLUSIVE_TRAILING_OCTETS[1];
    Ipv4Addr::from(octets)
}

/// Every address currently assigned to any interface.
pub fn interface_addresses() -> Result<Vec<IpAddr>, GateError> {
    let addrs = getifaddrs().context(InterfacesSnafu)?;
    Ok(addrs
        .filter_map(|ifa| ifa.address)
        .filter_map(|addr| {
            if let Some(v4) = addr.as_sockaddr_in() {
                Some(IpAddr::V4(v4.ip()))
            } else {
                addr.as_sockaddr_in6().map(|v6| IpAddr::V6(v6.ip()))
            }
        })
        .collect())
}

fn current_control_plane() -> Result<Option<Ipv4Addr>, GateError> {
    Ok(interface_addresses()?
        .into_iter()
        .find_map(as_control_plane))
}

/// Consume routing messages until an address is added on the control plane.
/// `rescan` reads the current addresses after messages were lost.
async fn next_control_plane<S, F>(
    events: &mut S,
    mut rescan: F,
) -> Result<Option<Ipv4Addr>, GateError>
where
    S: Stream<Item = RoutingMessage> + Unpin,
    F: FnMut() -> Result<Option<Ipv4Addr>, GateError>,
{
    while let Some(msg) = events.next().await {
        match classify(&msg) {
            MessageKind::NewAddress => {}
            MessageKind::Overrun => {
                warn!("routing messages lost, re-reading interface addresses");
                if let Some(ip) = rescan()? {
                    return Ok(Some(ip));
                }
                continue;
            }
            MessageKind::DeletedAddress | MessageKind::Other => continue,
        }
        match parse_address_change(&msg) {
            Ok(change) => {
                debug!(
                    address = %change.address,
                    prefix_len = change.prefix_len,
                    scope = %change.scope,
                    "address added"
                );
                if let Some(ip) = as_control_plane(change.address) {
                    return Ok(Some(ip));
                }
            }
            Err(e) => debug!(error = %e, "ignoring address message"),
        }
    }
    Ok(None)
}

/// Block until an interface carries a control-plane address.
pub async fn wait_for_control_plane_ip(
    shutdown: &Shutdown,
) -> Result<Ipv4Addr, GateError> {
    if let Some(ip) = current_control_plane()? {
        info!(%ip, "control plane ip already exists");
        return Ok(ip);
    }
    info!("control plane ip does not exist, waiting for it to be set");

    let mut session = NetWatchSession::open()?;
    let mut events = session.events()?;

    // subscribed now, so nothing assigned from here on can be missed
    let found = match current_control_plane()? {
        Some(ip) => Some(Ok(Some(ip))),
        None => {
            shutdown
                .run_until(next_control_plane(
                    &mut events,
                    current_control_plane,
                ))
                .await
        }
    };
    let closed = session.close().await;

    let outcome = match found {
        Some(Ok(Some(ip))) => Ok(ip),
        Some(Ok(None)) => SessionEndedSnafu { what: "network" }.fail(),
        Some(Err(e)) => Err(e),
        None => Err(GateError::Cancelled),
    };
    let ip = settle(outcome, closed, "network")?;
    info!(%ip, "control plane ip set");
    Ok(ip)
}

/// Everything that has to be in place before any boot mode powers on.
pub async fn prepare_power_on(
    config: &GateConfig,
    shutdown: &Shutdown,
) -> Result<GateOutcome, GateError> {
    wait_for_path(&config.symlink_path, shutdown).await?;
    let control_plane = wait_for_control_plane_ip(shutdown).await?;
    let exclusive = exclusive_address(control_plane);
    info!(%exclusive, "set master node exclusive ip");
    Ok(GateOutcome {
        control_plane,
        exclusive,
    })
}
