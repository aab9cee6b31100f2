//! `watch-path` / `watch-addr`: dump what the sessions see, for checking a
//! board by hand.

use std::path::Path;

use bootwatch_common::{
    Shutdown,
    inotify_session::{FsWatchSession, WatchFlags},
    netlink_session::{
        MessageKind, NetWatchSession, RoutingMessage, classify,
        parse_address_change,
    },
};
use futures::StreamExt;
use tracing::{info, warn};

use crate::gate::GateError;

pub async fn watch_path(
    dir: &Path,
    shutdown: &Shutdown,
) -> Result<(), GateError> {
    let mut session = FsWatchSession::open()?;
    let mask = WatchFlags::CREATE | WatchFlags::DELETE | WatchFlags::MODIFY;
    session.add(dir, mask).await?;
    let mut events = session.events()?;
    info!("watching {}", dir.display());

    shutdown
        .run_until(async {
            while let Some(event) = events.next().await {
                if event.is_overflow() {
                    warn!("event queue overflowed");
                    continue;
                }
                info!(
                    path = ?event.path,
                    mask = ?event.mask,
                    cookie = event.cookie,
                    "filesystem event"
                );
            }
        })
        .await;

    session.close().await?;
    Ok(())
}

fn log_routing_message(msg: &RoutingMessage) {
    let kind = classify(msg);
    match kind {
        MessageKind::Overrun => {
            warn!("routing messages were lost");
            return;
        }
        MessageKind::Other => {
            info!(
                message_type = msg.message_type,
                len = msg.payload.len(),
                "routing message"
            );
            return;
        }
        MessageKind::NewAddress | MessageKind::DeletedAddress => {}
    }
    match parse_address_change(msg) {
        Ok(change) => info!(
            %kind,
            address = %change.address,
            mask = %change.mask,
            prefix_len = change.prefix_len,
            interface = change.interface_index,
            scope = %change.scope,
            relevant = change.is_globally_relevant(),
            "address change"
        ),
        Err(e) => warn!(%kind, error = %e, "unparseable address change"),
    }
}

pub async fn watch_addr(shutdown: &Shutdown) -> Result<(), GateError> {
    let mut session = NetWatchSession::open()?;
    let mut events = session.events()?;
    info!("watching link and address changes");

    shutdown
        .run_until(async {
            while let Some(msg) = events.next().await {
                log_routing_message(&msg);
            }
        })
        .await;

    session.close().await?;
    Ok(())
}
