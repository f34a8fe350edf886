use std::{
    io,
    os::fd::RawFd,
    sync::{atomic::Ordering, Arc},
    time::Duration,
};

use mio::{Events, Poll};
use tracing::{debug, trace, warn};

use super::{EventHandler, ReactorHandle, Shared, WAKER_TOKEN};

/// Thread body of the reactor: block on the readiness primitive with a
/// bounded timeout, dispatch whatever is ready, repeat until closed and
/// drained. No error on this path is allowed to kill the thread.
pub(super) fn run<H: EventHandler>(
    mut poll: Poll,
    shared: Arc<Shared>,
    handler: H,
    poll_timeout: Duration,
    events_capacity: usize,
) {
    let mut events = Events::with_capacity(events_capacity);
    let mut close_requested = false;

    loop {
        if shared.closed.load(Ordering::SeqCst) {
            if !close_requested {
                close_requested = true;
                let handles: Vec<Arc<dyn ReactorHandle>> = shared
                    .lock_table()
                    .values()
                    .map(|slot| slot.handle.clone())
                    .collect();
                debug!(
                    count = handles.len(),
                    "reactor closing; requesting connection shutdown"
                );
                for handle in &handles {
                    handler.on_close_requested(handle);
                }
            }
            if shared.lock_table().is_empty() {
                break;
            }
        }

        if let Err(err) = poll.poll(&mut events, Some(poll_timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // treat OS-level wait faults as transient
            warn!(%err, "readiness wait failed");
            continue;
        }

        // announce registrations that became effective this iteration
        let fresh: Vec<Arc<dyn ReactorHandle>> = {
            let mut table = shared.lock_table();
            table
                .values_mut()
                .filter_map(|slot| {
                    if slot.fresh {
                        slot.fresh = false;
                        Some(slot.handle.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        for handle in &fresh {
            handler.on_registered(handle);
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let fd = token.0 as RawFd;
            // clone the handle out so dispatch runs without the table lock
            let Some(handle) = shared.lock_table().get(&fd).map(|s| s.handle.clone())
            else {
                // raced with a deregistration mid-dispatch
                continue;
            };
            if event.is_readable() {
                if let Err(err) = handler.on_readable(&handle) {
                    debug!(conn = %handle.describe(), error = %err, "read dispatch failed");
                    handle.notify_of_error(err);
                }
            }
            if event.is_writable() {
                if let Err(err) = handler.on_writable(&handle) {
                    debug!(conn = %handle.describe(), error = %err, "write dispatch failed");
                    handle.notify_of_error(err);
                }
            }
        }
    }

    trace!("reactor thread exiting");
}
