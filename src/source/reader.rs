//! Reader thread for network and UNIX-socket bases
//!
//! One thread per base polls every open descriptor, receives datagrams into
//! a scratch buffer, and copies each into the pending slot of the source
//! that accepts the sender. The slot is committed by acquiring the next one,
//! which is where backpressure from a slow consumer reaches the thread.

use std::io;
use std::net::IpAddr;
use std::os::fd::AsFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};

use super::base::SourceBase;

/// Why the read loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Asked to stop, or every source stopped
    Stopped,
    /// Poll or receive failed, or no descriptor is left open
    Failed,
}

/// Thread entry point
pub(crate) fn run(base: Arc<SourceBase>) {
    let mut scratch = Vec::new();
    if scratch.try_reserve_exact(base.item_size()).is_err() {
        tracing::warn!(
            base = %base.name(),
            item_size = base.item_size(),
            "Unable to allocate receive buffer"
        );
        let mut state = base.state.lock();
        state.started = true;
        state.running = false;
        base.cond.notify_all();
        return;
    }
    scratch.resize(base.item_size(), 0);

    {
        let mut state = base.state.lock();
        state.running = true;
        state.started = true;
        base.cond.notify_all();

        // Nothing to read for until a source attaches
        while !state.stop && !state.attached {
            base.cond.wait(&mut state);
        }
    }

    tracing::debug!(base = %base.name(), "Reader started");

    let exit = read_loop(&base, &mut scratch);

    if exit == Exit::Failed {
        tracing::error!(base = %base.name(), "Reader failed, stopping attached sources");
        base.cancel_sources();
    }

    let mut state = base.state.lock();
    state.running = false;
    base.cond.notify_all();
    drop(state);

    tracing::debug!(base = %base.name(), exit = ?exit, "Reader exited");
}

fn read_loop(base: &SourceBase, scratch: &mut [u8]) -> Exit {
    loop {
        {
            let state = base.state.lock();
            if state.stop || state.active_sources == 0 {
                return Exit::Stopped;
            }
        }
        if base.open_descriptors() == 0 {
            tracing::warn!(base = %base.name(), "No descriptors left open");
            return Exit::Failed;
        }

        let ready = match wait_readable(base) {
            Ok(ready) => ready,
            Err(Errno::EINTR) | Err(Errno::EAGAIN) => continue,
            Err(e) => {
                tracing::error!(base = %base.name(), error = %e, "Poll failed");
                return Exit::Failed;
            }
        };

        for (idx, revents) in ready {
            let desc = &base.descriptors[idx];

            if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
                if desc.close() {
                    base.stats.descriptor_closed();
                    tracing::debug!(
                        base = %base.name(),
                        revents = ?revents,
                        "Closing descriptor after poll error"
                    );
                }
                continue;
            }
            if !revents.contains(PollFlags::POLLIN) {
                continue;
            }

            let received = {
                let endpoint = desc.endpoint();
                match endpoint.as_ref() {
                    Some(endpoint) => endpoint.recv_from(scratch),
                    None => continue,
                }
            };

            match received {
                Ok((len, peer)) => {
                    base.stats.datagram_received(len);
                    deliver(base, peer, &scratch[..len]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    tracing::info!(base = %base.name(), "Ignoring spurious EAGAIN from recv");
                }
                Err(e) => {
                    tracing::error!(base = %base.name(), error = %e, "Receive failed");
                    return Exit::Failed;
                }
            }
        }
    }
}

/// Poll every open descriptor for input
///
/// Returns the index and returned events of each descriptor with events.
fn wait_readable(base: &SourceBase) -> Result<Vec<(usize, PollFlags)>, Errno> {
    let guards: Vec<_> = base
        .descriptors
        .iter()
        .enumerate()
        .map(|(idx, desc)| (idx, desc.endpoint()))
        .filter(|(_, endpoint)| endpoint.is_some())
        .collect();

    let mut fds: Vec<PollFd<'_>> = guards
        .iter()
        .filter_map(|(_, endpoint)| endpoint.as_ref())
        .map(|endpoint| PollFd::new(endpoint.as_fd(), PollFlags::POLLIN))
        .collect();

    let timeout = base.poll_timeout().as_millis().min(u16::MAX as u128) as u16;
    if poll(&mut fds, timeout)? == 0 {
        return Ok(Vec::new());
    }

    Ok(guards
        .iter()
        .zip(fds.iter())
        .filter_map(|((idx, _), fd)| {
            fd.revents()
                .filter(|revents| !revents.is_empty())
                .map(|revents| (*idx, revents))
        })
        .collect())
}

/// Hand one datagram to the source that accepts `peer`
fn deliver(base: &SourceBase, peer: Option<IpAddr>, data: &[u8]) {
    let target = {
        let mut state = base.state.lock();
        let target = state.routing.resolve(peer);
        if target.is_some() {
            state.unknown_peers.known();
        } else if state.unknown_peers.unknown() {
            tracing::info!(base = %base.name(), peer = ?peer, "Ignoring packets from host");
        }
        target
    };

    let Some(target) = target else {
        base.stats.unknown_peer();
        return;
    };
    if target.stopped.load(Ordering::Acquire) {
        base.stats.dropped_stopped();
        return;
    }
    if let Some(reject) = &target.reject {
        if reject(data) {
            base.stats.rejected();
            return;
        }
    }
    let Some(feed) = &target.feed else {
        return;
    };

    let mut writer = feed.writer.lock();
    let Some(slot) = writer.pending_slot() else {
        // The buffer was stopped before a slot was ever handed out
        return;
    };
    slot[..data.len()].copy_from_slice(data);
    slot[data.len()..].fill(0);

    loop {
        match writer.acquire_write_slot_timeout(base.poll_timeout()) {
            Ok(Some(_)) => return,
            Ok(None) => {
                if target.stopped.load(Ordering::Acquire) || base.stop_requested() {
                    base.stats.dropped_stopped();
                    return;
                }
            }
            Err(_) => return,
        }
    }
}
