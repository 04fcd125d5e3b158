//! Channel bookkeeping: id allocation, window accounting, close-handshake
//! tracking, and the ordered global-request reply queue.
//!
//! Channels are kept in a table keyed by local id. Ids are handed out from a
//! fast-path counter; once the counter reaches the 2^32-1 ceiling the
//! allocator falls back to a linear scan for a reclaimed slot. An id is
//! reserved *before* the application decides whether to accept the open, so
//! a second open arriving while the first is pending can never steal the
//! same id, and an id is never reused until both sides' CLOSE has been
//! observed.
//!
//! Global requests must be answered in arrival order even when the
//! application resolves them out of order; [`GlobalRequestQueue`] holds the
//! unsent replies and only releases a reply once every earlier one has been
//! resolved.

use skiff_platform::{SkiffError, SkiffResult};
use std::collections::{HashMap, VecDeque};

/// Highest allocatable channel id.
pub const CHANNEL_ID_CEILING: u32 = u32::MAX;

/// Lifecycle state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Reserved locally; open sent or being decided.
    Opening,
    /// Confirmed by both sides.
    Open,
    /// At least one side has sent CLOSE.
    Closing,
}

/// One multiplexed channel.
#[derive(Debug)]
pub struct Channel {
    /// Local channel id.
    pub local_id: u32,
    /// Peer's channel id (known after open/confirmation).
    pub peer_id: Option<u32>,
    /// Bytes the peer may still send us.
    pub local_window: u32,
    /// Bytes we may still send the peer.
    pub remote_window: u32,
    /// Largest packet we accept.
    pub local_max_packet: u32,
    /// Largest packet the peer accepts.
    pub remote_max_packet: u32,
    /// Lifecycle state.
    pub state: ChannelState,
    /// Session subtype once established (shell/exec/subsystem name).
    pub subtype: Option<String>,
    local_eof: bool,
    remote_eof: bool,
    local_close: bool,
    remote_close: bool,
}

impl Channel {
    fn new(local_id: u32, local_window: u32, local_max_packet: u32) -> Self {
        Self {
            local_id,
            peer_id: None,
            local_window,
            remote_window: 0,
            local_max_packet,
            remote_max_packet: 0,
            state: ChannelState::Opening,
            subtype: None,
            local_eof: false,
            remote_eof: false,
            local_close: false,
            remote_close: false,
        }
    }

    /// Records the peer's side of the open handshake.
    pub fn confirm(&mut self, peer_id: u32, remote_window: u32, remote_max_packet: u32) {
        self.peer_id = Some(peer_id);
        self.remote_window = remote_window;
        self.remote_max_packet = remote_max_packet;
        self.state = ChannelState::Open;
    }

    /// Consumes our send budget. Returns false when the window is too small
    /// for `len` bytes — the caller must wait for a WINDOW_ADJUST.
    pub fn consume_remote_window(&mut self, len: u32) -> bool {
        if len > self.remote_window {
            return false;
        }
        self.remote_window -= len;
        true
    }

    /// Replenishes our send budget from a WINDOW_ADJUST.
    pub fn grow_remote_window(&mut self, bytes: u32) {
        self.remote_window = self.remote_window.saturating_add(bytes);
    }

    /// Consumes the peer's send budget for inbound data. Returns false when
    /// the peer overran the window it was granted.
    pub fn consume_local_window(&mut self, len: u32) -> bool {
        if len > self.local_window {
            return false;
        }
        self.local_window -= len;
        true
    }

    /// Replenishes the peer's budget; the caller sends the matching
    /// WINDOW_ADJUST.
    pub fn grow_local_window(&mut self, bytes: u32) {
        self.local_window = self.local_window.saturating_add(bytes);
    }

    /// Records an EOF we sent.
    pub fn note_local_eof(&mut self) {
        self.local_eof = true;
    }

    /// Records an EOF from the peer.
    pub fn note_remote_eof(&mut self) {
        self.remote_eof = true;
    }

    /// Returns whether we already sent EOF.
    pub fn local_eof(&self) -> bool {
        self.local_eof
    }

    /// Returns whether the peer sent EOF.
    pub fn remote_eof(&self) -> bool {
        self.remote_eof
    }

    /// Records a CLOSE we sent; returns true when both directions are now
    /// closed.
    pub fn note_local_close(&mut self) -> bool {
        self.local_close = true;
        self.state = ChannelState::Closing;
        self.fully_closed()
    }

    /// Records a CLOSE from the peer; returns true when both directions are
    /// now closed.
    pub fn note_remote_close(&mut self) -> bool {
        self.remote_close = true;
        self.state = ChannelState::Closing;
        self.fully_closed()
    }

    /// Both sides' CLOSE observed.
    pub fn fully_closed(&self) -> bool {
        self.local_close && self.remote_close
    }
}

/// Table of live channels, keyed by local id.
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: HashMap<u32, Channel>,
    next_id: u32,
}

impl ChannelTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a fresh local id and inserts a channel in `Opening` state.
    ///
    /// # Errors
    ///
    /// Returns a local [`SkiffError::Protocol`] when every id is taken —
    /// this never terminates the connection.
    pub fn reserve(&mut self, local_window: u32, local_max_packet: u32) -> SkiffResult<u32> {
        let id = self.next_free_id()?;
        self.channels
            .insert(id, Channel::new(id, local_window, local_max_packet));
        Ok(id)
    }

    fn next_free_id(&mut self) -> SkiffResult<u32> {
        // Fast path: monotonic counter until the ceiling.
        while self.next_id < CHANNEL_ID_CEILING {
            let id = self.next_id;
            self.next_id += 1;
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        // Slow path: scan for a reclaimed slot.
        for id in 0..CHANNEL_ID_CEILING {
            if !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(SkiffError::Protocol("No free channel id".to_string()))
    }

    /// Releases a reserved id whose open was rejected or failed.
    pub fn release(&mut self, id: u32) {
        self.channels.remove(&id);
    }

    /// Removes a fully-closed channel, reclaiming its id.
    pub fn remove_closed(&mut self, id: u32) -> Option<Channel> {
        match self.channels.get(&id) {
            Some(channel) if channel.fully_closed() => self.channels.remove(&id),
            _ => None,
        }
    }

    /// Looks up a channel.
    pub fn get(&self, id: u32) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Looks up a channel mutably.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut Channel> {
        self.channels.get_mut(&id)
    }

    /// Looks up a channel mutably, mapping a bogus id to a protocol error.
    pub fn expect_mut(&mut self, id: u32) -> SkiffResult<&mut Channel> {
        self.channels.get_mut(&id).ok_or_else(|| {
            SkiffError::Protocol(format!("Message for unknown channel {}", id))
        })
    }

    /// Number of live channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channels exist.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Iterates over live channel ids.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.channels.keys().copied()
    }
}

/// Ticket identifying one queued global-request reply slot.
pub type ReplyTicket = u64;

#[derive(Debug)]
struct PendingReply {
    ticket: ReplyTicket,
    reply: Option<Vec<u8>>,
}

/// Serializes global-request replies into request-arrival order.
#[derive(Debug, Default)]
pub struct GlobalRequestQueue {
    pending: VecDeque<PendingReply>,
    next_ticket: ReplyTicket,
}

impl GlobalRequestQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an arriving request that wants a reply; the returned
    /// ticket resolves it later.
    pub fn enqueue(&mut self) -> ReplyTicket {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.pending.push_back(PendingReply {
            ticket,
            reply: None,
        });
        ticket
    }

    /// Resolves a ticket with its serialized reply, then returns every
    /// reply that is now unblocked, in arrival order.
    ///
    /// A reply is only released once all earlier tickets have resolved.
    pub fn resolve(&mut self, ticket: ReplyTicket, reply: Vec<u8>) -> Vec<Vec<u8>> {
        if let Some(slot) = self.pending.iter_mut().find(|p| p.ticket == ticket) {
            slot.reply = Some(reply);
        }
        self.drain_ready()
    }

    fn drain_ready(&mut self) -> Vec<Vec<u8>> {
        let mut ready = Vec::new();
        while let Some(front) = self.pending.front() {
            if front.reply.is_some() {
                let slot = self.pending.pop_front().expect("front exists");
                ready.push(slot.reply.expect("checked above"));
            } else {
                break;
            }
        }
        ready
    }

    /// Number of unresolved or blocked replies.
    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut table = ChannelTable::new();
        assert_eq!(table.reserve(1024, 256).unwrap(), 0);
        assert_eq!(table.reserve(1024, 256).unwrap(), 1);
        assert_eq!(table.reserve(1024, 256).unwrap(), 2);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_id_not_reused_until_fully_closed() {
        let mut table = ChannelTable::new();
        let id = table.reserve(1024, 256).unwrap();
        table.get_mut(id).unwrap().confirm(7, 2048, 512);

        // One-sided close: id still occupied.
        assert!(!table.get_mut(id).unwrap().note_local_close());
        assert!(table.remove_closed(id).is_none());
        assert!(table.get(id).is_some());

        // Both sides closed: the id is reclaimed.
        assert!(table.get_mut(id).unwrap().note_remote_close());
        assert!(table.remove_closed(id).is_some());
        assert!(table.get(id).is_none());

        // The counter keeps moving forward; the freed slot is found again
        // only via the scan fallback once the counter is exhausted.
        let next = table.reserve(1024, 256).unwrap();
        assert_ne!(next, id);
    }

    #[test]
    fn test_scan_fallback_reclaims_slot() {
        let mut table = ChannelTable::new();
        let a = table.reserve(1024, 256).unwrap();
        let _b = table.reserve(1024, 256).unwrap();

        // Close and reclaim `a`, then exhaust the fast-path counter.
        table.get_mut(a).unwrap().confirm(0, 0, 0);
        table.get_mut(a).unwrap().note_local_close();
        table.get_mut(a).unwrap().note_remote_close();
        table.remove_closed(a).unwrap();

        table.next_id = CHANNEL_ID_CEILING;
        let reclaimed = table.reserve(1024, 256).unwrap();
        assert_eq!(reclaimed, a);
    }

    #[test]
    fn test_release_reserved_id() {
        let mut table = ChannelTable::new();
        let id = table.reserve(1024, 256).unwrap();
        table.release(id);
        assert!(table.is_empty());
    }

    #[test]
    fn test_window_accounting() {
        let mut table = ChannelTable::new();
        let id = table.reserve(100, 256).unwrap();
        let channel = table.get_mut(id).unwrap();
        channel.confirm(1, 50, 512);

        assert!(channel.consume_remote_window(30));
        assert_eq!(channel.remote_window, 20);
        assert!(!channel.consume_remote_window(21));
        channel.grow_remote_window(80);
        assert!(channel.consume_remote_window(100));

        assert!(channel.consume_local_window(100));
        assert!(!channel.consume_local_window(1));
        channel.grow_local_window(64);
        assert!(channel.consume_local_window(64));
    }

    #[test]
    fn test_expect_mut_unknown_channel() {
        let mut table = ChannelTable::new();
        assert!(table.expect_mut(99).is_err());
    }

    #[test]
    fn test_reply_queue_in_order_resolution() {
        let mut queue = GlobalRequestQueue::new();
        let first = queue.enqueue();
        let second = queue.enqueue();

        assert_eq!(queue.resolve(first, b"one".to_vec()), vec![b"one".to_vec()]);
        assert_eq!(queue.resolve(second, b"two".to_vec()), vec![b"two".to_vec()]);
        assert_eq!(queue.outstanding(), 0);
    }

    #[test]
    fn test_reply_queue_out_of_order_resolution() {
        let mut queue = GlobalRequestQueue::new();
        let first = queue.enqueue();
        let second = queue.enqueue();
        let third = queue.enqueue();

        // Resolving later tickets releases nothing while the head waits.
        assert!(queue.resolve(third, b"three".to_vec()).is_empty());
        assert!(queue.resolve(second, b"two".to_vec()).is_empty());
        assert_eq!(queue.outstanding(), 3);

        // Resolving the head releases everything, in arrival order.
        let released = queue.resolve(first, b"one".to_vec());
        assert_eq!(
            released,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(queue.outstanding(), 0);
    }
}
