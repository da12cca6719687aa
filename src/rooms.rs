//! Room membership and presence bookkeeping
//!
//! `RoomTracker` is plain state with no I/O. The chat session drives it from
//! user calls and server events and emits whatever the transitions require.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::protocol::{Id, SenderRef};

/// Membership state of one room. Rooms never seen are `NotJoined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomState {
    NotJoined,
    /// Join requested, waiting for the server's confirmation
    Joining,
    Joined,
}

#[derive(Debug, Default)]
pub struct RoomTracker {
    rooms: HashMap<Id, RoomState>,
    /// Rooms in `Joining`, oldest request first
    joining: VecDeque<Id>,
    /// Rooms to request again once the connection comes back
    rejoin: Vec<Id>,
    presence: HashMap<Id, Vec<SenderRef>>,
}

impl RoomTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, room: &Id) -> RoomState {
        self.rooms.get(room).copied().unwrap_or(RoomState::NotJoined)
    }

    /// Rooms currently `Joined`, sorted
    pub fn joined(&self) -> Vec<Id> {
        let mut rooms: Vec<Id> = self
            .rooms
            .iter()
            .filter(|(_, state)| **state == RoomState::Joined)
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    /// `NotJoined -> Joining`. Returns false when the room is already joining
    /// or joined, in which case no request should be sent.
    pub fn begin_join(&mut self, room: &Id) -> bool {
        if self.state(room) != RoomState::NotJoined {
            return false;
        }
        self.rooms.insert(room.clone(), RoomState::Joining);
        self.joining.push_back(room.clone());
        true
    }

    /// `Joining -> Joined` on the server's confirmation. Unsolicited
    /// confirmations return false and change nothing.
    pub fn confirm_join(&mut self, room: &Id) -> bool {
        if self.state(room) != RoomState::Joining {
            return false;
        }
        self.rooms.insert(room.clone(), RoomState::Joined);
        self.joining.retain(|r| r != room);
        true
    }

    /// `Joining -> NotJoined`, e.g. when the request could not be sent
    pub fn fail_join(&mut self, room: &Id) -> bool {
        if self.state(room) != RoomState::Joining {
            return false;
        }
        self.forget(room);
        true
    }

    /// Fail the oldest outstanding join request
    pub fn fail_oldest_joining(&mut self) -> Option<Id> {
        let room = self.joining.pop_front()?;
        self.forget(&room);
        Some(room)
    }

    /// Leave a room, returning the state it was in. The room will not be
    /// rejoined after a reconnect.
    pub fn leave(&mut self, room: &Id) -> RoomState {
        let previous = self.state(room);
        self.forget(room);
        self.rejoin.retain(|r| r != room);
        previous
    }

    /// Involuntary disconnect: every room drops to `NotJoined` and the ones
    /// that were joined or joining are remembered for rejoin.
    pub fn connection_lost(&mut self) {
        let mut lost: Vec<Id> = self.rooms.drain().map(|(room, _)| room).collect();
        lost.sort();
        for room in lost {
            if !self.rejoin.contains(&room) {
                self.rejoin.push(room);
            }
        }
        self.joining.clear();
        self.presence.clear();
    }

    /// Explicit disconnect: forget everything, including the rejoin set
    pub fn reset(&mut self) {
        self.rooms.clear();
        self.joining.clear();
        self.rejoin.clear();
        self.presence.clear();
    }

    /// Move every remembered room back to `Joining` and hand them out once.
    /// A second call returns nothing until the next `connection_lost`.
    pub fn take_rejoins(&mut self) -> Vec<Id> {
        let rooms = std::mem::take(&mut self.rejoin);
        rooms
            .into_iter()
            .filter(|room| self.begin_join(room))
            .collect()
    }

    /// Replace the online users of a room with a server snapshot. Snapshots
    /// for rooms we are not in are ignored.
    pub fn replace_presence(&mut self, room: &Id, users: Vec<SenderRef>) -> bool {
        if self.state(room) == RoomState::NotJoined {
            return false;
        }

        let mut seen = HashSet::new();
        let users: Vec<SenderRef> = users
            .into_iter()
            .filter(|user| seen.insert(user.id().clone()))
            .collect();
        self.presence.insert(room.clone(), users);
        true
    }

    pub fn online_users(&self, room: &Id) -> Vec<SenderRef> {
        self.presence.get(room).cloned().unwrap_or_default()
    }

    fn forget(&mut self, room: &Id) {
        self.rooms.remove(room);
        self.joining.retain(|r| r != room);
        self.presence.remove(room);
    }
}
