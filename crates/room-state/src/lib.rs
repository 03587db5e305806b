//! Room-user state (C9): per-room user map with dual min-heap timeout
//! tracking, mirrored into a broker-backed hash store.
//!
//! [`RoomUserData`] is the pure in-memory half (no I/O, not concurrency-safe
//! on its own — callers serialize access, see spec §5's "explicit lock" for
//! C9). [`RoomUserStore`] wraps it with a lock and drives the broker mirror
//! calls in the same order the spec describes: memory first, then mirror.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub struct UserEntry {
    pub role: String,
    pub status: String,
    pub generation: u64,
    pub last_ts: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomStateError {
    #[error("user already present in room")]
    AlreadyPresent,
    #[error("user not found in room")]
    NotFound,
}

/// Pure data: the user map, plus the two lazily-deleted min-heaps.
#[derive(Default)]
pub struct RoomUserData {
    rooms: HashMap<String, HashMap<String, UserEntry>>,
    user_tracker: HashMap<String, (String, i64)>,
    user_heap: BinaryHeap<Reverse<(i64, String)>>,
    room_tracker: HashMap<String, i64>,
    room_heap: BinaryHeap<Reverse<(i64, String)>>,
}

impl RoomUserData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the room was newly created by this call.
    pub fn create_user(
        &mut self,
        room_id: &str,
        user_id: &str,
        role: impl Into<String>,
        generation: u64,
        now: i64,
    ) -> Result<bool, RoomStateError> {
        let room_is_new = !self.rooms.contains_key(room_id);
        let room = self.rooms.entry(room_id.to_owned()).or_default();
        if room.contains_key(user_id) {
            return Err(RoomStateError::AlreadyPresent);
        }
        room.insert(
            user_id.to_owned(),
            UserEntry {
                role: role.into(),
                status: String::new(),
                generation,
                last_ts: now,
            },
        );
        self.user_tracker.insert(user_id.to_owned(), (room_id.to_owned(), now));
        self.user_heap.push(Reverse((now, user_id.to_owned())));
        self.room_tracker.insert(room_id.to_owned(), now);
        self.room_heap.push(Reverse((now, room_id.to_owned())));
        Ok(room_is_new)
    }

    pub fn set_status(
        &mut self,
        room_id: &str,
        user_id: &str,
        status: impl Into<String>,
        generation: u64,
        now: i64,
    ) -> Result<(), RoomStateError> {
        let status = status.into();
        let room = self.rooms.get_mut(room_id).ok_or(RoomStateError::NotFound)?;
        let entry = room.get_mut(user_id).ok_or(RoomStateError::NotFound)?;
        if entry.role.is_empty() {
            return Err(RoomStateError::NotFound);
        }
        entry.status = status.clone();
        entry.generation = generation;
        entry.last_ts = now;

        if status.is_empty() {
            self.user_tracker.remove(user_id);
        } else {
            self.user_tracker.insert(user_id.to_owned(), (room_id.to_owned(), now));
            self.user_heap.push(Reverse((now, user_id.to_owned())));
        }
        Ok(())
    }

    /// Returns `(found, was_last_in_room)`.
    pub fn remove_user(&mut self, room_id: &str, user_id: &str) -> (bool, bool) {
        let Some(room) = self.rooms.get_mut(room_id) else {
            return (false, false);
        };
        if room.remove(user_id).is_none() {
            return (false, false);
        }
        self.user_tracker.remove(user_id);
        let was_last = room.is_empty();
        if was_last {
            self.rooms.remove(room_id);
            self.room_tracker.remove(room_id);
        }
        (true, was_last)
    }

    /// Two-phase sweep; returns the set of room ids affected by either
    /// phase (a user timing out, or a room being torn down outright).
    pub fn check_timeout(
        &mut self,
        now: i64,
        user_status_timeout: i64,
        room_max_ttl: i64,
    ) -> HashSet<String> {
        let mut affected = HashSet::new();

        while let Some(Reverse((ts, _))) = self.user_heap.peek().cloned() {
            if now - ts < user_status_timeout {
                break;
            }
            let Reverse((ts, uid)) = self.user_heap.pop().expect("just peeked");
            let Some((room_id, tracked_ts)) = self.user_tracker.get(&uid).cloned() else {
                continue;
            };
            if tracked_ts != ts {
                continue;
            }
            if let Some(room) = self.rooms.get_mut(&room_id) {
                if let Some(entry) = room.get_mut(&uid) {
                    entry.status.clear();
                }
            }
            self.user_tracker.remove(&uid);
            affected.insert(room_id);
        }

        while let Some(Reverse((ts, _))) = self.room_heap.peek().cloned() {
            if now - ts < room_max_ttl {
                break;
            }
            let Reverse((ts, rid)) = self.room_heap.pop().expect("just peeked");
            let Some(tracked_ts) = self.room_tracker.get(&rid).copied() else {
                continue;
            };
            if tracked_ts != ts {
                continue;
            }
            if let Some(room) = self.rooms.remove(&rid) {
                for uid in room.keys() {
                    self.user_tracker.remove(uid);
                }
            }
            self.room_tracker.remove(&rid);
            affected.insert(rid);
        }

        affected
    }

    #[must_use]
    pub fn get_user(&self, room_id: &str, user_id: &str) -> Option<&UserEntry> {
        self.rooms.get(room_id)?.get(user_id)
    }

    #[must_use]
    pub fn room_user_ids(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Broker-side mirror of room-user state: `m:<uid>` (role) and `s:<uid>`
/// (`"ts,status,gen"`) fields on a per-room hash, plus a `rooms` hash of
/// per-room last-ts (spec §3.4/§6.2).
#[async_trait::async_trait]
pub trait RoomUserBroker: Send + Sync {
    async fn set_role(&self, room_id: &str, user_id: &str, role: &str);
    async fn delete_role(&self, room_id: &str, user_id: &str);
    async fn set_status(&self, room_id: &str, user_id: &str, ts: i64, status: &str, generation: u64);
    async fn delete_status(&self, room_id: &str, user_id: &str);
    async fn set_room_ts(&self, room_id: &str, ts: i64);
    async fn delete_room(&self, room_id: &str);

    async fn list_rooms(&self) -> Vec<String>;
    async fn list_roles(&self, room_id: &str) -> Vec<(String, String)>;
    /// `(user_id, ts, status, generation)`.
    async fn list_statuses(&self, room_id: &str) -> Vec<(String, i64, String, u64)>;
}

/// Locks [`RoomUserData`] and drives [`RoomUserBroker`] mirror writes in the
/// order the spec describes for each operation.
pub struct RoomUserStore {
    data: Mutex<RoomUserData>,
    broker: std::sync::Arc<dyn RoomUserBroker>,
}

impl RoomUserStore {
    #[must_use]
    pub fn new(broker: std::sync::Arc<dyn RoomUserBroker>) -> Self {
        Self {
            data: Mutex::new(RoomUserData::new()),
            broker,
        }
    }

    pub async fn create_user(
        &self,
        room_id: &str,
        user_id: &str,
        role: impl Into<String> + Clone,
        generation: u64,
        now: i64,
    ) -> Result<bool, RoomStateError> {
        let room_is_new = {
            let mut data = self.data.lock().expect("room-user state poisoned");
            data.create_user(room_id, user_id, role.clone(), generation, now)?
        };
        self.broker.set_role(room_id, user_id, &role.into()).await;
        self.broker.set_room_ts(room_id, now).await;
        Ok(room_is_new)
    }

    pub async fn set_status(
        &self,
        room_id: &str,
        user_id: &str,
        status: impl Into<String>,
        generation: u64,
        now: i64,
    ) -> Result<(), RoomStateError> {
        let status = status.into();
        {
            let mut data = self.data.lock().expect("room-user state poisoned");
            data.set_status(room_id, user_id, status.clone(), generation, now)?;
        }
        if status.is_empty() {
            self.broker.delete_status(room_id, user_id).await;
        } else {
            self.broker.set_status(room_id, user_id, now, &status, generation).await;
        }
        Ok(())
    }

    pub async fn remove_user(&self, room_id: &str, user_id: &str) -> (bool, bool) {
        let (found, was_last) = {
            let mut data = self.data.lock().expect("room-user state poisoned");
            data.remove_user(room_id, user_id)
        };
        if found {
            self.broker.delete_status(room_id, user_id).await;
            if was_last {
                self.broker.delete_room(room_id).await;
            } else {
                self.broker.delete_role(room_id, user_id).await;
            }
        }
        (found, was_last)
    }

    pub async fn check_timeout(&self, now: i64, user_status_timeout: i64, room_max_ttl: i64) -> HashSet<String> {
        let (affected, torn_down) = {
            let mut data = self.data.lock().expect("room-user state poisoned");
            let before: HashSet<String> = data.rooms.keys().cloned().collect();
            let affected = data.check_timeout(now, user_status_timeout, room_max_ttl);
            let after: HashSet<String> = data.rooms.keys().cloned().collect();
            let torn_down: Vec<String> = before.difference(&after).cloned().collect();
            (affected, torn_down)
        };
        for room_id in &torn_down {
            self.broker.delete_room(room_id).await;
        }
        affected
    }

    /// Read rooms-hash; for each, load its user-status-hash, parse `m:`/`s:`
    /// fields, populate in-memory; push trackers using the parsed ts (or
    /// `now` if missing). Drop users missing a role.
    pub async fn rebuild_from_broker(&self, now: i64) {
        let room_ids = self.broker.list_rooms().await;
        let mut data = self.data.lock().expect("room-user state poisoned");
        *data = RoomUserData::new();
        for room_id in room_ids {
            let roles: HashMap<String, String> = self.broker.list_roles(&room_id).await.into_iter().collect();
            if roles.is_empty() {
                continue;
            }
            let statuses = self.broker.list_statuses(&room_id).await;
            let mut latest_ts = now;
            for (user_id, role) in &roles {
                data.rooms.entry(room_id.clone()).or_default().insert(
                    user_id.clone(),
                    UserEntry {
                        role: role.clone(),
                        status: String::new(),
                        generation: 0,
                        last_ts: now,
                    },
                );
            }
            for (user_id, ts, status, generation) in statuses {
                if !roles.contains_key(&user_id) {
                    continue;
                }
                if let Some(room) = data.rooms.get_mut(&room_id) {
                    if let Some(entry) = room.get_mut(&user_id) {
                        entry.status = status.clone();
                        entry.generation = generation;
                        entry.last_ts = ts;
                    }
                }
                if !status.is_empty() {
                    data.user_tracker.insert(user_id.clone(), (room_id.clone(), ts));
                    data.user_heap.push(Reverse((ts, user_id)));
                }
                latest_ts = latest_ts.max(ts);
            }
            data.room_tracker.insert(room_id.clone(), latest_ts);
            data.room_heap.push(Reverse((latest_ts, room_id)));
        }
    }

    pub fn get_user(&self, room_id: &str, user_id: &str) -> Option<UserEntry> {
        self.data
            .lock()
            .expect("room-user state poisoned")
            .get_user(room_id, user_id)
            .cloned()
    }
}

/// In-memory [`RoomUserBroker`] test double.
pub mod memory {
    use super::RoomUserBroker;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Tables {
        roles: HashMap<String, HashMap<String, String>>,
        statuses: HashMap<String, HashMap<String, (i64, String, u64)>>,
        room_ts: HashMap<String, i64>,
    }

    #[derive(Default)]
    pub struct MemoryRoomUserBroker {
        tables: Mutex<Tables>,
    }

    impl MemoryRoomUserBroker {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait::async_trait]
    impl RoomUserBroker for MemoryRoomUserBroker {
        async fn set_role(&self, room_id: &str, user_id: &str, role: &str) {
            self.tables
                .lock()
                .expect("broker mutex poisoned")
                .roles
                .entry(room_id.to_owned())
                .or_default()
                .insert(user_id.to_owned(), role.to_owned());
        }

        async fn set_status(&self, room_id: &str, user_id: &str, ts: i64, status: &str, generation: u64) {
            self.tables
                .lock()
                .expect("broker mutex poisoned")
                .statuses
                .entry(room_id.to_owned())
                .or_default()
                .insert(user_id.to_owned(), (ts, status.to_owned(), generation));
        }

        async fn delete_role(&self, room_id: &str, user_id: &str) {
            if let Some(room) = self.tables.lock().expect("broker mutex poisoned").roles.get_mut(room_id) {
                room.remove(user_id);
            }
        }

        async fn delete_status(&self, room_id: &str, user_id: &str) {
            if let Some(room) = self.tables.lock().expect("broker mutex poisoned").statuses.get_mut(room_id) {
                room.remove(user_id);
            }
        }

        async fn set_room_ts(&self, room_id: &str, ts: i64) {
            self.tables
                .lock()
                .expect("broker mutex poisoned")
                .room_ts
                .insert(room_id.to_owned(), ts);
        }

        async fn delete_room(&self, room_id: &str) {
            let mut tables = self.tables.lock().expect("broker mutex poisoned");
            tables.roles.remove(room_id);
            tables.statuses.remove(room_id);
            tables.room_ts.remove(room_id);
        }

        async fn list_rooms(&self) -> Vec<String> {
            self.tables.lock().expect("broker mutex poisoned").room_ts.keys().cloned().collect()
        }

        async fn list_roles(&self, room_id: &str) -> Vec<(String, String)> {
            self.tables
                .lock()
                .expect("broker mutex poisoned")
                .roles
                .get(room_id)
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default()
        }

        async fn list_statuses(&self, room_id: &str) -> Vec<(String, i64, String, u64)> {
            self.tables
                .lock()
                .expect("broker mutex poisoned")
                .statuses
                .get(room_id)
                .map(|m| m.iter().map(|(uid, (ts, status, gen))| (uid.clone(), *ts, status.clone(), *gen)).collect())
                .unwrap_or_default()
        }
    }
}

pub use memory::MemoryRoomUserBroker;
