//! The pull-based contract to whatever owns the room's participants. Nothing read through it is cached; every call
//! asks again.

use crate::id::PeerId;
use serde::{
    Deserialize,
    Serialize,
};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        Mutex,
    },
};
use strum::{
    Display,
    EnumString,
};

#[derive(Debug, Clone, Copy, Default, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    #[default]
    Member,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: PeerId,
    pub name: String,
    pub role: Role,
    /// Still in the game. Inactive participants keep their connection but cannot be voted for.
    pub active: bool,
}

impl Participant {
    pub fn member(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: Role::Member,
            active: true,
        }
    }

    pub fn host(id: impl Into<PeerId>, name: impl Into<String>) -> Self {
        Self {
            role: Role::Host,
            ..Self::member(id, name)
        }
    }
}

pub const DEFAULT_LIVES: u32 = 3;

pub trait RosterSource: Send + Sync + 'static {
    fn local_id(&self) -> PeerId;

    fn room_code(&self) -> Option<String>;

    fn role(&self) -> Role {
        Role::Member
    }

    /// Every member of the room. The host is reported separately.
    fn participants(&self) -> Vec<Participant>;

    fn host(&self) -> Option<Participant> {
        None
    }

    fn language(&self) -> String {
        "en".into()
    }

    fn is_voting_phase(&self) -> bool {
        false
    }

    fn has_voted(&self) -> bool {
        false
    }

    fn current_turn(&self) -> Option<PeerId> {
        None
    }

    fn next_turn(&self) -> Option<PeerId> {
        None
    }

    fn lives_for(&self, _id: &PeerId) -> Option<u32> {
        None
    }

    /// Told whenever the local microphone is switched on or off.
    fn on_media_state_change(&self, _microphone_on: bool) {}
}

#[derive(Debug)]
struct RosterData {
    local_id: PeerId,
    room_code: Option<String>,
    role: Role,
    participants: Vec<Participant>,
    host: Option<Participant>,
    language: Option<String>,
    voting_phase: bool,
    has_voted: bool,
    current_turn: Option<PeerId>,
    next_turn: Option<PeerId>,
    lives: HashMap<PeerId, u32>,
    media_reports: Vec<bool>,
}

/// A roster held in memory, for embedding and tests. Clones share the same data.
#[derive(Debug, Clone)]
pub struct StaticRoster {
    data: Arc<Mutex<RosterData>>,
}

impl StaticRoster {
    pub fn new(local_id: impl Into<PeerId>, room_code: impl Into<String>) -> Self {
        let data = RosterData {
            local_id: local_id.into(),
            room_code: Some(room_code.into()),
            role: Role::default(),
            participants: Vec::new(),
            host: None,
            language: None,
            voting_phase: false,
            has_voted: false,
            current_turn: None,
            next_turn: None,
            lives: HashMap::new(),
            media_reports: Vec::new(),
        };
        Self {
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn set_role(&self, role: Role) {
        self.data.lock().unwrap().role = role;
    }

    pub fn set_room_code(&self, room_code: Option<String>) {
        self.data.lock().unwrap().room_code = room_code;
    }

    /// Adds or replaces a member.
    pub fn upsert(&self, participant: Participant) {
        let mut data = self.data.lock().unwrap();
        match data.participants.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => *existing = participant,
            None => data.participants.push(participant),
        }
    }

    pub fn remove(&self, id: &PeerId) {
        self.data.lock().unwrap().participants.retain(|p| &p.id != id);
    }

    pub fn set_host(&self, host: Option<Participant>) {
        self.data.lock().unwrap().host = host;
    }

    pub fn set_language(&self, language: impl Into<String>) {
        self.data.lock().unwrap().language = Some(language.into());
    }

    pub fn set_voting(&self, voting_phase: bool, has_voted: bool) {
        let mut data = self.data.lock().unwrap();
        data.voting_phase = voting_phase;
        data.has_voted = has_voted;
    }

    pub fn set_turns(&self, current: Option<PeerId>, next: Option<PeerId>) {
        let mut data = self.data.lock().unwrap();
        data.current_turn = current;
        data.next_turn = next;
    }

    pub fn set_lives(&self, id: impl Into<PeerId>, lives: u32) {
        self.data.lock().unwrap().lives.insert(id.into(), lives);
    }

    /// Every microphone state reported through [`RosterSource::on_media_state_change`], oldest first.
    pub fn media_reports(&self) -> Vec<bool> {
        self.data.lock().unwrap().media_reports.clone()
    }
}

impl RosterSource for StaticRoster {
    fn local_id(&self) -> PeerId {
        self.data.lock().unwrap().local_id.clone()
    }

    fn room_code(&self) -> Option<String> {
        self.data.lock().unwrap().room_code.clone()
    }

    fn role(&self) -> Role {
        self.data.lock().unwrap().role
    }

    fn participants(&self) -> Vec<Participant> {
        self.data.lock().unwrap().participants.clone()
    }

    fn host(&self) -> Option<Participant> {
        self.data.lock().unwrap().host.clone()
    }

    fn language(&self) -> String {
        self.data.lock().unwrap().language.clone().unwrap_or_else(|| "en".into())
    }

    fn is_voting_phase(&self) -> bool {
        self.data.lock().unwrap().voting_phase
    }

    fn has_voted(&self) -> bool {
        self.data.lock().unwrap().has_voted
    }

    fn current_turn(&self) -> Option<PeerId> {
        self.data.lock().unwrap().current_turn.clone()
    }

    fn next_turn(&self) -> Option<PeerId> {
        self.data.lock().unwrap().next_turn.clone()
    }

    fn lives_for(&self, id: &PeerId) -> Option<u32> {
        self.data.lock().unwrap().lives.get(id).copied()
    }

    fn on_media_state_change(&self, microphone_on: bool) {
        self.data.lock().unwrap().media_reports.push(microphone_on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn new_roster_knows_only_itself_and_its_room() {
        let roster = StaticRoster::new("ana", "room-7");
        assert_eq!(roster.local_id(), PeerId::from("ana"));
        assert_eq!(roster.room_code(), Some("room-7".to_string()));
        assert_eq!(roster.role(), Role::default());
        assert!(roster.participants().is_empty());
        assert_eq!(roster.host(), None);
    }

    #[test]
    fn clones_share_membership() {
        let roster = StaticRoster::new("ana", "room-7");
        let view = roster.clone();
        roster.upsert(Participant::member("ben", "Ben"));
        roster.upsert(Participant::member("ben", "Benjamin"));
        assert_eq!(view.participants().len(), 1);
        assert_eq!(view.participants()[0].name, "Benjamin");
        roster.remove(&"ben".into());
        assert!(view.participants().is_empty());
    }
}
