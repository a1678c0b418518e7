//! The ordered list of video feeds a display layer renders, assembled from the roster, the local output and the
//! peer pool.

use crate::{
    id::PeerId,
    peer::{
        PeerPool,
        QualityTag,
        RemoteStream,
    },
    pipeline::OutgoingMediaState,
    roster::{
        Participant,
        Role,
        RosterSource,
        DEFAULT_LIVES,
    },
};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone)]
pub enum FeedSource {
    Local(Arc<OutgoingMediaState>),
    /// `None` until a connection to the participant exists.
    Remote(Option<watch::Receiver<RemoteStream>>),
}

#[derive(Debug, Clone)]
pub struct FeedView {
    pub id: PeerId,
    pub name: String,
    pub is_self: bool,
    pub is_host: bool,
    pub active: bool,
    pub lives: u32,
    pub is_answering: bool,
    /// Never set together with `is_answering`.
    pub is_next_turn: bool,
    pub can_vote: bool,
    pub microphone_muted: bool,
    pub quality: QualityTag,
    pub source: FeedSource,
}

struct Turns {
    current: Option<PeerId>,
    next: Option<PeerId>,
    voting: bool,
    viewer: Role,
}

impl Turns {
    fn answering(&self, id: &PeerId) -> bool {
        self.current.as_ref() == Some(id)
    }

    fn next(&self, id: &PeerId) -> bool {
        self.next.as_ref() == Some(id) && !self.answering(id)
    }
}

/// Self first. A host then sees every member; a member sees the host followed by the other members.
pub fn assemble(
    roster: &dyn RosterSource,
    local_output: Arc<OutgoingMediaState>,
    microphone_muted: bool,
    pool: &PeerPool,
) -> Vec<FeedView> {
    let local_id = roster.local_id();
    let members = roster.participants();
    let host = roster.host();
    let turns = Turns {
        current: roster.current_turn(),
        next: roster.next_turn(),
        voting: roster.is_voting_phase(),
        viewer: roster.role(),
    };
    let lives = |id: &PeerId| roster.lives_for(id).unwrap_or(DEFAULT_LIVES);

    let host_feed = |host: &Participant, is_self: bool, source: FeedSource| FeedView {
        id: host.id.clone(),
        name: host.name.clone(),
        is_self,
        is_host: true,
        active: true,
        lives: DEFAULT_LIVES,
        is_answering: false,
        is_next_turn: false,
        can_vote: false,
        microphone_muted: is_self && microphone_muted,
        quality: if is_self { QualityTag::Direct } else { pool.quality(&host.id) },
        source,
    };
    let member_feed = |member: &Participant, is_self: bool, source: FeedSource| FeedView {
        id: member.id.clone(),
        name: member.name.clone(),
        is_self,
        is_host: false,
        active: member.active,
        lives: lives(&member.id),
        is_answering: turns.answering(&member.id),
        is_next_turn: turns.next(&member.id),
        can_vote: turns.voting && !is_self && member.active && turns.viewer == Role::Member,
        microphone_muted: is_self && microphone_muted,
        quality: if is_self { QualityTag::Direct } else { pool.quality(&member.id) },
        source,
    };
    let remote = |id: &PeerId| FeedSource::Remote(pool.remote_stream(id));

    let mut feeds = Vec::with_capacity(members.len() + 1);
    match turns.viewer {
        Role::Host => {
            let me = host
                .clone()
                .filter(|h| h.id == local_id)
                .unwrap_or_else(|| Participant::host(local_id.clone(), local_id.to_string()));
            feeds.push(host_feed(&me, true, FeedSource::Local(local_output)));
            for member in members.iter().filter(|m| m.id != local_id) {
                feeds.push(member_feed(member, false, remote(&member.id)));
            }
        }
        Role::Member => {
            if let Some(me) = members.iter().find(|m| m.id == local_id) {
                feeds.push(member_feed(me, true, FeedSource::Local(local_output)));
            }
            if let Some(host) = host.as_ref().filter(|h| h.id != local_id) {
                feeds.push(host_feed(host, false, remote(&host.id)));
            }
            for member in members.iter().filter(|m| m.id != local_id) {
                feeds.push(member_feed(member, false, remote(&member.id)));
            }
        }
    }
    feeds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        roster::StaticRoster,
        signaling::LocalSignalingHub,
        transport::SimulatedNetwork,
    };
    use meshcall_config::ConnectionConfig;
    use pretty_assertions::assert_eq;

    fn roster(local: &str, role: Role) -> StaticRoster {
        let roster = StaticRoster::new(local, "room");
        roster.set_role(role);
        roster.set_host(Some(Participant::host("gm", "Game Master")));
        roster.upsert(Participant::member("ann", "Ann"));
        roster.upsert(Participant::member("ben", "Ben"));
        roster.upsert(Participant {
            active: false,
            ..Participant::member("cid", "Cid")
        });
        roster
    }

    fn pool(local: &str) -> PeerPool {
        PeerPool::new(
            Arc::new(LocalSignalingHub::new().client(local)),
            Arc::new(SimulatedNetwork::new()),
            watch::channel(Arc::new(OutgoingMediaState::default())).1,
            ConnectionConfig::default(),
        )
    }

    fn ids(feeds: &[FeedView]) -> Vec<&str> {
        feeds.iter().map(|f| f.id.as_str()).collect()
    }

    #[tokio::test]
    async fn host_sees_every_member_after_themselves() {
        let roster = roster("gm", Role::Host);
        let feeds = assemble(&roster, Default::default(), false, &pool("gm"));
        assert_eq!(ids(&feeds), vec!["gm", "ann", "ben", "cid"]);
        assert!(feeds[0].is_self && feeds[0].is_host);
        assert!(matches!(feeds[0].source, FeedSource::Local(_)));
        assert!(feeds.iter().all(|f| !f.can_vote));
    }

    #[tokio::test]
    async fn member_sees_host_then_other_members() {
        let roster = roster("ben", Role::Member);
        roster.set_turns(Some("ann".into()), Some("ann".into()));
        roster.set_voting(true, false);
        roster.set_lives("ann", 1);

        let feeds = assemble(&roster, Default::default(), true, &pool("ben"));
        assert_eq!(ids(&feeds), vec!["ben", "gm", "ann", "cid"]);
        assert!(feeds[0].microphone_muted);

        let ann = &feeds[2];
        assert!(ann.is_answering);
        assert!(!ann.is_next_turn);
        assert_eq!(ann.lives, 1);
        assert!(ann.can_vote);
        assert_eq!(ann.quality, QualityTag::Unavailable);
        assert!(matches!(ann.source, FeedSource::Remote(None)));

        // no votes for ourselves, the host or eliminated members
        assert!(!feeds[0].can_vote);
        assert!(!feeds[1].can_vote);
        assert!(!feeds[3].can_vote);
        assert_eq!(feeds[3].lives, DEFAULT_LIVES);
    }

    #[tokio::test]
    async fn member_missing_from_the_roster_has_no_self_feed() {
        let roster = roster("zed", Role::Member);
        let feeds = assemble(&roster, Default::default(), false, &pool("zed"));
        assert_eq!(ids(&feeds), vec!["gm", "ann", "ben", "cid"]);
    }
}
