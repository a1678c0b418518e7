//! A small line-based session description carrying ICE credentials and one media section per track.

use crate::{
    error::TransportError,
    id::PeerId,
    media::{
        Track,
        TrackKind,
        TrackParams,
    },
};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: PeerId,
    pub version: u64,
    pub ice_ufrag: String,
    pub ice_restart: bool,
    /// Only the video section is described; the audio section stays as previously negotiated.
    pub video_only: bool,
    pub tracks: Vec<Track>,
}

impl SessionDescription {
    pub fn track(&self, kind: TrackKind) -> Option<&Track> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn parse(sdp: &str) -> Result<Self, TransportError> {
        let invalid = |line: &str| TransportError::InvalidDescription(line.to_string());

        let mut origin = None;
        let mut version = 0;
        let mut ice_ufrag = None;
        let mut ice_restart = false;
        let mut video_only = false;
        let mut tracks = Vec::new();

        for line in sdp.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if line == "v=0" {
                continue;
            } else if let Some(rest) = line.strip_prefix("o=") {
                let mut parts = rest.split_whitespace();
                origin = parts.next().map(PeerId::from);
                version = parts.next().and_then(|v| v.parse().ok()).ok_or_else(|| invalid(line))?;
            } else if let Some(ufrag) = line.strip_prefix("a=ice-ufrag:") {
                ice_ufrag = Some(ufrag.to_string());
            } else if line == "a=ice-restart" {
                ice_restart = true;
            } else if line == "a=partial:video" {
                video_only = true;
            } else if let Some(rest) = line.strip_prefix("m=") {
                tracks.push(parse_media(rest).ok_or_else(|| invalid(line))?);
            } else {
                return Err(invalid(line));
            }
        }

        Ok(Self {
            origin: origin.ok_or_else(|| invalid("missing o= line"))?,
            version,
            ice_ufrag: ice_ufrag.ok_or_else(|| invalid("missing a=ice-ufrag line"))?,
            ice_restart,
            video_only,
            tracks,
        })
    }
}

fn parse_media(rest: &str) -> Option<Track> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let (kind, id, codec) = (*fields.first()?, fields.get(1)?.parse().ok()?, fields.get(2)?.to_string());
    let (params, direction, label_from) = match kind {
        "video" => (
            TrackParams::Video {
                codec,
                width: fields.get(3)?.parse().ok()?,
                height: fields.get(4)?.parse().ok()?,
                frame_rate: fields.get(5)?.parse().ok()?,
            },
            *fields.get(6)?,
            7,
        ),
        "audio" => (
            TrackParams::Audio {
                codec,
                sample_rate: fields.get(3)?.parse().ok()?,
                channels: fields.get(4)?.parse().ok()?,
            },
            *fields.get(5)?,
            6,
        ),
        _ => return None,
    };
    let enabled = match direction {
        "sendrecv" => true,
        "inactive" => false,
        _ => return None,
    };
    Some(Track {
        id,
        label: fields.get(label_from..).unwrap_or_default().join(" "),
        params,
        enabled,
    })
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "v=0")?;
        writeln!(f, "o={} {}", self.origin, self.version)?;
        writeln!(f, "a=ice-ufrag:{}", self.ice_ufrag)?;
        if self.ice_restart {
            writeln!(f, "a=ice-restart")?;
        }
        if self.video_only {
            writeln!(f, "a=partial:video")?;
        }
        for track in &self.tracks {
            let direction = if track.enabled { "sendrecv" } else { "inactive" };
            match &track.params {
                TrackParams::Video {
                    codec,
                    width,
                    height,
                    frame_rate,
                } => writeln!(
                    f,
                    "m=video {} {codec} {width} {height} {frame_rate} {direction} {}",
                    track.id, track.label
                )?,
                TrackParams::Audio {
                    codec,
                    sample_rate,
                    channels,
                } => writeln!(
                    f,
                    "m=audio {} {codec} {sample_rate} {channels} {direction} {}",
                    track.id, track.label
                )?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn survives_the_wire() {
        let mut muted = Track::new("Fake Microphone 0", TrackParams::audio(48_000));
        muted.enabled = false;
        let description = SessionDescription {
            origin: "alice".into(),
            version: 3,
            ice_ufrag: "a1b2".into(),
            ice_restart: true,
            video_only: false,
            tracks: vec![Track::new("Fake Camera 0", TrackParams::video(640, 360, 30)), muted],
        };
        let parsed = SessionDescription::parse(&description.to_string()).unwrap();
        assert_eq!(parsed, description);
        assert!(!parsed.track(TrackKind::Audio).unwrap().enabled);
    }

    #[test]
    fn rejects_unknown_lines() {
        assert!(matches!(
            SessionDescription::parse("v=0\no=alice 1\na=ice-ufrag:x\nb=AS:300\n"),
            Err(TransportError::InvalidDescription(_))
        ));
        assert!(SessionDescription::parse("v=0\no=alice 1\n").is_err());
    }
}
