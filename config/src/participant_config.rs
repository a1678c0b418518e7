use eyre::{
    OptionExt as _,
    Result,
};

/// Identity of the local participant within a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantConfig {
    pub peer_id: String,
    pub room_code: String,
}

impl ParticipantConfig {
    pub fn new(config: &super::Config) -> Result<Self> {
        let room_code = config.room_code.trim();
        if room_code.is_empty() {
            eyre::bail!("No room code provided");
        }
        let peer_id = match &config.peer_id {
            Some(peer_id) if !peer_id.trim().is_empty() => peer_id.trim().to_string(),
            _ => generate_peer_id()?,
        };
        Ok(Self {
            peer_id,
            room_code: room_code.to_string(),
        })
    }
}

pub fn generate_peer_id() -> Result<String> {
    names::Generator::with_naming(names::Name::Numbered)
        .next()
        .ok_or_eyre("Failed to generate a peer id")
}
