use clap::{
    Parser,
    Subcommand,
};
use std::collections::HashMap;

/// Peer-to-peer mesh video sessions with local media effects.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Room to join; overrides the stored configuration.
    #[clap(long, global = true)]
    pub room: Option<String>,

    /// Identifier of the local participant; random when omitted.
    #[clap(long, global = true)]
    pub peer_id: Option<String>,

    /// Websocket signaling relay, e.g. `wss://relay.example.com/signal`.
    #[clap(long, global = true, env = "MESHCALL_SIGNALING_URL")]
    pub signaling_url: Option<url::Url>,

    /// Synthetic capture devices: `<none>`, `<builtin>`, `<no-camera>` or `<dual-camera>`.
    #[clap(long = "fake-media", global = true)]
    pub fake_media: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run a whole mesh in-process over a simulated network.
    Simulate {
        /// Number of participants.
        #[clap(long, default_value_t = 3)]
        participants: usize,

        /// Seconds to keep the session running.
        #[clap(long, default_value_t = 10)]
        seconds: u64,

        /// Toggle background blur on the first participant midway through.
        #[clap(long)]
        blur: bool,
    },
    /// Join simulated participants to a room through the websocket signaling relay.
    Join {
        /// Number of participants this process contributes to the room.
        #[clap(long, default_value_t = 1)]
        participants: usize,

        /// Seconds to stay in the room; until interrupted when omitted.
        #[clap(long)]
        seconds: Option<u64>,
    },
}

impl config::Source for Args {
    fn clone_into_box(&self) -> Box<dyn config::Source + Send + Sync> {
        Box::new((*self).clone())
    }

    fn collect(&self) -> Result<config::Map<String, config::Value>, config::ConfigError> {
        let mut cache = HashMap::<String, config::Value>::new();
        if let Some(room) = &self.room {
            cache.insert("room_code".to_string(), room.clone().into());
        }
        if let Some(peer_id) = &self.peer_id {
            cache.insert("peer_id".to_string(), peer_id.clone().into());
        }
        if let Some(url) = &self.signaling_url {
            cache.insert("signaling_url".to_string(), url.to_string().into());
        }
        if let Some(fake_media) = &self.fake_media {
            cache.insert("fake_media".to_string(), fake_media.clone().into());
        }
        Ok(cache)
    }
}
