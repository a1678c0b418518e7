use eyre::{
    OptionExt as _,
    Result,
};
use futures::future::join_all;
use meshcall_config::{
    generate_peer_id,
    Args,
    Command,
    Config,
    PartialBackgroundConfig,
    ParticipantConfig,
};
use meshcall_session::{
    devices::{
        DeviceManager,
        FakeBackend,
    },
    pipeline::{
        MediaPipeline,
        PartialStageConfig,
        StageKind,
    },
    roster::{
        Participant,
        StaticRoster,
    },
    signaling::{
        LocalSignalingHub,
        SignalingClient,
        WebSocketSignaling,
    },
    transport::SimulatedNetwork,
    PeerId,
    SessionController,
};
use std::{
    sync::Arc,
    time::Duration,
};

const REPORT_INTERVAL: Duration = Duration::from_secs(2);

pub struct App {
    config: Config,
    command: Command,
}

impl App {
    pub fn new(args: Args) -> Result<Self> {
        let command = args.command.clone().unwrap_or(Command::Simulate {
            participants: 3,
            seconds: 10,
            blur: false,
        });
        let config = Config::new(args)?;
        config.validate()?;
        Ok(Self { config, command })
    }

    pub async fn run(self) -> Result<()> {
        match self.command.clone() {
            Command::Simulate {
                participants,
                seconds,
                blur,
            } => self.simulate(participants, seconds, blur).await,
            Command::Join { participants, seconds } => self.join(participants, seconds).await,
        }
    }

    /// Local participant ids: the configured one first, generated names for the rest.
    fn participant_ids(&self, count: usize) -> Result<(String, Vec<PeerId>)> {
        let participant = ParticipantConfig::new(&self.config)?;
        let mut ids = vec![PeerId::new(participant.peer_id)];
        while ids.len() < count {
            let id = PeerId::new(generate_peer_id()?);
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok((participant.room_code, ids))
    }

    async fn start_session(
        &self,
        roster: StaticRoster,
        signaling: Arc<dyn SignalingClient>,
        network: &SimulatedNetwork,
    ) -> Result<SessionController> {
        let backend = FakeBackend::new(&self.config.fake_media, self.config.pipeline);
        let pipeline = MediaPipeline::with_builtin_stages(&self.config).await?;
        let session = SessionController::new(
            Arc::new(roster),
            DeviceManager::new(Arc::new(backend)),
            pipeline,
            signaling,
            Arc::new(network.clone()),
            self.config.connection,
        );
        session.enable().await?;
        info!(peer = %session.local_id(), devices = ?session.list_devices().await?, "participant joined");
        Ok(session)
    }

    #[instrument(level = "debug", skip(self))]
    async fn simulate(&self, participants: usize, seconds: u64, blur: bool) -> Result<()> {
        let (room_code, ids) = self.participant_ids(participants.max(1))?;
        let hub = LocalSignalingHub::new();
        let network = SimulatedNetwork::new();
        info!(room = %room_code, participants = ids.len(), "starting simulated mesh");

        let mut sessions = Vec::with_capacity(ids.len());
        for id in &ids {
            let roster = StaticRoster::new(id.clone(), room_code.clone());
            for member in &ids {
                roster.upsert(Participant::member(member.clone(), member.to_string()));
            }
            let signaling = Arc::new(hub.client(id.clone()));
            sessions.push(self.start_session(roster, signaling, &network).await?);
        }

        let runtime = Duration::from_secs(seconds);
        let effects = async {
            if !blur {
                return std::future::pending().await;
            }
            tokio::time::sleep(runtime / 2).await;
            if let Err(e) = enable_blur(&sessions[0]).await {
                warn!("failed to enable background blur: {e}");
            }
            std::future::pending::<()>().await
        };
        tokio::select! {
            _ = tokio::time::sleep(runtime) => info!("simulation finished"),
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = report(&sessions) => {}
            _ = effects => {}
        }

        shutdown(&sessions).await;
        info!(relayed = hub.relayed().len(), "signaling messages relayed");
        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn join(&self, participants: usize, seconds: Option<u64>) -> Result<()> {
        let url = self
            .config
            .signaling_url
            .clone()
            .ok_or_eyre("No signaling url configured")?;
        let (room_code, ids) = self.participant_ids(participants.max(1))?;
        let network = SimulatedNetwork::new();

        let mut sessions = Vec::with_capacity(ids.len());
        for id in &ids {
            let signaling = Arc::new(WebSocketSignaling::connect(&url, id.clone()).await?);
            // the relay announces everyone else
            let roster = StaticRoster::new(id.clone(), room_code.clone());
            roster.upsert(Participant::member(id.clone(), id.to_string()));
            sessions.push(self.start_session(roster, signaling, &network).await?);
        }

        let deadline = async {
            match seconds {
                Some(seconds) => tokio::time::sleep(Duration::from_secs(seconds)).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = deadline => info!("leaving room"),
            _ = tokio::signal::ctrl_c() => info!("interrupted"),
            _ = report(&sessions) => {}
        }

        shutdown(&sessions).await;
        Ok(())
    }
}

async fn enable_blur(session: &SessionController) -> Result<()> {
    session
        .update_stage_config(
            StageKind::Background,
            PartialStageConfig::Background(PartialBackgroundConfig::blur()),
        )
        .await?;
    session.set_stage_enabled(StageKind::Background, true).await?;
    info!(peer = %session.local_id(), "background blur enabled");
    Ok(())
}

/// Logs every connection of every session, forever.
async fn report(sessions: &[SessionController]) {
    let mut ticker = tokio::time::interval(REPORT_INTERVAL);
    loop {
        ticker.tick().await;
        for session in sessions {
            let output = session.pipeline().current_output();
            debug!(
                peer = %session.local_id(),
                version = output.version,
                effects = ?output.effects,
                feeds = session.feeds().len(),
                "local media"
            );
            for (remote, snapshot) in session.pool().snapshots() {
                info!(
                    peer = %session.local_id(),
                    %remote,
                    state = %snapshot.state,
                    role = %snapshot.role,
                    quality = %snapshot.quality,
                    negotiations = snapshot.negotiations,
                    "connection"
                );
            }
        }
    }
}

async fn shutdown(sessions: &[SessionController]) {
    join_all(sessions.iter().map(|session| session.disable())).await;
    debug!(sessions = sessions.len(), "all sessions disabled");
}
