//! Scripted in-process room used by `huddle demo`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use huddle_client_core::config::Config;
use huddle_client_core::ids::RoomId;
use huddle_client_core::media::SyntheticDevices;
use huddle_client_core::peer::LoopbackNetwork;
use huddle_client_core::registry::TeardownReport;
use huddle_client_core::room::{RoomCollaborators, RoomHandle, RoomSession, RoomSnapshot};
use huddle_client_core::signaling::{LocalSignalingHub, SignalingClient, WsSignalingClient};
use huddle_client_core::telemetry;
use huddle_client_core::view::HeadlessSurface;
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DemoOptions {
    pub room: RoomId,
    pub participants: u16,
    pub websocket: bool,
    pub hold: Duration,
}

struct Participant {
    handle: RoomHandle,
    surface: Arc<HeadlessSurface>,
}

pub async fn run(config: Config, options: DemoOptions) -> Result<()> {
    let network = LoopbackNetwork::new();
    let hub = LocalSignalingHub::new();
    let expected = usize::from(options.participants) - 1;

    println!("room {} ({})", options.room, config.share_link(&options.room));
    println!("dial policy: {}", config.dial_policy);

    let mut participants = Vec::with_capacity(usize::from(options.participants));
    for _ in 0..options.participants {
        let signaling: Arc<dyn SignalingClient> = if options.websocket {
            Arc::new(WsSignalingClient::from_config(&config))
        } else {
            Arc::new(hub.client())
        };
        let surface = Arc::new(HeadlessSurface::new());
        let collaborators = RoomCollaborators {
            devices: Arc::new(SyntheticDevices::new()),
            signaling,
            connector: Arc::new(network.connector()),
            surface: surface.clone(),
        };
        let handle = RoomSession::enter(config.clone(), options.room.clone(), collaborators)
            .await
            .context("failed to enter room")?;
        println!("+ {} joined", handle.participant_id());
        participants.push(Participant { handle, surface });
        tokio::time::sleep(options.hold).await;
    }

    for participant in &participants {
        wait_until(&participant.handle, "full mesh", |snapshot| {
            snapshot.connected_peers() == expected
        })
        .await?;
    }
    print_rosters(&participants);

    let (first, rest) = participants
        .split_first()
        .ok_or_else(|| anyhow!("demo needs at least one participant"))?;
    let host_id = first.handle.participant_id().clone();
    let muted = first.handle.toggle_audio().await?;
    first.handle.rename("Host").await?;
    println!("~ {host_id} renamed to Host (muted: {muted})");
    for participant in rest {
        wait_until(&participant.handle, "host rename", |snapshot| {
            snapshot
                .peers
                .iter()
                .any(|peer| peer.participant == host_id && peer.label == "Host")
        })
        .await?;
    }
    tokio::time::sleep(options.hold).await;

    let Some(last) = participants.pop() else {
        return Ok(());
    };
    let departed = last.handle.participant_id().clone();
    let report = last.handle.leave().await?;
    print_report(&departed.to_string(), &report);
    for participant in &participants {
        wait_until(&participant.handle, "departure", |snapshot| {
            snapshot.peers.iter().all(|peer| peer.participant != departed)
        })
        .await?;
    }
    print_rosters(&participants);

    for participant in participants {
        let id = participant.handle.participant_id().to_string();
        let report = participant.handle.leave().await?;
        print_report(&id, &report);
    }

    if telemetry::enabled() {
        for line in telemetry::summary() {
            println!("{line}");
        }
    }
    info!(target = "huddle::demo", room = %options.room, "demo finished");
    Ok(())
}

async fn wait_until(
    handle: &RoomHandle,
    what: &str,
    done: impl FnMut(&RoomSnapshot) -> bool,
) -> Result<RoomSnapshot> {
    let mut updates = handle.subscribe();
    let snapshot = tokio::time::timeout(STEP_TIMEOUT, updates.wait_for(done))
        .await
        .with_context(|| format!("{} timed out waiting for {what}", handle.participant_id()))?
        .map_err(|_| anyhow!("room task of {} ended", handle.participant_id()))?
        .clone();
    Ok(snapshot)
}

fn print_rosters(participants: &[Participant]) {
    for participant in participants {
        let snapshot = participant.handle.snapshot();
        let peers: Vec<String> = snapshot
            .peers
            .iter()
            .map(|peer| format!("{} [{:?}, {}]", peer.label, peer.state, peer.direction))
            .collect();
        println!(
            "  {} ({}) tiles={} sees: {}",
            snapshot.display_name,
            snapshot.local,
            participant.surface.len(),
            peers.join(", ")
        );
    }
}

fn print_report(participant: &str, report: &TeardownReport) {
    match serde_json::to_string(report) {
        Ok(json) => println!("- {participant} left {json}"),
        Err(_) => println!("- {participant} left {report:?}"),
    }
}
