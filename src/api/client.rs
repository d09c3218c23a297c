//! Relay client: pulls project statuses from a project's pledge server and
//! feeds the scrubbed peer pledges into the engine.
//!
//! A project whose definition carries a `payment_url` names its relay base;
//! the status lives at `<base>/project/<hex id>`. Peer pledges arrive
//! scrubbed and are admitted under the server-status source, so revoked
//! tombstones and the goal cap still apply.

use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::{EngineHandle, Event, PledgeSource, ProjectId, ProjectSnapshot};
use crate::mirror::Mirror;
use crate::pledge::Pledge;
use crate::wire::{self, ProjectStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Fetch one project's status from its relay.
pub async fn fetch_status(
    client: &reqwest::Client,
    base: &str,
    project_id: &ProjectId,
) -> anyhow::Result<ProjectStatus> {
    let url = format!("{}/project/{project_id}", base.trim_end_matches('/'));
    let response = client.get(&url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    Ok(wire::decode_delimited(&bytes)?)
}

/// Fetch a project's server status and submit every pledge in it.
pub async fn sync_project(
    client: &reqwest::Client,
    handle: &EngineHandle,
    snapshot: &ProjectSnapshot,
) -> anyhow::Result<usize> {
    let Some(base) = snapshot.project.server_url() else { return Ok(0) };
    let status = fetch_status(client, base, &snapshot.project.id_hash()).await?;
    let count = status.pledges.len();
    for details in status.pledges {
        let pledge = Pledge::from_details(details);
        handle.send(Event::PledgeAppeared {
            source: PledgeSource::ServerStatus,
            bytes: pledge.encode_delimited(),
            reply: None,
        });
    }
    Ok(count)
}

/// Periodically pull statuses for every known project with a server.
pub fn spawn_status_poller(
    handle: EngineHandle,
    projects: Mirror<ProjectId, ProjectSnapshot>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        loop {
            for (id, snapshot) in projects.snapshot() {
                if snapshot.project.server_url().is_none() {
                    continue;
                }
                match sync_project(&client, &handle, &snapshot).await {
                    Ok(count) => debug!(project = %id, pledges = count, "server status synced"),
                    Err(e) => warn!(project = %id, error = %e, "server status fetch failed"),
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    })
}
