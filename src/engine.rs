//! The assurance-contract engine: a single task owning every piece of
//! mutable project and pledge state.
//!
//! Events arrive on a FIFO queue and are processed in arrival order. UTXO
//! lookups and broadcasts run as spawned tasks whose completions re-enter
//! the queue, so one project's verification never blocks another's, while
//! within a project checks stay strictly serial. Consumers observe state
//! through mirrors of the published snapshot map and never touch the engine
//! directly.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use bitcoin::hashes::{sha256, Hash};
use bitcoin::{Amount, BlockHash, OutPoint, Txid};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::disk::{DiskEvent, DiskManager};
use crate::error::CheckError;
use crate::mirror::{Mirror, ObservableMap};
use crate::networking::utxo::UtxoEntry;
use crate::networking::{BitcoinView, ChainNotification, PeerUtxoAnswer};
use crate::pledge::Pledge;
use crate::project::{FeePolicy, Project};
use crate::wallet::WalletAdapter;
use crate::wire;

pub type ProjectId = sha256::Hash;
pub type PledgeId = sha256::Hash;

/// Where a pledge entered the system from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PledgeSource {
    Disk,
    HttpUpload,
    WalletOwn,
    ServerStatus,
}

/// Everything the engine reacts to.
pub enum Event {
    ProjectAppeared {
        path: Option<PathBuf>,
        bytes: Vec<u8>,
    },
    ProjectDisappeared {
        path: PathBuf,
    },
    PledgeAppeared {
        source: PledgeSource,
        bytes: Vec<u8>,
        reply: Option<oneshot::Sender<Result<wire::ProjectStatus, CheckError>>>,
    },
    SpendSeen {
        outpoint: OutPoint,
        spending_tx: Txid,
    },
    BlockTipChanged {
        height: u64,
        hash: BlockHash,
    },
    PeerSetChanged,
    RefreshRequested {
        project_id: ProjectId,
    },
    ClaimRequested {
        project_id: ProjectId,
        reply: Option<oneshot::Sender<Result<Txid, CheckError>>>,
    },
    UtxoCheckFinished {
        project_id: ProjectId,
        job: CheckJob,
        result: Result<Vec<PeerUtxoAnswer>, CheckError>,
    },
    BroadcastFinished {
        project_id: ProjectId,
        txid: Txid,
        result: Result<usize, CheckError>,
        reply: Option<oneshot::Sender<Result<Txid, CheckError>>>,
    },
    Shutdown,
}

/// What a finished UTXO lookup was for.
pub enum CheckJob {
    Admission {
        pledge: Box<Pledge>,
        source: PledgeSource,
        reply: Option<oneshot::Sender<Result<wire::ProjectStatus, CheckError>>>,
    },
    Recheck,
}

/// Project lifecycle as visible to consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectPhase {
    Open,
    Claimed(Txid),
    /// Startup / offline: looks like OPEN but pledging is not permitted.
    Unknown,
}

/// Outcome of the most recent revalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    InProgress,
    Ok,
    Failed(CheckError),
}

/// Immutable snapshot published through mirrors.
#[derive(Clone)]
pub struct ProjectSnapshot {
    pub project: Project,
    pub phase: ProjectPhase,
    pub check: CheckStatus,
    /// Verified-open pledges in display order.
    pub open: Vec<Pledge>,
    pub claimed: Vec<Pledge>,
}

impl ProjectSnapshot {
    pub fn total_pledged(&self) -> u64 {
        self.open
            .iter()
            .chain(self.claimed.iter())
            .map(|p| p.total_input_value())
            .sum()
    }

    /// Wire status for relays and UIs. `full` keeps transaction bytes;
    /// otherwise every pledge is scrubbed.
    pub fn to_status(&self, full: bool) -> wire::ProjectStatus {
        let pledges = self
            .open
            .iter()
            .chain(self.claimed.iter())
            .map(|p| if full { p.details().clone() } else { p.scrub().details().clone() })
            .collect();
        wire::ProjectStatus {
            id: self.project.id_hash().as_byte_array().to_vec(),
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            value_pledged_so_far: self.total_pledged(),
            pledges,
            claimed_by: match &self.phase {
                ProjectPhase::Claimed(txid) => {
                    Some(txid.as_raw_hash().as_byte_array().to_vec())
                }
                _ => None,
            },
        }
    }
}

/// Engine tuning; the network-level knobs live in the peer group config.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Peers that must announce a claim back before it counts as broadcast.
    pub min_propagation: usize,
    /// Peers that must respond to a UTXO lookup before the answer set is
    /// treated as authoritative. 1 is only acceptable on test networks.
    pub utxo_quorum: usize,
    pub fee_policy: FeePolicy,
    /// With no peer connected projects sit in `Unknown` instead of `Open`.
    pub offline: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_propagation: 2,
            utxo_quorum: 2,
            fee_policy: FeePolicy::ZeroFee,
            offline: false,
        }
    }
}

struct ProjectEntry {
    project: Project,
    path: Option<PathBuf>,
    phase: ProjectPhase,
    check: CheckStatus,
    open: BTreeMap<PledgeId, Pledge>,
    claimed: BTreeMap<PledgeId, Pledge>,
    /// Identities of revoked pledges; a late server status cannot resurrect
    /// them.
    revoked: HashSet<PledgeId>,
    /// Input outpoint -> owning open pledge.
    outpoints: HashMap<OutPoint, PledgeId>,
    /// One UTXO batch in flight per project.
    checking: bool,
    recheck_queued: bool,
    pending: VecDeque<CheckJob>,
    /// Pledges whose check hit a transient failure; retried on the next
    /// tick.
    limbo: Vec<(Pledge, PledgeSource)>,
    claim_in_flight: bool,
}

impl ProjectEntry {
    fn ordered(map: &BTreeMap<PledgeId, Pledge>) -> Vec<Pledge> {
        let mut pledges: Vec<Pledge> = map.values().cloned().collect();
        pledges.sort_by_key(|p| p.sort_key());
        pledges
    }

    fn snapshot(&self) -> ProjectSnapshot {
        ProjectSnapshot {
            project: self.project.clone(),
            phase: self.phase.clone(),
            check: self.check.clone(),
            open: Self::ordered(&self.open),
            claimed: Self::ordered(&self.claimed),
        }
    }

    fn total_pledged(&self) -> u64 {
        self.open
            .values()
            .chain(self.claimed.values())
            .map(|p| p.total_input_value())
            .sum()
    }
}

/// Cheap cloneable handle used by the relay, the CLI and event sources.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl EngineHandle {
    pub fn send(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Submit a pledge and wait for its verification verdict.
    pub async fn submit_pledge(
        &self,
        source: PledgeSource,
        bytes: Vec<u8>,
    ) -> Result<wire::ProjectStatus, CheckError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::PledgeAppeared { source, bytes, reply: Some(reply_tx) });
        reply_rx.await.map_err(|_| CheckError::Offline)?
    }

    /// Assemble, broadcast and await propagation of the claim.
    pub async fn claim(&self, project_id: ProjectId) -> Result<Txid, CheckError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Event::ClaimRequested { project_id, reply: Some(reply_tx) });
        reply_rx.await.map_err(|_| CheckError::Offline)?
    }

    pub fn refresh(&self, project_id: ProjectId) {
        self.send(Event::RefreshRequested { project_id });
    }
}

pub struct Engine {
    rx: mpsc::UnboundedReceiver<Event>,
    tx: mpsc::UnboundedSender<Event>,
    view: Arc<dyn BitcoinView>,
    wallet: Option<Arc<dyn WalletAdapter>>,
    disk: DiskManager,
    config: EngineConfig,
    projects: HashMap<ProjectId, ProjectEntry>,
    path_index: HashMap<PathBuf, ProjectId>,
    /// Pledges that arrived before their project did.
    orphans: HashMap<ProjectId, Vec<(Pledge, PledgeSource)>>,
    published: ObservableMap<ProjectId, ProjectSnapshot>,
}

impl Engine {
    pub fn new(
        view: Arc<dyn BitcoinView>,
        wallet: Option<Arc<dyn WalletAdapter>>,
        disk: DiskManager,
        config: EngineConfig,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = EngineHandle { tx: tx.clone() };
        let engine = Self {
            rx,
            tx,
            view,
            wallet,
            disk,
            config,
            projects: HashMap::new(),
            path_index: HashMap::new(),
            orphans: HashMap::new(),
            published: ObservableMap::new(),
        };
        (engine, handle)
    }

    /// Mirror of the published project snapshots. Call before `run`.
    pub fn mirror(&mut self) -> Mirror<ProjectId, ProjectSnapshot> {
        self.published.mirror()
    }

    /// The cooperative event loop. Runs until every handle is dropped or a
    /// `Shutdown` event arrives.
    pub async fn run(mut self) {
        info!("engine started");
        while let Some(event) = self.rx.recv().await {
            match event {
                Event::ProjectAppeared { path, bytes } => self.on_project(path, bytes).await,
                Event::ProjectDisappeared { path } => self.on_project_gone(path),
                Event::PledgeAppeared { source, bytes, reply } => {
                    self.on_pledge(source, bytes, reply)
                }
                Event::SpendSeen { outpoint, spending_tx } => {
                    self.on_spend(outpoint, spending_tx)
                }
                Event::BlockTipChanged { height, .. } => {
                    debug!(height, "block tip changed, rechecking");
                    self.recheck_all();
                }
                Event::PeerSetChanged => self.recheck_all(),
                Event::RefreshRequested { project_id } => self.start_recheck(project_id),
                Event::ClaimRequested { project_id, reply } => {
                    self.on_claim(project_id, reply).await
                }
                Event::UtxoCheckFinished { project_id, job, result } => {
                    self.on_check_finished(project_id, job, result).await
                }
                Event::BroadcastFinished { project_id, txid, result, reply } => {
                    self.on_broadcast_finished(project_id, txid, result, reply).await
                }
                Event::Shutdown => break,
            }
        }
        info!("engine stopped");
    }

    // ---- projects -------------------------------------------------------

    async fn on_project(&mut self, path: Option<PathBuf>, bytes: Vec<u8>) {
        let project = match Project::decode_delimited(&bytes) {
            Ok(project) => project,
            Err(e) => {
                warn!(error = %e, "rejecting project");
                return;
            }
        };
        let id = project.id_hash();
        if let Some(entry) = self.projects.get_mut(&id) {
            // Same project re-announced, e.g. a file touch.
            if let Some(p) = path {
                self.path_index.insert(p.clone(), id);
                entry.path = Some(p);
            }
            return;
        }

        let phase = match self.disk.read_claim_status(&id).await {
            Some(status) => match status.claim_tx_hash.parse::<Txid>() {
                Ok(txid) => ProjectPhase::Claimed(txid),
                Err(_) => initial_phase(&self.config, &*self.view),
            },
            None => initial_phase(&self.config, &*self.view),
        };
        info!(project = %id, title = project.title(), phase = ?phase, "project admitted");

        if let Some(p) = &path {
            self.path_index.insert(p.clone(), id);
        }
        self.projects.insert(
            id,
            ProjectEntry {
                project,
                path,
                phase,
                check: CheckStatus::Ok,
                open: BTreeMap::new(),
                claimed: BTreeMap::new(),
                revoked: HashSet::new(),
                outpoints: HashMap::new(),
                checking: false,
                recheck_queued: false,
                pending: VecDeque::new(),
                limbo: Vec::new(),
                claim_in_flight: false,
            },
        );
        self.publish(id);

        // Pledges that arrived out of order are replayed now.
        if let Some(orphans) = self.orphans.remove(&id) {
            for (pledge, source) in orphans {
                self.admit_pledge(id, pledge, source, None);
            }
        }
    }

    fn on_project_gone(&mut self, path: PathBuf) {
        let Some(id) = self.path_index.remove(&path) else { return };
        // In-flight results for this project find it missing and drop out.
        self.projects.remove(&id);
        self.published.remove(&id);
        info!(project = %id, "project removed");
    }

    // ---- pledges --------------------------------------------------------

    fn on_pledge(
        &mut self,
        source: PledgeSource,
        bytes: Vec<u8>,
        reply: Option<oneshot::Sender<Result<wire::ProjectStatus, CheckError>>>,
    ) {
        let pledge = match Pledge::decode_delimited(&bytes) {
            Ok(pledge) => pledge,
            Err(e) => {
                respond(reply, Err(e));
                return;
            }
        };
        let Some(project_id) = pledge.project_id() else {
            respond(reply, Err(CheckError::BadPledgeShape("missing project id".into())));
            return;
        };
        if !self.projects.contains_key(&project_id) {
            match source {
                PledgeSource::Disk | PledgeSource::WalletOwn => {
                    self.orphans.entry(project_id).or_default().push((pledge, source));
                    respond(reply, Err(CheckError::BadProject("project not yet known".into())));
                }
                _ => respond(reply, Err(CheckError::BadProject("unknown project".into()))),
            }
            return;
        }
        self.admit_pledge(project_id, pledge, source, reply);
    }

    /// Local admission pipeline; network checks are handed off at the end.
    fn admit_pledge(
        &mut self,
        project_id: ProjectId,
        pledge: Pledge,
        source: PledgeSource,
        reply: Option<oneshot::Sender<Result<wire::ProjectStatus, CheckError>>>,
    ) {
        let Some(entry) = self.projects.get_mut(&project_id) else { return };
        let identity = pledge.identity();

        if entry.revoked.contains(&identity) {
            respond_status(reply, entry, Err(CheckError::Conflict));
            return;
        }
        if entry.open.contains_key(&identity) {
            // Already verified; duplicate deliveries are fine.
            respond_status(reply, entry, Ok(()));
            return;
        }

        if let ProjectPhase::Claimed(_) = entry.phase {
            // Restart replay: pledges persisted before the claim belong to
            // the claimed set. Anything else is too late.
            if source == PledgeSource::Disk && !pledge.is_scrubbed() {
                entry.claimed.insert(identity, pledge);
                let id = project_id;
                self.publish(id);
            } else {
                respond_status(reply, entry, Err(CheckError::Conflict));
            }
            return;
        }

        if pledge.is_scrubbed() {
            // Scrubbed pledges only make sense as server-side state; they
            // carry no transaction to verify, so the relay's word is taken.
            if source != PledgeSource::ServerStatus {
                respond_status(
                    reply,
                    entry,
                    Err(CheckError::BadPledgeShape("scrubbed pledge from non-server source".into())),
                );
                return;
            }
            if entry.total_pledged() + pledge.total_input_value()
                > entry.project.goal_amount()
            {
                respond_status(reply, entry, Err(CheckError::GoalExceeded));
                return;
            }
            entry.open.insert(identity, pledge);
            self.publish(project_id);
            return;
        }

        if let Err(e) = entry.project.check_pledge_shape(&pledge) {
            respond_status(reply, entry, Err(e));
            return;
        }
        if entry.total_pledged() + pledge.total_input_value() > entry.project.goal_amount() {
            respond_status(reply, entry, Err(CheckError::GoalExceeded));
            return;
        }
        // Earlier arrival wins an outpoint; the engine queue fixes arrival
        // order, so a collision always rejects the newcomer.
        match pledge.outpoints() {
            Ok(outpoints) => {
                if outpoints.iter().any(|op| entry.outpoints.contains_key(op)) {
                    respond_status(reply, entry, Err(CheckError::DuplicatedOutpoint));
                    return;
                }
            }
            Err(e) => {
                respond_status(reply, entry, Err(e));
                return;
            }
        }

        entry.pending.push_back(CheckJob::Admission { pledge: Box::new(pledge), source, reply });
        self.pump_checks(project_id);
    }

    /// Start the next queued UTXO batch for a project, if none is running.
    fn pump_checks(&mut self, project_id: ProjectId) {
        let Some(entry) = self.projects.get_mut(&project_id) else { return };
        if entry.checking {
            return;
        }
        let Some(job) = entry.pending.pop_front() else {
            let queued = entry.recheck_queued;
            entry.recheck_queued = false;
            if queued {
                self.start_recheck(project_id);
            }
            return;
        };
        let outpoints = match &job {
            CheckJob::Admission { pledge, .. } => match pledge.outpoints() {
                Ok(outpoints) => outpoints,
                Err(_) => Vec::new(),
            },
            CheckJob::Recheck => entry
                .open
                .values()
                .filter(|p| !p.is_scrubbed())
                .filter_map(|p| p.outpoints().ok())
                .flatten()
                .collect(),
        };
        if outpoints.is_empty() {
            // Nothing to look up: resolve inline.
            let _ = self.tx.send(Event::UtxoCheckFinished {
                project_id,
                job,
                result: Ok(Vec::new()),
            });
            entry.checking = true;
            entry.check = CheckStatus::InProgress;
            return;
        }
        entry.checking = true;
        entry.check = CheckStatus::InProgress;
        self.publish(project_id);

        let view = Arc::clone(&self.view);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = view
                .get_utxos(&outpoints, true)
                .await
                .map_err(CheckError::from);
            let _ = tx.send(Event::UtxoCheckFinished { project_id, job, result });
        });
    }

    async fn on_check_finished(
        &mut self,
        project_id: ProjectId,
        job: CheckJob,
        result: Result<Vec<PeerUtxoAnswer>, CheckError>,
    ) {
        if !self.projects.contains_key(&project_id) {
            // Project vanished mid-flight; drop the result.
            if let CheckJob::Admission { reply, .. } = job {
                respond(reply, Err(CheckError::BadProject("project disappeared".into())));
            }
            return;
        }

        match job {
            CheckJob::Admission { pledge, source, reply } => {
                self.finish_admission(project_id, *pledge, source, reply, result).await
            }
            CheckJob::Recheck => self.finish_recheck(project_id, result),
        }
        self.pump_checks(project_id);
    }

    async fn finish_admission(
        &mut self,
        project_id: ProjectId,
        pledge: Pledge,
        source: PledgeSource,
        reply: Option<oneshot::Sender<Result<wire::ProjectStatus, CheckError>>>,
        result: Result<Vec<PeerUtxoAnswer>, CheckError>,
    ) {
        let min_answers = self.config.utxo_quorum;
        let verdict = {
            let Some(entry) = self.projects.get_mut(&project_id) else { return };
            entry.checking = false;
            if entry.open.contains_key(&pledge.identity()) {
                // Both copies of a twice-delivered pledge got checked.
                entry.check = CheckStatus::Ok;
                respond_status(reply, entry, Ok(()));
                return;
            }
            let mut checked =
                verify_against_network(&entry.project, &pledge, result, min_answers);
            if checked.is_ok() {
                // Other pledges may have been admitted while this check was
                // in flight; the set invariants are decided against the
                // project state at insert time.
                checked = admission_still_fits(entry, &pledge);
            }
            match checked {
                Ok(()) => Ok(()),
                Err(e) if e.is_transient() => {
                    entry.check = CheckStatus::Failed(e.clone());
                    entry.limbo.push((pledge.clone(), source));
                    Err(e)
                }
                Err(e) => {
                    entry.check = CheckStatus::Failed(e.clone());
                    Err(e)
                }
            }
        };

        match verdict {
            Ok(()) => {
                let outpoints = pledge.outpoints().unwrap_or_default();
                let identity = pledge.identity();
                {
                    let entry = self
                        .projects
                        .get_mut(&project_id)
                        .expect("checked above");
                    for op in &outpoints {
                        entry.outpoints.insert(*op, identity);
                    }
                    entry.check = CheckStatus::Ok;
                    entry.open.insert(identity, pledge.clone());
                }
                info!(project = %project_id, pledge = %identity, ?source, "pledge verified open");

                // Watch the committed coins so revocations surface, and
                // keep the pledge on disk so it survives restarts.
                self.view.watch_outpoints(outpoints).await;
                if source != PledgeSource::Disk {
                    if let Err(e) = self.disk.persist_pledge(&project_id, &pledge).await {
                        warn!(error = %e, "pledge persistence failed");
                    }
                }
                self.publish(project_id);
                let entry = self.projects.get(&project_id).expect("checked above");
                respond(reply, Ok(entry.snapshot().to_status(false)));
            }
            Err(e) => {
                debug!(project = %project_id, error = %e, "pledge rejected");
                self.publish(project_id);
                respond(reply, Err(e));
            }
        }
    }

    fn finish_recheck(
        &mut self,
        project_id: ProjectId,
        result: Result<Vec<PeerUtxoAnswer>, CheckError>,
    ) {
        let mut revoked_now: Vec<PledgeId> = Vec::new();
        {
            let Some(entry) = self.projects.get_mut(&project_id) else { return };
            entry.checking = false;
            match result {
                Err(e) => {
                    entry.check = CheckStatus::Failed(e);
                }
                // An empty answer set means there was nothing to look up.
                Ok(answers) if answers.is_empty() => {
                    entry.check = CheckStatus::Ok;
                }
                // Too few peers responded to trust the answers.
                Ok(answers) if answers.len() < self.config.utxo_quorum => {
                    entry.check = CheckStatus::Failed(CheckError::Offline);
                }
                Ok(answers) => match quorum(&answers) {
                    QuorumOutcome::Inconsistent => {
                        entry.check = CheckStatus::Failed(CheckError::InconsistentUtxoAnswers);
                    }
                    QuorumOutcome::Agreed(utxos) => {
                        for (identity, pledge) in entry.open.clone() {
                            if pledge.is_scrubbed() {
                                continue;
                            }
                            let Ok(outpoints) = pledge.outpoints() else { continue };
                            let gone = outpoints
                                .iter()
                                .any(|op| utxos.get(op).map(|u| u.is_none()).unwrap_or(false));
                            if gone {
                                revoked_now.push(identity);
                            }
                        }
                        for identity in &revoked_now {
                            if let Some(pledge) = entry.open.remove(identity) {
                                entry.revoked.insert(*identity);
                                if let Ok(outpoints) = pledge.outpoints() {
                                    for op in outpoints {
                                        entry.outpoints.remove(&op);
                                    }
                                }
                            }
                        }
                        entry.check = CheckStatus::Ok;
                    }
                }
            }
        }
        for identity in &revoked_now {
            info!(project = %project_id, pledge = %identity, "pledge revoked by recheck");
        }
        self.publish(project_id);
        self.retry_limbo(project_id);
    }

    /// Re-admit pledges parked after transient failures.
    fn retry_limbo(&mut self, project_id: ProjectId) {
        let limbo = match self.projects.get_mut(&project_id) {
            Some(entry) => std::mem::take(&mut entry.limbo),
            None => return,
        };
        for (pledge, source) in limbo {
            self.admit_pledge(project_id, pledge, source, None);
        }
    }

    // ---- revocation -----------------------------------------------------

    fn on_spend(&mut self, outpoint: OutPoint, spending_tx: Txid) {
        let hit = self.projects.iter().find_map(|(id, entry)| {
            entry.outpoints.get(&outpoint).map(|pledge_id| (*id, *pledge_id))
        });
        let Some((project_id, pledge_id)) = hit else { return };
        let entry = self.projects.get_mut(&project_id).expect("found above");

        if let ProjectPhase::Claimed(claim_txid) = &entry.phase {
            if *claim_txid == spending_tx {
                return;
            }
        }
        if let Some(pledge) = entry.open.remove(&pledge_id) {
            entry.revoked.insert(pledge_id);
            if let Ok(outpoints) = pledge.outpoints() {
                for op in outpoints {
                    entry.outpoints.remove(&op);
                }
            }
            info!(project = %project_id, pledge = %pledge_id, spender = %spending_tx, "pledge revoked");
            self.publish(project_id);
        }
    }

    // ---- rechecks -------------------------------------------------------

    fn recheck_all(&mut self) {
        let targets: Vec<ProjectId> = self
            .projects
            .iter()
            .filter(|(_, e)| !matches!(e.phase, ProjectPhase::Claimed(_)))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.start_recheck(id);
        }
    }

    fn start_recheck(&mut self, project_id: ProjectId) {
        let Some(entry) = self.projects.get_mut(&project_id) else { return };
        if matches!(entry.phase, ProjectPhase::Claimed(_)) {
            return;
        }
        if entry.checking {
            entry.recheck_queued = true;
            return;
        }
        entry.pending.push_back(CheckJob::Recheck);
        self.pump_checks(project_id);
    }

    // ---- claims ---------------------------------------------------------

    async fn on_claim(
        &mut self,
        project_id: ProjectId,
        reply: Option<oneshot::Sender<Result<Txid, CheckError>>>,
    ) {
        let tx = {
            let Some(entry) = self.projects.get_mut(&project_id) else {
                respond(reply, Err(CheckError::BadProject("unknown project".into())));
                return;
            };
            if entry.claim_in_flight {
                respond(reply, Err(CheckError::Conflict));
                return;
            }
            match &entry.phase {
                ProjectPhase::Open => {}
                ProjectPhase::Claimed(txid) => {
                    respond(reply, Ok(*txid));
                    return;
                }
                ProjectPhase::Unknown => {
                    respond(reply, Err(CheckError::Offline));
                    return;
                }
            }
            let open: Vec<Pledge> = ProjectEntry::ordered(&entry.open);
            if open.iter().any(|p| p.is_scrubbed()) {
                respond(
                    reply,
                    Err(CheckError::BadPledgeShape(
                        "cannot claim from scrubbed pledges".into(),
                    )),
                );
                return;
            }
            let tx = match entry.project.assemble_contract(&open) {
                Ok(tx) => tx,
                Err(e) => {
                    respond(reply, Err(e));
                    return;
                }
            };
            entry.claim_in_flight = true;
            entry.check = CheckStatus::InProgress;
            tx
        };
        self.publish(project_id);

        let tx = match &self.wallet {
            Some(wallet) => match wallet.finalize_claim(tx, self.config.fee_policy).await {
                Ok(tx) => tx,
                Err(e) => {
                    warn!(error = %e, "claim finalization failed");
                    if let Some(entry) = self.projects.get_mut(&project_id) {
                        entry.claim_in_flight = false;
                        entry.check =
                            CheckStatus::Failed(CheckError::ClaimBroadcastFailed);
                    }
                    self.publish(project_id);
                    respond(reply, Err(CheckError::ClaimBroadcastFailed));
                    return;
                }
            },
            None => tx,
        };

        let txid = tx.compute_txid();
        info!(project = %project_id, claim = %txid, "broadcasting claim");
        let view = Arc::clone(&self.view);
        let events = self.tx.clone();
        let min_propagation = self.config.min_propagation;
        tokio::spawn(async move {
            let result = view
                .broadcast(tx, min_propagation)
                .await
                .map_err(|_| CheckError::ClaimBroadcastFailed);
            let _ = events.send(Event::BroadcastFinished { project_id, txid, result, reply });
        });
    }

    async fn on_broadcast_finished(
        &mut self,
        project_id: ProjectId,
        txid: Txid,
        result: Result<usize, CheckError>,
        reply: Option<oneshot::Sender<Result<Txid, CheckError>>>,
    ) {
        {
            let Some(entry) = self.projects.get_mut(&project_id) else {
                respond(reply, Err(CheckError::BadProject("project disappeared".into())));
                return;
            };
            entry.claim_in_flight = false;
            match result {
                Ok(peers) => {
                    info!(project = %project_id, claim = %txid, peers, "claim propagated");
                    entry.phase = ProjectPhase::Claimed(txid);
                    entry.check = CheckStatus::Ok;
                    let open = std::mem::take(&mut entry.open);
                    entry.claimed.extend(open);
                    entry.outpoints.clear();
                }
                Err(e) => {
                    // Never partially claim: everything stays open.
                    warn!(project = %project_id, error = %e, "claim broadcast failed");
                    entry.check = CheckStatus::Failed(e.clone());
                    self.publish(project_id);
                    respond(reply, Err(e));
                    return;
                }
            }
        }
        if let Err(e) = self.disk.write_claim_status(&project_id, &txid).await {
            warn!(error = %e, "claim marker write failed");
        }
        self.publish(project_id);
        respond(reply, Ok(txid));
    }

    // ---- publishing -----------------------------------------------------

    fn publish(&mut self, project_id: ProjectId) {
        if let Some(entry) = self.projects.get(&project_id) {
            let snapshot = entry.snapshot();
            self.published.insert(project_id, snapshot);
        }
    }
}

fn initial_phase(config: &EngineConfig, view: &dyn BitcoinView) -> ProjectPhase {
    if config.offline || view.peer_count() == 0 {
        ProjectPhase::Unknown
    } else {
        ProjectPhase::Open
    }
}

fn respond<T>(reply: Option<oneshot::Sender<Result<T, CheckError>>>, result: Result<T, CheckError>) {
    if let Some(reply) = reply {
        let _ = reply.send(result);
    }
}

/// Reply with the project's current (scrubbed) status, or the error.
fn respond_status(
    reply: Option<oneshot::Sender<Result<wire::ProjectStatus, CheckError>>>,
    entry: &ProjectEntry,
    result: Result<(), CheckError>,
) {
    respond(reply, result.map(|()| entry.snapshot().to_status(false)));
}

enum QuorumOutcome {
    Inconsistent,
    /// Every responding peer gave the same answer per outpoint.
    Agreed(HashMap<OutPoint, Option<UtxoEntry>>),
}

/// The quorum rule: all responding peers must agree on spent/unspent and,
/// for unspent answers, on amount and script. Heights may differ.
fn quorum(answers: &[PeerUtxoAnswer]) -> QuorumOutcome {
    let mut agreed: HashMap<OutPoint, Option<UtxoEntry>> = HashMap::new();
    for answer in answers {
        for (outpoint, entry) in &answer.utxos {
            let normalized = entry.clone().map(|mut u| {
                u.height = None;
                u
            });
            match agreed.get(outpoint) {
                None => {
                    agreed.insert(*outpoint, normalized);
                }
                Some(existing) if *existing == normalized => {}
                Some(_) => return QuorumOutcome::Inconsistent,
            }
        }
    }
    QuorumOutcome::Agreed(agreed)
}

/// Invariants another admission can break while a check is in flight: the
/// revocation tombstones, the goal cap and outpoint exclusivity are decided
/// again right before the pledge enters the open set.
fn admission_still_fits(entry: &ProjectEntry, pledge: &Pledge) -> Result<(), CheckError> {
    if entry.revoked.contains(&pledge.identity()) {
        return Err(CheckError::Conflict);
    }
    if entry.total_pledged() + pledge.total_input_value() > entry.project.goal_amount() {
        return Err(CheckError::GoalExceeded);
    }
    for outpoint in pledge.outpoints()? {
        if entry.outpoints.contains_key(&outpoint) {
            return Err(CheckError::DuplicatedOutpoint);
        }
    }
    Ok(())
}

/// Full network verdict for one pledge: quorum over its outpoints, declared
/// value against returned values, and script execution per input.
fn verify_against_network(
    project: &Project,
    pledge: &Pledge,
    result: Result<Vec<PeerUtxoAnswer>, CheckError>,
    min_answers: usize,
) -> Result<(), CheckError> {
    let answers = result?;
    // A lone responding peer is not an authoritative view of the chain
    // unless the configured quorum says so.
    if answers.len() < min_answers.max(1) {
        return Err(CheckError::Offline);
    }
    let utxos = match quorum(&answers) {
        QuorumOutcome::Inconsistent => return Err(CheckError::InconsistentUtxoAnswers),
        QuorumOutcome::Agreed(utxos) => utxos,
    };
    let tx = pledge.pledge_tx()?;
    let mut actual_total = Amount::ZERO;
    for (index, input) in tx.input.iter().enumerate() {
        let entry = utxos
            .get(&input.previous_output)
            .cloned()
            .flatten()
            .ok_or(CheckError::OutputsUnspendable)?;
        project.verify_input_script(&tx, index, entry.value, &entry.script)?;
        actual_total += entry.value;
    }
    if actual_total.to_sat() != pledge.total_input_value() {
        return Err(CheckError::BadPledgeShape(
            "declared value differs from committed coins".into(),
        ));
    }
    Ok(())
}

/// Pipe filesystem events into the engine queue.
pub fn forward_disk_events(
    handle: EngineHandle,
    mut rx: mpsc::UnboundedReceiver<DiskEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DiskEvent::ProjectFile { path, bytes } => {
                    handle.send(Event::ProjectAppeared { path: Some(path), bytes });
                }
                DiskEvent::ProjectFileRemoved { path } => {
                    handle.send(Event::ProjectDisappeared { path });
                }
                DiskEvent::PledgeFile { bytes, .. } => {
                    handle.send(Event::PledgeAppeared {
                        source: PledgeSource::Disk,
                        bytes,
                        reply: None,
                    });
                }
                DiskEvent::PledgeFileRemoved { .. } => {
                    // Disk is the user's; removing a pledge file does not
                    // revoke the pledge, only spending the stub does.
                }
            }
        }
    })
}

/// Pipe network notifications into the engine queue.
pub fn forward_chain_notifications(
    handle: EngineHandle,
    mut rx: mpsc::UnboundedReceiver<ChainNotification>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            match notification {
                ChainNotification::TipChanged { height, hash } => {
                    handle.send(Event::BlockTipChanged { height, hash });
                }
                ChainNotification::SpendSeen { outpoint, spending_tx } => {
                    handle.send(Event::SpendSeen { outpoint, spending_tx });
                }
                ChainNotification::PeerSetChanged => handle.send(Event::PeerSetChanged),
            }
        }
    })
}
