//! Switchboard Manager -- connection ranking, culling, dial selection.
//!
//! Pure decision engine, no I/O. The runtime ticks `evaluate` every
//! `eval_interval_ms` with a snapshot of its live connections and applies
//! the returned actions: shut down culled connections, dial one node,
//! activate the best open connection.

pub mod priority;
pub mod zones;

pub use priority::{NodeDescriptor, PriorityEntry, PriorityList, Tier, TierParseError};
pub use zones::ZoneDirectory;

use priority::TierLists;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Process-unique connection identifier.
pub type ConnId = u64;

/// Lifecycle of one transport connection. Closed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Windowed RTT estimates in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentPings {
    pub last: u64,
    pub min2: u64,
    pub min5: u64,
}

/// What the manager needs to know about one pool member.
#[derive(Debug, Clone)]
pub struct ConnectionSnapshot {
    pub id: ConnId,
    pub authority: String,
    pub state: ConnectionState,
    pub pings: RecentPings,
    pub last_activity: Instant,
}

/// Tuning knobs for the control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerTuning {
    #[serde(default = "default_eval_interval_ms")]
    pub eval_interval_ms: u64,
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Weighted last-RTT gap that forces a switch.
    #[serde(default = "default_switch_at_last_ms")]
    pub switch_at_last_ms: f64,
    /// Weighted min-of-2 gap that forces a switch.
    #[serde(default = "default_switch_at_min2_ms")]
    pub switch_at_min2_ms: f64,
    /// Weighted min-of-5 gap that forces a switch.
    #[serde(default = "default_switch_at_min5_ms")]
    pub switch_at_min5_ms: f64,
    /// RTT under which an open connection counts as good.
    #[serde(default = "default_satisfactory_ms")]
    pub satisfactory_ms: u64,
    /// Base delay doubled per in-flight attempt before redialing the same node.
    #[serde(default = "default_reattempt_base_ms")]
    pub reattempt_base_ms: u64,
    /// Idle grace before a surplus prioritized connection is culled.
    #[serde(default = "default_cull_timeout_ms")]
    pub cull_timeout_ms: u64,
    #[serde(default = "default_target_connections")]
    pub target_connections: usize,
    #[serde(default = "default_tier_penalty_step")]
    pub tier_penalty_step: f64,
}

fn default_eval_interval_ms() -> u64 {
    250
}
fn default_ping_interval_ms() -> u64 {
    5000
}
fn default_switch_at_last_ms() -> f64 {
    1000.0
}
fn default_switch_at_min2_ms() -> f64 {
    200.0
}
fn default_switch_at_min5_ms() -> f64 {
    50.0
}
fn default_satisfactory_ms() -> u64 {
    500
}
fn default_reattempt_base_ms() -> u64 {
    500
}
fn default_cull_timeout_ms() -> u64 {
    20_000
}
fn default_target_connections() -> usize {
    3
}
fn default_tier_penalty_step() -> f64 {
    1.2
}

impl Default for ManagerTuning {
    fn default() -> Self {
        Self {
            eval_interval_ms: default_eval_interval_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            switch_at_last_ms: default_switch_at_last_ms(),
            switch_at_min2_ms: default_switch_at_min2_ms(),
            switch_at_min5_ms: default_switch_at_min5_ms(),
            satisfactory_ms: default_satisfactory_ms(),
            reattempt_base_ms: default_reattempt_base_ms(),
            cull_timeout_ms: default_cull_timeout_ms(),
            target_connections: default_target_connections(),
            tier_penalty_step: default_tier_penalty_step(),
        }
    }
}

impl ManagerTuning {
    pub fn eval_interval(&self) -> Duration {
        Duration::from_millis(self.eval_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// Actions the runtime should take after a tick.
#[derive(Debug, Default, PartialEq)]
pub struct ManagerActions {
    /// Connections to shut down gracefully.
    pub shutdown: Vec<ConnId>,
    /// Node to dial.
    pub dial: Option<NodeDescriptor>,
    /// Best open connection; the runtime activates it if it is not already active.
    pub activate: Option<ConnId>,
}

/// Status column of the diagnostic view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Known node without a connection.
    Standby,
    Active,
    /// Open but not active.
    Spare,
    Connecting,
    Closing,
    Closed,
}

/// One row of `connection_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub status: ConnectionStatus,
    pub user_select: bool,
    pub zone: String,
    pub name: String,
    pub ping: Option<u64>,
    pub authority: String,
}

/// Ticks to wait before the next dial after `depth` consecutive dialing ticks.
///
/// No real backoff until the third consecutive attempt, then +50% per
/// attempt, capped at 16 ticks.
pub fn backoff_ticks(depth: u32) -> u32 {
    let raw = 1.5f64.powi(depth as i32 - 3).floor();
    raw.clamp(1.0, 16.0) as u32
}

struct Candidate<'a> {
    snap: &'a ConnectionSnapshot,
    penalty: Option<f64>,
    is_active: bool,
    preferred: bool,
}

/// Connection manager: known nodes, ranked priorities, dial/cull/select policy.
pub struct ConnectionManager {
    tuning: ManagerTuning,
    known: HashMap<String, NodeDescriptor>,
    tiers: TierLists,
    priorities: PriorityList,
    user_pref: Option<String>,
    tried_this_cycle: HashSet<String>,
    backoff_timer: u32,
    backoff_depth: u32,
}

impl ConnectionManager {
    pub fn new(tuning: ManagerTuning) -> Self {
        Self {
            tuning,
            known: HashMap::new(),
            tiers: TierLists::default(),
            priorities: PriorityList::default(),
            user_pref: None,
            tried_this_cycle: HashSet::new(),
            backoff_timer: 1,
            backoff_depth: 0,
        }
    }

    pub fn tuning(&self) -> &ManagerTuning {
        &self.tuning
    }

    /// Make nodes known, overwriting existing records with the same authority.
    pub fn assert_nodes(&mut self, nodes: Vec<NodeDescriptor>) {
        for node in nodes {
            self.known.insert(node.authority.clone(), node);
        }
        self.build_priorities();
    }

    /// Replace one tier's groups and rebuild the combined list.
    pub fn set_priority_list(&mut self, tier: Tier, groups: Vec<Vec<String>>) {
        self.tiers.set(tier, groups);
        self.build_priorities();
    }

    /// Set or clear the user's preferred authority.
    pub fn set_user_pref(&mut self, authority: Option<String>) {
        self.user_pref = authority.filter(|a| !a.is_empty());
        self.build_priorities();
    }

    pub fn user_pref(&self) -> Option<&str> {
        self.user_pref.as_deref()
    }

    pub fn priority_list(&self) -> &PriorityList {
        &self.priorities
    }

    pub fn known_node(&self, authority: &str) -> Option<&NodeDescriptor> {
        self.known.get(authority)
    }

    pub fn known_count(&self) -> usize {
        self.known.len()
    }

    pub fn was_tried_this_cycle(&self, authority: &str) -> bool {
        self.tried_this_cycle.contains(authority)
    }

    fn build_priorities(&mut self) {
        let mut groups = self.tiers.effective();

        if let Some(pref) = &self.user_pref {
            if self.known.contains_key(pref) {
                groups.insert(0, vec![pref.clone()]);
            }
        }

        self.priorities = PriorityList::build(&groups, &self.known, self.tuning.tier_penalty_step);
        tracing::debug!(
            candidates = self.priorities.len(),
            known = self.known.len(),
            "priorities rebuilt"
        );
    }

    /// Run one tick.
    pub fn evaluate(
        &mut self,
        connections: &[ConnectionSnapshot],
        active: Option<ConnId>,
        now: Instant,
    ) -> ManagerActions {
        let mut actions = ManagerActions::default();
        let target = self.tuning.target_connections;

        // 1. Cull
        actions.shutdown = self.cull(connections, active, target, now);

        // Culled connections are closing from here on.
        let view: Vec<ConnectionSnapshot> = connections
            .iter()
            .cloned()
            .map(|mut c| {
                if actions.shutdown.contains(&c.id) && c.state != ConnectionState::Closed {
                    c.state = ConnectionState::Closing;
                }
                c
            })
            .collect();

        // 2. Connect, rate limited
        self.backoff_timer = self.backoff_timer.saturating_sub(1);
        if self.backoff_timer == 0 {
            actions.dial = self.connect(&view, target);
            // 3. Backoff bookkeeping
            if actions.dial.is_some() {
                self.backoff_depth += 1;
                self.backoff_timer = backoff_ticks(self.backoff_depth);
            } else {
                self.backoff_depth = 0;
                self.backoff_timer = 1;
                self.tried_this_cycle.clear();
            }
        }

        // 4. Select active
        actions.activate = self.pick_best(&view, active);

        actions
    }

    /// Keep the `target` best open connections, at most one per authority.
    /// Everything else is shut down unless it is active, or it is a
    /// prioritized node's only connection and was used recently.
    fn cull(
        &self,
        connections: &[ConnectionSnapshot],
        active: Option<ConnId>,
        target: usize,
        now: Instant,
    ) -> Vec<ConnId> {
        let mut open: Vec<(&ConnectionSnapshot, Option<f64>)> = connections
            .iter()
            .filter(|c| c.state == ConnectionState::Open)
            .map(|c| {
                let score = self
                    .priorities
                    .penalty(&c.authority)
                    .map(|p| p * c.pings.min5 as f64);
                (c, score)
            })
            .collect();

        // Scored before unscored; lower score first.
        open.sort_by(|a, b| match (a.1, b.1) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => a.0.pings.min5.cmp(&b.0.pings.min5),
        });

        let cull_timeout = Duration::from_millis(self.tuning.cull_timeout_ms);
        let mut kept_auths: HashSet<&str> = HashSet::new();
        let mut shutdown = Vec::new();

        for (conn, _) in open {
            let auth = conn.authority.as_str();

            if kept_auths.len() < target && !kept_auths.contains(auth) {
                kept_auths.insert(auth);
                continue;
            }

            if Some(conn.id) == active {
                continue;
            }

            let recently_used = now.saturating_duration_since(conn.last_activity) <= cull_timeout;
            if self.priorities.contains(auth) && !kept_auths.contains(auth) && recently_used {
                continue;
            }

            tracing::info!(conn = conn.id, authority = auth, "culling connection");
            shutdown.push(conn.id);
        }

        shutdown
    }

    /// Pick a node to dial, or None if nothing needs dialing.
    fn connect(&mut self, connections: &[ConnectionSnapshot], target: usize) -> Option<NodeDescriptor> {
        let mut good: HashSet<&str> = HashSet::new();
        let mut pending: HashMap<&str, u32> = HashMap::new();
        let mut best_ping: HashMap<&str, u64> = HashMap::new();

        for conn in connections {
            let auth = conn.authority.as_str();
            let best = best_ping.entry(auth).or_insert(u64::MAX);
            *best = (*best).min(conn.pings.last);
            match conn.state {
                ConnectionState::Open if conn.pings.last < self.tuning.satisfactory_ms => {
                    good.insert(auth);
                }
                ConnectionState::Connecting => *pending.entry(auth).or_insert(0) += 1,
                _ => {}
            }
        }

        let mut so_far = 0;
        let mut connect_to: Option<&PriorityEntry> = None;
        let mut best_ignoring_failures: Option<&PriorityEntry> = None;

        for entry in self.priorities.entries() {
            if so_far >= target {
                break;
            }
            let auth = entry.node.authority.as_str();

            if good.contains(auth) {
                so_far += 1;
                continue;
            }

            if let Some(&count) = pending.get(auth) {
                let threshold = self
                    .tuning
                    .reattempt_base_ms
                    .saturating_mul(1u64 << count.min(32));
                if best_ping.get(auth).copied().unwrap_or(u64::MAX) < threshold {
                    continue;
                }
            }

            best_ignoring_failures.get_or_insert(entry);
            if !self.tried_this_cycle.contains(auth) {
                connect_to = Some(entry);
                break;
            }
        }

        let mut chosen = connect_to.map(|e| e.node.clone());
        if chosen.is_none() && so_far < target {
            if let Some(entry) = best_ignoring_failures {
                tracing::debug!(
                    authority = %entry.node.authority,
                    "candidate list exhausted, forgetting failures"
                );
                chosen = Some(entry.node.clone());
                self.tried_this_cycle.clear();
            }
        }

        let node = chosen?;
        self.tried_this_cycle.insert(node.authority.clone());
        tracing::debug!(authority = %node.authority, depth = self.backoff_depth, "dialing");
        Some(node)
    }

    /// Best open connection, or None if nothing is open.
    fn pick_best(&self, connections: &[ConnectionSnapshot], active: Option<ConnId>) -> Option<ConnId> {
        let candidates: Vec<Candidate<'_>> = connections
            .iter()
            .filter(|c| c.state == ConnectionState::Open)
            .map(|c| Candidate {
                snap: c,
                penalty: self.priorities.penalty(&c.authority),
                is_active: Some(c.id) == active,
                preferred: self.user_pref.as_deref() == Some(c.authority.as_str()),
            })
            .collect();

        candidates
            .iter()
            .max_by(|a, b| self.compare_candidates(a, b))
            .map(|c| c.snap.id)
    }

    /// Greater means `a` is the better connection.
    fn compare_candidates(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let t = &self.tuning;

        // Nodes from the current list beat everything else.
        let ord = a.penalty.is_some().cmp(&b.penalty.is_some());
        if ord != Ordering::Equal {
            return ord;
        }

        if let Some(ord) = weighted_gap(a, b, |p| p.last, t.switch_at_last_ms) {
            return ord;
        }

        let ord = a.preferred.cmp(&b.preferred);
        if ord != Ordering::Equal {
            return ord;
        }

        if let Some(ord) = weighted_gap(a, b, |p| p.min2, t.switch_at_min2_ms) {
            return ord;
        }

        if let Some(ord) = weighted_gap(a, b, |p| p.min5, t.switch_at_min5_ms) {
            return ord;
        }

        // Neither is compellingly better; stay put.
        a.is_active.cmp(&b.is_active)
    }

    /// Hook for a dialed connection reaching Open. Fast nodes lose their
    /// tried mark so they can be redialed within the same cycle.
    pub fn connection_opened(&mut self, authority: &str, pings: RecentPings) {
        if pings.last < self.tuning.satisfactory_ms / 2 {
            self.tried_this_cycle.remove(authority);
        }
    }

    /// Other in-flight dials to `authority`, made redundant by `opened`.
    pub fn redundant_attempts(
        authority: &str,
        opened: ConnId,
        connections: &[ConnectionSnapshot],
    ) -> Vec<ConnId> {
        connections
            .iter()
            .filter(|c| {
                c.id != opened && c.authority == authority && c.state == ConnectionState::Connecting
            })
            .map(|c| c.id)
            .collect()
    }

    /// Known nodes left-joined with live connections. With `all == false`
    /// only the active connection is reported.
    pub fn connection_info(
        &self,
        all: bool,
        connections: &[ConnectionSnapshot],
        active: Option<ConnId>,
    ) -> Vec<ConnectionInfo> {
        let active_snap = active.and_then(|id| connections.iter().find(|c| c.id == id));
        let mut rows = Vec::new();

        let mut push_row = |authority: &str, conn: Option<&ConnectionSnapshot>| {
            let node = self.known.get(authority);
            let status = match conn {
                None => ConnectionStatus::Standby,
                Some(c) => match c.state {
                    ConnectionState::Open if Some(c.id) == active => ConnectionStatus::Active,
                    ConnectionState::Open => ConnectionStatus::Spare,
                    ConnectionState::Connecting => ConnectionStatus::Connecting,
                    ConnectionState::Closing => ConnectionStatus::Closing,
                    ConnectionState::Closed => ConnectionStatus::Closed,
                },
            };
            rows.push(ConnectionInfo {
                status,
                user_select: self.user_pref.as_deref() == Some(authority),
                zone: node.map(|n| n.zonename.clone()).unwrap_or_default(),
                name: node.map(|n| n.shortname.clone()).unwrap_or_default(),
                ping: conn.map(|c| c.pings.last),
                authority: authority.to_string(),
            });
        };

        if all {
            for authority in self.known.keys() {
                let mut matched = connections
                    .iter()
                    .filter(|c| &c.authority == authority)
                    .peekable();
                if matched.peek().is_none() {
                    push_row(authority, None);
                }
                for conn in matched {
                    push_row(authority, Some(conn));
                }
            }
        } else if let Some(conn) = active_snap {
            push_row(&conn.authority, Some(conn));
        }

        rows.sort_by(|a, b| (&a.zone, &a.name).cmp(&(&b.zone, &b.name)));
        rows
    }
}

fn weighted_gap(
    a: &Candidate<'_>,
    b: &Candidate<'_>,
    metric: impl Fn(&RecentPings) -> u64,
    threshold: f64,
) -> Option<Ordering> {
    let (pa, pb) = (a.penalty?, b.penalty?);
    let gap = pb * metric(&b.snap.pings) as f64 - pa * metric(&a.snap.pings) as f64;
    if gap.abs() > threshold {
        Some(if gap > 0.0 {
            Ordering::Greater
        } else {
            Ordering::Less
        })
    } else {
        None
    }
}
