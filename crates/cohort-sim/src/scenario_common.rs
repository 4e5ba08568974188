/// Common types and helpers for the simulated scenarios.
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cohort_protocol::{
    ChannelSnapshot, CohortConfig, ConstantFitness, GroupChannel, GroupDescriptor, Message, Node,
    RetryPolicy, Role, RoleSpec,
};
use cohort_transport::MemoryNetwork;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// How long any single wait in a scenario may take.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(15);

/// How long a whole step may take.
pub const STEP_LIMIT: Duration = Duration::from_secs(60);

/// Settings shared by every scenario of one run.
#[derive(Debug, Clone)]
pub struct SimSettings {
    pub nodes: usize,
    pub seed: u64,
    pub config: CohortConfig,
}

impl SimSettings {
    pub fn new(nodes: usize, seed: u64) -> Self {
        Self {
            nodes: nodes.max(2),
            seed,
            config: CohortConfig::default()
                .with_join_settle_delay(Duration::from_millis(50))
                .with_supervisor_left_delay(Duration::from_millis(50))
                .with_random_delay_bound(Duration::from_millis(25))
                .with_election_timeout(Duration::from_millis(250))
                .with_migration_delay(Duration::from_millis(30))
                .with_operation_timeout(Duration::from_secs(3))
                .with_retry(RetryPolicy {
                    max_attempts: 4,
                    base_delay: Duration::from_millis(20),
                    max_delay: Duration::from_millis(200),
                }),
        }
    }

    /// Distinct fitness values for `count` nodes, reproducible from the seed.
    pub fn fitness_values(&self, count: usize) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut values: Vec<f64> = Vec::with_capacity(count);
        while values.len() < count {
            let f = (rng.random_range(0.0..100.0_f64) * 100.0).round() / 100.0;
            if !values.contains(&f) {
                values.push(f);
            }
        }
        values
    }
}

/// Outcome of one scenario step, with the group layout it left behind.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub elapsed_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Group name → member count on the network once the step finished.
    pub layout: BTreeMap<String, usize>,
}

impl StepResult {
    fn layout_line(&self) -> String {
        if self.layout.is_empty() {
            return "no groups".into();
        }
        self.layout
            .iter()
            .map(|(group, members)| format!("{group}:{members}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Steps of one scenario run against one network.
pub struct ScenarioResult {
    pub scenario: String,
    pub steps: Vec<StepResult>,
    pub total_ms: f64,
    network: MemoryNetwork,
    started: Instant,
}

#[derive(Serialize)]
struct ScenarioRecord<'a> {
    event: &'static str,
    scenario: &'a str,
    passed: usize,
    failed: usize,
    total_ms: f64,
    steps: &'a [StepResult],
}

impl ScenarioResult {
    pub fn new(scenario: &str, network: &MemoryNetwork) -> Self {
        Self {
            scenario: scenario.into(),
            steps: Vec::new(),
            total_ms: 0.0,
            network: network.clone(),
            started: Instant::now(),
        }
    }

    /// Record a step and the layout it produced. Returns whether it passed
    /// so later steps can bail out.
    pub fn add(&mut self, mut step: StepResult) -> bool {
        step.layout = self
            .network
            .groups()
            .into_iter()
            .map(|group| {
                let members = self.network.members(&group).len();
                (group, members)
            })
            .collect();
        let ok = step.ok;
        self.steps.push(step);
        ok
    }

    pub fn finalize(&mut self) {
        self.total_ms = self.started.elapsed().as_secs_f64() * 1000.0;
    }

    pub fn passed(&self) -> usize {
        self.steps.iter().filter(|s| s.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.steps.len() - self.passed()
    }

    pub fn success(&self) -> bool {
        self.failed() == 0
    }

    pub fn print_summary(&self) {
        let verdict = if self.success() { "PASS" } else { "FAIL" };
        eprintln!(
            "\n[{verdict}] {}: {}/{} steps in {:.1}ms",
            self.scenario,
            self.passed(),
            self.steps.len(),
            self.total_ms
        );
        for step in &self.steps {
            let mark = if step.ok { " ok" } else { "FAIL" };
            eprintln!("  [{mark}] {} ({:.1}ms)", step.step, step.elapsed_ms);
            eprintln!("         groups: {}", step.layout_line());
            if let Some(detail) = &step.detail {
                eprintln!("         {detail}");
            }
        }
    }

    pub fn emit_jsonl(&self) {
        let record = ScenarioRecord {
            event: "scenario",
            scenario: &self.scenario,
            passed: self.passed(),
            failed: self.failed(),
            total_ms: self.total_ms,
            steps: &self.steps,
        };
        if let Ok(json) = serde_json::to_string(&record) {
            println!("{json}");
        }
    }
}

/// Run one step under [`STEP_LIMIT`]. A step that hangs fails instead of
/// stalling the run.
pub async fn run_step<F, Fut>(name: &str, f: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<String, String>>,
{
    let start = Instant::now();
    let outcome = tokio::time::timeout(STEP_LIMIT, f())
        .await
        .unwrap_or_else(|_| Err(format!("step exceeded {STEP_LIMIT:?}")));
    let (ok, detail) = match outcome {
        Ok(detail) => (true, Some(detail).filter(|d| !d.is_empty())),
        Err(detail) => (false, Some(detail)),
    };
    StepResult {
        step: name.into(),
        ok,
        elapsed_ms: start.elapsed().as_secs_f64() * 1000.0,
        detail,
        layout: BTreeMap::new(),
    }
}

/// Wait until `channel`'s snapshot satisfies `pred`.
pub async fn wait_snapshot(
    channel: &GroupChannel,
    pred: impl FnMut(&ChannelSnapshot) -> bool,
) -> Result<ChannelSnapshot, String> {
    tokio::time::timeout(STEP_TIMEOUT, channel.wait_for(pred))
        .await
        .map_err(|_| format!("timeout waiting on {}", channel.group()))?
        .map_err(|e| e.to_string())
}

/// Poll `check` until it holds.
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) -> Result<(), String> {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .map_err(|_| format!("timeout waiting for {what}"))
}

/// Role that counts application messages. Scenarios only need the roles to
/// exist; the count shows traffic reached them.
pub struct CountingRole {
    received: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Role for CountingRole {
    async fn on_application_message(&mut self, _channel: &GroupChannel, _message: Message) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }
}

/// Descriptor with both roles and a constant fitness.
pub fn descriptor(group: &str, fitness: f64, received: &Arc<AtomicUsize>) -> GroupDescriptor {
    let sup = Arc::clone(received);
    let fol = Arc::clone(received);
    GroupDescriptor::new(group)
        .with_supervisor_role(RoleSpec::new("supervisor", move || CountingRole {
            received: Arc::clone(&sup),
        }))
        .with_follower_role(RoleSpec::new("follower", move || CountingRole {
            received: Arc::clone(&fol),
        }))
        .with_fitness(ConstantFitness(fitness))
}

/// One simulated device.
pub struct SimNode {
    pub name: String,
    pub fitness: f64,
    pub node: Node,
}

/// Spawn `count` nodes named `n0`, `n1`, … on `net`.
pub fn spawn_nodes(net: &MemoryNetwork, settings: &SimSettings, count: usize) -> Vec<SimNode> {
    settings
        .fitness_values(count)
        .into_iter()
        .enumerate()
        .map(|(i, fitness)| {
            let name = format!("n{i}");
            let node = Node::new(net.endpoint(name.as_str()), settings.config.clone());
            SimNode {
                name,
                fitness,
                node,
            }
        })
        .collect()
}

/// The node with the highest fitness.
pub fn fittest(nodes: &[SimNode]) -> Option<&SimNode> {
    nodes.iter().max_by(|a, b| a.fitness.total_cmp(&b.fitness))
}
