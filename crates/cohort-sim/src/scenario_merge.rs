/// Merge scenario: two groups, one absorbed into the other. The destination's
/// supervisor is also a member of the source and stays where it is.
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use cohort_protocol::{Address, GroupName};
use cohort_transport::MemoryNetwork;

use crate::scenario_common::{
    descriptor, run_step, spawn_nodes, wait_snapshot, wait_until, ScenarioResult,
    SimNode, SimSettings,
};

const SOURCE: &str = "merge-src";
const DESTINATION: &str = "merge-dst";

/// Connect `members` to `group` in order; the first one ends up supervising.
async fn form(
    group: &str,
    members: &[&SimNode],
    fitness: impl Fn(&SimNode) -> f64,
    received: &Arc<AtomicUsize>,
) -> Result<(), String> {
    let leader = members
        .first()
        .map(|n| Address::from(n.name.as_str()))
        .ok_or("empty group")?;
    for n in members {
        let channel = n
            .node
            .connect(descriptor(group, fitness(n), received))
            .await
            .map_err(|e| format!("{}: {e}", n.name))?;
        wait_snapshot(&channel, |s| s.supervisor.as_ref() == Some(&leader)).await?;
    }
    Ok(())
}

pub async fn run(settings: &SimSettings) -> anyhow::Result<ScenarioResult> {
    let net = MemoryNetwork::new();
    let mut result = ScenarioResult::new("merge", &net);
    let mut nodes = spawn_nodes(&net, settings, settings.nodes.max(3));
    nodes.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
    let received = Arc::new(AtomicUsize::new(0));

    // the host supervises the destination with a fitness no migrating
    // member can beat, and only follows in the source
    let host = &nodes[0];
    let source: Vec<&SimNode> = nodes[1..].iter().chain(std::iter::once(host)).collect();
    let everyone: Vec<Address> = {
        let mut all: Vec<Address> = nodes.iter().map(|n| Address::from(n.name.as_str())).collect();
        all.sort();
        all
    };

    let step = run_step("form destination", || async {
        form(DESTINATION, &[host], |_| 1000.0, &received).await?;
        Ok(format!("{} supervises {DESTINATION}", host.name))
    })
    .await;
    if !result.add(step) {
        result.finalize();
        return Ok(result);
    }

    let step = run_step("form source", || async {
        let fitness = |n: &SimNode| if n.name == host.name { 0.0 } else { n.fitness };
        form(SOURCE, &source, fitness, &received).await?;
        Ok(format!("{} members", source.len()))
    })
    .await;
    if !result.add(step) {
        result.finalize();
        return Ok(result);
    }

    // ── Merge ───────────────────────────────────────────────────────
    let requester = &source[0].node;
    let step = run_step("merge source into destination", || async {
        match requester.merge(DESTINATION, SOURCE).await {
            Ok(true) => Ok(String::new()),
            other => Err(format!("merge returned {other:?}")),
        }
    })
    .await;
    result.add(step);

    let step = run_step("source dissolved", || async {
        wait_until("source to disappear", || {
            !net.groups().iter().any(|g| g == SOURCE)
        })
        .await?;
        wait_until("destination to hold everyone", || {
            net.members(DESTINATION) == everyone
        })
        .await?;
        Ok(format!("{} members in {DESTINATION}", everyone.len()))
    })
    .await;
    result.add(step);

    let step = run_step("host still supervises", || async {
        let channel = host
            .node
            .channel(&GroupName::from(DESTINATION))
            .ok_or("host lost its destination channel")?;
        wait_snapshot(&channel, |s| s.is_supervisor && s.members.len() == everyone.len()).await?;
        Ok(String::new())
    })
    .await;
    result.add(step);

    for n in &nodes {
        n.node.shutdown().await;
    }
    result.finalize();
    Ok(result)
}
