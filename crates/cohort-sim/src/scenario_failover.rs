/// Failover scenario: the supervisor leaves, the next fittest takes over; a
/// follower loses its session and rejoins on its own.
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use cohort_protocol::{Address, GroupChannel, GroupName, GroupState};
use cohort_transport::MemoryNetwork;

use crate::scenario_common::{
    descriptor, run_step, spawn_nodes, wait_snapshot, wait_until, ScenarioResult,
    SimSettings,
};

const GROUP: &str = "failover";

pub async fn run(settings: &SimSettings) -> anyhow::Result<ScenarioResult> {
    let net = MemoryNetwork::new();
    let mut result = ScenarioResult::new("failover", &net);
    let mut nodes = spawn_nodes(&net, settings, settings.nodes);
    nodes.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
    let received = Arc::new(AtomicUsize::new(0));

    // ── Fittest first, then the rest ────────────────────────────────
    let first = Address::from(nodes[0].name.as_str());
    let mut channels: Vec<GroupChannel> = Vec::new();
    let (opened, members, counter, leader) = (&mut channels, &nodes, &received, &first);
    let step = run_step("sequential connect", move || async move {
        for n in members {
            let channel = n
                .node
                .connect(descriptor(GROUP, n.fitness, counter))
                .await
                .map_err(|e| format!("{}: {e}", n.name))?;
            wait_snapshot(&channel, |s| s.supervisor.as_ref() == Some(leader)).await?;
            opened.push(channel);
        }
        Ok(format!("{} members under {leader}", opened.len()))
    })
    .await;
    if !result.add(step) {
        result.finalize();
        return Ok(result);
    }

    // ── Supervisor leaves ───────────────────────────────────────────
    let second = Address::from(nodes[1].name.as_str());
    let step = run_step("supervisor disconnects", || async {
        if nodes[0].node.disconnect(&GroupName::from(GROUP)).await {
            Ok(format!("{first} left"))
        } else {
            Err(format!("{first} had no channel"))
        }
    })
    .await;
    result.add(step);

    let step = run_step("next fittest takes over", || async {
        for channel in &channels[1..] {
            wait_snapshot(channel, |s| {
                s.state == GroupState::Active && s.supervisor.as_ref() == Some(&second)
            })
            .await?;
        }
        Ok(format!("supervisor {second}"))
    })
    .await;
    result.add(step);

    // ── A follower loses its session ────────────────────────────────
    if let Some(victim) = nodes.last().filter(|_| nodes.len() > 2) {
        let victim_addr = Address::from(victim.name.as_str());
        let expected = nodes.len() - 1;
        let step = run_step("follower session loss", || async {
            if !net.lose_session(&victim_addr, GROUP) {
                return Err(format!("{victim_addr} was not in {GROUP}"));
            }
            wait_until("victim to rejoin", || {
                net.members(GROUP).contains(&victim_addr) && net.members(GROUP).len() == expected
            })
            .await?;
            let channel = channels.last().ok_or("no channel for victim")?;
            wait_snapshot(channel, |s| {
                s.state == GroupState::Active && s.supervisor.as_ref() == Some(&second)
            })
            .await?;
            Ok(format!("{victim_addr} rejoined"))
        })
        .await;
        result.add(step);
    }

    for n in &nodes {
        n.node.shutdown().await;
    }
    result.finalize();
    Ok(result)
}
