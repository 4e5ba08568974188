/// Election scenario: N nodes join one group at the same time and must agree
/// on the fittest of them as supervisor.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cohort_protocol::{Address, GroupChannel, GroupState, Message};
use cohort_transport::MemoryNetwork;

use crate::scenario_common::{
    descriptor, fittest, run_step, spawn_nodes, wait_snapshot, wait_until,
    ScenarioResult, SimSettings,
};

const GROUP: &str = "election";

pub async fn run(settings: &SimSettings) -> anyhow::Result<ScenarioResult> {
    let net = MemoryNetwork::new();
    let mut result = ScenarioResult::new("election", &net);
    let nodes = spawn_nodes(&net, settings, settings.nodes);
    let received = Arc::new(AtomicUsize::new(0));
    let winner = fittest(&nodes)
        .map(|n| Address::from(n.name.as_str()))
        .ok_or_else(|| anyhow::anyhow!("no nodes"))?;
    for n in &nodes {
        eprintln!("{:<4} fitness {:>6.2}", n.name, n.fitness);
    }

    // ── Everyone connects at once ───────────────────────────────────
    let mut channels: Vec<GroupChannel> = Vec::new();
    let (opened, members, counter) = (&mut channels, &nodes, &received);
    let step = run_step("concurrent connect", move || async move {
        let mut tasks = Vec::new();
        for n in members {
            let node = n.node.clone();
            let d = descriptor(GROUP, n.fitness, counter);
            tasks.push(tokio::spawn(async move { node.connect(d).await }));
        }
        for task in tasks {
            let channel = task
                .await
                .map_err(|e| format!("connect task failed: {e}"))?
                .map_err(|e| format!("connect failed: {e}"))?;
            opened.push(channel);
        }
        Ok(format!("{} channels open", opened.len()))
    })
    .await;
    if !result.add(step) {
        result.finalize();
        return Ok(result);
    }

    // ── Convergence ─────────────────────────────────────────────────
    let step = run_step("converge on fittest", || async {
        for channel in &channels {
            wait_snapshot(channel, |s| {
                s.state == GroupState::Active && s.supervisor.as_ref() == Some(&winner)
            })
            .await?;
        }
        Ok(format!("supervisor {winner}"))
    })
    .await;
    result.add(step);

    let step = run_step("single supervisor", || async {
        let supervisors = channels.iter().filter(|c| c.is_supervisor()).count();
        if supervisors == 1 {
            Ok(String::new())
        } else {
            Err(format!("{supervisors} channels claim the supervisor role"))
        }
    })
    .await;
    result.add(step);

    // ── Application traffic reaches the supervisor role ─────────────
    let step = run_step("followers reach supervisor", || async {
        let followers: Vec<&GroupChannel> =
            channels.iter().filter(|c| !c.is_supervisor()).collect();
        for channel in &followers {
            channel
                .send_to_supervisor(Message::application(1, "report"))
                .await
                .map_err(|e| e.to_string())?;
        }
        let expected = followers.len();
        wait_until("supervisor role deliveries", || {
            received.load(Ordering::Relaxed) >= expected
        })
        .await?;
        Ok(format!("{expected} messages delivered"))
    })
    .await;
    result.add(step);

    for n in &nodes {
        n.node.shutdown().await;
    }
    result.finalize();
    Ok(result)
}
