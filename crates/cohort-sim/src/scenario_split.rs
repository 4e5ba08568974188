/// Split scenario: the supervisor spins off single members into numbered
/// subgroups, and a degenerate split changes nothing.
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use cohort_protocol::{Address, GroupChannel};
use cohort_transport::MemoryNetwork;

use crate::scenario_common::{
    descriptor, run_step, spawn_nodes, wait_snapshot, wait_until, ScenarioResult,
    SimSettings,
};

const GROUP: &str = "split";

pub async fn run(settings: &SimSettings) -> anyhow::Result<ScenarioResult> {
    let net = MemoryNetwork::new();
    let mut result = ScenarioResult::new("split", &net);
    let mut nodes = spawn_nodes(&net, settings, settings.nodes.max(3));
    nodes.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
    let received = Arc::new(AtomicUsize::new(0));
    let size = nodes.len();

    let leader = Address::from(nodes[0].name.as_str());
    let mut supervisor_channel: Option<GroupChannel> = None;
    let (slot, members, counter, first) = (&mut supervisor_channel, &nodes, &received, &leader);
    let step = run_step("form group", move || async move {
        for n in members {
            let channel = n
                .node
                .connect(descriptor(GROUP, n.fitness, counter))
                .await
                .map_err(|e| format!("{}: {e}", n.name))?;
            wait_snapshot(&channel, |s| s.supervisor.as_ref() == Some(first)).await?;
            slot.get_or_insert(channel);
        }
        Ok(format!("{} members", members.len()))
    })
    .await;
    let formed = result.add(step);
    let Some(sup) = supervisor_channel.filter(|_| formed) else {
        result.finalize();
        return Ok(result);
    };
    let supervisor = &nodes[0].node;

    let step = run_step("degenerate split is a no-op", || async {
        for count in [0, size] {
            match supervisor.split(GROUP, count).await {
                Ok(false) => {}
                other => return Err(format!("split({count}) returned {other:?}")),
            }
        }
        let counter = sup.snapshot().split_counter;
        if counter == 0 {
            Ok(String::new())
        } else {
            Err(format!("counter moved to {counter}"))
        }
    })
    .await;
    result.add(step);

    // ── Two single-member splits ────────────────────────────────────
    for round in 1..=2u32 {
        if round as usize >= size {
            break;
        }
        let subgroup = format!("{GROUP}_{round}");
        let remaining = size - round as usize;
        let step = run_step(&format!("split into {subgroup}"), || async {
            let ok = supervisor
                .split(GROUP, 1)
                .await
                .map_err(|e| e.to_string())?;
            if !ok {
                return Err("supervisor reported failure".into());
            }
            wait_until(&subgroup, || net.members(&subgroup).len() == 1).await?;
            let snap = wait_snapshot(&sup, |s| s.members.len() == remaining).await?;
            if snap.split_counter != round {
                return Err(format!("split counter {} != {round}", snap.split_counter));
            }
            let moved = net.members(&subgroup);
            Ok(format!("{:?} moved", moved))
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
