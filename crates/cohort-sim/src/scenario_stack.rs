/// Stack scenario: an outsider stacks a parent on a group through a
/// temporary link, a late joiner recovers the hierarchy, and the stack is
/// undone again.
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use cohort_protocol::{Address, GroupChannel, GroupName};
use cohort_transport::MemoryNetwork;

use crate::scenario_common::{
    descriptor, run_step, spawn_nodes, wait_snapshot, wait_until, ScenarioResult,
    SimSettings,
};

const CHILD: &str = "stack-child";
const PARENT: &str = "stack-parent";

pub async fn run(settings: &SimSettings) -> anyhow::Result<ScenarioResult> {
    let net = MemoryNetwork::new();
    let mut result = ScenarioResult::new("stack", &net);
    // child members, one outsider, one late joiner
    let mut nodes = spawn_nodes(&net, settings, settings.nodes.max(2) + 2);
    let late = nodes.pop().ok_or_else(|| anyhow::anyhow!("no late joiner"))?;
    let outsider = nodes.pop().ok_or_else(|| anyhow::anyhow!("no outsider"))?;
    nodes.sort_by(|a, b| b.fitness.total_cmp(&a.fitness));
    let received = Arc::new(AtomicUsize::new(0));

    let leader = Address::from(nodes[0].name.as_str());
    let mut channels: Vec<GroupChannel> = Vec::new();
    let (opened, members, counter, first) = (&mut channels, &nodes, &received, &leader);
    let step = run_step("form child group", move || async move {
        for n in members {
            let channel = n
                .node
                .connect(descriptor(CHILD, n.fitness, counter))
                .await
                .map_err(|e| format!("{}: {e}", n.name))?;
            wait_snapshot(&channel, |s| s.supervisor.as_ref() == Some(first)).await?;
            opened.push(channel);
        }
        Ok(format!("{} members under {first}", opened.len()))
    })
    .await;
    if !result.add(step) {
        result.finalize();
        return Ok(result);
    }
    let parent = GroupName::from(PARENT);

    // ── Outsider stacks the parent ──────────────────────────────────
    let step = run_step("outsider stacks parent", || async {
        match outsider.node.stack(PARENT, CHILD).await {
            Ok(true) => {}
            other => return Err(format!("stack returned {other:?}")),
        }
        if !outsider.node.groups().is_empty() {
            return Err("outsider kept its link open".into());
        }
        Ok(String::new())
    })
    .await;
    result.add(step);

    let step = run_step("ledger replicated", || async {
        for channel in &channels {
            wait_snapshot(channel, |s| s.parents.contains(&parent)).await?;
        }
        if !net.members(PARENT).contains(&leader) {
            return Err(format!("{leader} is not present in {PARENT}"));
        }
        Ok(format!("{} members list {PARENT}", channels.len()))
    })
    .await;
    result.add(step);

    // ── Late joiner asks for the hierarchy ──────────────────────────
    let step = run_step("late joiner recovers hierarchy", || async {
        let channel = late
            .node
            .connect(descriptor(CHILD, -1.0, &received))
            .await
            .map_err(|e| e.to_string())?;
        wait_snapshot(&channel, |s| s.parents.contains(&parent)).await?;
        Ok(String::new())
    })
    .await;
    result.add(step);

    // ── Undo ────────────────────────────────────────────────────────
    let step = run_step("reverse stack", || async {
        match nodes[0].node.reverse_stack(PARENT, CHILD).await {
            Ok(true) => {}
            other => return Err(format!("reverse_stack returned {other:?}")),
        }
        for channel in &channels {
            wait_snapshot(channel, |s| s.parents.is_empty()).await?;
        }
        // the parent had only the supervisor's link in it
        wait_until("parent to dissolve", || {
            !net.groups().iter().any(|g| g == PARENT)
        })
        .await?;
        Ok(String::new())
    })
    .await;
    result.add(step);

    for n in nodes.iter().chain([&outsider, &late]) {
        n.node.shutdown().await;
    }
    result.finalize();
    Ok(result)
}
