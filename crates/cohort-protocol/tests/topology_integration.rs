/// Integration tests: stack, reverse-stack, merge and split across groups.
///
/// Each test builds one or more settled groups on a shared `MemoryNetwork`,
/// runs a topology operation through `Node`, and checks both the network
/// membership and the published channel snapshots.
use std::time::Duration;

use cohort_protocol::{
    Address, ChannelSnapshot, CohortConfig, CohortError, ConstantFitness, FitnessFunctions,
    GroupChannel, GroupDescriptor, GroupName, GroupState, Message, Node, ProtocolEvent, Role,
    RoleSpec, SplitCriterion,
};
use cohort_transport::MemoryNetwork;
use tokio::time::timeout;

/// Honors RUST_LOG; quiet by default.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

fn config() -> CohortConfig {
    init_tracing();
    CohortConfig {
        join_settle_delay: Duration::from_millis(50),
        supervisor_left_delay: Duration::from_millis(50),
        random_delay_bound: Duration::from_millis(20),
        election_timeout: Duration::from_millis(200),
        migration_delay: Duration::from_millis(20),
        operation_timeout: Duration::from_secs(2),
        ..CohortConfig::default()
    }
}

struct Idle;

#[async_trait::async_trait]
impl Role for Idle {
    async fn on_application_message(&mut self, _channel: &GroupChannel, _message: Message) {}
}

/// Split fitness that answers both criteria.
struct Tagged {
    fitness: f64,
    flag: bool,
}

impl FitnessFunctions for Tagged {
    fn supervisor_fitness(&self) -> f64 {
        self.fitness
    }

    fn integer_split_fitness(&self) -> Result<i64, CohortError> {
        Ok(self.fitness as i64)
    }

    fn boolean_split_fitness(&self) -> Result<bool, CohortError> {
        Ok(self.flag)
    }
}

fn descriptor(group: &str, fitness: f64) -> GroupDescriptor {
    GroupDescriptor::new(group)
        .with_supervisor_role(RoleSpec::new("supervisor", || Idle))
        .with_follower_role(RoleSpec::new("follower", || Idle))
        .with_fitness(ConstantFitness(fitness))
}

fn addr(s: &str) -> Address {
    Address::from(s)
}

async fn settled(
    channel: &GroupChannel,
    pred: impl FnMut(&ChannelSnapshot) -> bool,
) -> ChannelSnapshot {
    timeout(Duration::from_secs(30), channel.wait_for(pred))
        .await
        .expect("condition not reached in time")
        .expect("channel closed")
}

/// Poll the network until `check` holds.
async fn eventually(mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(30), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("network never reached the expected shape");
}

/// Bring up `group` with the given members; the first one supervises.
async fn group(
    net: &MemoryNetwork,
    name: &str,
    members: &[(&str, f64)],
) -> Vec<(Node, GroupChannel)> {
    let mut out = Vec::new();
    let supervisor = addr(members[0].0);
    for (member, fitness) in members {
        let node = Node::new(net.endpoint(*member), config());
        let channel = node.connect(descriptor(name, *fitness)).await.unwrap();
        settled(&channel, |s| s.supervisor.as_ref() == Some(&supervisor)).await;
        out.push((node, channel));
    }
    out
}

// ── Split ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn split_moves_one_member_into_first_subgroup() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0), ("c", 1.0)]).await;
    let (a, ga) = &g[0];

    // ── Step 1: split off one member ──
    assert!(a.split("G", 1).await.unwrap());

    // ── Step 2: the network reflects the move ──
    eventually(|| net.members("G").len() == 2 && net.members("G_1").len() == 1).await;
    let moved = net.members("G_1");
    assert_ne!(moved[0], addr("a"));
    assert!(!net.members("G").contains(&moved[0]));

    // ── Step 3: the supervisor's ledger advanced ──
    let snap = settled(ga, |s| s.members.len() == 2).await;
    assert_eq!(snap.split_counter, 1);
    assert_eq!(snap.state, GroupState::Active);
    assert!(snap.is_supervisor);

    // the migrated node now runs G_1 on its own
    let (mover, _) = g.iter().find(|(n, _)| n.address() == moved[0]).unwrap();
    eventually(|| mover.groups() == vec![GroupName::from("G_1")]).await;
    let sub = mover.channel(&GroupName::from("G_1")).unwrap();
    settled(&sub, |s| s.is_supervisor).await;
}

#[tokio::test(start_paused = true)]
async fn split_with_degenerate_count_is_noop() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0), ("c", 1.0)]).await;
    let (a, ga) = &g[0];

    assert!(!a.split("G", 0).await.unwrap());
    assert!(!a.split("G", 3).await.unwrap());
    assert!(!a.split("G", 10).await.unwrap());

    assert_eq!(ga.snapshot().split_counter, 0);
    assert_eq!(net.members("G").len(), 3);
    assert_eq!(net.groups(), vec!["G".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn successive_splits_use_fresh_subgroups() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0), ("c", 1.0), ("d", 0.5)]).await;
    let (a, ga) = &g[0];

    // wait for the supervisor's own view so the next pick skips the mover
    assert!(a.split("G", 1).await.unwrap());
    settled(ga, |s| s.members.len() == 3).await;
    assert!(a.split("G", 1).await.unwrap());
    settled(ga, |s| s.members.len() == 2).await;

    assert_eq!(net.members("G_1").len(), 1);
    assert_eq!(net.members("G_2").len(), 1);
    assert_eq!(ga.snapshot().split_counter, 2);
}

#[tokio::test(start_paused = true)]
async fn split_requested_by_follower_is_forwarded() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0)]).await;
    let (a, ga) = &g[0];
    let (b, _) = &g[1];

    // b is the only candidate, so it moves as part of its own request
    assert!(b.split("G", 1).await.unwrap());
    eventually(|| net.members("G_1") == vec![addr("b")]).await;
    eventually(|| b.groups() == vec![GroupName::from("G_1")]).await;

    let snap = settled(ga, |s| s.members.len() == 1).await;
    assert_eq!(snap.split_counter, 1);
    assert_eq!(a.groups(), vec![GroupName::from("G")]);
}

#[tokio::test(start_paused = true)]
async fn second_order_to_migrating_member_is_declined_at_once() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0)]).await;
    let (a, _) = &g[0];

    // both requests pick b; the second reaches it mid-migration
    let started = tokio::time::Instant::now();
    let (first, second) = tokio::join!(a.split("G", 1), a.split("G", 1));
    let mut outcomes = vec![first.unwrap(), second.unwrap()];
    outcomes.sort();
    assert_eq!(outcomes, vec![false, true]);
    assert!(started.elapsed() < config().operation_timeout);

    eventually(|| net.members("G_1") == vec![addr("b")] || net.members("G_2") == vec![addr("b")])
        .await;
    eventually(|| net.members("G") == vec![addr("a")]).await;
}

#[tokio::test(start_paused = true)]
async fn split_never_moves_a_link_channel() {
    let net = MemoryNetwork::new();
    let parent = group(&net, "P", &[("p", 9.0), ("q", 1.0)]).await;
    let (p, pp) = &parent[0];
    let c = group(&net, "C", &[("s", 9.0), ("f", 1.0)]).await;
    let (s, _) = &c[0];

    // ── Step 1: s sits in P as C's link ──
    assert!(s.stack("P", "C").await.unwrap());
    settled(pp, |snap| snap.links == vec![addr("s")] && snap.members.len() == 3).await;

    // ── Step 2: only the participant is eligible ──
    assert!(p.split("P", 1).await.unwrap());
    eventually(|| net.members("P_1") == vec![addr("q")]).await;
    settled(pp, |snap| snap.members == vec![addr("p"), addr("s")]).await;

    // ── Step 3: with just the link left, splitting is a no-op ──
    assert!(!p.split("P", 1).await.unwrap());
    assert!(net.members("P").contains(&addr("s")));
    assert!(s.groups().contains(&GroupName::from("P")));
}

// ── Fitness split ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn boolean_fitness_split_moves_flagged_members() {
    let net = MemoryNetwork::new();
    let members = [("a", 9.0, false), ("b", 3.0, true), ("c", 2.0, false), ("d", 1.0, true)];
    let mut nodes = Vec::new();
    for (name, fitness, flag) in members {
        let node = Node::new(net.endpoint(name), config());
        let d = GroupDescriptor::new("G")
            .with_supervisor_role(RoleSpec::new("supervisor", || Idle))
            .with_follower_role(RoleSpec::new("follower", || Idle))
            .with_fitness(Tagged { fitness, flag });
        let channel = node.connect(d).await.unwrap();
        settled(&channel, |s| s.supervisor == Some(addr("a"))).await;
        nodes.push((node, channel));
    }

    let (a, _) = &nodes[0];
    assert!(a.split_by_fitness("G", SplitCriterion::Boolean).await.unwrap());

    eventually(|| net.members("G_1") == vec![addr("b"), addr("d")]).await;
    eventually(|| net.members("G") == vec![addr("a"), addr("c")]).await;

    // b has the higher fitness of the two movers
    let (b, _) = &nodes[1];
    let sub = b.channel(&GroupName::from("G_1")).unwrap();
    settled(&sub, |s| s.is_supervisor && s.members.len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn integer_fitness_split_uses_threshold() {
    let net = MemoryNetwork::new();
    let members = [("a", 9.0), ("b", 5.0), ("c", 4.0), ("d", 7.0)];
    let mut nodes = Vec::new();
    for (name, fitness) in members {
        let node = Node::new(net.endpoint(name), config());
        let d = GroupDescriptor::new("G")
            .with_supervisor_role(RoleSpec::new("supervisor", || Idle))
            .with_follower_role(RoleSpec::new("follower", || Idle))
            .with_fitness(Tagged {
                fitness,
                flag: false,
            });
        let channel = node.connect(d).await.unwrap();
        settled(&channel, |s| s.supervisor == Some(addr("a"))).await;
        nodes.push((node, channel));
    }

    let (a, _) = &nodes[0];
    assert!(a
        .split_by_fitness("G", SplitCriterion::AtLeast(5))
        .await
        .unwrap());

    // the supervisor never moves, even though it qualifies
    eventually(|| net.members("G_1") == vec![addr("b"), addr("d")]).await;
    eventually(|| net.members("G") == vec![addr("a"), addr("c")]).await;
}

#[tokio::test(start_paused = true)]
async fn fitness_split_without_callback_fails_fast() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0)]).await;
    let (a, ga) = &g[0];
    let mut events = a.subscribe();

    let err = a
        .split_by_fitness("G", SplitCriterion::Boolean)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CohortError::NotImplemented {
            callback: "boolean_split_fitness"
        }
    ));

    let mut reported = false;
    while let Ok(event) = events.try_recv() {
        reported |= matches!(event, ProtocolEvent::Error { .. });
    }
    assert!(reported);
    assert_eq!(ga.snapshot().split_counter, 0);
    assert_eq!(net.members("G").len(), 2);
}

// ── Merge ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn merge_moves_everyone_and_dissolves_source() {
    let net = MemoryNetwork::new();

    // ── Step 1: H is supervised by h ──
    let h = Node::new(net.endpoint("h"), config());
    let hh = h.connect(descriptor("H", 50.0)).await.unwrap();
    settled(&hh, |s| s.is_supervisor).await;

    // ── Step 2: G = {g, h, x}, supervised by g ──
    let g = Node::new(net.endpoint("g"), config());
    let gg = g.connect(descriptor("G", 9.0)).await.unwrap();
    settled(&gg, |s| s.is_supervisor).await;
    let hg = h.connect(descriptor("G", 2.0)).await.unwrap();
    settled(&hg, |s| s.supervisor == Some(addr("g"))).await;
    let x = Node::new(net.endpoint("x"), config());
    let xg = x.connect(descriptor("G", 1.0)).await.unwrap();
    settled(&xg, |s| s.supervisor == Some(addr("g"))).await;

    // ── Step 3: merge G into H ──
    assert!(g.merge("H", "G").await.unwrap());

    // ── Step 4: G is gone, H holds everyone, h still supervises ──
    eventually(|| !net.groups().contains(&"G".to_string())).await;
    eventually(|| net.members("H") == vec![addr("g"), addr("h"), addr("x")]).await;
    assert_eq!(net.groups(), vec!["H".to_string()]);

    let snap = settled(&hh, |s| s.members.len() == 3).await;
    assert!(snap.is_supervisor);
    for node in [&g, &x] {
        eventually(|| node.groups() == vec![GroupName::from("H")]).await;
        let channel = node.channel(&GroupName::from("H")).unwrap();
        settled(&channel, |s| s.supervisor == Some(addr("h"))).await;
    }
    assert_eq!(h.groups(), vec![GroupName::from("H")]);
}

#[tokio::test(start_paused = true)]
async fn merge_uses_registered_destination_descriptor() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0)]).await;
    let (a, _) = &g[0];
    let (b, _) = &g[1];

    // b enters H with its own H fitness, high enough to supervise
    b.register(descriptor("H", 100.0));
    assert!(a.merge("H", "G").await.unwrap());

    eventually(|| net.members("H") == vec![addr("a"), addr("b")]).await;
    let bh = b.channel(&GroupName::from("H")).unwrap();
    settled(&bh, |s| s.is_supervisor).await;
    let ah = a.channel(&GroupName::from("H")).unwrap();
    settled(&ah, |s| s.supervisor == Some(addr("b"))).await;
}

#[tokio::test(start_paused = true)]
async fn merge_into_self_is_refused() {
    let net = MemoryNetwork::new();
    let g = group(&net, "G", &[("a", 9.0), ("b", 2.0)]).await;
    let (a, ga) = &g[0];

    assert!(!a.merge("G", "G").await.unwrap());
    assert_eq!(net.members("G").len(), 2);
    assert_eq!(ga.state(), GroupState::Active);
}

// ── Stack ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn outsider_stacks_parent_through_temporary_link() {
    let net = MemoryNetwork::new();
    let p = Node::new(net.endpoint("p"), config());
    let pp = p.connect(descriptor("P", 5.0)).await.unwrap();
    settled(&pp, |s| s.is_supervisor).await;
    let c = group(&net, "C", &[("s", 9.0), ("f", 1.0)]).await;
    let (s, sc) = &c[0];
    let (_, fc) = &c[1];

    // ── Step 1: an outsider asks C to stack under P ──
    let o = Node::new(net.endpoint("o"), config());
    assert!(o.stack("P", "C").await.unwrap());

    // ── Step 2: the outsider's link is gone ──
    assert!(o.groups().is_empty());
    eventually(|| !net.members("C").contains(&addr("o"))).await;

    // ── Step 3: C's ledger names P on every member ──
    let snap = settled(sc, |snap| !snap.parents.is_empty()).await;
    assert_eq!(snap.parents, vec![GroupName::from("P")]);
    settled(fc, |snap| snap.parents == vec![GroupName::from("P")]).await;

    // C's supervisor is present in P without taking part in its election
    assert_eq!(net.members("P"), vec![addr("p"), addr("s")]);
    assert!(s.groups().contains(&GroupName::from("P")));
    settled(&pp, |snap| snap.is_supervisor && snap.members.len() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn follower_stack_request_is_forwarded() {
    let net = MemoryNetwork::new();
    let c = group(&net, "C", &[("s", 9.0), ("f", 1.0)]).await;
    let (_, sc) = &c[0];
    let (f, _) = &c[1];

    assert!(f.stack("P", "C").await.unwrap());
    let snap = settled(sc, |snap| !snap.parents.is_empty()).await;
    assert_eq!(snap.parents, vec![GroupName::from("P")]);

    // stacking again is idempotent
    assert!(f.stack("P", "C").await.unwrap());
    assert_eq!(sc.snapshot().parents.len(), 1);
    // a group is never its own parent
    assert!(!f.stack("C", "C").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn reverse_stack_releases_parent_link() {
    let net = MemoryNetwork::new();
    let p = Node::new(net.endpoint("p"), config());
    let pp = p.connect(descriptor("P", 5.0)).await.unwrap();
    settled(&pp, |s| s.is_supervisor).await;
    let c = group(&net, "C", &[("s", 9.0), ("f", 1.0)]).await;
    let (s, sc) = &c[0];
    let (_, fc) = &c[1];

    assert!(s.stack("P", "C").await.unwrap());
    eventually(|| net.members("P").len() == 2).await;

    // ── Step 1: undo it ──
    assert!(s.reverse_stack("P", "C").await.unwrap());

    // ── Step 2: ledger cleared everywhere, link gone ──
    settled(sc, |snap| snap.parents.is_empty()).await;
    settled(fc, |snap| snap.parents.is_empty()).await;
    eventually(|| net.members("P") == vec![addr("p")]).await;
    eventually(|| s.groups() == vec![GroupName::from("C")]).await;
}

#[tokio::test(start_paused = true)]
async fn late_joiner_recovers_hierarchy() {
    let net = MemoryNetwork::new();
    let c = group(&net, "C", &[("s", 9.0), ("f", 1.0), ("g", 0.5)]).await;
    let (s, sc) = &c[0];

    assert!(s.stack("P", "C").await.unwrap());
    assert!(s.split("C", 1).await.unwrap());
    settled(sc, |snap| snap.split_counter == 1).await;

    let z = Node::new(net.endpoint("z"), config());
    let zc = z.connect(descriptor("C", 0.1)).await.unwrap();
    let snap = settled(&zc, |snap| {
        snap.split_counter == 1 && !snap.parents.is_empty() && snap.supervisor.is_some()
    })
    .await;
    assert_eq!(snap.parents, vec![GroupName::from("P")]);
    assert_eq!(snap.supervisor, Some(addr("s")));
}

#[tokio::test(start_paused = true)]
async fn new_supervisor_takes_over_parent_link() {
    let net = MemoryNetwork::new();
    let p = Node::new(net.endpoint("p"), config());
    let pp = p.connect(descriptor("P", 5.0)).await.unwrap();
    settled(&pp, |snap| snap.is_supervisor).await;
    let c = group(&net, "C", &[("s", 9.0), ("f", 1.0)]).await;
    let (s, _) = &c[0];
    let (f, fc) = &c[1];

    assert!(s.stack("P", "C").await.unwrap());
    eventually(|| net.members("P") == vec![addr("p"), addr("s")]).await;

    // ── Step 1: C's supervisor leaves ──
    assert!(s.disconnect(&GroupName::from("C")).await);

    // ── Step 2: f takes over C and with it the link into P ──
    settled(fc, |snap| snap.is_supervisor && snap.parents == vec![GroupName::from("P")]).await;
    eventually(|| net.members("P") == vec![addr("f"), addr("p")]).await;
    eventually(|| s.groups().is_empty()).await;
    assert!(f.groups().contains(&GroupName::from("P")));
}

// ── Timeouts ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn request_to_unsupervised_group_times_out() {
    let net = MemoryNetwork::new();
    let f = Node::new(net.endpoint("f"), config());
    let follower_only = GroupDescriptor::new("C").with_follower_role(RoleSpec::new("f", || Idle));
    let fc = f.connect(follower_only).await.unwrap();
    assert_eq!(fc.supervisor_id(), None);

    let o = Node::new(net.endpoint("o"), config());
    let started = tokio::time::Instant::now();
    assert!(!o.stack("P", "C").await.unwrap());
    assert!(started.elapsed() >= config().operation_timeout);
    assert!(o.groups().is_empty());
    assert!(!net.groups().contains(&"P".to_string()));
}
