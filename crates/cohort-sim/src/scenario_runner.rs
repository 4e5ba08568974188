/// Scenario runner: executes the selected scenarios in sequence and produces
/// an aggregated pass/fail report.
use std::time::Instant;

use serde::Serialize;

use crate::scenario_common::{ScenarioResult, SimSettings};
use crate::{scenario_election, scenario_failover, scenario_merge, scenario_split, scenario_stack};

/// Every scenario the harness knows, in run order.
pub const ALL: &[&str] = &["election", "failover", "split", "merge", "stack"];

#[derive(Serialize)]
struct RunnerSummary {
    event: &'static str,
    nodes: usize,
    seed: u64,
    scenarios: Vec<ScenarioLine>,
    total_passed: usize,
    total_failed: usize,
    total_elapsed_s: f64,
    overall_status: &'static str,
}

#[derive(Serialize)]
struct ScenarioLine {
    scenario: String,
    status: &'static str,
    passed: usize,
    failed: usize,
    elapsed_ms: f64,
}

/// Run `names` and report. Returns whether every scenario passed.
pub async fn run(names: &[String], settings: &SimSettings, json: bool) -> anyhow::Result<bool> {
    let runner_start = Instant::now();
    eprintln!(
        "cohort-sim v{}: {} scenario(s), {} nodes, seed {}",
        env!("CARGO_PKG_VERSION"),
        names.len(),
        settings.nodes,
        settings.seed
    );

    let mut lines = Vec::new();
    let mut total_passed = 0usize;
    let mut total_failed = 0usize;
    let mut any_failure = false;

    for name in names {
        eprintln!("\n───────────────────────────────────────────");
        eprintln!("  Running scenario: {name}");
        eprintln!("───────────────────────────────────────────");
        let outcome = run_one(name, settings).await;
        match outcome {
            Ok(r) => {
                r.print_summary();
                if json {
                    r.emit_jsonl();
                }
                total_passed += r.passed();
                total_failed += r.failed();
                any_failure |= !r.success();
                lines.push(ScenarioLine {
                    scenario: name.clone(),
                    status: if r.success() { "PASS" } else { "FAIL" },
                    passed: r.passed(),
                    failed: r.failed(),
                    elapsed_ms: r.total_ms,
                });
            }
            Err(e) => {
                tracing::error!(scenario = %name, "scenario aborted: {e:#}");
                eprintln!("\n[FAIL] Scenario {name}: {e:#}");
                any_failure = true;
                total_failed += 1;
                lines.push(ScenarioLine {
                    scenario: name.clone(),
                    status: "ERROR",
                    passed: 0,
                    failed: 1,
                    elapsed_ms: 0.0,
                });
            }
        }
    }

    let overall = if any_failure { "FAIL" } else { "PASS" };
    let elapsed_s = runner_start.elapsed().as_secs_f64();
    let summary = RunnerSummary {
        event: "scenario_runner_summary",
        nodes: settings.nodes,
        seed: settings.seed,
        scenarios: lines,
        total_passed,
        total_failed,
        total_elapsed_s: elapsed_s,
        overall_status: overall,
    };

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    }

    eprintln!("\n╔══════════════════════════════════════════╗");
    eprintln!("║          SCENARIO RUNNER SUMMARY         ║");
    eprintln!("╠══════════════════════════════════════════╣");
    for s in &summary.scenarios {
        let icon = match s.status {
            "PASS" => " OK ",
            _ => "FAIL",
        };
        eprintln!(
            "║ [{icon}] {:<10} {}/{} steps ({:.1}ms)",
            s.scenario,
            s.passed,
            s.passed + s.failed,
            s.elapsed_ms,
        );
    }
    eprintln!("╠══════════════════════════════════════════╣");
    eprintln!(
        "║ Total: {total_passed} passed, {total_failed} failed | {elapsed_s:.1}s | [{overall}]",
    );
    eprintln!("╚══════════════════════════════════════════╝");

    Ok(!any_failure)
}

async fn run_one(name: &str, settings: &SimSettings) -> anyhow::Result<ScenarioResult> {
    match name {
        "election" => scenario_election::run(settings).await,
        "failover" => scenario_failover::run(settings).await,
        "split" => scenario_split::run(settings).await,
        "merge" => scenario_merge::run(settings).await,
        "stack" => scenario_stack::run(settings).await,
        other => anyhow::bail!("unknown scenario '{other}' (known: {})", ALL.join(", ")),
    }
}
