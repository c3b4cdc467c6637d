//! Terminal rendering of run and monitor events.

use colored::Colorize;
use events::{Event, EventBus};
use genbatch_core::{JobStats, RunResult};
use orchestrator::eta::format_duration;
use orchestrator::MonitorSummary;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Prints events from `bus` until every sender is dropped.
pub fn spawn(bus: &EventBus, verbose: bool) -> JoinHandle<()> {
    let mut subscription = bus.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = subscription.next().await {
            if let Some(line) = render(&envelope.event, verbose) {
                println!("{}", line);
            }
        }
        if subscription.missed() > 0 {
            eprintln!(
                "{}",
                format!("  ... {} events dropped", subscription.missed()).dimmed()
            );
        }
    })
}

/// One line per event worth showing. Claims and polls only show when verbose.
pub fn render(event: &Event, verbose: bool) -> Option<String> {
    let line = match event {
        Event::RunStarted {
            run_id,
            owner_id,
            languages,
            max_concurrent,
        } => format!(
            "{} run {} for {} [{}] x{}",
            "▶".cyan().bold(),
            short(run_id),
            owner_id.bold(),
            languages.join(","),
            max_concurrent
        ),
        Event::RoundStarted { round, batch, .. } => {
            format!("{} round {} ({} tasks)", "•".cyan(), round, batch)
        }
        Event::RoundFinished {
            round,
            generated,
            skipped,
            failed,
            ..
        } if verbose => format!(
            "  round {} done: {} generated, {} skipped, {} failed",
            round, generated, skipped, failed
        ),
        Event::TaskClaimed { key, .. } if verbose => format!("  {} {}", "→".dimmed(), key),
        Event::ClaimConflict { task_id, .. } if verbose => {
            format!("  {} {} claimed elsewhere", "⇄".dimmed(), short(task_id))
        }
        Event::TaskFinished {
            key,
            outcome,
            detail,
            elapsed_ms,
            ..
        } => {
            let elapsed = format!("({:.1}s)", *elapsed_ms as f64 / 1000.0).dimmed();
            match outcome.as_str() {
                "generated" => format!("  {} {} {}", "✓".green(), key, elapsed),
                "skipped" => format!(
                    "  {} {} skipped: {}",
                    "↷".yellow(),
                    key,
                    detail.as_deref().unwrap_or("-")
                ),
                _ => format!(
                    "  {} {} failed: {} {}",
                    "✗".red(),
                    key,
                    detail.as_deref().unwrap_or("unknown error").red(),
                    elapsed
                ),
            }
        }
        Event::RunFinished {
            run_id,
            attempted,
            generated,
            skipped,
            failed,
            duration_ms,
            aborted,
        } => {
            let mut line = format!(
                "{} run {} finished in {}: {} attempted, {} generated, {} skipped, {} failed",
                "■".cyan().bold(),
                short(run_id),
                format_duration(Duration::from_millis(*duration_ms)),
                attempted,
                generated,
                skipped,
                failed
            );
            if let Some(reason) = aborted {
                line.push_str(&format!(" {}", format!("(aborted: {})", reason).red()));
            }
            line
        }
        Event::StatsPolled { stats, .. } if verbose => format!("  poll: {}", stats_line(stats)),
        Event::RunLaunched { owner_id } => {
            format!("{} launching run for {}", "⟳".cyan(), owner_id.bold())
        }
        Event::ProgressReport {
            stats, eta_secs, ..
        } => {
            let eta = eta_secs
                .map(|secs| format_duration(Duration::from_secs(secs)))
                .unwrap_or_else(|| "unknown".to_string());
            format!("{} {} eta {}", "◷".cyan(), stats_line(stats), eta)
        }
        Event::MonitorFinished { stats, .. } => {
            format!("{} monitor done: {}", "■".cyan().bold(), stats_line(stats))
        }
        Event::Error { message, context } => match context {
            Some(context) => format!("{} {}: {}", "!".red().bold(), context, message),
            None => format!("{} {}", "!".red().bold(), message),
        },
        _ => return None,
    };
    Some(line)
}

pub fn stats_line(stats: &JobStats) -> String {
    format!(
        "{}/{} completed ({:.1}%), {} pending, {} in progress, {} failed, {} skipped",
        stats.completed,
        stats.total,
        percent(stats.completed, stats.total),
        stats.pending,
        stats.in_progress,
        stats.failed,
        stats.skipped
    )
}

pub fn print_stats(owner: &str, stats: &JobStats) {
    println!("{}", format!("Scope {}", owner).bold());
    println!("  Total:        {}", stats.total);
    for (label, count) in [
        ("Completed:   ", stats.completed),
        ("Pending:     ", stats.pending),
        ("In progress: ", stats.in_progress),
        ("Failed:      ", stats.failed),
        ("Skipped:     ", stats.skipped),
    ] {
        println!("  {} {:>6}  {:>5.1}%", label, count, percent(count, stats.total));
    }
}

pub fn print_run_result(result: &RunResult) {
    println!();
    println!("{}", "Run summary".bold());
    println!("  Run:        {}", result.run_id);
    println!("  Rounds:     {}", result.rounds);
    println!("  Attempted:  {}", result.attempted);
    println!("  Generated:  {}", result.generated.to_string().green());
    println!("  Skipped:    {}", result.skipped.to_string().yellow());
    println!("  Failed:     {}", result.failed.to_string().red());
    if result.claim_conflicts > 0 {
        println!("  Conflicts:  {}", result.claim_conflicts);
    }
    println!(
        "  Duration:   {}",
        format_duration(Duration::from_millis(result.duration_ms))
    );
    if let Some(reason) = &result.aborted {
        println!("  {} {}", "Aborted:".red().bold(), reason);
    }
}

pub fn print_monitor_summary(summary: &MonitorSummary) {
    println!();
    println!("{}", "Monitor summary".bold());
    if let Some(stats) = &summary.final_stats {
        println!("  {}", stats_line(stats));
    }
    println!("  Launches:   {}", summary.launches);
    println!("  Reports:    {}", summary.reports);
    println!("  Throughput: {:.1}/h", summary.per_hour);
    println!(
        "  Elapsed:    {}",
        format_duration(Duration::from_millis(summary.elapsed_ms))
    );
    let verdict = if summary.reached_target {
        "target reached".green()
    } else if summary.cancelled {
        "cancelled".yellow()
    } else {
        "stopped before target".red()
    };
    println!("  Result:     {}", verdict);
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

fn short(id: &uuid::Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn finished(outcome: &str, detail: Option<&str>) -> Event {
        Event::TaskFinished {
            run_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            key: "p1/t1/en".to_string(),
            outcome: outcome.to_string(),
            detail: detail.map(String::from),
            elapsed_ms: 1500,
        }
    }

    #[test]
    fn test_task_outcomes_render() {
        let ok = render(&finished("generated", None), false).unwrap();
        assert!(ok.contains("p1/t1/en"));

        let failed = render(&finished("failed", Some("Status 502")), false).unwrap();
        assert!(failed.contains("Status 502"));

        let skipped = render(&finished("skipped", Some("no template content")), false).unwrap();
        assert!(skipped.contains("no template content"));
    }

    #[test]
    fn test_chatty_events_need_verbose() {
        let claimed = Event::TaskClaimed {
            run_id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            key: "p1/t1/en".to_string(),
        };
        assert!(render(&claimed, false).is_none());
        assert!(render(&claimed, true).is_some());
    }

    #[test]
    fn test_aborted_run_mentions_reason() {
        let event = Event::RunFinished {
            run_id: Uuid::new_v4(),
            attempted: 2,
            generated: 1,
            skipped: 0,
            failed: 1,
            duration_ms: 61_000,
            aborted: Some("store unavailable".to_string()),
        };
        assert!(render(&event, false).unwrap().contains("store unavailable"));
    }

    #[test]
    fn test_stats_line_handles_empty_scope() {
        let line = stats_line(&JobStats::default());
        assert!(line.starts_with("0/0 completed (0.0%)"));
    }
}
