//! Human-readable output for plans and statistics.
//!
//! User-facing output goes through `writeln!` on a caller-supplied writer
//! (stdout in the binary), not through tracing.

use std::io::{self, Write};

use armada_orchestration::cache::CacheStats;
use armada_orchestration::pool::PoolStatistics;
use armada_orchestration::scheduler::OrchestrationPlan;

pub fn write_plan(out: &mut impl Write, plan: &OrchestrationPlan) -> io::Result<()> {
    writeln!(
        out,
        "Plan: {} items in {} waves",
        plan.scheduled_count(),
        plan.waves.len()
    )?;

    for wave in &plan.waves {
        let marker = if wave.blocking { "  [blocking]" } else { "" };
        writeln!(
            out,
            "Wave {}{}  duration {}  owners: {}",
            wave.wave_number,
            marker,
            wave.estimated_duration,
            join_or_dash(&wave.owner_tags)
        )?;
        for id in &wave.member_ids {
            writeln!(out, "  - {id}")?;
        }
        if !wave.checkpoints.is_empty() {
            writeln!(out, "  checkpoints: {}", wave.checkpoints.join(", "))?;
        }
    }

    if !plan.critical_path.is_empty() {
        writeln!(out, "Critical path:")?;
        for entry in &plan.critical_path {
            let waits = if entry.blocking { ", waits on deps" } else { "" };
            writeln!(
                out,
                "  {}  ({}, {}{})",
                entry.id, entry.priority, entry.estimated_duration, waits
            )?;
        }
    }

    writeln!(
        out,
        "Duration: sequential {}, parallel {}, efficiency {}%",
        plan.sequential_duration_estimate, plan.total_duration_estimate, plan.parallel_efficiency
    )?;

    if !plan.collision_risks.is_empty() {
        writeln!(out, "Collision risks:")?;
        for risk in &plan.collision_risks {
            writeln!(
                out,
                "  wave {}: {} ({}) -> {}",
                risk.wave_number,
                risk.risk_type,
                risk.affected_owner_tags.join(", "),
                risk.mitigation
            )?;
        }
    }

    if let Err(e) = plan.check() {
        writeln!(out, "{e}")?;
    }
    Ok(())
}

pub fn write_pool_stats(out: &mut impl Write, stats: &PoolStatistics) -> io::Result<()> {
    writeln!(
        out,
        "Pool: {} requests, {} hits, {} misses (hit rate {:.1}%), avg allocation {:?}, {} idle",
        stats.total_requests,
        stats.hits,
        stats.misses,
        stats.hit_rate * 100.0,
        stats.average_allocation_time,
        stats.current_size
    )?;
    for (worker_type, per_type) in &stats.per_type {
        writeln!(
            out,
            "  {worker_type}  idle {}/target {} (max {})  hits {}  misses {}",
            per_type.size,
            per_type.target_size,
            per_type.sizing.max_size,
            per_type.hits,
            per_type.misses
        )?;
    }
    Ok(())
}

pub fn write_cache_stats(out: &mut impl Write, stats: &CacheStats) -> io::Result<()> {
    writeln!(
        out,
        "Cache: {} entries, {} hits, {} misses",
        stats.entries, stats.hits, stats.misses
    )
}

fn join_or_dash(values: &[String]) -> String {
    if values.is_empty() {
        "-".to_string()
    } else {
        values.join(", ")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use armada_orchestration::scheduler::{Priority, WaveScheduler, WorkItem};

    fn render(plan: &OrchestrationPlan) -> String {
        let mut buf = Vec::new();
        write_plan(&mut buf, plan).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn plan_output_lists_waves_and_efficiency() {
        let plan = WaveScheduler::default()
            .plan_execution(&[
                WorkItem::new("A", "a")
                    .with_duration(10)
                    .with_kind("build")
                    .with_priority(Priority::High),
                WorkItem::new("B", "b").with_duration(20).depends_on(["A"]),
                WorkItem::new("C", "c").with_duration(5),
            ])
            .unwrap();

        let text = render(&plan);
        assert!(text.contains("Plan: 3 items in 2 waves"), "{text}");
        assert!(text.contains("Wave 1  [blocking]  duration 10  owners: -"), "{text}");
        assert!(text.contains("checkpoints: build artifacts validated"), "{text}");
        assert!(text.contains("  A  (high, 10)"), "{text}");
        assert!(text.contains("efficiency 14%"), "{text}");
        assert!(!text.contains("plan incomplete"), "{text}");
    }

    #[test]
    fn incomplete_plan_reports_unresolvable_items() {
        let plan = WaveScheduler::default()
            .plan_execution(&[
                WorkItem::new("A", "a").depends_on(["B"]),
                WorkItem::new("B", "b").depends_on(["A"]),
            ])
            .unwrap();

        let text = render(&plan);
        assert!(text.contains("plan incomplete, 2 items unresolvable: A, B"), "{text}");
    }

    #[test]
    fn cache_stats_line() {
        let mut buf = Vec::new();
        write_cache_stats(
            &mut buf,
            &CacheStats {
                entries: 2,
                hits: 5,
                misses: 2,
                ..CacheStats::default()
            },
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "Cache: 2 entries, 5 hits, 2 misses\n"
        );
    }
}
