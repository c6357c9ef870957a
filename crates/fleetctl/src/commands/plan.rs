use std::collections::BTreeSet;
use std::fmt::Write as _;

use fleet_affinity::{Assignment, select, usable_candidates};
use fleet_core::NodeAffinity;
use fleet_state::{ExperimentStore, StateStore};
use tracing::warn;

pub fn plan(
    store: &StateStore,
    experiment: &str,
    groups: &[String],
    affinity: &str,
    count: u32,
    format: &str,
) -> anyhow::Result<()> {
    let affinity: NodeAffinity = affinity.parse().map_err(anyhow::Error::msg)?;
    let pool = store.get_entity_pool(experiment)?;
    let candidates = usable_candidates(&pool, groups, &BTreeSet::new(), affinity)?;
    let rows = select(&candidates, groups, count as usize, affinity);

    if rows.len() < count as usize {
        warn!(
            experiment,
            requested = count,
            available = rows.len(),
            "not enough candidates for every row"
        );
    }
    println!("{}", render(&rows, groups, format)?);
    Ok(())
}

fn render(rows: &[Assignment], groups: &[String], format: &str) -> anyhow::Result<String> {
    if format == "json" {
        let value: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "partition": row.partition.as_ref().map(ToString::to_string),
                    "picks": row.picks,
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&value)?);
    }
    if rows.is_empty() {
        return Ok("no row can be formed from the pool".to_string());
    }

    let mut out = String::new();
    for (idx, row) in rows.iter().enumerate() {
        match &row.partition {
            Some(partition) => writeln!(out, "row {idx} ({partition})")?,
            None => writeln!(out, "row {idx}")?,
        }
        for group in groups {
            writeln!(out, "  {group:<16} {}", row.node_for(group).unwrap_or("-"))?;
        }
    }
    Ok(out.trim_end().to_string())
}
