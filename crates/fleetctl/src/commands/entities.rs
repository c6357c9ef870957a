use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use fleet_state::{EntityMetadata, EntitySet, ExperimentStore, StateStore};

pub fn import_pool(store: &StateStore, experiment: &str, file: &Path) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let pool: EntitySet = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a valid entity list", file.display()))?;
    store.save_entity_pool(experiment, &pool)?;
    println!("✓ Imported {} entities into {experiment}", pool.len());
    Ok(())
}

pub fn show_pool(store: &StateStore, experiment: &str, format: &str) -> anyhow::Result<()> {
    let pool = store.get_entity_pool(experiment)?;
    println!("{}", render(&pool, format)?);
    Ok(())
}

pub fn show_provisioned(store: &StateStore, experiment: &str, format: &str) -> anyhow::Result<()> {
    let provisioned = store.get_entities_provisioned(experiment)?;
    println!("{}", render(&provisioned, format)?);
    Ok(())
}

pub fn render(set: &EntitySet, format: &str) -> anyhow::Result<String> {
    if format == "json" {
        return Ok(serde_json::to_string_pretty(set)?);
    }
    if set.is_empty() {
        return Ok("(no entities)".to_string());
    }

    let mut out = format!(
        "{:<11} {:<24} {:<12} {:<14} {:<10} {}\n",
        "TYPE", "ID", "GROUP", "CLUSTER", "RACK", "SESSION"
    );
    for entity in set.iter() {
        let (rack, session) = match &entity.metadata {
            EntityMetadata::Node(m) => (
                m.rack_location.clone().unwrap_or_default(),
                m.tip_session_id.clone().unwrap_or_default(),
            ),
            EntityMetadata::Rack(m) => (m.rack_location.clone().unwrap_or_default(), String::new()),
            EntityMetadata::TipSession(s) => (String::new(), format!("node {}", s.node_id)),
        };
        let id = if entity.discarded {
            format!("{} (discarded)", entity.id)
        } else {
            entity.id.clone()
        };
        writeln!(
            out,
            "{:<11} {:<24} {:<12} {:<14} {:<10} {}",
            entity.entity_type().label(),
            id,
            entity.environment_group,
            entity.cluster_name().unwrap_or("-"),
            rack,
            session
        )?;
    }
    Ok(out.trim_end().to_string())
}
