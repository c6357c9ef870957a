use fleet_state::{ExperimentStore, StateStore};

/// Print one step's state, or the state keys of the experiment.
pub fn show(store: &StateStore, experiment: &str, step: Option<&str>) -> anyhow::Result<()> {
    let Some(step) = step else {
        let keys = store.list_state_keys(experiment)?;
        if keys.is_empty() {
            println!("(no step state for {experiment})");
        }
        for key in keys {
            println!("{key}");
        }
        return Ok(());
    };

    match store.get_state(experiment, &format!("state-{step}"))? {
        Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
        None => anyhow::bail!("no state recorded for step '{step}' of {experiment}"),
    }
    Ok(())
}
