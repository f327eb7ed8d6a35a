use crate::output::{print_json, print_table};
use killchain_core::{config::Config, resolver};

pub fn run(config: &Config, json: bool) -> anyhow::Result<()> {
    let jobs = resolver::resolve(&config.adversaries);

    if json {
        return print_json(&jobs);
    }

    if jobs.is_empty() {
        println!("No adversaries enabled.");
        return Ok(());
    }

    let rows = jobs
        .iter()
        .map(|j| vec![j.position.to_string(), j.name.clone(), j.group.clone()])
        .collect();
    print_table(&["POS", "ADVERSARY", "GROUP"], rows);
    Ok(())
}
