use crate::output::print_json;
use vincent_core::compute_config_hash;

pub fn run(abilities: &[String], policies: &[String], json: bool) -> anyhow::Result<()> {
    if policies.len() > abilities.len() {
        anyhow::bail!(
            "got {} --policies lists for {} abilities",
            policies.len(),
            abilities.len()
        );
    }

    let policy_ids: Vec<Vec<String>> = (0..abilities.len())
        .map(|i| policies.get(i).map(|p| split_cids(p)).unwrap_or_default())
        .collect();
    let hash = compute_config_hash(abilities, &policy_ids);

    if json {
        print_json(&serde_json::json!({
            "configHash": hash,
            "abilityIpfsCids": abilities,
            "abilityPolicyCids": policy_ids,
        }))?;
    } else {
        println!("{hash}");
    }
    Ok(())
}

fn split_cids(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
