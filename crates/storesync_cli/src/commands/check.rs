//! Check command implementation.

use crate::scenario::Scenario;
use std::path::Path;

/// Runs the check command: loads a scenario and prints what it declares
/// without running it.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = Scenario::load(path)?;

    println!("Scenario: {}", scenario.name.as_deref().unwrap_or("(unnamed)"));
    println!("Starts at: {}", scenario.start.to_rfc3339());
    println!();
    for store in &scenario.stores {
        println!("Store {}:", store.name);
        for rule in &store.rules {
            let policy = rule
                .policy
                .map(|p| format!("{p:?}"))
                .unwrap_or_else(|| "default".to_string());
            let review = if rule.flag_for_review { ", review" } else { "" };
            println!(
                "  {} {:?} priority {} policy {}{}",
                rule.entity_type, rule.direction, rule.priority, policy, review
            );
        }
    }
    println!();
    println!("{} steps", scenario.steps.len());
    println!("✓ Scenario is valid");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn accepts_valid_and_rejects_broken_files() {
        let mut valid = tempfile::NamedTempFile::new().unwrap();
        write!(valid, r#"{{ "stores": [{{ "name": "a", "rules": [] }}] }}"#).unwrap();
        assert!(run(valid.path()).is_ok());

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        write!(broken, r#"{{ "stores": [] }}"#).unwrap();
        assert!(run(broken.path()).is_err());
    }
}
