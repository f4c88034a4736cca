//! Help text for the interactive shell

/// Shown for `help` and `?`.
pub fn shell_help() -> String {
    format!(
        r#"
Simulation Interpreter Help (circle-of-life v{})
Commands format: ACTION TARGET [NUMBER]

ACTIONS:
- add: Add NUMBER instances of TARGET to the simulation
- list: List all current TARGET instances
- delete: Remove NUMBER instances of TARGET from the simulation
- stop: Stop the simulation and exit (also: quit, exit)

TARGETS:
- prey: Simulation prey entities
- predator: Simulation predator entities
- all: Prey and predator entities (prey is operated on first)
- grass: Simulation grass entities

EXAMPLES:
- add prey 5      : Add 5 prey
- add all 2       : Add 2 prey and 2 predators
- add grass 12    : Add 12 grass (regardless of the limit)
- list predator   : Show all predators
- list grass      : Show the grass count
- delete prey 2   : Remove 2 prey
- stop            : Exit simulation
- help            : Show this help
- ?               : Show this help

NUMBER is optional. For add/delete; defaults to 1. For list; ignored.
"#,
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_help_names_every_target() {
        let text = shell_help();
        for target in ["prey", "predator", "all", "grass"] {
            assert!(text.contains(&format!("- {target}:")), "missing {target}");
        }
    }
}
