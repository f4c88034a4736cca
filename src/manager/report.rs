use crate::core::layout::SlotId;
use crate::species::Species;
use std::fmt::Write;

fn capitalized(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Listing of the living entries of one species, as read under the guard.
pub fn population_listing(species: Species, living: &[(SlotId, i32)]) -> String {
    let mut out = format!(
        "{} in the simulation (Shared Memory View):",
        capitalized(species.plural())
    );
    for (slot, energy) in living {
        let _ = write!(out, "\n - ID {slot}: Energy {energy}");
    }
    if living.is_empty() {
        let _ = write!(out, "\nNo active {} found in shared memory.", species.plural());
    } else {
        let _ = write!(out, "\nTotal: {} {species}(s).", living.len());
    }
    out
}

pub fn grass_total(count: i32) -> String {
    format!("Total: {count} grass")
}
