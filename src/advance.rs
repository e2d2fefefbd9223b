use serde::{Deserialize, Serialize};

/// An (instance, plugin) pair, as indices into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub instance: usize,
    pub plugin: usize,
}

impl Position {
    pub fn new(instance: usize, plugin: usize) -> Self {
        Self { instance, plugin }
    }
}

/// Pick the pair that runs after `current`.
///
/// Instances are the inner loop: every toggled instance goes through a
/// plugin before any of them starts the next toggled plugin. `None` as the
/// current position seeds the walk, so the first toggled instance and the
/// first toggled plugin are returned. `None` comes back once nothing is left
/// or when either side has nothing toggled.
pub fn next(instances: &[bool], plugins: &[bool], current: Option<Position>) -> Option<Position> {
    let first_instance = instances.iter().position(|&toggled| toggled)?;

    let Some(current) = current else {
        let plugin = plugins.iter().position(|&toggled| toggled)?;
        return Some(Position::new(first_instance, plugin));
    };

    if let Some(instance) = toggled_after(instances, current.instance) {
        return Some(Position::new(instance, current.plugin));
    }

    toggled_after(plugins, current.plugin).map(|plugin| Position::new(first_instance, plugin))
}

fn toggled_after(toggles: &[bool], index: usize) -> Option<usize> {
    toggles
        .iter()
        .enumerate()
        .skip(index + 1)
        .find_map(|(i, &toggled)| toggled.then_some(i))
}

/// Every pair a full run visits, in order.
pub fn schedule(instances: &[bool], plugins: &[bool]) -> Vec<Position> {
    let mut pairs = vec![];
    let mut current = next(instances, plugins, None);
    while let Some(position) = current {
        pairs.push(position);
        current = next(instances, plugins, Some(position));
    }
    pairs
}
