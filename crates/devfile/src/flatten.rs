//! Parent resolution: inline a devfile's parent chain into one
//! self-contained model.
//!
//! Flattening is referentially transparent: no I/O happens here beyond the
//! injected resolver, and identical inputs always produce identical output.
//! Manifest determinism downstream depends on that.

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::{Devfile, ParentRef};

/// Parent chains deeper than this are treated as runaway references.
const MAX_PARENT_DEPTH: usize = 8;

/// Fetches the raw YAML behind a parent reference. `Ok(None)` means the
/// reference does not resolve to anything.
pub trait ParentResolver {
    fn resolve(&self, parent: &ParentRef) -> Result<Option<String>>;
}

/// In-memory resolver keyed by parent uri/id. Used by tests and by callers
/// that pre-fetch referenced devfiles.
#[derive(Debug, Default)]
pub struct MapResolver {
    entries: std::collections::HashMap<String, String>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, yaml: impl Into<String>) {
        self.entries.insert(key.into(), yaml.into());
    }
}

impl ParentResolver for MapResolver {
    fn resolve(&self, parent: &ParentRef) -> Result<Option<String>> {
        Ok(parent.key().and_then(|k| self.entries.get(k).cloned()))
    }
}

/// Resolver that never resolves anything. A devfile without parent
/// references flattens fine through it.
#[derive(Debug, Default)]
pub struct NullResolver;

impl ParentResolver for NullResolver {
    fn resolve(&self, _parent: &ParentRef) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Recursively inline the parent chain. A devfile with no parent is returned
/// unchanged, so flattening is idempotent.
pub fn flatten(devfile: Devfile, resolver: &dyn ParentResolver) -> Result<Devfile> {
    let mut visited = Vec::new();
    flatten_inner(devfile, resolver, &mut visited)
}

fn flatten_inner(
    mut devfile: Devfile,
    resolver: &dyn ParentResolver,
    visited: &mut Vec<String>,
) -> Result<Devfile> {
    let Some(parent_ref) = devfile.parent.take() else {
        return Ok(devfile);
    };

    let key = parent_ref
        .key()
        .ok_or_else(|| anyhow!("parent reference carries neither uri nor id"))?
        .to_string();
    if visited.iter().any(|v| v == &key) {
        return Err(anyhow!("cyclic parent reference: '{}'", key));
    }
    if visited.len() >= MAX_PARENT_DEPTH {
        return Err(anyhow!("parent chain deeper than {} levels", MAX_PARENT_DEPTH));
    }
    visited.push(key.clone());
    debug!(parent = %key, depth = visited.len(), "resolving devfile parent");

    let raw = resolver
        .resolve(&parent_ref)?
        .ok_or_else(|| anyhow!("unresolved parent reference: '{}'", key))?;
    let parent = Devfile::from_yaml(&raw).with_context(|| format!("parsing parent devfile '{}'", key))?;
    let parent = flatten_inner(parent, resolver, visited)?;

    merge(parent, devfile)
}

/// Merge a child devfile over its flattened parent. A child component with
/// the same name and kind replaces the parent's; the same name with a
/// different kind cannot be reconciled deterministically and is an error.
/// Commands override by id; events concatenate parent-first.
fn merge(parent: Devfile, child: Devfile) -> Result<Devfile> {
    let mut components = parent.components;
    for child_component in child.components {
        match components.iter().position(|c| c.name == child_component.name) {
            Some(idx) => {
                let existing = &components[idx];
                if existing.kind() != child_component.kind() {
                    return Err(anyhow!(
                        "component '{}' is declared as {} in the parent and {} in the child",
                        child_component.name,
                        existing.kind().map(|k| k.as_str()).unwrap_or("nothing"),
                        child_component.kind().map(|k| k.as_str()).unwrap_or("nothing"),
                    ));
                }
                components[idx] = child_component;
            }
            None => components.push(child_component),
        }
    }

    let mut commands = parent.commands;
    for child_command in child.commands {
        match commands.iter().position(|c| c.id == child_command.id) {
            Some(idx) => commands[idx] = child_command,
            None => commands.push(child_command),
        }
    }

    let events = match (parent.events, child.events) {
        (None, e) | (e, None) => e,
        (Some(p), Some(c)) => {
            let mut pre_start = p.pre_start;
            for id in c.pre_start {
                if !pre_start.contains(&id) {
                    pre_start.push(id);
                }
            }
            let mut post_start = p.post_start;
            for id in c.post_start {
                if !post_start.contains(&id) {
                    post_start.push(id);
                }
            }
            Some(crate::Events { pre_start, post_start })
        }
    };

    Ok(Devfile {
        schema_version: child.schema_version,
        parent: None,
        components,
        commands,
        events,
    })
}
