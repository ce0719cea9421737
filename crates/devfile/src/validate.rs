//! Structural and domain validation, split around the flattener.
//!
//! Pre-flatten checks reject shapes that make flattening pointless or
//! unsafe; post-flatten checks cover invariants that only hold once parent
//! references are resolved. Both collect every violation instead of stopping
//! at the first, so the caller sees the full list in one pass.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{ComponentKind, Devfile, RESERVED_COMPONENT_PREFIX};

static DNS_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("static regex"));

/// True when `s` is a valid RFC-1123 DNS label (usable as a Kubernetes
/// resource name fragment).
pub fn is_dns_label(s: &str) -> bool {
    DNS_LABEL.is_match(s)
}

/// Checks on the raw model, before parent resolution.
pub fn pre_flatten_violations(devfile: &Devfile) -> Vec<String> {
    let mut violations = Vec::new();

    if devfile.schema_version.is_empty() {
        violations.push("schemaVersion is required".to_string());
    } else if !devfile.schema_version.starts_with("2.") {
        violations.push(format!(
            "schemaVersion '{}' is not supported (expected a 2.x devfile)",
            devfile.schema_version
        ));
    }

    for component in &devfile.components {
        if component.name.is_empty() {
            violations.push("component with empty name".to_string());
            continue;
        }
        if !is_dns_label(&component.name) {
            violations.push(format!("component name '{}' must be a DNS-1123 label", component.name));
        }
        if component.name.starts_with(RESERVED_COMPONENT_PREFIX) {
            violations.push(format!(
                "component name '{}' uses the reserved prefix '{}'",
                component.name, RESERVED_COMPONENT_PREFIX
            ));
        }
        if component.kind().is_none() {
            violations.push(format!(
                "component '{}' must declare exactly one of container, volume, image",
                component.name
            ));
        }
    }

    for command in &devfile.commands {
        if command.id.is_empty() {
            violations.push("command with empty id".to_string());
        }
        match (&command.exec, &command.apply) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => violations.push(format!(
                "command '{}' must declare exactly one of exec, apply",
                command.id
            )),
        }
    }

    violations
}

/// Checks that assume a fully inlined model.
pub fn post_flatten_violations(devfile: &Devfile, max_components: usize) -> Vec<String> {
    let mut violations = Vec::new();

    if devfile.parent.is_some() {
        violations.push("parent reference survived flattening".to_string());
    }

    if devfile.components.len() > max_components {
        violations.push(format!(
            "too many components: {} (limit {})",
            devfile.components.len(),
            max_components
        ));
    }

    let mut seen = Vec::new();
    for component in &devfile.components {
        if seen.contains(&component.name.as_str()) {
            violations.push(format!("duplicate component name '{}'", component.name));
        } else {
            seen.push(component.name.as_str());
        }
    }

    if !devfile.components.iter().any(|c| c.kind() == Some(ComponentKind::Container)) {
        violations.push("devfile must declare at least one container component".to_string());
    }

    // volume mounts must target declared volume components
    let volume_names: Vec<&str> = devfile
        .components
        .iter()
        .filter(|c| c.volume.is_some())
        .map(|c| c.name.as_str())
        .collect();
    for component in &devfile.components {
        let Some(container) = &component.container else { continue };
        for mount in &container.volume_mounts {
            if !volume_names.contains(&mount.name.as_str()) {
                violations.push(format!(
                    "component '{}' mounts undeclared volume '{}'",
                    component.name, mount.name
                ));
            }
        }
    }

    // command targets and event references must resolve
    for command in &devfile.commands {
        let target = command
            .exec
            .as_ref()
            .map(|e| e.component.as_str())
            .or_else(|| command.apply.as_ref().map(|a| a.component.as_str()));
        if let Some(target) = target {
            if devfile.component(target).is_none() {
                violations.push(format!(
                    "command '{}' references unknown component '{}'",
                    command.id, target
                ));
            }
        }
    }
    if let Some(events) = &devfile.events {
        for id in events.pre_start.iter().chain(events.post_start.iter()) {
            if !devfile.commands.iter().any(|c| &c.id == id) {
                violations.push(format!("event references unknown command '{}'", id));
            }
        }
    }

    violations
}
