//! Turns the configured adversary list into the ordered work list.

use std::collections::BTreeMap;

use tracing::info;

use crate::config::{AdversaryConfig, ENABLE_PREFIX};
use crate::types::AdversaryJob;

/// Split a comma-separated adversary list into `(name, group)` pairs.
///
/// Each token is `Name`, `Name@Group` or `Name:Group`. The split happens at
/// the rightmost `@` or `:` so names may themselves contain `:`. An empty
/// group falls back to `default_group`; tokens with an empty name are dropped.
pub fn parse_adversary_list(raw: &str, default_group: &str) -> Vec<(String, String)> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .filter_map(|token| {
            let (name, group) = match token.rfind(['@', ':']) {
                Some(pos) => {
                    let group = token[pos + 1..].trim();
                    let group = if group.is_empty() { default_group } else { group };
                    (token[..pos].trim(), group)
                }
                None => (token, default_group),
            };
            (!name.is_empty()).then(|| (name.to_string(), group.to_string()))
        })
        .collect()
}

/// `true` when an override value switches its item off.
///
/// Unset means enabled. `0`, `false`, `no` and `off` (any case) disable;
/// every other value enables.
pub fn is_disabled(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off"
        )
    })
}

/// Drop the items whose 1-based position is disabled by `overrides`,
/// preserving the order of the rest.
pub fn filter_enabled(
    items: Vec<(String, String)>,
    overrides: &BTreeMap<usize, String>,
) -> Vec<AdversaryJob> {
    let mut jobs = Vec::with_capacity(items.len());
    for (idx, (name, group)) in items.into_iter().enumerate() {
        let position = idx + 1;
        let key = format!("{ENABLE_PREFIX}{position}");
        let value = overrides.get(&position).map(String::as_str);

        if is_disabled(value) {
            info!("{key}={:?} -> SKIP adversary '{name}' (group={group})", value.unwrap_or(""));
            continue;
        }
        match value {
            Some(v) => info!("{key}={v:?} -> RUN adversary '{name}' (group={group})"),
            None => info!("{key} not set -> RUN adversary '{name}' (group={group})"),
        }
        jobs.push(AdversaryJob::new(name, group, position));
    }
    jobs
}

/// Resolve the configured adversaries into the enabled, ordered job list.
///
/// An empty list falls back to the single configured fallback adversary in
/// the default group before enable filtering is applied.
pub fn resolve(cfg: &AdversaryConfig) -> Vec<AdversaryJob> {
    let mut items = parse_adversary_list(&cfg.list, &cfg.default_group);
    if items.is_empty() {
        items.push((cfg.fallback.clone(), cfg.default_group.clone()));
    }
    filter_enabled(items, &cfg.enable)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
