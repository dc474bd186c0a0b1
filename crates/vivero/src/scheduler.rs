//! Scheduling rules: which (provider, template) pairs may serve a pool.

use recorrer::Version;

use crate::clock::Clock;
use crate::models::{AppliancePool, Template};
use crate::store::Store;

/// A provider may receive new work when it is enabled, has a free
/// provisioning slot, and stays under its appliance limit.
#[must_use]
pub fn provider_eligible(store: &Store, provider_id: &str) -> bool {
    let Ok(provider) = store.provider(provider_id) else {
        return false;
    };
    if provider.disabled {
        return false;
    }
    if store
        .remaining_provisioning_slots(provider_id)
        .unwrap_or(0)
        == 0
    {
        return false;
    }
    if let Some(limit) = provider.appliance_limit {
        if store.provider_appliance_count(provider_id) >= limit {
            return false;
        }
    }
    true
}

/// A template may serve a pool when it is ready, usable and existing,
/// matches the pool's group/version/date/preconfigured filters, and is
/// not obsolete under the group's age policy.
#[must_use]
pub fn template_eligible(
    store: &Store,
    clock: &dyn Clock,
    pool: &AppliancePool,
    template: &Template,
) -> bool {
    if !(template.ready && template.usable && template.exists) {
        return false;
    }
    if template.template_group != pool.group || template.preconfigured != pool.preconfigured {
        return false;
    }
    if let Some(version) = &pool.version {
        if template.version.as_deref() != Some(version.as_str()) {
            return false;
        }
    }
    if let Some(date) = pool.date {
        if template.date != date {
            return false;
        }
    }
    if let Ok(group) = store.group(&pool.group) {
        if let Some(days) = group.template_obsolete_days {
            let cutoff = clock.now().date_naive() - chrono::Duration::days(i64::from(days));
            if template.date <= cutoff {
                return false;
            }
        }
    }
    true
}

fn newest_first(templates: &mut [Template]) {
    templates.sort_by(|a, b| {
        let va = a.version.as_deref().map(Version::parse);
        let vb = b.version.as_deref().map(Version::parse);
        vb.cmp(&va).then(b.date.cmp(&a.date))
    });
}

/// Templates that could serve the pool right now, newest first, on
/// eligible providers only. A provider to avoid is a soft preference:
/// when avoiding it leaves no candidates, the full list stands and the
/// next attempt may hit the same provider again.
#[must_use]
pub fn eligible_templates(
    store: &Store,
    clock: &dyn Clock,
    pool: &AppliancePool,
    avoid: Option<&str>,
) -> Vec<Template> {
    let mut templates: Vec<Template> = store
        .templates()
        .into_iter()
        .filter(|t| template_eligible(store, clock, pool, t))
        .filter(|t| provider_eligible(store, &t.provider))
        .collect();
    newest_first(&mut templates);

    if let Some(avoid) = avoid {
        let preferred: Vec<Template> = templates
            .iter()
            .filter(|t| t.provider != avoid)
            .cloned()
            .collect();
        if !preferred.is_empty() {
            return preferred;
        }
    }
    templates
}

/// Templates able to replenish a group's warm pool right now, newest
/// first, on eligible providers only.
#[must_use]
pub fn shepherd_templates(
    store: &Store,
    clock: &dyn Clock,
    group: &str,
    preconfigured: bool,
) -> Vec<Template> {
    let obsolete_cutoff = store.group(group).ok().and_then(|g| {
        g.template_obsolete_days.map(|days| {
            clock.now().date_naive() - chrono::Duration::days(i64::from(days))
        })
    });
    let mut templates: Vec<Template> = store
        .templates()
        .into_iter()
        .filter(|t| t.ready && t.usable && t.exists)
        .filter(|t| t.template_group == group && t.preconfigured == preconfigured)
        .filter(|t| obsolete_cutoff.map_or(true, |cutoff| t.date > cutoff))
        .filter(|t| provider_eligible(store, &t.provider))
        .collect();
    newest_first(&mut templates);
    templates
}

/// Distinct versions available for a group/preconfigured combination,
/// newest first.
#[must_use]
pub fn available_versions(
    store: &Store,
    group: Option<&str>,
    preconfigured: bool,
) -> Vec<String> {
    let mut versions: Vec<String> = store
        .templates()
        .into_iter()
        .filter(|t| t.ready && t.usable && t.exists && t.preconfigured == preconfigured)
        .filter(|t| group.is_none() || group == Some(t.template_group.as_str()))
        .filter_map(|t| t.version)
        .collect();
    versions.sort_by(|a, b| Version::parse(b).cmp(&Version::parse(a)));
    versions.dedup();
    versions
}

/// Latest build date available for a group (optionally fixed to one
/// version).
#[must_use]
pub fn latest_date(
    store: &Store,
    group: &str,
    preconfigured: bool,
    version: Option<&str>,
) -> Option<chrono::NaiveDate> {
    store
        .templates()
        .into_iter()
        .filter(|t| {
            t.ready
                && t.usable
                && t.exists
                && t.template_group == group
                && t.preconfigured == preconfigured
        })
        .filter(|t| version.is_none() || t.version.as_deref() == version)
        .map(|t| t.date)
        .max()
}
