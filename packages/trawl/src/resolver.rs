//! Dependency resolution: which modules must run to produce a set of types.
//!
//! Modules and event types form a bipartite graph (module → produced types,
//! type → consuming modules). Starting from the producers of the requested
//! types, the resolver keeps adding producers of whatever the selected
//! modules consume until nothing new is added.
//!
//! The result is sufficient, not minimal: when two modules produce the same
//! type, both are selected. A module with no declared outputs is never pulled
//! in; name it explicitly with [`ModuleSelection::Named`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ScanError;
use crate::event::EventType;
use crate::module::{ModuleDescriptor, Subscription};

/// How a scan request picks its modules.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum ModuleSelection {
    /// Every registered module.
    #[default]
    All,
    /// Exactly these modules.
    Named(Vec<String>),
    /// Whatever is needed to produce these types.
    ProducingTypes(Vec<EventType>),
}

impl ModuleSelection {
    /// Turn the selection into module names, in catalog order.
    pub fn select(&self, catalog: &[ModuleDescriptor]) -> Result<Vec<String>, ScanError> {
        let selected: Vec<String> = match self {
            ModuleSelection::All => catalog.iter().map(|d| d.name.clone()).collect(),
            ModuleSelection::Named(names) => {
                for name in names {
                    if !catalog.iter().any(|d| &d.name == name) {
                        return Err(ScanError::UnknownModule { name: name.clone() });
                    }
                }
                catalog
                    .iter()
                    .filter(|d| names.contains(&d.name))
                    .map(|d| d.name.clone())
                    .collect()
            }
            ModuleSelection::ProducingTypes(types) => {
                let requested: BTreeSet<EventType> = types.iter().cloned().collect();
                let resolved = resolve(catalog, &requested);
                catalog
                    .iter()
                    .filter(|d| resolved.contains(&d.name))
                    .map(|d| d.name.clone())
                    .collect()
            }
        };

        if selected.is_empty() {
            return Err(ScanError::NoModulesSelected);
        }
        Ok(selected)
    }
}

/// Compute the module set needed to produce `requested`.
pub fn resolve(catalog: &[ModuleDescriptor], requested: &BTreeSet<EventType>) -> BTreeSet<String> {
    let mut selected = producers(catalog, &Needed::Types(requested.clone()));

    loop {
        let needed = consumed_by(catalog, &selected);
        let found = producers(catalog, &needed);
        let added: Vec<String> = found.difference(&selected).cloned().collect();
        if added.is_empty() {
            break;
        }
        debug!(?added, "resolver pulled in prerequisite modules");
        selected.extend(added);
    }

    selected
}

/// Types a set of modules needs as input.
enum Needed {
    Types(BTreeSet<EventType>),
    /// A wildcard consumer is selected; everything is needed.
    Everything,
}

fn consumed_by(catalog: &[ModuleDescriptor], selected: &BTreeSet<String>) -> Needed {
    let mut types = BTreeSet::new();
    for descriptor in catalog.iter().filter(|d| selected.contains(&d.name)) {
        match &descriptor.consumed {
            Subscription::Nothing => {}
            Subscription::All => return Needed::Everything,
            Subscription::Types(set) => types.extend(set.iter().cloned()),
        }
    }
    Needed::Types(types)
}

fn producers(catalog: &[ModuleDescriptor], needed: &Needed) -> BTreeSet<String> {
    catalog
        .iter()
        .filter(|d| match needed {
            Needed::Everything => !d.produced.is_empty(),
            Needed::Types(types) => !d.produced.is_disjoint(types),
        })
        .map(|d| d.name.clone())
        .collect()
}
