// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide set of zones served by this server

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::content::ZoneContents;
use crate::proto::rr::LowerName;
use crate::zone::Zone;

/// Set of zones, available to this server.
///
/// The map itself is swapped whole on mutation: readers capture a consistent
/// snapshot for the duration of their lookup and are never blocked by zones
/// being added or removed during reconfiguration. Superseded snapshots and
/// unpublished content trees are freed once their last reader is done.
#[derive(Clone, Default)]
pub struct Catalog {
    zones: Arc<ArcSwap<HashMap<LowerName, Arc<Zone>>>>,
}

impl Catalog {
    /// Constructs a new Catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a zone
    ///
    /// # Arguments
    ///
    /// * `zone` - the zone handle, keyed under its name, e.g. example.com.
    pub fn upsert(&self, zone: Arc<Zone>) {
        self.zones.rcu(|zones| {
            let mut zones = HashMap::clone(zones);
            zones.insert(zone.name().clone(), Arc::clone(&zone));
            zones
        });
    }

    /// Remove a zone from the catalog, returning its handle.
    ///
    /// The handle may still be referenced by in-flight work; callers discard
    /// it so pending timers see the zone is gone.
    pub fn remove(&self, name: &LowerName) -> Option<Arc<Zone>> {
        let removed = self.zones.load().get(name).cloned();
        if removed.is_some() {
            self.zones.rcu(|zones| {
                let mut zones = HashMap::clone(zones);
                zones.remove(name);
                zones
            });
        }
        removed
    }

    /// Checks whether the `Catalog` contains a zone with the exact `name`
    pub fn contains(&self, name: &LowerName) -> bool {
        self.zones.load().contains_key(name)
    }

    /// Gets the zone with the exact `name`
    pub fn get(&self, name: &LowerName) -> Option<Arc<Zone>> {
        self.zones.load().get(name).cloned()
    }

    /// Recursively searches the catalog for the nearest zone that is an
    /// ancestor of `name`
    pub fn find(&self, name: &LowerName) -> Option<Arc<Zone>> {
        let zones = self.zones.load();

        let mut name = name.clone();
        loop {
            if let Some(zone) = zones.get(&name) {
                return Some(Arc::clone(zone));
            }
            if name.is_root() {
                return None;
            }
            name = name.base_name();
        }
    }

    /// Marks the named zone expired: its contents are unpublished, leaving
    /// the handle as a stub, and the superseded tree is returned so the
    /// caller can drop it after readers quiesce.
    pub fn expire_zone(&self, name: &LowerName) -> Option<Arc<ZoneContents>> {
        self.get(name).and_then(|zone| zone.take_contents())
    }

    /// Snapshot of every zone currently hosted
    pub fn zones(&self) -> Vec<Arc<Zone>> {
        self.zones.load().values().cloned().collect()
    }
}
