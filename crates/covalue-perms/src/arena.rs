//! Arena of loaded CoValues.
//!
//! Groups refer to parents and children by id only; every lookup goes
//! through an arena keyed by [`CoId`].

use std::collections::BTreeMap;

use covalue_core::{CoId, CoValueCore};

pub trait CoValueArena {
    fn get(&self, id: &CoId) -> Option<&CoValueCore>;

    fn get_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore>;

    fn insert(&mut self, core: CoValueCore);
}

impl CoValueArena for BTreeMap<CoId, CoValueCore> {
    fn get(&self, id: &CoId) -> Option<&CoValueCore> {
        BTreeMap::get(self, id)
    }

    fn get_mut(&mut self, id: &CoId) -> Option<&mut CoValueCore> {
        BTreeMap::get_mut(self, id)
    }

    fn insert(&mut self, core: CoValueCore) {
        BTreeMap::insert(self, core.id().clone(), core);
    }
}
