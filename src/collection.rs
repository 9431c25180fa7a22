use indexmap::{IndexMap, IndexSet};

use crate::error::{Error, Result};
use crate::value::{Schema, Tuple};

/// How long a collection's contents survive.
///
/// `Table` rows persist across ticks until a rule deletes them. `Channel`
/// rows model message arrival: visible only during the tick they were
/// inserted, cleared at tick end. `Scratch` rows are per-tick working state
/// and are never persisted to the lineage store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifetime {
    Table,
    Channel,
    Scratch,
}

#[derive(Clone, Debug)]
pub struct Collection {
    name: String,
    schema: Schema,
    lifetime: Lifetime,
    rows: IndexSet<Tuple>,
}

impl Collection {
    fn new(name: String, schema: Schema, lifetime: Lifetime) -> Collection {
        Collection {
            name,
            schema,
            lifetime,
            rows: IndexSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn contains(&self, tuple: &Tuple) -> bool {
        self.rows.contains(tuple)
    }

    /// Iteration order is insertion order, which keeps evaluation
    /// deterministic across identical runs.
    pub fn tuples(&self) -> impl Iterator<Item = &Tuple> {
        self.rows.iter()
    }

    pub(crate) fn insert(&mut self, tuple: Tuple) -> bool {
        self.rows.insert(tuple)
    }

    pub(crate) fn delete(&mut self, tuple: &Tuple) -> bool {
        self.rows.shift_remove(tuple)
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
    }
}

/// The set of declared collections. The engine owns the catalog; everything
/// else reads it.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    collections: IndexMap<String, Collection>,
}

impl Catalog {
    pub(crate) fn declare(
        &mut self,
        name: &str,
        schema: Schema,
        lifetime: Lifetime,
    ) -> Result<&Collection> {
        if self.collections.contains_key(name) {
            return Err(Error::Construction(format!(
                "collection {} already declared",
                name
            )));
        }
        self.collections
            .insert(name.to_owned(), Collection::new(name.to_owned(), schema, lifetime));
        Ok(&self.collections[name])
    }

    pub fn get(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Collection> {
        self.collections.get_mut(name)
    }

    pub(crate) fn collections_mut(&mut self) -> impl Iterator<Item = &mut Collection> {
        self.collections.values_mut()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(|s| s.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }
}
