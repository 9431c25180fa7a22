use std::collections::{BTreeMap, HashSet};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::ast::{CollectionName, Dataflow, RuleId};
use crate::codec::Codec;
use crate::collection::{Catalog, Lifetime};
use crate::error::{Error, Result};
use crate::eval::{compile, Derivation, Plan};
use crate::lineage::{FactOp, Recorder};
use crate::store::{LineageStore, TickDeltas};
use crate::value::{Schema, Tuple};

/// Rule id under which mailbox arrivals are recorded; their facts have no
/// inputs, making them base facts for provenance walks.
pub const INGRESS_RULE: &str = "ingress";

/// Whether a rule's derivations merge into the target as inserts or as
/// deletes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Merge {
    Insert,
    Delete,
}

/// One declarative rule: evaluate `flow` every tick, merge the derived
/// tuples into `target`.
#[derive(Clone, Debug)]
pub struct RuleDecl {
    pub id: RuleId,
    pub target: CollectionName,
    pub merge: Merge,
    pub flow: Dataflow,
}

struct BoundRule {
    id: RuleId,
    target: CollectionName,
    merge: Merge,
    plan: Plan,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollectionDelta {
    pub inserted: Vec<Tuple>,
    pub deleted: Vec<Tuple>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub tick: u64,
    pub deltas: BTreeMap<CollectionName, CollectionDelta>,
    pub errors: Vec<Error>,
}

impl TickReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

struct Envelope {
    collection: CollectionName,
    tuple: Tuple,
}

/// Cloneable, thread-safe handle for network-sourced inputs. Envelopes are
/// buffered and drained into their channel collections only at the start
/// of a tick, never mid-tick.
#[derive(Clone)]
pub struct Inbox {
    tx: Sender<Envelope>,
}

impl Inbox {
    pub fn send(&self, collection: &str, tuple: Tuple) -> Result<()> {
        self.tx
            .send(Envelope {
                collection: collection.to_owned(),
                tuple,
            })
            .map_err(|_| Error::Evaluation("engine has shut down".to_owned()))
    }
}

pub struct Engine<C: Codec> {
    catalog: Catalog,
    rules: Vec<BoundRule>,
    store: LineageStore<C>,
    tick: u64,
    inbox_tx: Sender<Envelope>,
    inbox_rx: Receiver<Envelope>,
}

impl<C: Codec> Engine<C> {
    pub fn new(store: LineageStore<C>) -> Engine<C> {
        let (inbox_tx, inbox_rx) = unbounded();
        Engine {
            catalog: Catalog::default(),
            rules: Vec::new(),
            store,
            tick: 0,
            inbox_tx,
            inbox_rx,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// The store handle, for offline lineage queries and replay. Live
    /// evaluation never reads lineage back.
    pub fn store(&self) -> &LineageStore<C> {
        &self.store
    }

    pub fn declare(&mut self, name: &str, schema: Schema, lifetime: Lifetime) -> Result<()> {
        self.catalog.declare(name, schema.clone(), lifetime)?;
        if lifetime != Lifetime::Scratch {
            self.store.create_schema(name, &schema)?;
        }
        Ok(())
    }

    /// Rule registration, the sole way rules enter the engine: the closure
    /// sees the current catalog and returns rule declarations. Every
    /// declaration is bound and type-checked before any is accepted, so an
    /// ill-formed rule fails here and never during a tick.
    pub fn register<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&Catalog) -> Vec<RuleDecl>,
    {
        let decls = f(&self.catalog);
        let mut bound = Vec::new();
        for decl in decls {
            if decl.id == INGRESS_RULE {
                return Err(Error::Construction(format!(
                    "rule id {:?} is reserved",
                    INGRESS_RULE
                )));
            }
            if self.rules.iter().any(|r| r.id == decl.id)
                || bound.iter().any(|r: &BoundRule| r.id == decl.id)
            {
                return Err(Error::Construction(format!(
                    "duplicate rule id {:?}",
                    decl.id
                )));
            }
            let target = self.catalog.get(&decl.target).ok_or_else(|| {
                Error::Construction(format!("unknown target collection {:?}", decl.target))
            })?;
            let plan = compile(&decl.flow, &self.catalog)?;
            let produced = plan.schema();
            let expected = target.schema();
            if produced.arity() != expected.arity()
                || !produced.kinds().eq(expected.kinds())
            {
                return Err(Error::Construction(format!(
                    "rule {:?} produces {:?}, target {:?} holds {:?}",
                    decl.id,
                    produced.kinds().collect::<Vec<_>>(),
                    decl.target,
                    expected.kinds().collect::<Vec<_>>()
                )));
            }
            bound.push(BoundRule {
                id: decl.id,
                target: decl.target,
                merge: decl.merge,
                plan,
            });
        }
        self.rules.extend(bound);
        Ok(())
    }

    pub fn inbox(&self) -> Inbox {
        Inbox {
            tx: self.inbox_tx.clone(),
        }
    }

    /// In-process convenience over the same mailbox, with the target
    /// checked up front instead of at drain time.
    pub fn push(&self, collection: &str, tuple: Tuple) -> Result<()> {
        self.check_ingress(collection, &tuple)?;
        self.inbox().send(collection, tuple)
    }

    fn check_ingress(&self, collection: &str, tuple: &Tuple) -> Result<()> {
        let target = self.catalog.get(collection).ok_or_else(|| {
            Error::Evaluation(format!("unknown collection {:?}", collection))
        })?;
        if target.lifetime() != Lifetime::Channel {
            return Err(Error::Evaluation(format!(
                "collection {:?} is not a channel",
                collection
            )));
        }
        if !target.schema().admits(tuple) {
            return Err(Error::Evaluation(format!(
                "tuple {:?} does not match the schema of {:?}",
                tuple, collection
            )));
        }
        Ok(())
    }

    /// Runs one tick: drain the mailbox, evaluate every rule against the
    /// resulting snapshot, persist the tick's deltas and lineage, then
    /// apply the deltas in memory.
    ///
    /// Within a tick, all deletes apply before all inserts: a tuple both
    /// deleted and re-derived in the same tick ends up present.
    ///
    /// An evaluation error aborts the tick (nothing is persisted or
    /// applied) and is returned in the report. A store error after
    /// exhausted retries is returned as `Err`; in-memory state has not
    /// advanced and the process should not continue ticking.
    pub fn advance_tick(&mut self) -> Result<TickReport> {
        self.tick += 1;
        let tick = self.tick;
        debug!(tick, "advancing tick");
        let mut report = TickReport {
            tick,
            ..TickReport::default()
        };
        let mut recorder = Recorder::new();

        // Drain the mailbox; this tick sees a fixed snapshot of arrivals.
        let arrivals: Vec<Envelope> = self.inbox_rx.try_iter().collect();
        let mut ingress: Vec<(CollectionName, Tuple)> = Vec::new();
        for env in arrivals {
            if let Err(e) = self.check_ingress(&env.collection, &env.tuple) {
                warn!(tick, error = %e, "tick aborted while draining mailbox");
                self.clear_ephemeral();
                report.errors.push(e);
                return Ok(report);
            }
            let pair = (env.collection, env.tuple);
            if !ingress.contains(&pair) {
                ingress.push(pair);
            }
        }
        for (name, tuple) in &ingress {
            if let Some(collection) = self.catalog.get_mut(name) {
                collection.insert(tuple.clone());
            }
            recorder.record(tick, INGRESS_RULE, name, FactOp::Insert, tuple.id(), Vec::new());
        }

        // Evaluate all rules before touching any collection, so every rule
        // sees the same tick-start state.
        let mut derived: Vec<Vec<Derivation>> = Vec::new();
        for rule in &self.rules {
            match collect_rule(&rule.plan, &self.catalog) {
                Ok(derivations) => derived.push(derivations),
                Err(e) => {
                    warn!(tick, rule = %rule.id, error = %e, "tick aborted");
                    self.clear_ephemeral();
                    report.errors.push(e);
                    return Ok(report);
                }
            }
        }

        // Deletes first. A tuple present at tick start records one
        // membership change however many rules delete it, but each deleting
        // derivation records its own fact. Deletes of absent tuples are
        // no-ops and record nothing.
        let mut deltas = TickDeltas::default();
        let mut deleted: HashSet<(CollectionName, Tuple)> = HashSet::new();
        for (rule, derivations) in self.rules.iter().zip(&derived) {
            if rule.merge != Merge::Delete {
                continue;
            }
            for d in derivations {
                let present = self
                    .catalog
                    .get(&rule.target)
                    .map(|c| c.contains(&d.tuple))
                    .unwrap_or(false);
                if !present {
                    continue;
                }
                if deleted.insert((rule.target.clone(), d.tuple.clone())) {
                    deltas
                        .deletes
                        .push((rule.target.clone(), d.tuple.clone()));
                }
                recorder.record(
                    tick,
                    &rule.id,
                    &rule.target,
                    FactOp::Delete,
                    d.tuple.id(),
                    d.inputs.clone(),
                );
            }
        }

        // Then inserts; re-insertion after a same-tick delete wins. Every
        // derivation event records a fact even when the tuple is already
        // present, since a differing derivation is still lineage.
        let mut inserted: HashSet<(CollectionName, Tuple)> = HashSet::new();
        for (rule, derivations) in self.rules.iter().zip(&derived) {
            if rule.merge != Merge::Insert {
                continue;
            }
            for d in derivations {
                let key = (rule.target.clone(), d.tuple.clone());
                let present = self
                    .catalog
                    .get(&rule.target)
                    .map(|c| c.contains(&d.tuple))
                    .unwrap_or(false);
                let absent_after_deletes = !present || deleted.contains(&key);
                if absent_after_deletes && inserted.insert(key.clone()) {
                    deltas.inserts.push(key);
                }
                recorder.record(
                    tick,
                    &rule.id,
                    &rule.target,
                    FactOp::Insert,
                    d.tuple.id(),
                    d.inputs.clone(),
                );
            }
        }

        // Ingress arrivals are part of the tick's persisted deltas.
        let mut all_inserts: Vec<(CollectionName, Tuple)> = ingress.clone();
        all_inserts.extend(deltas.inserts.iter().cloned());
        let persisted = TickDeltas {
            deletes: deltas.deletes.clone(),
            inserts: all_inserts,
        };

        // The store must acknowledge the tick before live state advances.
        let fact_count = recorder.len();
        if let Err(e) = self
            .store
            .record_tick(tick, &self.catalog, &persisted, recorder.facts())
        {
            self.clear_ephemeral();
            return Err(e);
        }

        for (name, tuple) in &deltas.deletes {
            if let Some(collection) = self.catalog.get_mut(name) {
                collection.delete(tuple);
            }
        }
        for (name, tuple) in &deltas.inserts {
            if let Some(collection) = self.catalog.get_mut(name) {
                collection.insert(tuple.clone());
            }
        }

        for (name, tuple) in persisted.deletes {
            report.deltas.entry(name).or_default().deleted.push(tuple);
        }
        for (name, tuple) in persisted.inserts {
            report.deltas.entry(name).or_default().inserted.push(tuple);
        }

        self.clear_ephemeral();
        debug!(tick, facts = fact_count, "tick complete");
        Ok(report)
    }

    /// Channel and scratch contents do not outlive the tick.
    fn clear_ephemeral(&mut self) {
        for collection in self.catalog.collections_mut() {
            if collection.lifetime() != Lifetime::Table {
                collection.clear();
            }
        }
    }
}

/// Materialization boundary for one rule: the stream is collected and
/// exact duplicate derivations (same tuple, same inputs) are dropped.
fn collect_rule(plan: &Plan, catalog: &Catalog) -> Result<Vec<Derivation>> {
    let collected: Result<Vec<Derivation>> = plan.stream(catalog).collect();
    let mut seen: HashSet<Derivation> = HashSet::new();
    Ok(collected?
        .into_iter()
        .filter(|d| seen.insert(d.clone()))
        .collect())
}
