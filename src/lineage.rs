use crate::ast::{CollectionName, RuleId};
use crate::error::{Error, Result};
use crate::value::TupleId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactOp {
    Insert,
    Delete,
}

impl FactOp {
    pub fn as_str(self) -> &'static str {
        match self {
            FactOp::Insert => "insert",
            FactOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<FactOp> {
        match s {
            "insert" => Ok(FactOp::Insert),
            "delete" => Ok(FactOp::Delete),
            _ => Err(Error::Store(format!("unknown fact op {:?}", s))),
        }
    }
}

/// One derivation event: which rule derived (or deleted) which tuple in
/// which collection at which tick, and the ordered identities of the input
/// tuples that contributed. Facts are append-only and never rewritten; a
/// correction is expressed as a new delete-then-insert pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineageFact {
    pub tick: u64,
    pub rule_id: RuleId,
    pub collection: CollectionName,
    pub tuple_id: TupleId,
    pub inputs: Vec<TupleId>,
    pub op: FactOp,
}

/// Accumulates the lineage facts of one tick, in emission order.
#[derive(Debug, Default)]
pub struct Recorder {
    facts: Vec<LineageFact>,
}

impl Recorder {
    pub fn new() -> Recorder {
        Recorder::default()
    }

    pub fn record(
        &mut self,
        tick: u64,
        rule_id: &str,
        collection: &str,
        op: FactOp,
        tuple_id: TupleId,
        inputs: Vec<TupleId>,
    ) {
        self.facts.push(LineageFact {
            tick,
            rule_id: rule_id.to_owned(),
            collection: collection.to_owned(),
            tuple_id,
            inputs,
            op,
        });
    }

    pub fn facts(&self) -> &[LineageFact] {
        &self.facts
    }

    pub fn into_facts(self) -> Vec<LineageFact> {
        self.facts
    }

    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }
}

/// A reconstructed provenance chain for one tuple: every insert fact that
/// derived it, each with the provenance of its own inputs, walked back
/// until base facts (tuples no rule derived) or a depth bound.
#[derive(Clone, Debug)]
pub struct Provenance {
    pub tuple_id: TupleId,
    pub derivations: Vec<DerivationStep>,
}

impl Provenance {
    /// A base fact: nothing in the store derived this tuple.
    pub fn is_base(&self) -> bool {
        self.derivations.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct DerivationStep {
    pub fact: LineageFact,
    pub inputs: Vec<Provenance>,
}
