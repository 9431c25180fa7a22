pub mod ast;
pub mod codec;
pub mod collection;
pub mod engine;
pub mod error;
pub mod eval;
pub mod lineage;
pub mod store;
pub mod value;

#[cfg(test)]
mod tests;

pub use ast::{
    col, count, filter, join, lit, minus, on, project, scan, union, Cmp, Dataflow, Op,
    Operand, Pred, ProjCol,
};
pub use codec::{export_schema, Codec, ColumnType, MockCodec, SqliteCodec, StorageValue};
pub use collection::{Catalog, Collection, Lifetime};
pub use engine::{CollectionDelta, Engine, Inbox, Merge, RuleDecl, TickReport, INGRESS_RULE};
pub use error::{Error, Result};
pub use eval::{compile, Derivation, Plan};
pub use lineage::{DerivationStep, FactOp, LineageFact, Provenance, Recorder};
pub use store::{LineageStore, StoreConfig, TickDeltas};
pub use value::{Column, Schema, Tuple, TupleId, Value, ValueKind};
