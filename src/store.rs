use std::marker::PhantomData;
use std::path::Path;
use std::time::Duration;

use itertools::Itertools;
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection};
use tracing::warn;

use crate::ast::CollectionName;
use crate::codec::{export_schema, Codec, StorageValue};
use crate::collection::{Catalog, Lifetime};
use crate::error::{Error, Result};
use crate::lineage::{DerivationStep, FactOp, LineageFact, Provenance};
use crate::value::{Schema, Tuple, TupleId};

#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub max_retries: u32,
    /// Base delay between retries; doubles per attempt.
    pub backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> StoreConfig {
        StoreConfig {
            max_retries: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Membership changes of one tick, flattened in apply order: all deletes
/// before all inserts.
#[derive(Clone, Debug, Default)]
pub struct TickDeltas {
    pub deletes: Vec<(CollectionName, Tuple)>,
    pub inserts: Vec<(CollectionName, Tuple)>,
}

impl TickDeltas {
    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty()
    }
}

/// Persists collection history and lineage facts into SQLite.
///
/// Each collection gets a history table: metadata columns (tuple hash,
/// insertion tick, deletion tick) followed by the codec-derived value
/// columns. Rows are never physically deleted; a delete sets the deletion
/// tick, preserving full history for replay and audit.
pub struct LineageStore<C: Codec> {
    conn: Connection,
    config: StoreConfig,
    _codec: PhantomData<C>,
}

impl<C: Codec> LineageStore<C> {
    pub fn open_in_memory() -> Result<LineageStore<C>> {
        Self::with_config(Connection::open_in_memory()?, StoreConfig::default())
    }

    pub fn open(path: &Path) -> Result<LineageStore<C>> {
        Self::with_config(Connection::open(path)?, StoreConfig::default())
    }

    pub fn with_config(conn: Connection, config: StoreConfig) -> Result<LineageStore<C>> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS lineage_facts (
                id INTEGER PRIMARY KEY,
                tick INTEGER NOT NULL,
                rule_id TEXT NOT NULL,
                collection TEXT NOT NULL,
                tuple_hash TEXT NOT NULL,
                op TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS lineage_inputs (
                fact_id INTEGER NOT NULL,
                ordinal INTEGER NOT NULL,
                input_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_facts_tuple ON lineage_facts (tuple_hash);
            CREATE INDEX IF NOT EXISTS idx_inputs_fact ON lineage_inputs (fact_id);",
        )?;
        Ok(LineageStore {
            conn,
            config,
            _codec: PhantomData,
        })
    }

    /// The exact provisioning statement for a collection. Exposed so the
    /// generated schema can be inspected (e.g. under the mock codec)
    /// without a store behind it.
    pub fn table_sql(name: &str, schema: &Schema) -> String {
        let cols = export_schema::<C>(schema)
            .iter()
            .map(|(name, ty)| format!("\"{}\" {}", name, ty))
            .join(", ");
        format!(
            "CREATE TABLE \"{}\" (hash TEXT NOT NULL, time_inserted INTEGER NOT NULL, time_deleted INTEGER, {})",
            name, cols
        )
    }

    pub fn create_schema(&self, name: &str, schema: &Schema) -> Result<()> {
        self.conn.execute(&Self::table_sql(name, schema), [])?;
        Ok(())
    }

    /// Durably records one tick: either every delta and fact lands, or none
    /// do. Transient failures are retried with doubling backoff up to the
    /// configured bound; exhaustion surfaces as a store error, which the
    /// engine treats as fatal.
    pub fn record_tick(
        &mut self,
        tick: u64,
        catalog: &Catalog,
        deltas: &TickDeltas,
        facts: &[LineageFact],
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.try_record(tick, catalog, deltas, facts) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.backoff * 2u32.pow(attempt - 1);
                    warn!(tick, attempt, error = %e, "store write failed, retrying");
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    return Err(Error::Store(format!(
                        "tick {} not recorded after {} attempts: {}",
                        tick,
                        attempt + 1,
                        e
                    )))
                }
            }
        }
    }

    fn try_record(
        &mut self,
        tick: u64,
        catalog: &Catalog,
        deltas: &TickDeltas,
        facts: &[LineageFact],
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        for (name, tuple) in &deltas.deletes {
            tx.execute(
                &format!(
                    "UPDATE \"{}\" SET time_deleted = ?1 WHERE hash = ?2 AND time_deleted IS NULL",
                    name
                ),
                params![tick as i64, tuple.id().to_string()],
            )?;
        }

        for (name, tuple) in &deltas.inserts {
            let collection = catalog
                .get(name)
                .ok_or_else(|| Error::Store(format!("unknown collection {:?}", name)))?;
            // Channel rows live exactly one tick; their deletion tick is
            // written up front. Scratch never reaches the store.
            let deleted = match collection.lifetime() {
                Lifetime::Table => None,
                Lifetime::Channel => Some(tick as i64),
                Lifetime::Scratch => continue,
            };
            let schema = collection.schema();
            let col_names = schema
                .columns()
                .iter()
                .map(|c| format!("\"{}\"", c.name))
                .join(", ");
            let placeholders = (0..schema.arity() + 3)
                .map(|i| format!("?{}", i + 1))
                .join(", ");
            let sql = format!(
                "INSERT INTO \"{}\" (hash, time_inserted, time_deleted, {}) VALUES ({})",
                name, col_names, placeholders
            );
            let mut row: Vec<rusqlite::types::Value> = vec![
                tuple.id().to_string().into(),
                (tick as i64).into(),
                match deleted {
                    Some(t) => t.into(),
                    None => rusqlite::types::Value::Null,
                },
            ];
            for value in &tuple.0 {
                row.push(match C::encode(value) {
                    StorageValue::Integer(x) => x.into(),
                    StorageValue::Real(x) => x.into(),
                    StorageValue::Text(s) => s.into(),
                });
            }
            tx.execute(&sql, params_from_iter(row))?;
        }

        for fact in facts {
            tx.execute(
                "INSERT INTO lineage_facts (tick, rule_id, collection, tuple_hash, op)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    fact.tick as i64,
                    fact.rule_id,
                    fact.collection,
                    fact.tuple_id.to_string(),
                    fact.op.as_str(),
                ],
            )?;
            let fact_id = tx.last_insert_rowid();
            for (ordinal, input) in fact.inputs.iter().enumerate() {
                tx.execute(
                    "INSERT INTO lineage_inputs (fact_id, ordinal, input_hash)
                     VALUES (?1, ?2, ?3)",
                    params![fact_id, ordinal as i64, input.to_string()],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Facts about one tuple identity, in emission order.
    pub fn facts_for(&self, id: TupleId) -> Result<Vec<LineageFact>> {
        self.load_facts(
            "WHERE tuple_hash = ?1 ORDER BY id",
            params![id.to_string()],
        )
    }

    /// Facts emitted in the inclusive tick range, in emission order.
    pub fn facts_between(&self, from_tick: u64, to_tick: u64) -> Result<Vec<LineageFact>> {
        self.load_facts(
            "WHERE tick >= ?1 AND tick <= ?2 ORDER BY id",
            params![from_tick as i64, to_tick as i64],
        )
    }

    fn load_facts<P: rusqlite::Params>(&self, filter: &str, params: P) -> Result<Vec<LineageFact>> {
        let sql = format!(
            "SELECT id, tick, rule_id, collection, tuple_hash, op FROM lineage_facts {}",
            filter
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params)?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            let fact_id: i64 = row.get(0)?;
            let tick: i64 = row.get(1)?;
            let rule_id: String = row.get(2)?;
            let collection: String = row.get(3)?;
            let hash: String = row.get(4)?;
            let op: String = row.get(5)?;
            facts.push(LineageFact {
                tick: tick as u64,
                rule_id,
                collection,
                tuple_id: TupleId::from_hex(&hash)?,
                inputs: self.load_inputs(fact_id)?,
                op: FactOp::parse(&op)?,
            });
        }
        Ok(facts)
    }

    fn load_inputs(&self, fact_id: i64) -> Result<Vec<TupleId>> {
        let mut stmt = self.conn.prepare(
            "SELECT input_hash FROM lineage_inputs WHERE fact_id = ?1 ORDER BY ordinal",
        )?;
        let mut rows = stmt.query(params![fact_id])?;
        let mut inputs = Vec::new();
        while let Some(row) = rows.next()? {
            let hash: String = row.get(0)?;
            inputs.push(TupleId::from_hex(&hash)?);
        }
        Ok(inputs)
    }

    /// Reconstructs the contributing-tuple chain for a tuple, transitively,
    /// until base facts or the depth bound. Depth zero stops at the tuple
    /// itself.
    pub fn provenance(&self, id: TupleId, max_depth: usize) -> Result<Provenance> {
        if max_depth == 0 {
            return Ok(Provenance {
                tuple_id: id,
                derivations: Vec::new(),
            });
        }
        let mut derivations = Vec::new();
        for fact in self.facts_for(id)? {
            if fact.op != FactOp::Insert {
                continue;
            }
            let inputs = fact
                .inputs
                .iter()
                .map(|input| self.provenance(*input, max_depth - 1))
                .collect::<Result<Vec<_>>>()?;
            derivations.push(DerivationStep { fact, inputs });
        }
        Ok(Provenance {
            tuple_id: id,
            derivations,
        })
    }

    /// A collection's contents as of the end of the given tick,
    /// reconstructed from history rows.
    pub fn contents_at(&self, name: &str, schema: &Schema, tick: u64) -> Result<Vec<Tuple>> {
        let col_list = schema
            .columns()
            .iter()
            .map(|c| format!("\"{}\"", c.name))
            .join(", ");
        let sql = format!(
            "SELECT {} FROM \"{}\" WHERE time_inserted <= ?1
             AND (time_deleted IS NULL OR time_deleted > ?1) ORDER BY rowid",
            col_list, name
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![tick as i64])?;
        let mut tuples = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::new();
            for (i, column) in schema.columns().iter().enumerate() {
                let stored = match row.get_ref(i)? {
                    ValueRef::Integer(x) => StorageValue::Integer(x),
                    ValueRef::Real(x) => StorageValue::Real(x),
                    ValueRef::Text(bytes) => StorageValue::Text(
                        std::str::from_utf8(bytes)
                            .map_err(|e| Error::Store(e.to_string()))?
                            .to_owned(),
                    ),
                    other => {
                        return Err(Error::Store(format!(
                            "unexpected stored value {:?} in {}.{}",
                            other, name, column.name
                        )))
                    }
                };
                values.push(C::decode(&column.kind, &stored)?);
            }
            tuples.push(Tuple::new(values));
        }
        Ok(tuples)
    }
}
