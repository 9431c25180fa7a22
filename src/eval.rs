use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use indexmap::IndexSet;

use crate::ast::{Cmp, Dataflow, Expr, Operand, Pred};
use crate::collection::Catalog;
use crate::error::{Error, Result};
use crate::value::{Column, Schema, Tuple, TupleId, Value, ValueKind};

/// One output of a physical pipeline: the derived tuple plus the identities
/// of the input tuples that produced it, in operator order (left before
/// right for joins).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Derivation {
    pub tuple: Tuple,
    pub inputs: Vec<TupleId>,
}

pub type DerivStream<'a> = Box<dyn Iterator<Item = Result<Derivation>> + 'a>;

/// A logical tree bound against a catalog: names resolved to positions,
/// kinds and arities checked. Binding happens once, at rule registration;
/// per-tick evaluation never re-checks types.
#[derive(Clone, Debug)]
pub struct Plan {
    node: Node,
    schema: Schema,
}

impl Plan {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Pull-based evaluation: consuming the stream drives child nodes only
    /// as far as needed. Join, Difference and Count materialize their build
    /// side on first pull; everything else stays streaming.
    pub fn stream<'a>(&'a self, catalog: &'a Catalog) -> DerivStream<'a> {
        stream(&self.node, catalog)
    }
}

#[derive(Clone, Debug)]
enum Node {
    Scan(String),
    Filter {
        input: Box<Node>,
        pred: BoundPred,
    },
    Project {
        input: Box<Node>,
        exprs: Vec<BoundExpr>,
    },
    Join {
        left: Box<Node>,
        right: Box<Node>,
        keys: Vec<(usize, usize)>,
    },
    Union(Vec<Node>),
    Difference {
        left: Box<Node>,
        right: Box<Node>,
    },
    Count {
        input: Box<Node>,
    },
}

#[derive(Clone, Debug)]
struct BoundPred {
    lhs: usize,
    cmp: Cmp,
    rhs: BoundOperand,
}

#[derive(Clone, Debug)]
enum BoundOperand {
    Col(usize),
    Lit(Value),
}

#[derive(Clone, Debug)]
enum BoundExpr {
    Col(usize),
    Lit(Value),
}

pub fn compile(flow: &Dataflow, catalog: &Catalog) -> Result<Plan> {
    let (node, schema) = bind(flow, catalog)?;
    Ok(Plan { node, schema })
}

fn bind(flow: &Dataflow, catalog: &Catalog) -> Result<(Node, Schema)> {
    match flow {
        Dataflow::Scan(name) => {
            let collection = catalog.get(name).ok_or_else(|| {
                Error::Construction(format!("unknown collection {:?}", name))
            })?;
            Ok((Node::Scan(name.clone()), collection.schema().clone()))
        }

        Dataflow::Filter { input, pred } => {
            let (node, schema) = bind(input, catalog)?;
            let pred = bind_pred(pred, &schema)?;
            Ok((
                Node::Filter {
                    input: Box::new(node),
                    pred,
                },
                schema,
            ))
        }

        Dataflow::Project { input, cols } => {
            let (node, schema) = bind(input, catalog)?;
            if cols.is_empty() {
                return Err(Error::Construction(
                    "projection has no output columns".to_owned(),
                ));
            }
            let mut exprs = Vec::new();
            let mut out = Vec::new();
            for pc in cols {
                match &pc.expr {
                    Expr::Col(name) => {
                        let i = schema.position(name).ok_or_else(|| {
                            Error::Construction(format!("unknown column {:?}", name))
                        })?;
                        out.push(Column {
                            name: pc.name.clone().unwrap_or_else(|| name.clone()),
                            kind: schema.columns()[i].kind.clone(),
                        });
                        exprs.push(BoundExpr::Col(i));
                    }
                    Expr::Lit(value) => {
                        let name = pc.name.clone().ok_or_else(|| {
                            Error::Construction(
                                "literal projection column needs a name".to_owned(),
                            )
                        })?;
                        out.push(Column {
                            name,
                            kind: value.kind(),
                        });
                        exprs.push(BoundExpr::Lit(value.clone()));
                    }
                }
            }
            Ok((
                Node::Project {
                    input: Box::new(node),
                    exprs,
                },
                Schema::new(out)?,
            ))
        }

        Dataflow::Join { left, right, on } => {
            let (lnode, lschema) = bind(left, catalog)?;
            let (rnode, rschema) = bind(right, catalog)?;
            if on.is_empty() {
                return Err(Error::Construction(
                    "join needs at least one key column pair".to_owned(),
                ));
            }
            let mut keys = Vec::new();
            for (lname, rname) in on {
                let li = lschema.position(lname).ok_or_else(|| {
                    Error::Construction(format!("unknown join key {:?} on left side", lname))
                })?;
                let ri = rschema.position(rname).ok_or_else(|| {
                    Error::Construction(format!("unknown join key {:?} on right side", rname))
                })?;
                let lkind = &lschema.columns()[li].kind;
                let rkind = &rschema.columns()[ri].kind;
                if lkind != rkind {
                    return Err(Error::Construction(format!(
                        "join key kinds differ: {} is {}, {} is {}",
                        lname, lkind, rname, rkind
                    )));
                }
                keys.push((li, ri));
            }
            // Output is left columns then right columns, each side's key
            // columns kept once. A right-side name that collides with a
            // left-side one gets a numeric suffix.
            let mut cols = lschema.columns().to_vec();
            for c in rschema.columns() {
                let mut name = c.name.clone();
                let mut n = 2;
                while cols.iter().any(|existing| existing.name == name) {
                    name = format!("{}_{}", c.name, n);
                    n += 1;
                }
                cols.push(Column {
                    name,
                    kind: c.kind.clone(),
                });
            }
            Ok((
                Node::Join {
                    left: Box::new(lnode),
                    right: Box::new(rnode),
                    keys,
                },
                Schema::new(cols)?,
            ))
        }

        Dataflow::Union(branches) => {
            if branches.is_empty() {
                return Err(Error::Construction(
                    "union needs at least one branch".to_owned(),
                ));
            }
            let (first, schema) = bind(&branches[0], catalog)?;
            let mut nodes = vec![first];
            for branch in &branches[1..] {
                let (node, branch_schema) = bind(branch, catalog)?;
                if !same_shape(&schema, &branch_schema) {
                    return Err(Error::Construction(format!(
                        "union branch shape mismatch: {:?} vs {:?}",
                        schema.kinds().collect::<Vec<_>>(),
                        branch_schema.kinds().collect::<Vec<_>>()
                    )));
                }
                nodes.push(node);
            }
            Ok((Node::Union(nodes), schema))
        }

        Dataflow::Difference { left, right } => {
            let (lnode, lschema) = bind(left, catalog)?;
            let (rnode, rschema) = bind(right, catalog)?;
            if !same_shape(&lschema, &rschema) {
                return Err(Error::Construction(
                    "difference sides have different shapes".to_owned(),
                ));
            }
            Ok((
                Node::Difference {
                    left: Box::new(lnode),
                    right: Box::new(rnode),
                },
                lschema,
            ))
        }

        Dataflow::Count { input } => {
            let (node, _) = bind(input, catalog)?;
            let schema = Schema::of(&[("count", ValueKind::U64)])?;
            Ok((
                Node::Count {
                    input: Box::new(node),
                },
                schema,
            ))
        }
    }
}

fn same_shape(a: &Schema, b: &Schema) -> bool {
    a.arity() == b.arity() && a.kinds().eq(b.kinds())
}

fn bind_pred(pred: &Pred, schema: &Schema) -> Result<BoundPred> {
    let lhs = schema.position(&pred.lhs).ok_or_else(|| {
        Error::Construction(format!("unknown column {:?}", pred.lhs))
    })?;
    let lhs_kind = schema.columns()[lhs].kind.clone();
    let (rhs, rhs_kind) = match &pred.rhs {
        Operand::Col(name) => {
            let i = schema.position(name).ok_or_else(|| {
                Error::Construction(format!("unknown column {:?}", name))
            })?;
            (BoundOperand::Col(i), schema.columns()[i].kind.clone())
        }
        Operand::Lit(value) => (BoundOperand::Lit(value.clone()), value.kind()),
    };
    if lhs_kind != rhs_kind {
        return Err(Error::Construction(format!(
            "predicate compares {} against {}",
            lhs_kind, rhs_kind
        )));
    }
    let ordered = matches!(pred.cmp, Cmp::Lt | Cmp::Le | Cmp::Gt | Cmp::Ge);
    if ordered && !lhs_kind.is_ordered() {
        return Err(Error::Construction(format!(
            "kind {} does not support ordered comparison",
            lhs_kind
        )));
    }
    Ok(BoundPred {
        lhs,
        cmp: pred.cmp,
        rhs,
    })
}

fn stream<'a>(node: &'a Node, catalog: &'a Catalog) -> DerivStream<'a> {
    match node {
        Node::Scan(name) => match catalog.get(name) {
            Some(collection) => Box::new(collection.tuples().map(|t| {
                Ok(Derivation {
                    tuple: t.clone(),
                    inputs: vec![t.id()],
                })
            })),
            None => Box::new(std::iter::once(Err(Error::Evaluation(format!(
                "collection {:?} not in catalog",
                name
            ))))),
        },

        Node::Filter { input, pred } => {
            Box::new(stream(input, catalog).filter_map(move |item| match item {
                Ok(d) => match eval_pred(pred, &d.tuple) {
                    Ok(true) => Some(Ok(d)),
                    Ok(false) => None,
                    Err(e) => Some(Err(e)),
                },
                Err(e) => Some(Err(e)),
            }))
        }

        Node::Project { input, exprs } => {
            Box::new(stream(input, catalog).map(move |item| {
                let d = item?;
                let values = exprs
                    .iter()
                    .map(|expr| match expr {
                        BoundExpr::Col(i) => d.tuple.0[*i].clone(),
                        BoundExpr::Lit(v) => v.clone(),
                    })
                    .collect();
                Ok(Derivation {
                    tuple: Tuple::new(values),
                    inputs: d.inputs,
                })
            }))
        }

        Node::Join { left, right, keys } => join_stream(left, right, keys, catalog),

        Node::Union(branches) => {
            // Set semantics on tuple values, with one exception: the same
            // tuple derived by different branches keeps one derivation per
            // distinct input set, so every contributing branch shows up in
            // lineage. Only exact duplicates are dropped.
            let mut seen: HashSet<Derivation> = HashSet::new();
            Box::new(
                branches
                    .iter()
                    .flat_map(move |branch| stream(branch, catalog))
                    .filter(move |item| match item {
                        Ok(d) => seen.insert(d.clone()),
                        Err(_) => true,
                    }),
            )
        }

        Node::Difference { left, right } => difference_stream(left, right, catalog),

        Node::Count { input } => count_stream(input, catalog),
    }
}

fn eval_pred(pred: &BoundPred, tuple: &Tuple) -> Result<bool> {
    let lhs = &tuple.0[pred.lhs];
    let rhs = match &pred.rhs {
        BoundOperand::Col(i) => &tuple.0[*i],
        BoundOperand::Lit(v) => v,
    };
    Ok(match pred.cmp {
        Cmp::Eq => lhs == rhs,
        Cmp::Ne => lhs != rhs,
        Cmp::Lt => lhs.try_cmp(rhs)? == Ordering::Less,
        Cmp::Le => lhs.try_cmp(rhs)? != Ordering::Greater,
        Cmp::Gt => lhs.try_cmp(rhs)? == Ordering::Greater,
        Cmp::Ge => lhs.try_cmp(rhs)? != Ordering::Less,
    })
}

fn join_stream<'a>(
    left: &'a Node,
    right: &'a Node,
    keys: &'a [(usize, usize)],
    catalog: &'a Catalog,
) -> DerivStream<'a> {
    Box::new(std::iter::once(()).flat_map(move |()| -> DerivStream<'a> {
        // The right side is the build side: fully materialized into a hash
        // table on first pull. The left side streams through it.
        let built: Result<Vec<Derivation>> = stream(right, catalog).collect();
        let rows = match built {
            Ok(rows) => rows,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let mut table: HashMap<Vec<Value>, Vec<Derivation>> = HashMap::new();
        for d in rows {
            let key = keys.iter().map(|(_, ri)| d.tuple.0[*ri].clone()).collect();
            table.entry(key).or_default().push(d);
        }
        Box::new(stream(left, catalog).flat_map(move |item| -> Vec<Result<Derivation>> {
            match item {
                Err(e) => vec![Err(e)],
                Ok(l) => {
                    let key: Vec<Value> =
                        keys.iter().map(|(li, _)| l.tuple.0[*li].clone()).collect();
                    match table.get(&key) {
                        None => vec![],
                        Some(matches) => matches
                            .iter()
                            .map(|r| {
                                let mut values = l.tuple.0.clone();
                                values.extend(r.tuple.0.iter().cloned());
                                let mut inputs = l.inputs.clone();
                                inputs.extend(r.inputs.iter().copied());
                                Ok(Derivation {
                                    tuple: Tuple::new(values),
                                    inputs,
                                })
                            })
                            .collect(),
                    }
                }
            }
        }))
    }))
}

fn difference_stream<'a>(
    left: &'a Node,
    right: &'a Node,
    catalog: &'a Catalog,
) -> DerivStream<'a> {
    Box::new(std::iter::once(()).flat_map(move |()| -> DerivStream<'a> {
        let built: Result<Vec<Derivation>> = stream(right, catalog).collect();
        let exclude: HashSet<Tuple> = match built {
            Ok(rows) => rows.into_iter().map(|d| d.tuple).collect(),
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        Box::new(stream(left, catalog).filter(move |item| match item {
            Ok(d) => !exclude.contains(&d.tuple),
            Err(_) => true,
        }))
    }))
}

fn count_stream<'a>(input: &'a Node, catalog: &'a Catalog) -> DerivStream<'a> {
    Box::new(std::iter::once(()).flat_map(move |()| -> DerivStream<'a> {
        let collected: Result<Vec<Derivation>> = stream(input, catalog).collect();
        let rows = match collected {
            Ok(rows) => rows,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        // Counts distinct tuple values; every input tuple present at
        // evaluation time contributes to the single output. An empty input
        // still yields one tuple holding zero.
        let mut distinct: IndexSet<Tuple> = IndexSet::new();
        let mut inputs: IndexSet<TupleId> = IndexSet::new();
        for d in rows {
            distinct.insert(d.tuple);
            inputs.extend(d.inputs);
        }
        let n = distinct.len() as u64;
        Box::new(std::iter::once(Ok(Derivation {
            tuple: Tuple::new(vec![Value::U64(n)]),
            inputs: inputs.into_iter().collect(),
        })))
    }))
}
