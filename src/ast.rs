use std::ops::BitOr;

use crate::value::Value;

pub type RuleId = String;
pub type CollectionName = String;
pub type ColumnName = String;

/// A logical operator tree. Building one is pure tree construction: nothing
/// is evaluated and no storage is touched until the tree is bound and
/// pulled, so a rule can be declared once and re-evaluated every tick.
#[derive(Clone, Debug)]
pub enum Dataflow {
    Scan(CollectionName),
    Filter {
        input: Box<Dataflow>,
        pred: Pred,
    },
    Project {
        input: Box<Dataflow>,
        cols: Vec<ProjCol>,
    },
    Join {
        left: Box<Dataflow>,
        right: Box<Dataflow>,
        on: Vec<(ColumnName, ColumnName)>,
    },
    Union(Vec<Dataflow>),
    Difference {
        left: Box<Dataflow>,
        right: Box<Dataflow>,
    },
    Count {
        input: Box<Dataflow>,
    },
}

impl Dataflow {
    pub fn filter(self, pred: Pred) -> Dataflow {
        Dataflow::Filter {
            input: Box::new(self),
            pred,
        }
    }

    pub fn project(self, cols: Vec<ProjCol>) -> Dataflow {
        Dataflow::Project {
            input: Box::new(self),
            cols,
        }
    }

    pub fn join(self, right: Dataflow, on: Vec<(ColumnName, ColumnName)>) -> Dataflow {
        Dataflow::Join {
            left: Box::new(self),
            right: Box::new(right),
            on,
        }
    }

    pub fn union_with(self, other: Dataflow) -> Dataflow {
        Dataflow::Union(vec![self, other])
    }

    pub fn minus(self, other: Dataflow) -> Dataflow {
        Dataflow::Difference {
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    pub fn count(self) -> Dataflow {
        Dataflow::Count {
            input: Box::new(self),
        }
    }
}

pub fn scan(name: &str) -> Dataflow {
    Dataflow::Scan(name.to_owned())
}

/// One output column of a projection: a column reference or a literal,
/// optionally renamed. A literal must be named.
#[derive(Clone, Debug)]
pub struct ProjCol {
    pub expr: Expr,
    pub name: Option<ColumnName>,
}

impl ProjCol {
    pub fn named(mut self, name: &str) -> ProjCol {
        self.name = Some(name.to_owned());
        self
    }
}

pub fn col(name: &str) -> ProjCol {
    ProjCol {
        expr: Expr::Col(name.to_owned()),
        name: None,
    }
}

pub fn lit(value: Value) -> ProjCol {
    ProjCol {
        expr: Expr::Lit(value),
        name: None,
    }
}

#[derive(Clone, Debug)]
pub enum Expr {
    Col(ColumnName),
    Lit(Value),
}

#[derive(Clone, Debug)]
pub struct Pred {
    pub lhs: ColumnName,
    pub cmp: Cmp,
    pub rhs: Operand,
}

impl Pred {
    pub fn new(lhs: &str, cmp: Cmp, rhs: Operand) -> Pred {
        Pred {
            lhs: lhs.to_owned(),
            cmp,
            rhs,
        }
    }

    pub fn eq(lhs: &str, rhs: Operand) -> Pred {
        Pred::new(lhs, Cmp::Eq, rhs)
    }

    pub fn ne(lhs: &str, rhs: Operand) -> Pred {
        Pred::new(lhs, Cmp::Ne, rhs)
    }

    pub fn lt(lhs: &str, rhs: Operand) -> Pred {
        Pred::new(lhs, Cmp::Lt, rhs)
    }

    pub fn gt(lhs: &str, rhs: Operand) -> Pred {
        Pred::new(lhs, Cmp::Gt, rhs)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug)]
pub enum Operand {
    Col(ColumnName),
    Lit(Value),
}

impl Operand {
    pub fn col(name: &str) -> Operand {
        Operand::Col(name.to_owned())
    }

    pub fn lit(value: Value) -> Operand {
        Operand::Lit(value)
    }
}

pub fn on(pairs: &[(&str, &str)]) -> Vec<(ColumnName, ColumnName)> {
    pairs
        .iter()
        .map(|(l, r)| ((*l).to_owned(), (*r).to_owned()))
        .collect()
}

/// An operator waiting for an upstream, so trees can be piped together:
/// `scan("xs") | count()` builds the same tree as `scan("xs").count()`.
#[derive(Clone, Debug)]
pub enum Op {
    Filter(Pred),
    Project(Vec<ProjCol>),
    Join {
        right: Dataflow,
        on: Vec<(ColumnName, ColumnName)>,
    },
    Union(Dataflow),
    Difference(Dataflow),
    Count,
}

pub fn filter(pred: Pred) -> Op {
    Op::Filter(pred)
}

pub fn project(cols: Vec<ProjCol>) -> Op {
    Op::Project(cols)
}

pub fn join(right: Dataflow, on: Vec<(ColumnName, ColumnName)>) -> Op {
    Op::Join { right, on }
}

pub fn union(with: Dataflow) -> Op {
    Op::Union(with)
}

pub fn minus(with: Dataflow) -> Op {
    Op::Difference(with)
}

pub fn count() -> Op {
    Op::Count
}

impl BitOr<Op> for Dataflow {
    type Output = Dataflow;

    fn bitor(self, op: Op) -> Dataflow {
        match op {
            Op::Filter(pred) => self.filter(pred),
            Op::Project(cols) => self.project(cols),
            Op::Join { right, on } => self.join(right, on),
            Op::Union(with) => self.union_with(with),
            Op::Difference(with) => self.minus(with),
            Op::Count => self.count(),
        }
    }
}
