//! Tree-walking evaluator

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};

use super::funcs::{self, Func, Kind};
use super::parse::{BinaryOp, Node};
use super::value::{Computation, GroupResult, Value};
use super::EvalError;
use crate::models::TagSet;
use crate::tsdb::{Query, QueryCache, Request, Series};

/// Everything one evaluation needs from the outside world
pub struct Context<'a> {
    /// Reference time for relative query windows
    pub now: DateTime<Utc>,
    pub cache: &'a QueryCache,
}

impl<'a> Context<'a> {
    pub fn new(now: DateTime<Utc>, cache: &'a QueryCache) -> Self {
        Self { now, cache }
    }
}

/// Evaluate a root node: one numeric result per distinct group, sorted by group.
pub(crate) async fn evaluate(root: &Node, ctx: &Context<'_>) -> Result<Vec<GroupResult>, EvalError> {
    let mut by_group: BTreeMap<TagSet, GroupResult> = BTreeMap::new();
    for result in walk(root, ctx).await? {
        if !matches!(result.value, Value::Number(_)) {
            return Err(EvalError::ty(root, "expression produced a series"));
        }
        by_group.entry(result.group.clone()).or_insert(result);
    }
    Ok(by_group.into_values().collect())
}

fn walk<'a>(node: &'a Node, ctx: &'a Context<'a>) -> BoxFuture<'a, Result<Vec<GroupResult>, EvalError>> {
    async move {
        match node {
            Node::Number(n) => Ok(vec![GroupResult::number(*n, TagSet::new())]),
            Node::String(_) | Node::Query { .. } => Err(EvalError::ty(node, "not a value")),
            Node::Unary { op, arg } => {
                let results = walk(arg, ctx).await?;
                Ok(results
                    .into_iter()
                    .map(|mut r| {
                        r.value = match r.value {
                            Value::Number(n) => Value::Number(op.apply(n)),
                            Value::Series(s) => Value::Series(s.into_iter().map(|(t, v)| (t, op.apply(v))).collect()),
                        };
                        r
                    })
                    .collect())
            }
            Node::Binary { op, lhs, rhs } => {
                let (a, b) = futures::try_join!(walk(lhs, ctx), walk(rhs, ctx))?;
                union(node, *op, a, b)
            }
            Node::Func { func, args } => call(node, func, args, ctx).await,
        }
    }
    .boxed()
}

/// Join every pair of results whose groups are compatible.
///
/// Groups are compatible when equal, when either is empty, or when one is a
/// subset of the other. The joined result carries the larger group. Pairs
/// with conflicting tags are dropped.
fn union(
    node: &Node,
    op: BinaryOp,
    lhs: Vec<GroupResult>,
    rhs: Vec<GroupResult>,
) -> Result<Vec<GroupResult>, EvalError> {
    let mut out = Vec::new();
    for a in &lhs {
        for b in &rhs {
            let group = if a.group == b.group || b.group.is_empty() || a.group.subset(&b.group) {
                a.group.clone()
            } else if a.group.is_empty() || b.group.subset(&a.group) {
                b.group.clone()
            } else {
                continue;
            };

            let value = match (&a.value, &b.value) {
                (Value::Number(x), Value::Number(y)) => Value::Number(op.apply(*x, *y)),
                (Value::Series(s), Value::Number(y)) => {
                    Value::Series(s.iter().map(|(t, x)| (*t, op.apply(*x, *y))).collect())
                }
                (Value::Number(x), Value::Series(s)) => {
                    Value::Series(s.iter().map(|(t, y)| (*t, op.apply(*x, *y))).collect())
                }
                (Value::Series(_), Value::Series(_)) => {
                    return Err(EvalError::ty(node, "cannot combine two series"));
                }
            };

            let mut computations = a.computations.clone();
            computations.extend(b.computations.iter().cloned());
            if let Value::Number(v) = value {
                computations.push(Computation {
                    text: node.to_string(),
                    value: v,
                });
            }
            out.push(GroupResult {
                value,
                group,
                computations,
            });
        }
    }
    Ok(out)
}

async fn call(
    node: &Node,
    func: &Func,
    args: &[Node],
    ctx: &Context<'_>,
) -> Result<Vec<GroupResult>, EvalError> {
    match func.kind {
        Kind::Query => {
            let (query, start, end) = (query_arg(node, args, 0)?, duration(args, 1)?, duration(args, 2)?);
            let now = ctx.now.timestamp();
            let request = Request {
                start: now - secs(start),
                end: Some(now - secs(end)),
                queries: vec![query.clone()],
            };
            let responses = ctx.cache.query(&request).await?;
            if responses.is_empty() {
                return Err(EvalError::NoData(query.to_string()));
            }
            Ok(responses
                .iter()
                .map(|r| GroupResult::series(r.dps.clone(), r.tags.clone()))
                .collect())
        }
        Kind::Band => {
            let (query, window, period) = (query_arg(node, args, 0)?, duration(args, 1)?, duration(args, 2)?);
            let num = scalar(func, &args[3], ctx).await?;
            if !(num >= 1.0 && num.fract() == 0.0) {
                return Err(EvalError::Scalar {
                    func: func.name,
                    message: format!("count must be a positive integer, got {num}"),
                });
            }

            let mut merged: BTreeMap<TagSet, Series> = BTreeMap::new();
            let mut end = ctx.now.timestamp();
            for _ in 0..num as u32 {
                end -= secs(period);
                let request = Request {
                    start: end - secs(window),
                    end: Some(end),
                    queries: vec![query.clone()],
                };
                for response in ctx.cache.query(&request).await?.iter() {
                    merged
                        .entry(response.tags.clone())
                        .or_default()
                        .extend(response.dps.iter().map(|(t, v)| (*t, *v)));
                }
            }
            if merged.is_empty() {
                return Err(EvalError::NoData(query.to_string()));
            }
            Ok(merged
                .into_iter()
                .map(|(group, series)| GroupResult::series(series, group))
                .collect())
        }
        Kind::Reduce(f) => reduce(node, args, ctx, f).await,
        Kind::Since => {
            let now = ctx.now.timestamp();
            reduce(node, args, ctx, |s| {
                s.keys().next_back().map_or(f64::NAN, |t| (now - t) as f64)
            })
            .await
        }
        Kind::Percentile => {
            let p = scalar(func, &args[1], ctx).await?;
            reduce(node, args, ctx, |s| funcs::percentile(s, p)).await
        }
        Kind::Abs => {
            let mut results = walk(&args[0], ctx).await?;
            for r in &mut results {
                if let Value::Number(n) = r.value {
                    r.value = Value::Number(n.abs());
                }
            }
            Ok(results)
        }
        Kind::Nv => {
            let default = scalar(func, &args[1], ctx).await?;
            match walk(&args[0], ctx).await {
                Ok(results) if !results.is_empty() => Ok(results),
                Ok(_) | Err(EvalError::NoData(_)) => Ok(vec![GroupResult::number(default, TagSet::new())]),
                Err(e) => Err(e),
            }
        }
    }
}

/// Apply `f` to every series produced by the first argument
async fn reduce<F>(node: &Node, args: &[Node], ctx: &Context<'_>, f: F) -> Result<Vec<GroupResult>, EvalError>
where
    F: Fn(&Series) -> f64,
{
    let results = walk(&args[0], ctx).await?;
    results
        .into_iter()
        .map(|r| match r.value {
            Value::Series(ref s) => {
                let v = f(s);
                let mut computations = r.computations;
                computations.push(Computation {
                    text: node.to_string(),
                    value: v,
                });
                Ok(GroupResult {
                    value: Value::Number(v),
                    group: r.group,
                    computations,
                })
            }
            Value::Number(_) => Err(EvalError::ty(node, "expected a series argument")),
        })
        .collect()
}

/// Evaluate an argument that must produce exactly one number
async fn scalar(func: &Func, arg: &Node, ctx: &Context<'_>) -> Result<f64, EvalError> {
    let results = walk(arg, ctx).await?;
    match results.as_slice() {
        [GroupResult {
            value: Value::Number(n),
            ..
        }] => Ok(*n),
        _ => Err(EvalError::Scalar {
            func: func.name,
            message: format!("{arg} must evaluate to a single number"),
        }),
    }
}

fn query_arg<'n>(node: &Node, args: &'n [Node], index: usize) -> Result<&'n Query, EvalError> {
    match &args[index] {
        Node::Query { query, .. } => Ok(query),
        _ => Err(EvalError::ty(node, "expected a query argument")),
    }
}

fn duration(args: &[Node], index: usize) -> Result<Duration, EvalError> {
    match &args[index] {
        Node::String(s) if s.is_empty() => Ok(Duration::ZERO),
        Node::String(s) => humantime::parse_duration(s).map_err(|e| EvalError::Duration(format!("{s:?}: {e}"))),
        other => Err(EvalError::Duration(format!("{other} is not a duration"))),
    }
}

fn secs(d: Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}
