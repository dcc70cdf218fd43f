//! Built-in function table

use crate::tsdb::Series;

use super::value::Type;

/// Default for an omitted trailing argument
#[derive(Debug, Clone, Copy)]
pub enum Literal {
    Str(&'static str),
    Num(f64),
}

/// How a function is evaluated
#[derive(Clone, Copy)]
pub enum Kind {
    /// `q(query, start, end)`
    Query,
    /// `band(query, duration, period, num)`
    Band,
    /// Series → number per group
    Reduce(fn(&Series) -> f64),
    /// Seconds since the newest point
    Since,
    /// `percentile(series, p)`
    Percentile,
    Abs,
    /// `nv(number, default)`
    Nv,
}

/// Signature and implementation of one built-in
pub struct Func {
    pub name: &'static str,
    pub args: &'static [Type],
    pub ret: Type,
    /// Values for omitted trailing arguments, aligned to the end of `args`
    pub defaults: &'static [Literal],
    pub kind: Kind,
}

impl Func {
    /// Fewest arguments a call may pass
    pub fn min_args(&self) -> usize {
        self.args.len() - self.defaults.len()
    }

    /// Indices of string arguments that must hold durations
    pub fn duration_args(&self) -> &'static [usize] {
        match self.kind {
            Kind::Query => &[1, 2],
            Kind::Band => &[1, 2],
            _ => &[],
        }
    }
}

impl std::fmt::Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Func").field("name", &self.name).finish()
    }
}

const fn reduce(name: &'static str, f: fn(&Series) -> f64) -> Func {
    Func {
        name,
        args: &[Type::Series],
        ret: Type::Number,
        defaults: &[],
        kind: Kind::Reduce(f),
    }
}

static BUILTINS: &[Func] = &[
    Func {
        name: "q",
        args: &[Type::Query, Type::String, Type::String],
        ret: Type::Series,
        defaults: &[Literal::Str("")],
        kind: Kind::Query,
    },
    Func {
        name: "band",
        args: &[Type::Query, Type::String, Type::String, Type::Number],
        ret: Type::Series,
        defaults: &[],
        kind: Kind::Band,
    },
    reduce("avg", avg),
    reduce("dev", dev),
    reduce("sum", sum),
    reduce("min", min),
    reduce("max", max),
    reduce("median", median),
    reduce("first", first),
    reduce("last", last),
    reduce("recent", last),
    reduce("len", len),
    reduce("diff", diff),
    reduce("streak", streak),
    Func {
        name: "since",
        args: &[Type::Series],
        ret: Type::Number,
        defaults: &[],
        kind: Kind::Since,
    },
    Func {
        name: "percentile",
        args: &[Type::Series, Type::Number],
        ret: Type::Number,
        defaults: &[],
        kind: Kind::Percentile,
    },
    Func {
        name: "abs",
        args: &[Type::Number],
        ret: Type::Number,
        defaults: &[],
        kind: Kind::Abs,
    },
    Func {
        name: "nv",
        args: &[Type::Number, Type::Number],
        ret: Type::Number,
        defaults: &[],
        kind: Kind::Nv,
    },
];

/// Find a built-in by name
pub fn lookup(name: &str) -> Option<&'static Func> {
    BUILTINS.iter().find(|f| f.name == name)
}

pub(crate) fn avg(s: &Series) -> f64 {
    if s.is_empty() {
        return f64::NAN;
    }
    sum(s) / s.len() as f64
}

/// Sample standard deviation
pub(crate) fn dev(s: &Series) -> f64 {
    let mean = avg(s);
    let sq: f64 = s.values().map(|v| (v - mean).powi(2)).sum();
    (sq / (s.len() as f64 - 1.0)).sqrt()
}

pub(crate) fn sum(s: &Series) -> f64 {
    s.values().sum()
}

pub(crate) fn min(s: &Series) -> f64 {
    s.values().copied().reduce(f64::min).unwrap_or(f64::NAN)
}

pub(crate) fn max(s: &Series) -> f64 {
    s.values().copied().reduce(f64::max).unwrap_or(f64::NAN)
}

pub(crate) fn median(s: &Series) -> f64 {
    percentile(s, 0.5)
}

pub(crate) fn first(s: &Series) -> f64 {
    s.values().next().copied().unwrap_or(f64::NAN)
}

pub(crate) fn last(s: &Series) -> f64 {
    s.values().next_back().copied().unwrap_or(f64::NAN)
}

pub(crate) fn len(s: &Series) -> f64 {
    s.len() as f64
}

pub(crate) fn diff(s: &Series) -> f64 {
    last(s) - first(s)
}

/// Longest run of consecutive non-zero points
pub(crate) fn streak(s: &Series) -> f64 {
    let mut best = 0usize;
    let mut run = 0usize;
    for v in s.values() {
        if *v != 0.0 {
            run += 1;
            best = best.max(run);
        } else {
            run = 0;
        }
    }
    best as f64
}

/// Nearest-rank percentile, `p` in `[0, 1]`
pub(crate) fn percentile(s: &Series, p: f64) -> f64 {
    if s.is_empty() {
        return f64::NAN;
    }
    let mut values: Vec<f64> = s.values().copied().collect();
    values.sort_by(f64::total_cmp);
    if p <= 0.0 {
        return values[0];
    }
    if p >= 1.0 {
        return values[values.len() - 1];
    }
    let idx = (p * (values.len() - 1) as f64).ceil() as usize;
    values[idx]
}
