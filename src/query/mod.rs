//! Graph query engine
//!
//! Parses the small query language (`deps`, `rdeps`, `allpaths`, `kind`,
//! `attr`, and target patterns) and evaluates it by walking the build
//! graph. Queries are strictly read-only.

mod eval;
mod parser;

pub use eval::evaluate;
pub use parser::{parse, QueryError, QueryExpr, TargetPattern};

use crate::graph::{BuildGraph, TargetId};
use std::collections::BTreeSet;

/// Parse and evaluate in one step
pub fn query(graph: &BuildGraph, input: &str) -> Result<BTreeSet<TargetId>, QueryError> {
    let expr = parse(input)?;
    evaluate(graph, &expr)
}
