//! Visible-row filters
//!
//! A [`FilterSpec`] joins two independently negatable terms: a predicate in
//! the query language of [`crate::predicate`] and a list of hand-picked row
//! ids. The in-memory backend evaluates a compiled spec once per row; the
//! query backend renders it as one SQL boolean expression.

use std::time::Instant;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tp_core::{
    CellValue, ColumnDescriptor, DataSourceAdapter, QueryBackend, Result, SourceRowId,
};

use crate::index_space::IndexSpace;
use crate::predicate::Predicate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryTerm {
    pub text: String,
    /// Match rows for which the predicate is false or unknown instead
    pub negated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickedTerm {
    pub ids: Vec<SourceRowId>,
    pub negated: bool,
}

/// How the query and picked terms are joined when both are present
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combine {
    #[default]
    Any,
    All,
}

/// Description of the rows that stay visible
///
/// A spec without terms matches every row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    pub query: Option<QueryTerm>,
    pub picked: Option<PickedTerm>,
    pub combine: Combine,
}

impl FilterSpec {
    pub fn query(text: impl Into<String>) -> Self {
        Self::default().with_query(text)
    }

    pub fn picked(ids: Vec<SourceRowId>) -> Self {
        Self::default().with_picked(ids)
    }

    pub fn with_query(mut self, text: impl Into<String>) -> Self {
        self.query = Some(QueryTerm {
            text: text.into(),
            negated: false,
        });
        self
    }

    pub fn with_picked(mut self, ids: Vec<SourceRowId>) -> Self {
        self.picked = Some(PickedTerm { ids, negated: false });
        self
    }

    pub fn with_combine(mut self, combine: Combine) -> Self {
        self.combine = combine;
        self
    }

    pub fn negate_query(mut self) -> Self {
        if let Some(term) = self.query.as_mut() {
            term.negated = !term.negated;
        }
        self
    }

    pub fn negate_picked(mut self) -> Self {
        if let Some(term) = self.picked.as_mut() {
            term.negated = !term.negated;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.query.is_none() && self.picked.is_none()
    }

    /// The exact complement of this spec
    ///
    /// Flips both negations and swaps the join. The complement of the empty
    /// spec matches nothing.
    pub fn inverted(&self) -> Self {
        if self.is_empty() {
            return Self::picked(Vec::new());
        }
        let combine = match self.combine {
            Combine::Any => Combine::All,
            Combine::All => Combine::Any,
        };
        self.clone().negate_query().negate_picked().with_combine(combine)
    }
}

/// A spec with its predicate parsed against a column list
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    query: Option<(Predicate, bool)>,
    picked: Option<(AHashSet<SourceRowId>, bool)>,
    combine: Combine,
}

impl CompiledFilter {
    pub fn compile(spec: &FilterSpec, columns: &[ColumnDescriptor]) -> Result<Self> {
        let query = match &spec.query {
            Some(term) => Some((Predicate::parse(&term.text, columns)?, term.negated)),
            None => None,
        };
        let picked = spec
            .picked
            .as_ref()
            .map(|term| (term.ids.iter().copied().collect(), term.negated));
        Ok(Self {
            query,
            picked,
            combine: spec.combine,
        })
    }

    /// Whether the row `id` passes; `cell` reads a column of that row
    pub fn matches(
        &self,
        id: SourceRowId,
        cell: &mut dyn FnMut(usize) -> Result<CellValue>,
    ) -> Result<bool> {
        let picked = self
            .picked
            .as_ref()
            .map(|(ids, negated)| ids.contains(&id) != *negated);

        match (&self.query, picked) {
            (None, None) => Ok(true),
            (None, Some(p)) => Ok(p),
            (Some(_), Some(true)) if self.combine == Combine::Any => Ok(true),
            (Some(_), Some(false)) if self.combine == Combine::All => Ok(false),
            (Some((predicate, negated)), _) => Ok(predicate.matches(cell)? != *negated),
        }
    }

    /// SQL boolean expression over the backend's table
    pub fn to_sql(&self, backend: &dyn QueryBackend) -> String {
        let mut terms = Vec::with_capacity(2);

        if let Some((predicate, negated)) = &self.query {
            let columns = backend.as_adapter().columns();
            let sql = predicate.to_sql(
                &|col| {
                    columns
                        .get(col)
                        .map(|c| backend.escape_identifier(&c.name))
                        .unwrap_or_else(|| "NULL".to_string())
                },
                &|value| backend.escape_literal(value),
            );
            // unknown must count as a miss on both sides of a negation
            let expected = if *negated { 0 } else { 1 };
            terms.push(format!("(CASE WHEN {} THEN 1 ELSE 0 END = {})", sql, expected));
        }

        if let Some((ids, negated)) = &self.picked {
            terms.push(picked_sql(backend, ids, *negated));
        }

        match (terms.len(), self.combine) {
            (0, _) => "1".to_string(),
            (1, _) => terms.remove(0),
            (_, Combine::Any) => format!("({})", terms.join(" OR ")),
            (_, Combine::All) => format!("({})", terms.join(" AND ")),
        }
    }
}

fn picked_sql(backend: &dyn QueryBackend, ids: &AHashSet<SourceRowId>, negated: bool) -> String {
    if ids.is_empty() {
        return if negated { "1" } else { "0" }.to_string();
    }
    let mut ids: Vec<i64> = ids.iter().map(|id| id.get()).collect();
    ids.sort_unstable();
    let list = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ");
    format!(
        "({} {}IN ({}))",
        backend.key_column_sql(),
        if negated { "NOT " } else { "" },
        list
    )
}

/// Active filter plus both evaluation strategies
#[derive(Debug, Clone, Default)]
pub struct FilterEngine {
    active: Option<FilterSpec>,
}

impl FilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<&FilterSpec> {
        self.active.as_ref()
    }

    pub fn is_current(&self, spec: Option<&FilterSpec>) -> bool {
        self.active.as_ref() == spec
    }

    pub fn record(&mut self, spec: Option<FilterSpec>) {
        if self.active != spec {
            debug!("Filter {:?} -> {:?}", self.active, spec);
        }
        self.active = spec;
    }

    /// Evaluate `spec` for every source position, hidden rows included
    pub fn evaluate(
        spec: &FilterSpec,
        adapter: &dyn DataSourceAdapter,
        space: &IndexSpace,
    ) -> Result<Vec<bool>> {
        let start = Instant::now();
        let compiled = CompiledFilter::compile(spec, &adapter.columns())?;

        let mut passes = Vec::with_capacity(space.source_len());
        for &id in space.ids() {
            passes.push(compiled.matches(id, &mut |col| adapter.cell_value(id, col))?);
        }

        debug!(
            "Evaluated filter over {} rows in {:?}, {} pass",
            passes.len(),
            start.elapsed(),
            passes.iter().filter(|p| **p).count()
        );
        Ok(passes)
    }

    /// SQL boolean expression for `spec`; `1` when there is none
    pub fn passes_sql(spec: Option<&FilterSpec>, backend: &dyn QueryBackend) -> Result<String> {
        match spec {
            Some(spec) => {
                let compiled = CompiledFilter::compile(spec, &backend.as_adapter().columns())?;
                Ok(compiled.to_sql(backend))
            }
            None => Ok("1".to_string()),
        }
    }
}
