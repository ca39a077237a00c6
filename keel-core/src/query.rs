//! Query descriptors
//!
//! A [`Query`] records what a read should do without doing it. The pieces are
//! held in fixed slots, so the lowering order is always
//! filter → include → order → page → project no matter which order the
//! builder methods were called in. Stores execute a query only at a terminal
//! operation (first, list, count, exists, group count).

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::filter::{write_ident, write_ident_list};
use crate::{Entity, KeelResult, Predicate, ValidationError};

/// Eager-load directive naming a navigation. Dotted paths load nested
/// navigations (`customer.address`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Include {
    path: String,
}

impl Include {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path split into navigation names, outermost first.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('.')
    }
}

impl From<&str> for Include {
    fn from(path: &str) -> Self {
        Include::new(path)
    }
}

impl From<String> for Include {
    fn from(path: String) -> Self {
        Include::new(path)
    }
}

/// Ordering key plus direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, descending: bool) -> Self {
        Self {
            field: field.into(),
            descending,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self::new(field, false)
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self::new(field, true)
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = if self.descending { "DESC" } else { "ASC" };
        write_ident(f, &self.field)?;
        write!(f, " {}", direction)
    }
}

/// Projection onto a subset of fields. The projected row is an object holding
/// only those fields, deserialised into the caller's result type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }
}

/// Grouping key for distinct-group counts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupBy {
    fields: Vec<String>,
}

impl GroupBy {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn field(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn validate(&self) -> KeelResult<()> {
        require_fields("group_by", &self.fields)
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_ident_list(f, self.fields.iter().map(String::as_str))
    }
}

/// Unexecuted read over entity type `T`.
pub struct Query<T> {
    predicate: Option<Predicate>,
    includes: Vec<Include>,
    order: Option<OrderBy>,
    skip: Option<usize>,
    take: Option<usize>,
    projection: Option<Projection>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Query<T> {
    /// The whole collection of `T`.
    pub fn new() -> Self {
        Self {
            predicate: None,
            includes: Vec::new(),
            order: None,
            skip: None,
            take: None,
            projection: None,
            _entity: PhantomData,
        }
    }

    /// Build from the optional pieces a repository read accepts.
    pub fn from_parts(
        predicate: Option<Predicate>,
        includes: &[Include],
        order: Option<OrderBy>,
        projection: Option<Projection>,
    ) -> Self {
        let mut query = Self::new();
        query.predicate = predicate;
        for include in includes {
            query = query.include(include.clone());
        }
        query.order = order;
        query.projection = projection;
        query
    }

    /// Add a filter. A second call is ANDed with the first.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => existing.and(predicate),
            None => predicate,
        });
        self
    }

    /// Append an eager-load directive. Duplicates are ignored.
    pub fn include(mut self, include: impl Into<Include>) -> Self {
        let include = include.into();
        if !self.includes.contains(&include) {
            self.includes.push(include);
        }
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order = Some(order);
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = Some(count);
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn select(mut self, projection: Projection) -> Self {
        self.projection = Some(projection);
        self
    }

    /// Same query without ordering, paging or projection; the shape counted
    /// by count and exists terminals.
    pub fn filtered_only(&self) -> Self {
        let mut query = Self::new();
        query.predicate = self.predicate.clone();
        query
    }

    pub fn predicate(&self) -> Option<&Predicate> {
        self.predicate.as_ref()
    }

    pub fn includes(&self) -> &[Include] {
        &self.includes
    }

    pub fn order(&self) -> Option<&OrderBy> {
        self.order.as_ref()
    }

    pub fn skip_count(&self) -> Option<usize> {
        self.skip
    }

    pub fn take_count(&self) -> Option<usize> {
        self.take
    }

    pub fn projection(&self) -> Option<&Projection> {
        self.projection.as_ref()
    }

    pub fn entity_type(&self) -> &'static str {
        T::entity_type()
    }

    /// Deterministic text form of this query.
    pub fn canonical_text(&self) -> String {
        self.to_string()
    }

    /// Fail fast on malformed pieces before anything is executed.
    pub fn validate(&self) -> KeelResult<()> {
        if let Some(predicate) = &self.predicate {
            predicate.validate()?;
        }
        for include in &self.includes {
            if include.segments().any(|s| s.trim().is_empty()) {
                return Err(ValidationError::InvalidValue {
                    field: "include".to_string(),
                    reason: format!("malformed navigation path '{}'", include.path()),
                }
                .into());
            }
        }
        if let Some(order) = &self.order {
            if order.field.trim().is_empty() {
                return Err(ValidationError::RequiredFieldMissing {
                    field: "order_by.field".to_string(),
                }
                .into());
            }
        }
        if let Some(projection) = &self.projection {
            require_fields("projection", projection.fields())?;
        }
        Ok(())
    }
}

fn require_fields(name: &str, fields: &[String]) -> KeelResult<()> {
    if fields.is_empty() {
        return Err(ValidationError::RequiredFieldMissing {
            field: name.to_string(),
        }
        .into());
    }
    if fields.iter().any(|f| f.trim().is_empty()) {
        return Err(ValidationError::InvalidValue {
            field: name.to_string(),
            reason: "field names must not be empty".to_string(),
        }
        .into());
    }
    Ok(())
}

impl<T: Entity> Default for Query<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            includes: self.includes.clone(),
            order: self.order.clone(),
            skip: self.skip,
            take: self.take,
            projection: self.projection.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity_type", &std::any::type_name::<T>())
            .field("predicate", &self.predicate)
            .field("includes", &self.includes)
            .field("order", &self.order)
            .field("skip", &self.skip)
            .field("take", &self.take)
            .field("projection", &self.projection)
            .finish()
    }
}

impl<T: Entity> fmt::Display for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FROM {}", T::entity_type())?;
        if let Some(predicate) = &self.predicate {
            write!(f, " WHERE {}", predicate)?;
        }
        if !self.includes.is_empty() {
            f.write_str(" INCLUDE ")?;
            write_ident_list(f, self.includes.iter().map(Include::path))?;
        }
        if let Some(order) = &self.order {
            write!(f, " ORDER BY {}", order)?;
        }
        if let Some(skip) = self.skip {
            write!(f, " SKIP {}", skip)?;
        }
        if let Some(take) = self.take {
            write!(f, " TAKE {}", take)?;
        }
        if let Some(projection) = &self.projection {
            f.write_str(" SELECT ")?;
            write_ident_list(f, projection.fields().iter().map(String::as_str))?;
        }
        Ok(())
    }
}
