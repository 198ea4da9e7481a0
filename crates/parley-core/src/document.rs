//! The document model shared by every [`RemoteStore`](crate::store::RemoteStore)
//! backend.
//!
//! Documents are schemaless JSON objects addressed by `(collection, id)`.
//! Writes are expressed as [`Fields`] maps whose values are either plain
//! overwrites, a server-resolved timestamp, or monotonic set operations.
//! [`apply_fields`] is the single interpretation of those operations and
//! [`Query::apply`] the single interpretation of a query, so backends only
//! have to persist documents and announce changes.

use std::{cmp::Ordering, collections::BTreeMap};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::{Error, Result};

// ─── Collections ─────────────────────────────────────────────────────────────

/// The remote collections the client reads and writes.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
  strum::Display,
  strum::EnumString,
  strum::AsRefStr,
)]
#[strum(serialize_all = "camelCase")]
pub enum Collection {
  Users,
  DirectChats,
  Groups,
  Messages,
  Notifications,
  TypingSignals,
}

// ─── Documents ───────────────────────────────────────────────────────────────

/// A stored document: an id plus a JSON object of fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
  pub id:     String,
  pub fields: Map<String, Value>,
}

impl Document {
  pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
    Self { id: id.into(), fields }
  }

  pub fn get(&self, field: &str) -> Option<&Value> { self.fields.get(field) }

  /// Decode the document into a typed entity. The document id is injected as
  /// the `id` field before deserialisation.
  pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
    let mut fields = self.fields.clone();
    fields.insert("id".into(), Value::String(self.id.clone()));
    serde_json::from_value(Value::Object(fields)).map_err(|source| {
      Error::Decode {
        id: self.id.clone(),
        source,
      }
    })
  }
}

/// A typed entity stored in one collection.
pub trait Entity: DeserializeOwned + Clone + Send + Sync + 'static {
  const COLLECTION: Collection;

  fn id(&self) -> &str;

  fn from_document(doc: &Document) -> Result<Self> { doc.decode() }
}

// ─── Writes ──────────────────────────────────────────────────────────────────

/// One field mutation in a write.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
  /// Overwrite the field.
  Set(Value),
  /// Placeholder resolved by the store at write time.
  ServerTimestamp,
  /// Add each value to the array field unless already present.
  ArrayUnion(Vec<Value>),
  /// Remove every occurrence of each value from the array field.
  ArrayRemove(Vec<Value>),
}

impl FieldValue {
  pub fn set(value: impl Into<Value>) -> Self { Self::Set(value.into()) }

  pub fn union(value: impl Into<Value>) -> Self {
    Self::ArrayUnion(vec![value.into()])
  }

  pub fn remove(value: impl Into<Value>) -> Self {
    Self::ArrayRemove(vec![value.into()])
  }
}

/// A write payload, keyed by field name.
pub type Fields = BTreeMap<String, FieldValue>;

/// Build a [`Fields`] map from `(name, value)` pairs.
pub fn fields<const N: usize>(entries: [(&str, FieldValue); N]) -> Fields {
  entries
    .into_iter()
    .map(|(name, value)| (name.to_owned(), value))
    .collect()
}

/// Canonical wire form of a timestamp. Fixed precision keeps the strings
/// lexicographically ordered.
pub fn encode_timestamp(at: DateTime<Utc>) -> String {
  at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Apply `fields` to `target`, resolving server timestamps to `now`.
pub fn apply_fields(
  target: &mut Map<String, Value>,
  fields: Fields,
  now: DateTime<Utc>,
) {
  for (name, value) in fields {
    match value {
      FieldValue::Set(value) => {
        target.insert(name, value);
      }
      FieldValue::ServerTimestamp => {
        target.insert(name, Value::String(encode_timestamp(now)));
      }
      FieldValue::ArrayUnion(values) => {
        let slot = target.entry(name).or_insert_with(|| Value::Array(vec![]));
        if !slot.is_array() {
          *slot = Value::Array(vec![]);
        }
        if let Value::Array(items) = slot {
          for value in values {
            if !items.contains(&value) {
              items.push(value);
            }
          }
        }
      }
      FieldValue::ArrayRemove(values) => match target.get_mut(&name) {
        Some(Value::Array(items)) => items.retain(|item| !values.contains(item)),
        _ => {
          target.insert(name, Value::Array(vec![]));
        }
      },
    }
  }
}

// ─── Queries ─────────────────────────────────────────────────────────────────

/// A single predicate over a document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
  Eq { field: String, value: Value },
  ArrayContains { field: String, value: Value },
}

impl Filter {
  pub fn eq(field: &str, value: impl Into<Value>) -> Self {
    Self::Eq {
      field: field.to_owned(),
      value: value.into(),
    }
  }

  pub fn array_contains(field: &str, value: impl Into<Value>) -> Self {
    Self::ArrayContains {
      field: field.to_owned(),
      value: value.into(),
    }
  }

  pub fn matches(&self, doc: &Document) -> bool {
    match self {
      Self::Eq { field, value } => doc.get(field) == Some(value),
      Self::ArrayContains { field, value } => matches!(
        doc.get(field),
        Some(Value::Array(items)) if items.contains(value)
      ),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  Ascending,
  Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
  pub field:     String,
  pub direction: Direction,
}

/// A collection query: conjunction of filters, optional ordering and limit.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
  pub collection: Collection,
  pub filters:    Vec<Filter>,
  pub order_by:   Option<OrderBy>,
  pub limit:      Option<usize>,
}

impl Query {
  pub fn new(collection: Collection) -> Self {
    Self {
      collection,
      filters: vec![],
      order_by: None,
      limit: None,
    }
  }

  pub fn filter(mut self, filter: Filter) -> Self {
    self.filters.push(filter);
    self
  }

  pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
    self.order_by = Some(OrderBy {
      field: field.to_owned(),
      direction,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, doc: &Document) -> bool {
    self.filters.iter().all(|f| f.matches(doc))
  }

  /// Evaluate the query over every document of its collection.
  ///
  /// Sorting is stable, so documents with equal keys keep their input order.
  pub fn apply(&self, docs: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut out: Vec<Document> =
      docs.into_iter().filter(|d| self.matches(d)).collect();

    if let Some(order) = &self.order_by {
      out.sort_by(|a, b| {
        let ord = compare_values(a.get(&order.field), b.get(&order.field));
        match order.direction {
          Direction::Ascending => ord,
          Direction::Descending => ord.reverse(),
        }
      });
    }
    if let Some(limit) = self.limit {
      out.truncate(limit);
    }
    out
  }
}

fn is_absent(value: Option<&Value>) -> bool {
  matches!(value, None | Some(Value::Null))
}

/// Absent and null values sort lowest; mismatched types compare equal.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (is_absent(a), is_absent(b)) {
    (true, true) => return Ordering::Equal,
    (true, false) => return Ordering::Less,
    (false, true) => return Ordering::Greater,
    (false, false) => {}
  }
  match (a, b) {
    (Some(Value::Number(x)), Some(Value::Number(y))) => x
      .as_f64()
      .partial_cmp(&y.as_f64())
      .unwrap_or(Ordering::Equal),
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    _ => Ordering::Equal,
  }
}
