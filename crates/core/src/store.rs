use crate::models::{SearchFilters, StoredPoint};
use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    pub name: String,
    pub vector_size: Option<usize>,
    pub points_count: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrollPage {
    pub points: Vec<StoredPoint>,
    /// Id to pass as `offset` for the next page; `None` on the last page.
    pub next_offset: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Match { key: String, value: Value },
    Range {
        key: String,
        gte: Option<f64>,
        lte: Option<f64>,
    },
}

impl Condition {
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            Condition::Match { key, value } => match payload.get(key) {
                Some(Value::Array(items)) => items.contains(value),
                Some(field) => field == value,
                None => false,
            },
            Condition::Range { key, gte, lte } => {
                let Some(number) = payload.get(key).and_then(Value::as_f64) else {
                    return false;
                };
                gte.map_or(true, |bound| number >= bound) && lte.map_or(true, |bound| number <= bound)
            }
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Condition::Match { key, value } => json!({ "key": key, "match": { "value": value } }),
            Condition::Range { key, gte, lte } => {
                let mut range = Map::new();
                if let Some(gte) = gte {
                    range.insert("gte".to_string(), json!(gte));
                }
                if let Some(lte) = lte {
                    range.insert("lte".to_string(), json!(lte));
                }
                json!({ "key": key, "range": range })
            }
        }
    }
}

/// Payload filter: every `must` condition and, when present, at least one
/// `should` condition has to hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointFilter {
    pub must: Vec<Condition>,
    pub should: Vec<Condition>,
}

impl PointFilter {
    /// All points of one document.
    pub fn document(document_uuid: Uuid) -> Self {
        Self {
            must: vec![Condition::Match {
                key: "document_uuid".to_string(),
                value: Value::String(document_uuid.to_string()),
            }],
            should: Vec::new(),
        }
    }

    /// Points of one document whose `chunk_index` lies in `lower..=upper`.
    pub fn document_window(document_uuid: Uuid, lower: u64, upper: u64) -> Self {
        let mut filter = Self::document(document_uuid);
        filter.must.push(Condition::Range {
            key: "chunk_index".to_string(),
            gte: Some(lower as f64),
            lte: Some(upper as f64),
        });
        filter
    }

    /// `None` when the filters are empty. File types match the payload
    /// `file_format`; metadata pairs match payload keys verbatim.
    pub fn from_search_filters(filters: &SearchFilters) -> Option<Self> {
        if filters.is_empty() {
            return None;
        }

        let mut should = filters
            .file_types
            .iter()
            .map(|file_type| Condition::Match {
                key: "file_format".to_string(),
                value: Value::String(file_type.clone()),
            })
            .collect::<Vec<_>>();
        should.extend(filters.metadata.iter().map(|(key, value)| Condition::Match {
            key: key.clone(),
            value: Value::String(value.clone()),
        }));

        Some(Self {
            must: Vec::new(),
            should,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.should.is_empty()
    }

    pub fn matches(&self, payload: &Value) -> bool {
        self.must.iter().all(|condition| condition.matches(payload))
            && (self.should.is_empty() || self.should.iter().any(|condition| condition.matches(payload)))
    }

    pub fn to_json(&self) -> Value {
        let mut filter = Map::new();
        if !self.must.is_empty() {
            filter.insert(
                "must".to_string(),
                Value::Array(self.must.iter().map(Condition::to_json).collect()),
            );
        }
        if !self.should.is_empty() {
            filter.insert(
                "should".to_string(),
                Value::Array(self.should.iter().map(Condition::to_json).collect()),
            );
        }
        Value::Object(filter)
    }
}
