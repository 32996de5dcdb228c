//! Query context for the read endpoint: status/search filters, structured
//! filter groups and the active sort, plus the normalized context signature
//! used to decide when a paged collection must reset.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::{PostStatus, SortDir, SortSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Combinator {
    And,
    Or,
}

impl Combinator {
    fn as_str(&self) -> &'static str {
        match self {
            Combinator::And => "and",
            Combinator::Or => "or",
        }
    }
}

/// A structured filter node. Compiled exhaustively into query pairs; the
/// server owns the translation to SQL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterExpression {
    Equals { field: String, value: Value },
    NotEquals { field: String, value: Value },
    Contains { field: String, needle: String },
    NotContains { field: String, needle: String },
    IsEmpty { field: String },
    IsNotEmpty { field: String },
    Between { field: String, low: Value, high: Value },
    In { field: String, values: SmallVec<[Value; 4]> },
    Group(FilterGroup),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    pub combinator: Combinator,
    #[serde(default)]
    pub children: Vec<FilterExpression>,
}

fn value_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FilterExpression {
    /// Canonical, order-independent rendering. Group children and `In` value
    /// sets are sorted because both are commutative.
    pub fn canonical(&self) -> String {
        match self {
            FilterExpression::Equals { field, value } => format!("eq({field},{value})"),
            FilterExpression::NotEquals { field, value } => format!("ne({field},{value})"),
            FilterExpression::Contains { field, needle } => format!("has({field},{needle:?})"),
            FilterExpression::NotContains { field, needle } => format!("nhas({field},{needle:?})"),
            FilterExpression::IsEmpty { field } => format!("empty({field})"),
            FilterExpression::IsNotEmpty { field } => format!("nempty({field})"),
            FilterExpression::Between { field, low, high } => format!("between({field},{low},{high})"),
            FilterExpression::In { field, values } => {
                let mut vs: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                vs.sort();
                vs.dedup();
                format!("in({field},[{}])", vs.join(","))
            }
            FilterExpression::Group(g) => g.canonical(),
        }
    }

    /// Append this node as bracketed query pairs under `prefix`.
    pub fn compile_into(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        let mut put = |k: &str, v: String| out.push((format!("{prefix}[{k}]"), v));
        match self {
            FilterExpression::Equals { field, value } => {
                put("op", "eq".into());
                put("field", field.clone());
                put("value", value_text(value));
            }
            FilterExpression::NotEquals { field, value } => {
                put("op", "ne".into());
                put("field", field.clone());
                put("value", value_text(value));
            }
            FilterExpression::Contains { field, needle } => {
                put("op", "contains".into());
                put("field", field.clone());
                put("value", needle.clone());
            }
            FilterExpression::NotContains { field, needle } => {
                put("op", "not_contains".into());
                put("field", field.clone());
                put("value", needle.clone());
            }
            FilterExpression::IsEmpty { field } => {
                put("op", "is_empty".into());
                put("field", field.clone());
            }
            FilterExpression::IsNotEmpty { field } => {
                put("op", "is_not_empty".into());
                put("field", field.clone());
            }
            FilterExpression::Between { field, low, high } => {
                put("op", "between".into());
                put("field", field.clone());
                put("low", value_text(low));
                put("high", value_text(high));
            }
            FilterExpression::In { field, values } => {
                put("op", "in".into());
                put("field", field.clone());
                for (i, v) in values.iter().enumerate() {
                    put(&format!("values][{i}"), value_text(v));
                }
            }
            FilterExpression::Group(g) => g.compile_into(prefix, out),
        }
    }
}

impl FilterGroup {
    pub fn new(combinator: Combinator, children: Vec<FilterExpression>) -> Self {
        Self { combinator, children }
    }

    pub fn is_empty(&self) -> bool { self.children.is_empty() }

    pub fn canonical(&self) -> String {
        let mut parts: Vec<String> = self.children.iter().map(|c| c.canonical()).collect();
        parts.sort();
        format!("{}[{}]", self.combinator.as_str(), parts.join(","))
    }

    pub fn compile_into(&self, prefix: &str, out: &mut Vec<(String, String)>) {
        out.push((format!("{prefix}[combinator]"), self.combinator.as_str().to_string()));
        for (i, child) in self.children.iter().enumerate() {
            child.compile_into(&format!("{prefix}[children][{i}]"), out);
        }
    }
}

/// Normalized serialization of every active filter/sort parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextSignature(pub String);

impl std::fmt::Display for ContextSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

/// Filter and sort parameters for the read endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueryContext {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub statuses: Vec<PostStatus>,
    #[serde(default)]
    pub filter: Option<FilterGroup>,
    #[serde(default)]
    pub sort: SortSpec,
}

impl QueryContext {
    pub fn with_sort(mut self, sort: SortSpec) -> Self {
        self.sort = sort;
        self
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = PostStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    pub fn with_filter(mut self, filter: FilterGroup) -> Self {
        self.filter = Some(filter);
        self
    }

    fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    /// Signature over all active parameters; equal for contexts that differ only
    /// in the order of statuses, group children or `In` values.
    pub fn signature(&self) -> ContextSignature {
        let mut statuses: Vec<&str> = self.statuses.iter().map(|s| s.as_str()).collect();
        statuses.sort_unstable();
        statuses.dedup();
        let filter = self
            .filter
            .as_ref()
            .filter(|g| !g.is_empty())
            .map(|g| g.canonical())
            .unwrap_or_default();
        let dir = match self.sort.dir {
            SortDir::Asc => "asc",
            SortDir::Desc => "desc",
        };
        ContextSignature(format!(
            "q={}|status={}|filter={}|sort={}:{}",
            self.search_term().unwrap_or(""),
            statuses.join(","),
            filter,
            self.sort.key,
            dir
        ))
    }

    /// Query pairs for `GET posts`; `offset` is converted to a 1-based page too.
    pub fn to_query_pairs(&self, offset: u64, page_size: u32) -> Vec<(String, String)> {
        let size = page_size.max(1);
        let page = offset / u64::from(size) + 1;
        let mut out = vec![
            ("page".to_string(), page.to_string()),
            ("pageSize".to_string(), size.to_string()),
            ("offset".to_string(), offset.to_string()),
            ("sort".to_string(), self.sort.key.clone()),
            (
                "dir".to_string(),
                match self.sort.dir {
                    SortDir::Asc => "asc".to_string(),
                    SortDir::Desc => "desc".to_string(),
                },
            ),
        ];
        if let Some(q) = self.search_term() {
            out.push(("search".to_string(), q.to_string()));
        }
        for s in &self.statuses {
            out.push(("status".to_string(), s.as_str().to_string()));
        }
        if let Some(g) = self.filter.as_ref().filter(|g| !g.is_empty()) {
            g.compile_into("filter", &mut out);
        }
        out
    }
}
