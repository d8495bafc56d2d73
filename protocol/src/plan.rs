use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Filter operators a structured plan may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    In,
    Between,
    Contains,
    Startswith,
    Endswith,
    IsNull,
    IsNotNull,
}

/// Aggregation functions a structured plan may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
}

/// A single projected output column: either a bare column reference or an
/// aggregation over one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SelectItem {
    Column(String),
    Agg {
        #[serde(rename = "fn")]
        func: AggFn,
        column: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        alias: Option<String>,
    },
}

impl SelectItem {
    pub fn is_aggregate(&self) -> bool {
        matches!(self, SelectItem::Agg { .. })
    }

    /// The bare column name this item reads from (`*` for `count(*)`).
    pub fn source_column(&self) -> &str {
        match self {
            SelectItem::Column(c) => c,
            SelectItem::Agg { column, .. } => column,
        }
    }

    pub fn output_label(&self) -> String {
        match self {
            SelectItem::Column(c) => c.clone(),
            SelectItem::Agg {
                func,
                column,
                alias,
            } => alias.clone().unwrap_or_else(|| {
                let fn_name = serde_json::to_value(func)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "agg".to_string());
                format!("{fn_name}_{column}")
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub column: String,
    pub op: CompareOp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub column: String,
    pub dir: OrderDir,
}

/// A strongly-typed, deterministically-compilable analytic query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub dataset_id: String,
    pub table: String,
    pub select: Vec<SelectItem>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub group_by: Vec<String>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}
