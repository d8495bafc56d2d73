use serde_json::Value;
use tabulon_protocol::AggFn;
use tabulon_protocol::CompareOp;
use tabulon_protocol::DatasetDescriptor;
use tabulon_protocol::Filter;
use tabulon_protocol::OrderDir;
use tabulon_protocol::QueryPlan;
use tabulon_protocol::SelectItem;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;

const DEFAULT_LIMIT: u32 = 200;

fn reject(msg: impl Into<String>) -> GatewayErr {
    GatewayErr::PlanValidation(msg.into())
}

fn is_valid_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn sql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn sql_literal(value: &Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(sql_string_literal(s)),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(if *b { "TRUE".to_string() } else { "FALSE".to_string() }),
        Value::Null => Ok("NULL".to_string()),
        other => Err(reject(format!("unsupported literal value: {other}"))),
    }
}

/// `true` if every element is a JSON scalar of the same variant (string,
/// number, or bool). An empty or single-element slice is trivially
/// homogeneous.
fn is_type_homogeneous(items: &[Value]) -> bool {
    let Some(first) = items.first() else {
        return true;
    };
    items
        .iter()
        .all(|v| std::mem::discriminant(v) == std::mem::discriminant(first))
}

fn agg_fn_name(func: AggFn) -> &'static str {
    match func {
        AggFn::Count => "COUNT",
        AggFn::CountDistinct => "COUNT",
        AggFn::Sum => "SUM",
        AggFn::Avg => "AVG",
        AggFn::Min => "MIN",
        AggFn::Max => "MAX",
    }
}

fn validate_column(dataset: &DatasetDescriptor, table: &str, column: &str) -> Result<()> {
    if column == "*" {
        return Ok(());
    }
    if !is_valid_identifier(column) {
        return Err(reject(format!("invalid identifier `{column}`")));
    }
    if !dataset.has_column(table, column) {
        return Err(reject(format!(
            "unknown column `{column}` in table `{table}`"
        )));
    }
    Ok(())
}

fn select_sql(item: &SelectItem) -> String {
    match item {
        SelectItem::Column(c) => c.clone(),
        SelectItem::Agg {
            func,
            column,
            alias,
        } => {
            let inner = if *func == AggFn::CountDistinct {
                format!("DISTINCT {column}")
            } else {
                column.clone()
            };
            let expr = format!("{}({inner})", agg_fn_name(*func));
            format!("{expr} AS {}", alias.clone().unwrap_or_else(|| item.output_label()))
        }
    }
}

fn filter_sql(filter: &Filter) -> Result<String> {
    let col = &filter.column;
    let value = || {
        filter
            .value
            .as_ref()
            .ok_or_else(|| reject(format!("filter on `{col}` requires a value")))
    };

    Ok(match filter.op {
        CompareOp::Eq => format!("{col} = {}", sql_literal(value()?)?),
        CompareOp::Ne => format!("{col} != {}", sql_literal(value()?)?),
        CompareOp::Lt => format!("{col} < {}", sql_literal(value()?)?),
        CompareOp::Le => format!("{col} <= {}", sql_literal(value()?)?),
        CompareOp::Gt => format!("{col} > {}", sql_literal(value()?)?),
        CompareOp::Ge => format!("{col} >= {}", sql_literal(value()?)?),
        CompareOp::In => {
            let Value::Array(items) = value()? else {
                return Err(reject(format!("filter `in` on `{col}` requires a list")));
            };
            if items.is_empty() {
                return Err(reject(format!("filter `in` on `{col}` requires a non-empty list")));
            }
            if !is_type_homogeneous(items) {
                return Err(reject(format!("filter `in` on `{col}` requires a list of one type")));
            }
            let rendered = items
                .iter()
                .map(sql_literal)
                .collect::<Result<Vec<_>>>()?
                .join(", ");
            format!("{col} IN ({rendered})")
        }
        CompareOp::Between => {
            let Value::Array(items) = value()? else {
                return Err(reject(format!(
                    "filter `between` on `{col}` requires a 2-element list"
                )));
            };
            let [lo, hi] = items.as_slice() else {
                return Err(reject(format!(
                    "filter `between` on `{col}` requires exactly 2 values"
                )));
            };
            if !is_type_homogeneous(items) {
                return Err(reject(format!(
                    "filter `between` on `{col}` requires two values of one type"
                )));
            }
            format!("{col} BETWEEN {} AND {}", sql_literal(lo)?, sql_literal(hi)?)
        }
        CompareOp::Contains => {
            let Value::String(s) = value()? else {
                return Err(reject(format!("filter `contains` on `{col}` requires a string")));
            };
            format!(
                "{col} LIKE {} ESCAPE '\\'",
                sql_string_literal(&format!("%{}%", escape_like(s)))
            )
        }
        CompareOp::Startswith => {
            let Value::String(s) = value()? else {
                return Err(reject(format!(
                    "filter `startswith` on `{col}` requires a string"
                )));
            };
            format!(
                "{col} LIKE {} ESCAPE '\\'",
                sql_string_literal(&format!("{}%", escape_like(s)))
            )
        }
        CompareOp::Endswith => {
            let Value::String(s) = value()? else {
                return Err(reject(format!("filter `endswith` on `{col}` requires a string")));
            };
            format!(
                "{col} LIKE {} ESCAPE '\\'",
                sql_string_literal(&format!("%{}", escape_like(s)))
            )
        }
        CompareOp::IsNull => format!("{col} IS NULL"),
        CompareOp::IsNotNull => format!("{col} IS NOT NULL"),
    })
}

/// Compile a structured query plan into a single deterministic `SELECT`
/// statement, validating every identifier against the dataset schema along
/// the way. `max_rows_cap` is the server-configured ceiling an explicit
/// `limit` is clamped to; `exfil_threshold` is the non-aggregated column
/// count above which an unlimited, unaggregated select is rejected.
pub fn compile_plan(
    plan: &QueryPlan,
    dataset: &DatasetDescriptor,
    max_rows_cap: u32,
    exfil_threshold: usize,
) -> Result<String> {
    let table = &plan.table;
    if dataset.file(table).is_none() {
        return Err(reject(format!("unknown table `{table}`")));
    }
    if plan.select.is_empty() {
        return Err(reject("select list must not be empty"));
    }

    for item in &plan.select {
        if let SelectItem::Agg { func, column, .. } = item {
            if column == "*" && *func != AggFn::Count {
                return Err(reject("`*` is only valid with count"));
            }
        }
        validate_column(dataset, table, item.source_column())?;
    }

    let has_aggregation = plan.select.iter().any(SelectItem::is_aggregate);
    if has_aggregation {
        for item in &plan.select {
            if !item.is_aggregate() {
                let col = item.source_column();
                if col != "*" && !plan.group_by.iter().any(|g| g == col) {
                    return Err(reject(format!(
                        "column `{col}` is selected without aggregation but missing from group_by"
                    )));
                }
            }
        }
    }

    for col in &plan.group_by {
        validate_column(dataset, table, col)?;
    }

    for filter in &plan.filters {
        validate_column(dataset, table, &filter.column)?;
    }

    for ob in &plan.order_by {
        let is_known_column = dataset.has_column(table, &ob.column);
        let is_select_alias = plan.select.iter().any(|i| i.output_label() == ob.column);
        if !is_known_column && !is_select_alias {
            return Err(reject(format!("unknown order_by column `{}`", ob.column)));
        }
    }

    let no_limit = plan.limit.is_none();
    let non_aggregated_count = plan
        .select
        .iter()
        .filter(|i| !i.is_aggregate())
        .count();
    let selects_everything = plan
        .select
        .iter()
        .any(|i| matches!(i, SelectItem::Column(c) if c == "*"));
    if !has_aggregation && no_limit && (selects_everything || non_aggregated_count > exfil_threshold) {
        warn!(table = %plan.table, "plan policy: exfiltration heuristic triggered");
        return Err(GatewayErr::ExfilHeuristic(format!(
            "unaggregated, unbounded selection of {non_aggregated_count} columns from `{table}`"
        )));
    }

    let limit = plan.limit.unwrap_or(DEFAULT_LIMIT).min(max_rows_cap);

    let mut sql = String::new();
    sql.push_str("SELECT ");
    sql.push_str(
        &plan
            .select
            .iter()
            .map(select_sql)
            .collect::<Vec<_>>()
            .join(", "),
    );
    sql.push_str(" FROM ");
    sql.push_str(table);

    if !plan.filters.is_empty() {
        sql.push_str(" WHERE ");
        let rendered = plan
            .filters
            .iter()
            .map(filter_sql)
            .collect::<Result<Vec<_>>>()?;
        sql.push_str(&rendered.join(" AND "));
    }

    if !plan.group_by.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&plan.group_by.join(", "));
    }

    if !plan.order_by.is_empty() {
        sql.push_str(" ORDER BY ");
        let rendered = plan
            .order_by
            .iter()
            .map(|ob| {
                format!(
                    "{} {}",
                    ob.column,
                    match ob.dir {
                        OrderDir::Asc => "ASC",
                        OrderDir::Desc => "DESC",
                    }
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&rendered);
    }

    sql.push_str(&format!(" LIMIT {limit}"));

    Ok(sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabulon_protocol::DatasetFile;
    use tabulon_protocol::Filter;
    use tabulon_protocol::SchemaColumn;

    fn dataset() -> DatasetDescriptor {
        DatasetDescriptor {
            id: "shop".into(),
            name: "Shop".into(),
            files: vec![DatasetFile {
                name: "orders".into(),
                path: "/data/orders.csv".into(),
                schema: vec![
                    SchemaColumn { column: "id".into(), data_type: "integer".into() },
                    SchemaColumn { column: "total".into(), data_type: "float".into() },
                    SchemaColumn { column: "customer".into(), data_type: "string".into() },
                ],
            }],
            version_hash: "v1".into(),
            example_prompts: vec![],
        }
    }

    #[test]
    fn count_star_gets_default_limit() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Agg {
                func: AggFn::Count,
                column: "*".into(),
                alias: Some("n".into()),
            }],
            filters: vec![],
            group_by: vec![],
            order_by: vec![],
            limit: None,
        };
        let sql = compile_plan(&plan, &dataset(), 1000, 6).unwrap();
        assert_eq!(sql, "SELECT COUNT(*) AS n FROM orders LIMIT 200");
    }

    #[test]
    fn compiling_twice_is_byte_identical() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("customer".into())],
            filters: vec![],
            group_by: vec!["customer".into()],
            order_by: vec![],
            limit: Some(10),
        };
        let a = compile_plan(&plan, &dataset(), 1000, 6).unwrap();
        let b = compile_plan(&plan, &dataset(), 1000, 6).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn explicit_limit_above_cap_is_clamped() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("id".into())],
            filters: vec![],
            group_by: vec![],
            order_by: vec![],
            limit: Some(5000),
        };
        let sql = compile_plan(&plan, &dataset(), 1000, 6).unwrap();
        assert!(sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn non_grouped_non_aggregated_column_is_rejected() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![
                SelectItem::Column("customer".into()),
                SelectItem::Agg { func: AggFn::Sum, column: "total".into(), alias: None },
            ],
            filters: vec![],
            group_by: vec![],
            order_by: vec![],
            limit: None,
        };
        let err = compile_plan(&plan, &dataset(), 1000, 6).unwrap_err();
        assert!(matches!(err, GatewayErr::PlanValidation(_)));
    }

    #[test]
    fn unbounded_select_star_triggers_exfil_heuristic() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("*".into())],
            filters: vec![],
            group_by: vec![],
            order_by: vec![],
            limit: None,
        };
        let err = compile_plan(&plan, &dataset(), 1000, 6).unwrap_err();
        assert!(matches!(err, GatewayErr::ExfilHeuristic(_)));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("bogus".into())],
            filters: vec![],
            group_by: vec![],
            order_by: vec![],
            limit: Some(10),
        };
        let err = compile_plan(&plan, &dataset(), 1000, 6).unwrap_err();
        assert!(matches!(err, GatewayErr::PlanValidation(_)));
    }

    #[test]
    fn contains_filter_escapes_like_metacharacters() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("id".into())],
            filters: vec![Filter {
                column: "customer".into(),
                op: CompareOp::Contains,
                value: Some(serde_json::json!("50%_off")),
            }],
            group_by: vec![],
            order_by: vec![],
            limit: Some(10),
        };
        let sql = compile_plan(&plan, &dataset(), 1000, 6).unwrap();
        assert!(sql.contains("LIKE '%50\\%\\_off%' ESCAPE '\\'"));
    }

    #[test]
    fn in_filter_rejects_mixed_types() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("id".into())],
            filters: vec![Filter {
                column: "id".into(),
                op: CompareOp::In,
                value: Some(serde_json::json!([1, "two", true])),
            }],
            group_by: vec![],
            order_by: vec![],
            limit: Some(10),
        };
        let err = compile_plan(&plan, &dataset(), 1000, 6).unwrap_err();
        assert!(matches!(err, GatewayErr::PlanValidation(_)));
    }

    #[test]
    fn between_filter_rejects_mixed_types() {
        let plan = QueryPlan {
            dataset_id: "shop".into(),
            table: "orders".into(),
            select: vec![SelectItem::Column("id".into())],
            filters: vec![Filter {
                column: "total".into(),
                op: CompareOp::Between,
                value: Some(serde_json::json!([1, "10"])),
            }],
            group_by: vec![],
            order_by: vec![],
            limit: Some(10),
        };
        let err = compile_plan(&plan, &dataset(), 1000, 6).unwrap_err();
        assert!(matches!(err, GatewayErr::PlanValidation(_)));
    }
}
