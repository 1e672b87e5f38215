//! Batch-aggregator reduction strategies (`stats`, `filter`, `group`,
//! `summary`) that run in-process without a sandboxed runner.

use pe_core::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Default)]
struct FieldStats {
    min: f64,
    max: f64,
    sum: f64,
    count: u64,
}

/// Per named numeric field: min/max/sum/mean/count. Items missing the
/// field (or whose value isn't numeric) are excluded from that field's
/// stats entirely rather than causing an error.
pub fn compute_stats(items: &[Value], fields: &[String]) -> Value {
    let mut per_field: HashMap<String, FieldStats> = HashMap::new();

    for field in fields {
        let mut stats: Option<FieldStats> = None;
        for item in items {
            let Some(map) = item.as_map() else { continue };
            let Some(n) = map.get(field).and_then(Value::as_f64) else {
                continue;
            };
            stats = Some(match stats {
                None => FieldStats {
                    min: n,
                    max: n,
                    sum: n,
                    count: 1,
                },
                Some(s) => FieldStats {
                    min: s.min.min(n),
                    max: s.max.max(n),
                    sum: s.sum + n,
                    count: s.count + 1,
                },
            });
        }
        per_field.insert(field.clone(), stats.unwrap_or_default());
    }

    let fields_map: HashMap<String, Value> = per_field
        .into_iter()
        .map(|(name, s)| {
            let mean = if s.count == 0 { 0.0 } else { s.sum / s.count as f64 };
            let mut m = HashMap::new();
            m.insert("min".to_string(), Value::Number(if s.count == 0 { 0.0 } else { s.min }));
            m.insert("max".to_string(), Value::Number(if s.count == 0 { 0.0 } else { s.max }));
            m.insert("sum".to_string(), Value::Number(s.sum));
            m.insert("mean".to_string(), Value::Number(mean));
            m.insert("count".to_string(), Value::Number(s.count as f64));
            (name, Value::Map(m))
        })
        .collect();

    let mut out = HashMap::new();
    out.insert("total_items".to_string(), Value::Number(items.len() as f64));
    out.insert("fields".to_string(), Value::Map(fields_map));
    Value::Map(out)
}

/// `field OP literal` where OP is one of `==`, `!=`, `>`, `>=`, `<`, `<=`,
/// or a bare field name tested for truthiness. Deliberately minimal: no
/// boolean connectives, no nested access — a safe evaluator, not a
/// general-purpose expression language.
pub fn filter_items(items: &[Value], condition: &str) -> Value {
    let kept: Vec<Value> = items
        .iter()
        .filter(|item| evaluate_condition(item, condition))
        .cloned()
        .collect();
    Value::List(kept)
}

fn evaluate_condition(item: &Value, condition: &str) -> bool {
    const OPS: &[&str] = &["==", "!=", ">=", "<=", ">", "<"];
    for op in OPS {
        if let Some(pos) = condition.find(op) {
            let field = condition[..pos].trim();
            let literal = condition[pos + op.len()..].trim();
            let Some(map) = item.as_map() else { return false };
            let Some(actual) = map.get(field) else { return false };
            return compare(actual, op, literal);
        }
    }
    // No operator: treat the whole condition as a field name, tested for
    // truthiness.
    let field = condition.trim();
    match item.as_map().and_then(|m| m.get(field)) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => *n != 0.0,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Null) | None => false,
        Some(Value::List(l)) => !l.is_empty(),
        Some(Value::Map(m)) => !m.is_empty(),
    }
}

fn compare(actual: &Value, op: &str, literal: &str) -> bool {
    let unquoted = literal.trim_matches(|c| c == '\'' || c == '"');
    if let (Some(a), Ok(b)) = (actual.as_f64(), unquoted.parse::<f64>()) {
        return match op {
            "==" => a == b,
            "!=" => a != b,
            ">" => a > b,
            ">=" => a >= b,
            "<" => a < b,
            "<=" => a <= b,
            _ => false,
        };
    }
    if let Some(a) = actual.as_str() {
        return match op {
            "==" => a == unquoted,
            "!=" => a != unquoted,
            _ => false,
        };
    }
    false
}

/// Bucket items by the named field's display-string value.
pub fn group_items(items: &[Value], group_by: &str) -> Value {
    let mut groups: HashMap<String, Vec<Value>> = HashMap::new();
    for item in items {
        let key = item
            .as_map()
            .and_then(|m| m.get(group_by))
            .map(Value::to_display_string)
            .unwrap_or_default();
        groups.entry(key).or_default().push(item.clone());
    }
    Value::Map(
        groups
            .into_iter()
            .map(|(k, v)| (k, Value::List(v)))
            .collect(),
    )
}

/// Gather named fields into a flat per-item summary.
pub fn summarize_items(items: &[Value], summary_fields: &[String]) -> Value {
    let summaries: Vec<Value> = items
        .iter()
        .map(|item| {
            let map = item.as_map();
            let mut out = HashMap::new();
            for field in summary_fields {
                let v = map
                    .and_then(|m| m.get(field))
                    .cloned()
                    .unwrap_or(Value::Null);
                out.insert(field.clone(), v);
            }
            Value::Map(out)
        })
        .collect();
    Value::List(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(fields: &[(&str, f64)]) -> Value {
        let mut m = HashMap::new();
        for (k, v) in fields {
            m.insert(k.to_string(), Value::Number(*v));
        }
        Value::Map(m)
    }

    #[test]
    fn test_stats_excludes_missing_field_from_mean() {
        let items = vec![
            item(&[("score", 10.0)]),
            item(&[("score", 20.0)]),
            Value::Map(HashMap::new()), // missing "score"
        ];
        let out = compute_stats(&items, &["score".to_string()]);
        let fields = out.as_map().unwrap().get("fields").unwrap().as_map().unwrap();
        let score = fields.get("score").unwrap().as_map().unwrap();
        assert_eq!(score.get("count").unwrap().as_f64(), Some(2.0));
        assert_eq!(score.get("mean").unwrap().as_f64(), Some(15.0));
        assert_eq!(score.get("sum").unwrap().as_f64(), Some(30.0));
    }

    #[test]
    fn test_filter_numeric_comparison() {
        let items = vec![item(&[("n", 1.0)]), item(&[("n", 5.0)]), item(&[("n", 10.0)])];
        let out = filter_items(&items, "n > 3");
        assert_eq!(out.as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_group_by_bucket() {
        let mut a = HashMap::new();
        a.insert("kind".to_string(), Value::from("x"));
        let mut b = HashMap::new();
        b.insert("kind".to_string(), Value::from("y"));
        let mut c = HashMap::new();
        c.insert("kind".to_string(), Value::from("x"));
        let items = vec![Value::Map(a), Value::Map(b), Value::Map(c)];
        let out = group_items(&items, "kind");
        let groups = out.as_map().unwrap();
        assert_eq!(groups.get("x").unwrap().as_list().unwrap().len(), 2);
        assert_eq!(groups.get("y").unwrap().as_list().unwrap().len(), 1);
    }

    #[test]
    fn test_summary_gathers_fields() {
        let items = vec![item(&[("a", 1.0), ("b", 2.0)])];
        let out = summarize_items(&items, &["a".to_string(), "c".to_string()]);
        let row = out.as_list().unwrap()[0].as_map().unwrap();
        assert_eq!(row.get("a").unwrap().as_f64(), Some(1.0));
        assert_eq!(row.get("c").unwrap(), &Value::Null);
    }
}
