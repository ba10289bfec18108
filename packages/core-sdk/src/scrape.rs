//! 低置信度的字段抓取。
//!
//! 仅在结构化解析彻底失败后使用：按 `field: value` / `"field": value` 模式逐字段匹配，
//! 结果与结构化解析结果分开表示。

use std::collections::BTreeMap;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/**
 * \brief 抓取到的字段；缺失字段不会出现在结果中。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ScrapedFields {
    values: BTreeMap<String, Value>,
}

impl ScrapedFields {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.values
    }
}

/**
 * \brief 对每个字段取第一处匹配；字符串、数字、布尔与 null 会还原为对应 JSON 值。
 */
pub fn scrape_fields(raw: &str, fields: &[&str]) -> ScrapedFields {
    let mut values = BTreeMap::new();
    for field in fields {
        let Some(re) = field_pattern(field) else {
            continue;
        };
        if let Some(value) = re.captures(raw).and_then(|caps| capture_value(&caps)) {
            values.insert(field.to_string(), value);
        }
    }
    debug!(requested = fields.len(), found = values.len(), "scraped fields from raw text");
    ScrapedFields { values }
}

fn field_pattern(field: &str) -> Option<Regex> {
    let pattern = format!(
        r#"(?i)["']?\b{}\b["']?\s*[:=]\s*(?:"((?:[^"\\]|\\.)*)"|'([^']*)'|(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)\b|(true|false|null)\b|([^\s"',;}}\]][^\s,;}}\]]*))"#,
        regex::escape(field)
    );
    Regex::new(&pattern).ok()
}

fn capture_value(caps: &regex::Captures<'_>) -> Option<Value> {
    if let Some(m) = caps.get(1) {
        let quoted = format!("\"{}\"", m.as_str());
        return Some(
            serde_json::from_str::<String>(&quoted)
                .map(Value::String)
                .unwrap_or_else(|_| Value::String(m.as_str().to_string())),
        );
    }
    if let Some(m) = caps.get(2) {
        return Some(Value::String(m.as_str().to_string()));
    }
    if let Some(m) = caps.get(3) {
        return serde_json::from_str::<Value>(m.as_str()).ok();
    }
    if let Some(m) = caps.get(4) {
        return serde_json::from_str::<Value>(&m.as_str().to_ascii_lowercase()).ok();
    }
    caps.get(5).map(|m| Value::String(m.as_str().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scrapes_truncated_json() {
        let raw = r#"{"riskLevel": "high", "score": 7.5, "requiresReview": true, "summary": "Vendor lacks SOC 2 \"Type II\" rep"#;
        let fields = scrape_fields(raw, &["riskLevel", "score", "requiresReview", "summary", "owner"]);
        assert_eq!(fields.get("riskLevel"), Some(&json!("high")));
        assert_eq!(fields.get("score"), Some(&json!(7.5)));
        assert_eq!(fields.get("requiresReview"), Some(&json!(true)));
        assert_eq!(fields.get("summary"), None);
        assert_eq!(fields.get("owner"), None);
        assert_eq!(fields.len(), 3);
    }

    #[test]
    fn test_scrapes_prose_key_values() {
        let raw = "Category = access_control; severity: 4\nowner: 'security team'";
        let fields = scrape_fields(raw, &["category", "severity", "owner"]);
        assert_eq!(fields.get("category"), Some(&json!("access_control")));
        assert_eq!(fields.get("severity"), Some(&json!(4)));
        assert_eq!(fields.get("owner"), Some(&json!("security team")));
    }

    #[test]
    fn test_field_name_is_matched_literally() {
        let raw = "a.b: 1, axb: 2";
        let fields = scrape_fields(raw, &["a.b"]);
        assert_eq!(fields.get("a.b"), Some(&json!(1)));
        assert!(scrape_fields("nothing", &["risk"]).is_empty());
    }
}
