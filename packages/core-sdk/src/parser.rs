use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::AiError;
use crate::scrape::{scrape_fields, ScrapedFields};

/**
 * \brief 结构化解析或按字段抓取的结果，调用方据此区分置信度。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum Recovered {
    /** \brief 完整 JSON 解析成功 */
    Parsed(Map<String, Value>),
    /** \brief 低置信度：仅按字段模式抓取 */
    Scraped(ScrapedFields),
}

impl Recovered {
    pub fn is_confident(&self) -> bool {
        matches!(self, Recovered::Parsed(_))
    }
}

/**
 * \brief 从模型原文中解析 JSON 对象。
 */
pub fn parse_json_object(raw: &str) -> Result<Map<String, Value>, AiError> {
    parse_structured(raw)
}

/**
 * \brief 依次尝试：去掉代码围栏、截取首个 `{` 到最后一个 `}`、原文直接解析；第一个成功者胜出。
 */
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, AiError> {
    let mut last_err = None;
    for (label, candidate) in candidates(raw) {
        match serde_json::from_str::<T>(candidate) {
            Ok(v) => {
                debug!(heuristic = label, "recovered structured response");
                return Ok(v);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(AiError::MalformedResponse {
        provider: None,
        reason: last_err
            .map(|e| format!("no JSON object found: {}", e))
            .unwrap_or_else(|| "empty response".to_string()),
        raw: raw.to_string(),
    })
}

/**
 * \brief 先做结构化解析，失败后退回字段抓取；两者都失败时返回原始错误。
 */
pub fn recover(raw: &str, fields: &[&str]) -> Result<Recovered, AiError> {
    match parse_json_object(raw) {
        Ok(map) => Ok(Recovered::Parsed(map)),
        Err(err) => {
            let scraped = scrape_fields(raw, fields);
            if scraped.is_empty() {
                Err(err)
            } else {
                Ok(Recovered::Scraped(scraped))
            }
        }
    }
}

fn candidates(raw: &str) -> Vec<(&'static str, &str)> {
    let mut out = Vec::with_capacity(3);
    if let Some(inner) = strip_fence(raw) {
        out.push(("fence", inner));
    }
    if let Some(inner) = brace_slice(raw) {
        out.push(("braces", inner));
    }
    out.push(("verbatim", raw.trim()));
    out
}

/**
 * \brief 去掉首尾的 ``` 或 ```json 围栏；没有起始围栏时返回 None。
 */
fn strip_fence(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let without_open = trimmed.strip_prefix("```")?;
    let body = match without_open.find('\n') {
        Some(idx) => {
            let label = without_open[..idx].trim();
            if label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
                &without_open[idx + 1..]
            } else {
                without_open
            }
        }
        None => without_open,
    };
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    Some(body.trim())
}

fn brace_slice(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_round_trip_through_fences() {
        let objects = vec![
            json!({"risk": "high", "score": 87}),
            json!({"nested": {"controls": ["AC-1", "AC-2"], "ok": true}, "note": "contains } and { in text"}),
            json!({}),
            json!({"unicode": "données conformité ✓", "n": -1.5, "nil": null}),
        ];
        for obj in objects {
            let serialized = serde_json::to_string_pretty(&obj).expect("serialize");
            let labeled = format!("```json\n{}\n```", serialized);
            let unlabeled = format!("```\n{}\n```", serialized);
            for form in [labeled, unlabeled, serialized.clone()] {
                let parsed = parse_json_object(&form).expect("parse");
                assert_eq!(Value::Object(parsed), obj, "form: {form}");
            }
        }
    }

    #[test]
    fn test_extracts_object_from_prose() {
        let raw = "Sure! Here is the classification you asked for:\n{\"category\": \"privacy\", \"confidence\": 0.9}\nLet me know if you need more.";
        let parsed = parse_json_object(raw).expect("parse");
        assert_eq!(
            Value::Object(parsed),
            json!({"category": "privacy", "confidence": 0.9})
        );
    }

    #[test]
    fn test_fence_with_surrounding_whitespace_and_uppercase_label() {
        let raw = "  \n```JSON\n{\"a\": 1}\n```  \n";
        assert_eq!(Value::Object(parse_json_object(raw).expect("parse")), json!({"a": 1}));
    }

    #[test]
    fn test_unclosed_fence_still_parses() {
        let raw = "```json\n{\"a\": [1, 2]}";
        assert_eq!(
            Value::Object(parse_json_object(raw).expect("parse")),
            json!({"a": [1, 2]})
        );
    }

    #[test]
    fn test_single_line_fence() {
        let raw = "```{\"a\": true}```";
        assert_eq!(
            Value::Object(parse_json_object(raw).expect("parse")),
            json!({"a": true})
        );
    }

    #[test]
    fn test_total_failure_carries_raw_text() {
        let raw = "I could not determine a risk level for this vendor.";
        let err = parse_json_object(raw).expect_err("no json");
        assert!(matches!(err, AiError::MalformedResponse { provider: None, .. }));
        assert_eq!(err.raw_text(), Some(raw));

        let broken = "{\"risk\": \"high\", \"score\": }";
        let err = parse_json_object(broken).expect_err("broken json");
        assert_eq!(err.raw_text(), Some(broken));
    }

    #[test]
    fn test_typed_parse() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Classification {
            category: String,
            severity: u8,
        }
        let raw = "```json\n{\"category\":\"access-control\",\"severity\":3}\n```";
        let parsed: Classification = parse_structured(raw).expect("typed parse");
        assert_eq!(
            parsed,
            Classification {
                category: "access-control".into(),
                severity: 3
            }
        );
    }

    #[test]
    fn test_recover_distinguishes_confidence() {
        let parsed = recover("{\"risk\": \"low\"}", &["risk"]).expect("parsed");
        assert!(parsed.is_confident());

        let scraped = recover("risk: \"medium\", score: 42 (truncated", &["risk", "score"])
            .expect("scraped");
        assert!(!scraped.is_confident());
        match scraped {
            Recovered::Scraped(fields) => {
                assert_eq!(fields.get("risk"), Some(&json!("medium")));
                assert_eq!(fields.get("score"), Some(&json!(42)));
            }
            other => panic!("unexpected: {other:?}"),
        }

        assert!(recover("nothing useful here", &["risk"]).is_err());
    }
}
