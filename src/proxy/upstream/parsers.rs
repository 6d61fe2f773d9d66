// 文本形态工具调用的兜底解析
//
// 模型偶尔不走结构化工具事件，而是在正文里输出
// `[Called func_name with args: {...}]` 字面量。流结束时扫一遍
// 累积文本，把这种调用恢复成真正的 tool_use 块。JSON 参数用
// 括号配对提取，字符串与转义按 JSON 规则处理。

use serde_json::Value;

use super::tool_lifecycle::ToolCall;

/// 找到 `start` 处 `{` 的配对 `}`，正确跳过字符串和转义。
fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if start >= bytes.len() || bytes[start] != b'{' {
        return None;
    }

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (offset, &ch) in bytes[start..].iter().enumerate() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            b'\\' if in_string => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }

    None
}

/// 扫描 `[Called <name> with args: {...}]` 形态的调用。
pub fn parse_bracket_tool_calls(text: &str) -> Vec<ToolCall> {
    if text.is_empty() || !text.contains("[Called") {
        return Vec::new();
    }

    let pattern = regex::Regex::new(r"(?i)\[Called\s+(\w+)\s+with\s+args:\s*").unwrap();
    let mut results = Vec::new();

    for caps in pattern.captures_iter(text) {
        let name = caps.get(1).unwrap().as_str().to_string();
        let match_end = caps.get(0).unwrap().end();

        let Some(offset) = text[match_end..].find('{') else {
            continue;
        };
        let json_start = match_end + offset;
        let Some(json_end) = find_matching_brace(text, json_start) else {
            continue;
        };

        let json_str = &text[json_start..=json_end];
        if serde_json::from_str::<Value>(json_str).is_err() {
            continue;
        }

        let raw = uuid::Uuid::new_v4().simple().to_string();
        results.push(ToolCall {
            // "toolu_" + 24 hex，与上游 id 形态一致
            id: format!("toolu_{}", &raw[..24]),
            name,
            arguments: json_str.to_string(),
        });
    }

    results
}

/// 同名同参的调用去重，保留首个。
pub fn deduplicate_tool_calls(calls: Vec<ToolCall>) -> Vec<ToolCall> {
    let mut seen = std::collections::HashSet::new();
    calls
        .into_iter()
        .filter(|call| {
            let normalized = serde_json::from_str::<Value>(&call.arguments)
                .map(|v| v.to_string())
                .unwrap_or_else(|_| call.arguments.clone());
            seen.insert(format!("{}-{}", call.name, normalized))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_call() {
        let text = r#"[Called get_weather with args: {"city": "London"}]"#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "get_weather");
        assert!(calls[0].arguments.contains("London"));
        assert!(calls[0].id.starts_with("toolu_"));
        assert_eq!(calls[0].id.len(), "toolu_".len() + 24);
    }

    #[test]
    fn parses_multiple_calls_with_unique_ids() {
        let text = r#"x [Called foo with args: {"a": 1}] y [Called bar with args: {"b": 2}] z"#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "foo");
        assert_eq!(calls[1].name, "bar");
        assert_ne!(calls[0].id, calls[1].id);
    }

    #[test]
    fn no_pattern_returns_empty() {
        assert!(parse_bracket_tool_calls("").is_empty());
        assert!(parse_bracket_tool_calls("just plain text").is_empty());
    }

    #[test]
    fn invalid_json_skipped() {
        let text = r#"[Called bad with args: {not json}] [Called good with args: {"ok": true}]"#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "good");
    }

    #[test]
    fn nested_braces_and_string_braces() {
        let text = r#"[Called f with args: {"a": {"b": "}"}, "c": 1}]"#;
        let calls = parse_bracket_tool_calls(text);
        assert_eq!(calls.len(), 1);
        let parsed: Value = serde_json::from_str(&calls[0].arguments).unwrap();
        assert_eq!(parsed["a"]["b"], "}");
        assert_eq!(parsed["c"], 1);
    }

    #[test]
    fn unterminated_json_ignored() {
        assert!(parse_bracket_tool_calls(r#"[Called f with args: {"a": 1"#).is_empty());
    }

    #[test]
    fn matching_brace_cases() {
        assert_eq!(find_matching_brace(r#"{"a": 1}"#, 0), Some(7));
        assert_eq!(find_matching_brace(r#"{"a": {"b": 1}}"#, 0), Some(14));
        assert_eq!(find_matching_brace(r#"{"a": "{}"}"#, 0), Some(10));
        assert_eq!(find_matching_brace(r#"{"a": 1"#, 0), None);
        assert_eq!(find_matching_brace("hello", 0), None);
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let calls = vec![
            ToolCall {
                id: "toolu_a".into(),
                name: "foo".into(),
                arguments: r#"{"a": 1}"#.into(),
            },
            ToolCall {
                id: "toolu_b".into(),
                name: "foo".into(),
                arguments: r#"{"a":1}"#.into(), // 空格差异，语义相同
            },
            ToolCall {
                id: "toolu_c".into(),
                name: "foo".into(),
                arguments: r#"{"a": 2}"#.into(),
            },
        ];
        let deduped = deduplicate_tool_calls(calls);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "toolu_a");
        assert_eq!(deduped[1].id, "toolu_c");
    }

    #[test]
    fn dedup_is_idempotent() {
        let calls = vec![
            ToolCall {
                id: "1".into(),
                name: "a".into(),
                arguments: "{}".into(),
            },
            ToolCall {
                id: "2".into(),
                name: "b".into(),
                arguments: "{}".into(),
            },
        ];
        let once = deduplicate_tool_calls(calls);
        let names: Vec<String> = once.iter().map(|c| c.name.clone()).collect();
        let twice = deduplicate_tool_calls(once);
        assert_eq!(
            names,
            twice.iter().map(|c| c.name.clone()).collect::<Vec<_>>()
        );
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_bracket_parse_extracts_name_and_args(
            name in "[a-zA-Z][a-zA-Z0-9_]{0,16}",
            key in "[a-z]{1,8}",
            val in "[a-zA-Z0-9 ]{0,24}",
        ) {
            let input = format!(r#"[Called {} with args: {{"{}": "{}"}}]"#, name, key, val);
            let calls = parse_bracket_tool_calls(&input);
            prop_assert_eq!(calls.len(), 1);
            prop_assert_eq!(&calls[0].name, &name);
            let parsed: Value = serde_json::from_str(&calls[0].arguments).unwrap();
            prop_assert_eq!(parsed[&key].as_str().unwrap(), val.as_str());
        }
    }
}
