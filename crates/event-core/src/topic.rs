//! Topic 推导
//!
//! 事件类型转换为小写连字符形式后加上数据源命名空间：
//! `UserCreated` @ `user-service` -> `user-service.user-created.v1`

/// 数据源 DLQ topic
pub fn dlq_topic(source: &str) -> String {
    format!("{}.dlq.v1", source)
}

/// 事件类型对应的 topic
pub fn event_topic(source: &str, event_type: &str) -> String {
    format!("{}.{}.v1", source, kebab_case(event_type))
}

/// 混合大小写转小写连字符
///
/// - 小写/数字后接大写处插入连字符（`UserCreated` -> `user-created`）
/// - 连续大写后接小写时在最后一个大写前插入（`HTTPRequest` -> `http-request`）
/// - 非 ASCII 字母数字的连续片段折叠为单个连字符，首尾不保留
pub fn kebab_case(event_type: &str) -> String {
    let chars: Vec<char> = event_type.chars().collect();
    let mut out = String::with_capacity(chars.len() + 4);
    let mut boundary = false;

    for (i, &c) in chars.iter().enumerate() {
        if !c.is_ascii_alphanumeric() {
            boundary = true;
            continue;
        }

        if c.is_ascii_uppercase() && i > 0 {
            let prev = chars[i - 1];
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if prev.is_ascii_lowercase()
                || prev.is_ascii_digit()
                || (prev.is_ascii_uppercase() && next_is_lower)
            {
                boundary = true;
            }
        }

        if boundary && !out.is_empty() {
            out.push('-');
        }
        boundary = false;
        out.push(c.to_ascii_lowercase());
    }

    out
}
