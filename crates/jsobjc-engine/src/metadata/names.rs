//! Naming rules: selector to script name, initializer tokens and
//! ownership families.

/// Derive the script-side name of a selector: `initWithInt:andInt:`
/// becomes `initWithIntAndInt`.
pub fn js_name_for_selector(selector: &str) -> String {
    let mut parts = selector.split(':').filter(|p| !p.is_empty());
    let mut out = parts.next().unwrap_or_default().to_string();
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
        }
    }
    out
}

/// Lower-camel-case a selector keyword, treating a leading acronym as one
/// word: `URL` → `url`, `URLString` → `urlString`, `FileURL` → `fileURL`.
pub fn lower_camel(keyword: &str) -> String {
    let chars: Vec<char> = keyword.chars().collect();
    let run = chars.iter().take_while(|c| c.is_uppercase()).count();
    if run == 0 {
        return keyword.to_string();
    }
    let lower_until = if run == chars.len() || run == 1 { run } else { run - 1 };
    chars
        .iter()
        .enumerate()
        .map(|(i, c)| {
            if i < lower_until {
                c.to_lowercase().next().unwrap_or(*c)
            } else {
                *c
            }
        })
        .collect()
}

/// Parameter-name tokens of an initializer selector, or `None` when the
/// selector is not an initializer.
///
/// `init` → `[]`, `initWithString:` → `[string]`,
/// `initWithX:andY:` → `[x, andY]`, `initFileURLWithPath:` → `[fileURLWithPath]`.
pub fn initializer_tokens(selector: &str) -> Option<Vec<String>> {
    let rest = selector.strip_prefix("init")?;
    if rest.is_empty() {
        return Some(Vec::new());
    }
    if !rest.starts_with(|c: char| c.is_uppercase()) {
        return None;
    }
    let mut tokens = Vec::new();
    for (i, keyword) in rest.split(':').filter(|k| !k.is_empty()).enumerate() {
        let keyword = if i == 0 {
            match keyword.strip_prefix("With") {
                Some(stripped) if stripped.starts_with(|c: char| c.is_uppercase()) => stripped,
                _ => keyword,
            }
        } else {
            keyword
        };
        tokens.push(lower_camel(keyword));
    }
    Some(tokens)
}

/// Whether a selector belongs to a family that returns a +1 object
/// (`alloc`, `new`, `copy`, `mutableCopy`, `init`).
pub fn returns_retained_by_convention(selector: &str) -> bool {
    let name = selector.trim_start_matches('_');
    ["alloc", "new", "copy", "mutableCopy", "init"]
        .iter()
        .any(|family| match name.strip_prefix(family) {
            Some(rest) => rest.is_empty() || rest.starts_with(|c: char| c == ':' || c.is_uppercase()),
            None => false,
        })
}

/// Selector for a script-exposed method: the name followed by one colon
/// per parameter.
pub fn selector_for_exposed(name: &str, param_count: usize) -> String {
    let mut selector = name.to_string();
    for _ in 0..param_count {
        selector.push(':');
    }
    selector
}

/// Setter selector for a property: `value` → `setValue:`
pub fn setter_for_property(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => format!("set{}{}:", first.to_uppercase(), chars.as_str()),
        None => "set:".to_string(),
    }
}
