use flowcore::NodeError;
use regex::{Regex, RegexBuilder};

/// Compile a pattern with editor-style flags (`i`, `m`, `s`, `u`)
pub(crate) fn compile(pattern: &str, flags: Option<&str>) -> Result<Regex, NodeError> {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.unwrap_or_default().chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'u' => builder.unicode(true),
            _ => &mut builder,
        };
    }
    builder
        .build()
        .map_err(|e| NodeError::Configuration(format!("invalid regex '{}': {}", pattern, e)))
}

pub(crate) fn replace(text: &str, pattern: &str, flags: Option<&str>, replacement: &str) -> Result<String, NodeError> {
    Ok(compile(pattern, flags)?.replace_all(text, replacement).into_owned())
}

/// First match's capture `group`; empty when nothing matches or the group
/// does not exist
pub(crate) fn extract(text: &str, pattern: &str, flags: Option<&str>, group: usize) -> Result<String, NodeError> {
    let regex = compile(pattern, flags)?;
    Ok(regex
        .captures(text)
        .and_then(|caps| caps.get(group))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default())
}

pub(crate) fn is_match(text: &str, pattern: &str, flags: Option<&str>) -> Result<bool, NodeError> {
    Ok(compile(pattern, flags)?.is_match(text))
}
