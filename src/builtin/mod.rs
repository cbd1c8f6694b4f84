//! Plugins compiled into the binary, one per capability contract.
use std::sync::Arc;

use serde_json::Value;
use wiseflow_plugin::Plugin;

use crate::registry::PluginFactory;

mod file_connector;
mod keyword_analyzer;
mod text_cleaner;

pub use file_connector::FileConnector;
pub use keyword_analyzer::KeywordAnalyzer;
pub use text_cleaner::TextCleaner;

pub fn factories() -> Vec<PluginFactory> {
    vec![
        Arc::new(|| Box::new(FileConnector::default()) as Box<dyn Plugin>),
        Arc::new(|| Box::new(TextCleaner::default()) as Box<dyn Plugin>),
        Arc::new(|| Box::new(KeywordAnalyzer::default()) as Box<dyn Plugin>),
    ]
}

/// Text carried by `data`: a string, `{"text": ..}` or
/// `{"documents": [{"content": ..}, ..]}` (joined by blank lines).
pub(crate) fn text_of(data: &Value) -> Option<String> {
    match data {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(Value::as_str) {
                return Some(text.to_string());
            }
            let docs = map.get("documents")?.as_array()?;
            let parts: Vec<&str> = docs
                .iter()
                .filter_map(|d| d.get("content").and_then(Value::as_str))
                .collect();
            Some(parts.join("\n\n"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_shapes() {
        assert_eq!(text_of(&json!("plain")).as_deref(), Some("plain"));
        assert_eq!(text_of(&json!({"text": "t"})).as_deref(), Some("t"));
        assert_eq!(
            text_of(&json!({"documents": [{"content": "a"}, {"path": "x"}, {"content": "b"}]})).as_deref(),
            Some("a\n\nb")
        );
        assert!(text_of(&json!(3)).is_none());
        assert!(text_of(&json!({"other": 1})).is_none());
    }
}
