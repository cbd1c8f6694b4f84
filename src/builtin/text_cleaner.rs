use anyhow::bail;
use serde_json::{Map, Value};
use wiseflow_plugin::{Plugin, PluginContext, PluginKind, PluginMetadata, Processor};

/// Normalises whitespace and strips control characters.
///
/// Accepts a string, `{"text": ..}` or `{"documents": [..]}` and returns the
/// same shape. Option `lowercase` (also read from config) folds case.
#[derive(Debug, Default)]
pub struct TextCleaner {
    lowercase: bool,
}

pub(crate) fn clean(text: &str, lowercase: bool) -> String {
    let cleaned = text
        .split(|c: char| c.is_whitespace() || c.is_control())
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if lowercase { cleaned.to_lowercase() } else { cleaned }
}

impl Plugin for TextCleaner {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("text_cleaner", "1.0.0")
            .with_description("Whitespace and control character normalisation")
            .with_author("wiseflow developers")
            .with_license("MIT")
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Processor
    }

    fn initialize(&mut self, ctx: PluginContext) -> anyhow::Result<()> {
        self.lowercase = ctx
            .config_value("lowercase")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Ok(())
    }

    fn as_processor(&mut self) -> Option<&mut dyn Processor> {
        Some(self)
    }
}

impl Processor for TextCleaner {
    fn process(&mut self, data: Value, options: &Map<String, Value>) -> anyhow::Result<Value> {
        let lowercase = options
            .get("lowercase")
            .and_then(Value::as_bool)
            .unwrap_or(self.lowercase);
        match data {
            Value::String(s) => Ok(Value::String(clean(&s, lowercase))),
            Value::Object(mut map) => {
                if let Some(Value::String(text)) = map.get_mut("text") {
                    *text = clean(text, lowercase);
                } else if let Some(Value::Array(docs)) = map.get_mut("documents") {
                    for doc in docs {
                        if let Some(Value::String(content)) = doc.get_mut("content") {
                            *content = clean(content, lowercase);
                        }
                    }
                } else {
                    bail!("expected `text` or `documents`");
                }
                Ok(Value::Object(map))
            }
            other => bail!("cannot clean a {}", kind_of(&other)),
        }
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collapses_whitespace_and_controls() {
        assert_eq!(clean("  a\t\tb\n\u{7}c  ", false), "a b c");
        assert_eq!(clean("Hello  World", true), "hello world");
    }

    #[test]
    fn keeps_the_input_shape() {
        let mut p = TextCleaner::default();
        assert_eq!(p.process(json!(" x  y "), &Map::new()).unwrap(), json!("x y"));

        let mut opts = Map::new();
        opts.insert("lowercase".into(), json!(true));
        let out = p
            .process(json!({"documents": [{"path": "a", "content": " A\nB "}]}), &opts)
            .unwrap();
        assert_eq!(out["documents"][0]["content"], json!("a b"));
        assert_eq!(out["documents"][0]["path"], json!("a"));

        assert!(p.process(json!(5), &Map::new()).is_err());
        assert!(p.process(json!({"other": 1}), &Map::new()).is_err());
    }
}
