use std::collections::HashMap;

use anyhow::anyhow;
use serde_json::{Map, Value, json};
use wiseflow_plugin::{Analyzer, EventType, Plugin, PluginContext, PluginKind, PluginMetadata};

use super::{text_cleaner::clean, text_of};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "has", "have", "had",
    "her", "his", "its", "was", "were", "with", "this", "that", "from", "they", "them", "then",
    "than", "there", "their", "what", "when", "which", "will", "would", "into", "out", "our",
    "about", "been", "also", "more", "some", "such", "only", "other", "over", "very",
];

/// Top-N term frequency over the input text.
///
/// Option/config `top_n` (default 10) and `min_length` (default 3).
#[derive(Debug, Default)]
pub struct KeywordAnalyzer {
    ctx: Option<PluginContext>,
    top_n: usize,
    min_length: usize,
}

fn usize_opt(options: &Map<String, Value>, key: &str) -> Option<usize> {
    options.get(key).and_then(Value::as_u64).map(|v| v as usize)
}

pub(crate) fn keywords(text: &str, top_n: usize, min_length: usize) -> (Vec<(String, usize)>, usize) {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut total = 0;
    for term in clean(text, true).split(|c: char| !c.is_alphanumeric()) {
        if term.chars().count() < min_length || STOPWORDS.contains(&term) {
            continue;
        }
        total += 1;
        *counts.entry(term.to_string()).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    // ties broken alphabetically so results are stable
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(top_n);
    (ranked, total)
}

impl Plugin for KeywordAnalyzer {
    fn metadata(&self) -> PluginMetadata {
        PluginMetadata::new("keyword_analyzer", "1.0.0")
            .with_description("Term frequency keywords")
            .with_author("wiseflow developers")
            .with_license("MIT")
            .with_dependency("text_cleaner", "^1.0")
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Analyzer
    }

    fn initialize(&mut self, ctx: PluginContext) -> anyhow::Result<()> {
        self.top_n = usize_opt(ctx.config(), "top_n").unwrap_or(10);
        self.min_length = usize_opt(ctx.config(), "min_length").unwrap_or(3);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn as_analyzer(&mut self) -> Option<&mut dyn Analyzer> {
        Some(self)
    }
}

impl Analyzer for KeywordAnalyzer {
    fn analyze(&mut self, data: Value, options: &Map<String, Value>) -> anyhow::Result<Value> {
        let text = text_of(&data).ok_or_else(|| anyhow!("no text to analyze"))?;
        let top_n = usize_opt(options, "top_n").unwrap_or(self.top_n);
        let min_length = usize_opt(options, "min_length").unwrap_or(self.min_length);
        let (ranked, total) = keywords(&text, top_n, min_length);

        let keywords: Vec<Value> = ranked
            .iter()
            .map(|(term, count)| json!({ "term": term, "count": count }))
            .collect();
        if let Some(ctx) = &self.ctx {
            let mut data = Map::new();
            data.insert("keywords".into(), json!(keywords.len()));
            data.insert("total_terms".into(), json!(total));
            ctx.publish(EventType::AnalysisCompleted, data)?;
        }
        Ok(json!({ "keywords": keywords, "total_terms": total }))
    }
}
