//! 场景目录：从 `<scenario dir>/*.json` 加载预置的事件回放脚本
//!
//! 场景文件格式：
//!
//! ```json
//! {
//!   "id": "tool-call",
//!   "name": "Tool call",
//!   "turns": [
//!     { "trigger": { "userMessage": "weather" }, "delayMs": 100, "events": [ ... ] },
//!     { "trigger": { "userMessage": "*" }, "events": [ ... ] }
//!   ]
//! }
//! ```
//!
//! `userMessage` 为大小写敏感的正则（在整段文本中搜索），`*` 为通配；
//! 非法正则退化为精确相等匹配。turn 按声明顺序匹配，先匹配者胜出。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::Event;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Invalid scenario glob: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// 触发条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
enum TurnMatcher {
    #[default]
    Never,
    Any,
    Pattern(Regex),
    Exact(String),
}

impl TurnMatcher {
    fn compile(trigger: &Trigger) -> Self {
        match trigger.user_message.as_deref() {
            None | Some("") => TurnMatcher::Never,
            Some("*") => TurnMatcher::Any,
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => TurnMatcher::Pattern(re),
                Err(e) => {
                    tracing::warn!(pattern, error = %e, "invalid trigger regex, using exact match");
                    TurnMatcher::Exact(pattern.to_string())
                }
            },
        }
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            TurnMatcher::Never => false,
            TurnMatcher::Any => true,
            TurnMatcher::Pattern(re) => re.is_match(text),
            TurnMatcher::Exact(s) => s == text,
        }
    }
}

/// 一个回放回合
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioTurn {
    #[serde(default)]
    pub trigger: Trigger,
    #[serde(default)]
    pub events: Vec<Event>,
    /// 覆盖默认事件间隔（毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip)]
    matcher: TurnMatcher,
}

impl ScenarioTurn {
    pub fn new(pattern: impl Into<String>, events: Vec<Event>) -> Self {
        let trigger = Trigger {
            user_message: Some(pattern.into()),
        };
        Self {
            matcher: TurnMatcher::compile(&trigger),
            trigger,
            events,
            delay_ms: None,
        }
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn matches(&self, text: &str) -> bool {
        self.matcher.matches(text)
    }
}

/// 一个场景
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub turns: Vec<ScenarioTurn>,
}

impl Scenario {
    pub fn new(id: impl Into<String>, turns: Vec<ScenarioTurn>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            turns,
        }
    }

    /// 编译所有触发条件（反序列化后调用一次）
    fn compiled(mut self) -> Self {
        for turn in &mut self.turns {
            turn.matcher = TurnMatcher::compile(&turn.trigger);
        }
        self
    }

    /// 第一个匹配 `text` 的回合
    pub fn select_turn(&self, text: &str) -> Option<&ScenarioTurn> {
        self.turns.iter().find(|t| t.matches(text))
    }

    pub fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            turn_count: self.turns.len(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str::<Scenario>(json).map(Scenario::compiled)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub turn_count: usize,
}

/// 场景目录（启动时加载，只读）
#[derive(Debug, Default, Clone)]
pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, Arc<Scenario>>,
}

impl ScenarioCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加载目录下全部 `*.json`；单个文件解析失败只记录日志并跳过
    pub fn load_dir(dir: &Path) -> Result<Self, ScenarioError> {
        let mut catalog = Self::new();
        if !dir.is_dir() {
            tracing::warn!(dir = %dir.display(), "scenario directory not found, catalog is empty");
            return Ok(catalog);
        }

        let pattern = dir.join("*.json");
        for entry in glob::glob(&pattern.to_string_lossy())? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "unreadable scenario entry");
                    continue;
                }
            };
            match Self::load_file(&path) {
                Ok(scenario) => {
                    tracing::debug!(id = %scenario.id, path = %path.display(), "scenario loaded");
                    catalog.insert(scenario);
                }
                Err(e) => tracing::warn!(error = %e, "skipping scenario file"),
            }
        }

        tracing::info!(count = catalog.len(), dir = %dir.display(), "Scenarios loaded");
        Ok(catalog)
    }

    fn load_file(path: &Path) -> Result<Scenario, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut scenario = Scenario::from_json(&text).map_err(|source| ScenarioError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if scenario.id.is_empty() {
            if let Some(stem) = path.file_stem() {
                scenario.id = stem.to_string_lossy().into_owned();
            }
        }
        Ok(scenario)
    }

    pub fn insert(&mut self, scenario: Scenario) {
        let scenario = scenario.compiled();
        self.scenarios.insert(scenario.id.clone(), Arc::new(scenario));
    }

    pub fn get(&self, id: &str) -> Option<Arc<Scenario>> {
        self.scenarios.get(id).cloned()
    }

    pub fn list(&self) -> Vec<ScenarioSummary> {
        self.scenarios.values().map(|s| s.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hi_then_wildcard() -> Scenario {
        Scenario::new(
            "greet",
            vec![
                ScenarioTurn::new("hi", vec![Event::text_chunk("m1", "hello!")]),
                ScenarioTurn::new("*", vec![Event::text_chunk("m2", "fallback")]),
            ],
        )
    }

    #[test]
    fn test_first_matching_turn_wins() {
        let s = hi_then_wildcard();
        assert_eq!(
            s.select_turn("hi there").unwrap().events[0],
            Event::text_chunk("m1", "hello!")
        );
        assert_eq!(
            s.select_turn("bye").unwrap().events[0],
            Event::text_chunk("m2", "fallback")
        );
    }

    #[test]
    fn test_matching_is_case_sensitive() {
        let s = Scenario::new("x", vec![ScenarioTurn::new("hi", vec![])]);
        assert!(s.select_turn("HI").is_none());
        assert!(s.select_turn("oh hi").is_some());
    }

    #[test]
    fn test_invalid_regex_falls_back_to_exact() {
        let s = Scenario::new("x", vec![ScenarioTurn::new("what(", vec![])]);
        assert!(s.select_turn("what(").is_some());
        assert!(s.select_turn("what( now").is_none());
    }

    #[test]
    fn test_turn_without_trigger_never_matches() {
        let s = Scenario::from_json(r#"{"id":"x","turns":[{"events":[]}]}"#).unwrap();
        assert!(s.select_turn("anything").is_none());
    }

    #[test]
    fn test_load_dir_skips_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("greet.json"),
            r#"{"id":"greet","name":"Greeting","turns":[
                {"trigger":{"userMessage":"*"},"delayMs":10,
                 "events":[{"type":"TEXT_MESSAGE_CHUNK","messageId":"m","delta":"hey"}]}]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = ScenarioCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        let greet = catalog.get("greet").unwrap();
        assert_eq!(greet.turns[0].delay_ms, Some(10));
        assert!(greet.select_turn("whatever").is_some());
    }

    #[test]
    fn test_missing_dir_is_empty_catalog() {
        let catalog = ScenarioCatalog::load_dir(Path::new("/nonexistent/scenarios")).unwrap();
        assert!(catalog.is_empty());
    }
}
