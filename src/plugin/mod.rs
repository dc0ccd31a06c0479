pub mod builtin;
mod schema;

pub use builtin::{base_plugin, BASE_PLUGIN_ID};

use crate::types::{
    ActionType, ConditionType, Goal, PluginType, PropertyMergeStrategyType, PropertyType, Rule,
    RuleError, Scoring, Segment, Tag, ValueType,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 一个插件贡献的全部定义
#[derive(Debug, Clone, Default)]
pub struct PluginDefinitions {
    pub plugin_id: String,
    pub tags: Vec<Tag>,
    pub conditions: Vec<ConditionType>,
    pub actions: Vec<ActionType>,
    pub values: Vec<ValueType>,
    pub properties: Vec<PropertyType>,
    pub mergers: Vec<PropertyMergeStrategyType>,
    pub rules: Vec<Rule>,
    pub segments: Vec<Segment>,
    pub scorings: Vec<Scoring>,
    pub goals: Vec<Goal>,
}

impl PluginDefinitions {
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            ..Self::default()
        }
    }

    /// 注册到类型注册表的全部类型
    pub fn types(&self) -> Vec<PluginType> {
        let mut types = Vec::new();
        types.extend(self.conditions.iter().cloned().map(|t| PluginType::Condition(Arc::new(t))));
        types.extend(self.actions.iter().cloned().map(|t| PluginType::Action(Arc::new(t))));
        types.extend(self.values.iter().cloned().map(|t| PluginType::Value(Arc::new(t))));
        types.extend(self.properties.iter().cloned().map(|t| PluginType::Property(Arc::new(t))));
        types.extend(self.mergers.iter().cloned().map(|t| PluginType::MergeStrategy(Arc::new(t))));
        types
    }
}

/// 单个定义文件的加载结果
#[derive(Debug)]
pub struct LoadResult {
    pub path: PathBuf,
    pub status: LoadStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadStatus {
    Loaded { id: String },
    Skipped { reason: String },
    Failed { error: String },
}

impl LoadResult {
    pub fn is_loaded(&self) -> bool {
        matches!(self.status, LoadStatus::Loaded { .. })
    }
}

/// 定义目录的子目录
#[derive(Debug, Clone, Copy, PartialEq)]
enum Section {
    Tags,
    Conditions,
    Actions,
    Values,
    Properties,
    Mergers,
    Rules,
    Segments,
    Scorings,
    Goals,
}

impl Section {
    const ALL: [Section; 10] = [
        Section::Tags,
        Section::Conditions,
        Section::Actions,
        Section::Values,
        Section::Properties,
        Section::Mergers,
        Section::Rules,
        Section::Segments,
        Section::Scorings,
        Section::Goals,
    ];

    fn dir_name(self) -> &'static str {
        match self {
            Section::Tags => "tags",
            Section::Conditions => "conditions",
            Section::Actions => "actions",
            Section::Values => "values",
            Section::Properties => "properties",
            Section::Mergers => "mergers",
            Section::Rules => "rules",
            Section::Segments => "segments",
            Section::Scorings => "scorings",
            Section::Goals => "goals",
        }
    }
}

/// 从插件目录读取 JSON 定义
///
/// 目录结构: `<root>/{tags,conditions,actions,values,properties/<target>,mergers,rules,segments,scorings,goals}/*.json`。
/// 单个文件出错只记入结果, 不影响其他文件。
pub struct DefinitionLoader;

impl DefinitionLoader {
    pub async fn load_dir(
        root: impl AsRef<Path>,
        plugin_id: &str,
    ) -> Result<(PluginDefinitions, Vec<LoadResult>), RuleError> {
        let root = root.as_ref();
        let mut definitions = PluginDefinitions::new(plugin_id);
        let mut results = Vec::new();

        for section in Section::ALL {
            let dir = root.join(section.dir_name());
            if !tokio::fs::try_exists(&dir).await? {
                continue;
            }
            if section == Section::Properties {
                for (target, target_dir) in sub_dirs(&dir).await? {
                    for path in json_files(&target_dir, &mut results).await? {
                        let status = load_property(&path, &target, &mut definitions).await;
                        results.push(report(path, status));
                    }
                }
                continue;
            }
            for path in json_files(&dir, &mut results).await? {
                let status = load_file(&path, section, &mut definitions).await;
                results.push(report(path, status));
            }
        }

        let loaded = results.iter().filter(|r| r.is_loaded()).count();
        info!(plugin = %plugin_id, path = %root.display(), loaded, total = results.len(), "Plugin definitions loaded");
        Ok((definitions, results))
    }
}

fn report(path: PathBuf, status: LoadStatus) -> LoadResult {
    match &status {
        LoadStatus::Loaded { id } => debug!(path = %path.display(), id = %id, "Loaded definition"),
        LoadStatus::Failed { error } => {
            tracing::error!(path = %path.display(), error = %error, "Failed to load definition")
        }
        LoadStatus::Skipped { .. } => {}
    }
    LoadResult { path, status }
}

async fn sub_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, RuleError> {
    let mut dirs = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                dirs.push((name.to_string(), path.clone()));
            }
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// 目录下的 JSON 文件 (按文件名排序); 其他文件记为 Skipped
async fn json_files(dir: &Path, results: &mut Vec<LoadResult>) -> Result<Vec<PathBuf>, RuleError> {
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if entry.file_type().await?.is_dir() {
            continue;
        }
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if name.starts_with('.') {
            results.push(LoadResult {
                path,
                status: LoadStatus::Skipped {
                    reason: "dotfile".to_string(),
                },
            });
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            results.push(LoadResult {
                path,
                status: LoadStatus::Skipped {
                    reason: "not a JSON file".to_string(),
                },
            });
            continue;
        }
        files.push(path);
    }
    files.sort();
    Ok(files)
}

async fn read_document(path: &Path) -> Result<Value, RuleError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

fn parse<T: DeserializeOwned>(document: Value) -> Result<T, RuleError> {
    serde_json::from_value(document).map_err(|e| RuleError::InvalidDefinition(e.to_string()))
}

async fn load_file(path: &Path, section: Section, definitions: &mut PluginDefinitions) -> LoadStatus {
    match parse_section(path, section, definitions).await {
        Ok(id) => LoadStatus::Loaded { id },
        Err(e) => LoadStatus::Failed { error: e.to_string() },
    }
}

async fn parse_section(
    path: &Path,
    section: Section,
    definitions: &mut PluginDefinitions,
) -> Result<String, RuleError> {
    let document = read_document(path).await?;
    match section {
        Section::Conditions => schema::validate_condition_type(&document).map_err(RuleError::InvalidDefinition)?,
        Section::Actions => schema::validate_action_type(&document).map_err(RuleError::InvalidDefinition)?,
        _ => {}
    }

    let id = match section {
        Section::Tags => {
            let tag: Tag = parse(document)?;
            let id = tag.id.clone();
            definitions.tags.push(tag);
            id
        }
        Section::Conditions => {
            let ty: ConditionType = parse(document)?;
            let id = ty.id.clone();
            definitions.conditions.push(ty);
            id
        }
        Section::Actions => {
            let ty: ActionType = parse(document)?;
            let id = ty.id.clone();
            definitions.actions.push(ty);
            id
        }
        Section::Values => {
            let ty: ValueType = parse(document)?;
            let id = ty.id.clone();
            definitions.values.push(ty);
            id
        }
        Section::Mergers => {
            let ty: PropertyMergeStrategyType = parse(document)?;
            let id = ty.id.clone();
            definitions.mergers.push(ty);
            id
        }
        Section::Rules => {
            let rule: Rule = parse(document)?;
            let id = rule.metadata.id.clone();
            definitions.rules.push(rule);
            id
        }
        Section::Segments => {
            let segment: Segment = parse(document)?;
            let id = segment.metadata.id.clone();
            definitions.segments.push(segment);
            id
        }
        Section::Scorings => {
            let scoring: Scoring = parse(document)?;
            let id = scoring.metadata.id.clone();
            definitions.scorings.push(scoring);
            id
        }
        Section::Goals => {
            let goal: Goal = parse(document)?;
            let id = goal.metadata.id.clone();
            definitions.goals.push(goal);
            id
        }
        Section::Properties => {
            return Err(RuleError::InvalidDefinition("属性定义需要 target 目录".to_string()));
        }
    };
    if id.is_empty() {
        warn!(path = %path.display(), "Definition has an empty id");
        return Err(RuleError::InvalidDefinition("id 不能为空".to_string()));
    }
    Ok(id)
}

async fn load_property(path: &Path, target: &str, definitions: &mut PluginDefinitions) -> LoadStatus {
    let parsed = async {
        let mut ty: PropertyType = parse(read_document(path).await?)?;
        if ty.target.is_empty() {
            ty.target = target.to_string();
        }
        Ok::<_, RuleError>(ty)
    }
    .await;
    match parsed {
        Ok(ty) => {
            let id = format!("{}/{}", ty.target, ty.id);
            definitions.properties.push(ty);
            LoadStatus::Loaded { id }
        }
        Err(e) => LoadStatus::Failed { error: e.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn malformed_files_do_not_abort_siblings() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "tags/web.json", r#"{"id": "web", "parentId": "condition"}"#);
        write(
            root,
            "conditions/pageVisit.json",
            r#"{"id": "pageVisitCondition", "systemTags": ["profileCondition"]}"#,
        );
        write(root, "conditions/broken.json", r#"{"id": "#);
        write(root, "conditions/noId.json", r#"{"systemTags": []}"#);
        write(root, "actions/mail.json", r#"{"id": "sendMailAction", "actionExecutor": "sendMail"}"#);
        write(root, "actions/README.md", "docs");
        write(root, "properties/profiles/email.json", r#"{"id": "email", "type": "string"}"#);
        write(
            root,
            "rules/welcome.json",
            r#"{"metadata": {"id": "welcome"}, "condition": {"conditionTypeId": "eventTypeCondition", "parameterValues": {"eventTypeId": "login"}}}"#,
        );

        let (definitions, results) = DefinitionLoader::load_dir(root, "web").await.unwrap();

        assert_eq!(definitions.tags.len(), 1);
        assert_eq!(definitions.conditions.len(), 1);
        assert_eq!(definitions.conditions[0].id, "pageVisitCondition");
        assert_eq!(definitions.actions[0].action_executor, "sendMail");
        assert_eq!(definitions.properties[0].target, "profiles");
        assert_eq!(definitions.rules[0].metadata.id, "welcome");

        let failed = results
            .iter()
            .filter(|r| matches!(r.status, LoadStatus::Failed { .. }))
            .count();
        let skipped = results
            .iter()
            .filter(|r| matches!(r.status, LoadStatus::Skipped { .. }))
            .count();
        assert_eq!(failed, 2);
        assert_eq!(skipped, 1);
        assert_eq!(results.iter().filter(|r| r.is_loaded()).count(), 5);
    }

    #[tokio::test]
    async fn missing_sections_are_fine() {
        let dir = TempDir::new().unwrap();
        let (definitions, results) = DefinitionLoader::load_dir(dir.path(), "empty").await.unwrap();
        assert!(definitions.types().is_empty());
        assert!(results.is_empty());
    }
}
