//! Content-based skill loading.
//!
//! Each subdirectory of a skill directory holds a `SKILL.md` with YAML
//! front-matter and a Markdown body used verbatim as the skill's
//! instructions.

use crate::error::Result;
use crate::skills::registry::{SkillContextMode, SkillDefinition, SkillRegistry, SkillSource};

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FrontMatter {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default = "default_true")]
    user_invocable: bool,
    #[serde(default)]
    argument_hint: Option<String>,
    #[serde(default)]
    disable_model_invocation: bool,
    #[serde(default)]
    allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    context: Option<SkillContextMode>,
}

fn default_true() -> bool {
    true
}

/// Load every `<dir>/<skill>/SKILL.md` into the registry. Individual
/// failures are logged and skipped.
pub async fn load_skill_directories(registry: &SkillRegistry, directories: &[impl AsRef<Path>]) {
    for directory in directories {
        let directory = directory.as_ref();
        let entries = match std::fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(dir = %directory.display(), %error, "failed to read skill directory");
                continue;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let skill_file = path.join("SKILL.md");
            if !skill_file.exists() {
                continue;
            }

            let name_hint = entry.file_name().to_string_lossy().to_string();
            let loaded = std::fs::read_to_string(&skill_file)
                .map_err(anyhow::Error::from)
                .and_then(|content| parse_skill_md(&name_hint, &content).map_err(Into::into));

            match loaded {
                Ok(definition) => {
                    tracing::info!(skill = %definition.name, "loaded content skill");
                    registry.register(definition).await;
                }
                Err(error) => {
                    tracing::warn!(path = %skill_file.display(), %error, "failed to load skill");
                }
            }
        }
    }
}

/// Parse a `SKILL.md` document: optional `---`-delimited YAML
/// front-matter followed by the instruction body.
pub fn parse_skill_md(name_hint: &str, content: &str) -> Result<SkillDefinition> {
    let (front_matter, body) = split_front_matter(content);
    let meta: FrontMatter = match front_matter {
        Some(yaml) => serde_yaml::from_str(yaml)
            .map_err(|error| anyhow::anyhow!("invalid front-matter: {error}"))?,
        None => FrontMatter::default(),
    };

    let instructions = body.trim();
    if instructions.is_empty() {
        return Err(anyhow::anyhow!("skill body is empty").into());
    }

    Ok(SkillDefinition {
        name: meta.name.unwrap_or_else(|| name_hint.to_string()),
        description: meta.description.unwrap_or_default(),
        user_invocable: meta.user_invocable,
        argument_hint: meta.argument_hint,
        disable_model_invocation: meta.disable_model_invocation,
        allowed_tools: meta.allowed_tools,
        context: meta.context,
        instructions: Some(instructions.to_string()),
        source: SkillSource::Skillmd,
    })
}

/// Split out the leading `---\n...\n---` block, if any.
fn split_front_matter(content: &str) -> (Option<&str>, &str) {
    let Some(rest) = content.strip_prefix("---") else {
        return (None, content);
    };
    let Some(rest) = rest.strip_prefix('\n') else {
        return (None, content);
    };
    match rest.find("\n---") {
        Some(end) => {
            let body = &rest[end + 4..];
            let body = body.strip_prefix('\n').unwrap_or(body);
            (Some(&rest[..end]), body)
        }
        None => (None, content),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    #[test]
    fn parses_front_matter_and_body() {
        let content = indoc! {r#"
            ---
            name: summarize
            description: Summarize a document
            argumentHint: <url or text>
            disableModelInvocation: true
            context: fork
            ---
            Summarize the following:

            $ARGUMENTS
        "#};

        let skill = parse_skill_md("dir-name", content).expect("parse");
        assert_eq!(skill.name, "summarize");
        assert_eq!(skill.description, "Summarize a document");
        assert_eq!(skill.argument_hint.as_deref(), Some("<url or text>"));
        assert!(skill.disable_model_invocation);
        assert_eq!(skill.context, Some(SkillContextMode::Fork));
        assert!(skill.user_invocable);
        assert!(
            skill
                .instructions
                .as_deref()
                .expect("instructions")
                .starts_with("Summarize the following:")
        );
        assert_eq!(skill.source, SkillSource::Skillmd);
    }

    #[test]
    fn body_without_front_matter_uses_directory_name() {
        let skill = parse_skill_md("haiku", "Write a haiku about $ARGUMENTS").expect("parse");
        assert_eq!(skill.name, "haiku");
        assert_eq!(skill.description, "");
        assert!(skill.user_invocable);
    }

    #[test]
    fn empty_body_is_rejected() {
        assert!(parse_skill_md("empty", "---\nname: empty\n---\n\n").is_err());
    }

    #[tokio::test]
    async fn loads_directories_and_skips_broken_skills() {
        let dir = tempfile::tempdir().expect("tempdir");
        let good = dir.path().join("good");
        std::fs::create_dir_all(&good).expect("mkdir");
        std::fs::write(
            good.join("SKILL.md"),
            "---\ndescription: works\n---\nDo it: $ARGUMENTS",
        )
        .expect("write");

        let broken = dir.path().join("broken");
        std::fs::create_dir_all(&broken).expect("mkdir");
        std::fs::write(broken.join("SKILL.md"), "---\nname: [\n---\n").expect("write");

        let registry = SkillRegistry::new();
        load_skill_directories(&registry, &[dir.path()]).await;

        assert!(registry.get("good").await.is_some());
        assert!(registry.get("broken").await.is_none());
    }
}
