use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::expr::{BoolVm, StringVm};
use crate::provider::ChannelType;
use crate::upstream::Policy;

/// Top-level YAML configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub debug: bool,
    pub listen: String,
    pub socks5: String,
    #[serde(skip_serializing)]
    pub keys: Vec<String>,
    pub policy: Policy,
    pub rules: Vec<Rule>,
    pub extra_models: Vec<String>,
    pub enable_prometheus: bool,
    pub moderation: Moderation,
}

/// One configured channel declaration. A rule expands into one upstream per
/// (server × key) pair at registry build time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Rule {
    pub name: String,
    pub servers: Vec<String>,
    #[serde(skip_serializing)]
    pub keys: Vec<String>,
    pub models: Vec<String>,
    pub model_keys: Vec<ModelKeySet>,
    pub proxy: bool,
    #[serde(rename = "type")]
    pub channel: ChannelType,
    pub azure_api_version: String,
    pub rewrite: Vec<ModelRewrite>,
    /// Member of the default pool, used when no model mapping matches.
    pub default: bool,
    /// Only eligible during retry, or when the pool has no main members.
    pub backup: bool,
    /// Weight for the `weight` policy. 0 counts as 1, negative disables the rule.
    pub weight: i32,
    pub expr: Option<Expr>,
}

impl Rule {
    /// Models this rule serves: declared models plus every rewrite source.
    pub fn all_models(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for m in self
            .models
            .iter()
            .chain(self.rewrite.iter().map(|r| &r.src))
        {
            if seen.insert(m.clone()) {
                out.push(m.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRewrite {
    pub src: String,
    pub dst: String,
}

/// Sub-rule shorthand: each entry becomes its own rule named `{parent}-S(i)`,
/// inheriting servers/keys it does not set itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelKeySet {
    pub servers: Vec<String>,
    pub server: String,
    pub models: Vec<String>,
    pub model: String,
    pub keys: Vec<String>,
    pub key: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Expr {
    /// Boolean expression over `Model` deciding whether the rule serves it.
    pub r#match: String,
    /// String expression over `Model` producing the outbound model name.
    pub replace: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Moderation {
    pub enabled: bool,
    /// Honor a client `X-Ignore-Moderation: true` header.
    pub client_can_ignore: bool,
    pub categories: Vec<String>,
    pub score_threshold: f64,
    pub api: ModerationApi,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModerationApi {
    #[serde(rename = "type")]
    pub kind: String,
    pub server: String,
    #[serde(skip_serializing)]
    pub key: String,
    pub proxy: bool,
    pub model: String,
}

const DEFAULT_MODERATION_CATEGORIES: &[&str] = &[
    "sexual",
    "sexual/minors",
    "harassment",
    "harassment/threatening",
    "hate",
    "hate/threatening",
    "illicit",
    "illicit/violent",
    "self-harm",
    "self-harm/intent",
    "self-harm/instructions",
    "violence",
    "violence/graphic",
];

pub fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    parse_config(&text)
}

pub fn parse_config(text: &str) -> Result<Config> {
    let mut conf: Config = serde_yaml::from_str(text).context("parse config yaml")?;

    let mut seen = HashSet::new();
    conf.extra_models.retain(|m| seen.insert(m.clone()));

    conf.rules = expand_rules(std::mem::take(&mut conf.rules));
    apply_moderation_defaults(&mut conf.moderation);
    validate(&conf)?;

    Ok(conf)
}

/// Flatten `model-keys` entries into standalone rules.
fn expand_rules(rules: Vec<Rule>) -> Vec<Rule> {
    let mut out = Vec::new();
    for rule in rules {
        if rule.model_keys.is_empty() {
            out.push(rule);
            continue;
        }

        for (i, entry) in rule.model_keys.iter().enumerate() {
            let mut servers = entry.servers.clone();
            if !entry.server.is_empty() {
                servers.push(entry.server.clone());
            }
            let mut models = entry.models.clone();
            if !entry.model.is_empty() {
                models.push(entry.model.clone());
            }
            let mut keys = entry.keys.clone();
            if !entry.key.is_empty() {
                keys.push(entry.key.clone());
            }

            out.push(Rule {
                name: format!("{}-S({})", rule.name, i),
                servers: if servers.is_empty() {
                    rule.servers.clone()
                } else {
                    servers
                },
                keys: if keys.is_empty() {
                    rule.keys.clone()
                } else {
                    keys
                },
                rewrite: rule
                    .rewrite
                    .iter()
                    .filter(|r| models.contains(&r.src))
                    .cloned()
                    .collect(),
                models,
                model_keys: Vec::new(),
                proxy: rule.proxy,
                channel: rule.channel,
                azure_api_version: rule.azure_api_version.clone(),
                default: rule.default,
                backup: rule.backup,
                weight: rule.weight,
                expr: None,
            });
        }
    }
    out
}

fn apply_moderation_defaults(moderation: &mut Moderation) {
    if !moderation.enabled {
        return;
    }

    if moderation.categories.is_empty() {
        moderation.categories = DEFAULT_MODERATION_CATEGORIES
            .iter()
            .map(|s| s.to_string())
            .collect();
    }
    if moderation.score_threshold == 0.0 {
        moderation.score_threshold = 0.7;
    }
    if moderation.api.kind.is_empty() {
        moderation.api.kind = "openai".to_string();
    }
    if moderation.api.server.is_empty() {
        moderation.api.server = "https://api.openai.com".to_string();
    }
    if moderation.api.model.is_empty() {
        moderation.api.model = "omni-moderation-latest".to_string();
    }
}

fn validate(conf: &Config) -> Result<()> {
    for (i, rule) in conf.rules.iter().enumerate() {
        if rule.servers.is_empty() {
            bail!("rule #{}: at least one server is required", i + 1);
        }
        if rule.keys.is_empty() {
            bail!("rule #{}: at least one key is required", i + 1);
        }

        if let Some(expr) = &rule.expr {
            if !expr.r#match.is_empty()
                && let Err(err) = BoolVm::compile(&expr.r#match)
            {
                bail!("rule #{}, expr.match: {}", i + 1, err);
            }
            if !expr.replace.is_empty()
                && let Err(err) = StringVm::compile(&expr.replace)
            {
                bail!("rule #{}, expr.replace: {}", i + 1, err);
            }
        }
    }

    if conf.moderation.enabled {
        if conf.moderation.api.kind != "openai" {
            bail!("moderation api type only supports openai");
        }
        if !(0.0..=1.0).contains(&conf.moderation.score_threshold) {
            bail!("moderation score threshold must be between 0 and 1");
        }
        if !conf.moderation.api.server.starts_with("http://")
            && !conf.moderation.api.server.starts_with("https://")
        {
            bail!("moderation api server must be a valid url");
        }
        if conf.moderation.api.key.is_empty() {
            bail!("moderation api key is required");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_config() {
        let conf = parse_config(
            r#"
listen: "127.0.0.1:8080"
keys: ["sk-admin"]
policy: round_robin
rules:
  - name: openai
    servers: ["https://api.openai.com"]
    keys: ["sk-one", "sk-two"]
    models: ["gpt-4"]
    default: true
"#,
        )
        .unwrap();

        assert_eq!(conf.listen, "127.0.0.1:8080");
        assert_eq!(conf.policy, Policy::RoundRobin);
        assert_eq!(conf.rules.len(), 1);
        assert_eq!(conf.rules[0].channel, ChannelType::OpenAi);
        assert!(conf.rules[0].default);
    }

    #[test]
    fn rejects_unknown_policy() {
        let err = parse_config(
            r#"
listen: ":8080"
policy: sticky
rules: []
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("parse config yaml"));
    }

    #[test]
    fn expands_model_keys_into_sub_rules() {
        let conf = parse_config(
            r#"
listen: ":8080"
rules:
  - name: mixed
    servers: ["https://a.example"]
    keys: ["parent-key"]
    rewrite:
      - { src: "gpt-4", dst: "gpt-4-turbo" }
      - { src: "gpt-3.5", dst: "gpt-3.5-turbo" }
    model-keys:
      - model: gpt-4
        key: key-for-gpt4
      - models: ["gpt-3.5"]
        server: "https://b.example"
"#,
        )
        .unwrap();

        assert_eq!(conf.rules.len(), 2);

        let first = &conf.rules[0];
        assert_eq!(first.name, "mixed-S(0)");
        assert_eq!(first.servers, vec!["https://a.example"]);
        assert_eq!(first.keys, vec!["key-for-gpt4"]);
        assert_eq!(first.models, vec!["gpt-4"]);
        assert_eq!(first.rewrite.len(), 1);
        assert_eq!(first.rewrite[0].dst, "gpt-4-turbo");

        let second = &conf.rules[1];
        assert_eq!(second.name, "mixed-S(1)");
        assert_eq!(second.servers, vec!["https://b.example"]);
        assert_eq!(second.keys, vec!["parent-key"]);
        assert_eq!(second.rewrite.len(), 1);
        assert_eq!(second.rewrite[0].src, "gpt-3.5");
    }

    #[test]
    fn moderation_defaults_are_applied() {
        let conf = parse_config(
            r#"
listen: ":8080"
rules:
  - name: r
    servers: ["https://a.example"]
    keys: ["k"]
    models: ["gpt-4"]
moderation:
  enabled: true
  api:
    key: sk-mod
"#,
        )
        .unwrap();

        let m = &conf.moderation;
        assert_eq!(m.score_threshold, 0.7);
        assert_eq!(m.api.kind, "openai");
        assert_eq!(m.api.server, "https://api.openai.com");
        assert_eq!(m.api.model, "omni-moderation-latest");
        assert!(m.categories.contains(&"hate".to_string()));
    }

    #[test]
    fn moderation_requires_key() {
        let err = parse_config(
            r#"
listen: ":8080"
rules:
  - name: r
    servers: ["https://a.example"]
    keys: ["k"]
moderation:
  enabled: true
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("moderation api key"));
    }

    #[test]
    fn invalid_expression_fails_validation() {
        let err = parse_config(
            r#"
listen: ":8080"
rules:
  - name: r
    servers: ["https://a.example"]
    keys: ["k"]
    expr:
      match: 'Model startsWith'
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("expr.match"));
    }

    #[test]
    fn anthropic_channel_is_accepted() {
        let conf = parse_config(
            r#"
listen: ":8080"
rules:
  - name: claude
    servers: ["https://api.anthropic.com"]
    keys: ["k"]
    models: ["claude-3-opus"]
    type: anthropic
"#,
        )
        .unwrap();
        assert_eq!(conf.rules[0].channel, ChannelType::Anthropic);
    }

    #[test]
    fn all_models_unions_rewrite_sources() {
        let rule = Rule {
            models: vec!["gpt-4".to_string()],
            rewrite: vec![
                ModelRewrite {
                    src: "gpt-4".to_string(),
                    dst: "gpt-4-turbo".to_string(),
                },
                ModelRewrite {
                    src: "gpt-4o".to_string(),
                    dst: "gpt-4o-mini".to_string(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(rule.all_models(), vec!["gpt-4", "gpt-4o"]);
    }

    #[test]
    fn extra_models_are_deduplicated() {
        let conf = parse_config(
            r#"
listen: ":8080"
rules:
  - name: r
    servers: ["https://a.example"]
    keys: ["k"]
extra-models: ["m1", "m2", "m1"]
"#,
        )
        .unwrap();
        assert_eq!(conf.extra_models, vec!["m1", "m2"]);
    }
}
