use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::openai::{ModelCard, ModelList};
use crate::provider::{HttpClients, build_adapter};

use super::{CompiledRule, Policy, UpstreamPool};

/// Immutable routing table built once at startup: static model→pool mappings,
/// the default pool, and the expression rules evaluated for unknown models.
pub struct Registry {
    model_pools: HashMap<String, Arc<UpstreamPool>>,
    default_pool: Arc<UpstreamPool>,
    expr_rules: Vec<Arc<CompiledRule>>,
    policy: Policy,
    clients: HttpClients,
    models: ModelList,
}

impl Registry {
    pub fn build(conf: &Config, clients: HttpClients) -> Result<Self> {
        let policy = conf.policy;

        let mut compiled: Vec<Arc<CompiledRule>> = Vec::new();
        for (i, rule) in conf.rules.iter().enumerate() {
            // 负数权重表示禁用该规则
            if rule.weight < 0 {
                debug!("rule #{} disabled by negative weight", i + 1);
                continue;
            }
            let rule = CompiledRule::new(rule.clone())
                .with_context(|| format!("compile expressions of rule #{}", i + 1))?;
            compiled.push(Arc::new(rule));
        }

        let mut model_pools: HashMap<String, UpstreamPool> = HashMap::new();
        for rule in &compiled {
            for model in rule.rule.all_models() {
                let pool = model_pools
                    .entry(model)
                    .or_insert_with(|| UpstreamPool::new(policy));
                add_rule_upstreams(pool, rule, &clients)?;
            }
        }

        let mut default_pool = UpstreamPool::new(policy);
        let mut default_names: HashSet<String> = HashSet::new();
        for rule in compiled.iter().filter(|r| r.rule.default) {
            // 同名规则只加入一次 default pool
            if !default_names.insert(rule.rule.name.clone()) {
                continue;
            }
            add_rule_upstreams(&mut default_pool, rule, &clients)?;
        }

        let expr_rules: Vec<Arc<CompiledRule>> = compiled
            .iter()
            .filter(|r| {
                r.rule
                    .expr
                    .as_ref()
                    .is_some_and(|e| !e.r#match.is_empty())
            })
            .cloned()
            .collect();

        let model_pools: HashMap<String, Arc<UpstreamPool>> = model_pools
            .into_iter()
            .map(|(model, mut pool)| {
                pool.init();
                (model, Arc::new(pool))
            })
            .collect();
        default_pool.init();

        let models = build_model_list(&model_pools, &conf.extra_models);

        Ok(Self {
            model_pools,
            default_pool: Arc::new(default_pool),
            expr_rules,
            policy,
            clients,
            models,
        })
    }

    /// Resolve the pool serving a model: the static mapping when one exists,
    /// otherwise a pool assembled from the matching expression rules. `None`
    /// means the caller should fall back to the default pool.
    pub fn select_pool(&self, model: &str) -> Option<Arc<UpstreamPool>> {
        if let Some(pool) = self.model_pools.get(model) {
            return Some(pool.clone());
        }

        let mut pool: Option<UpstreamPool> = None;
        for rule in &self.expr_rules {
            if !rule.matches_model(model) {
                continue;
            }
            let pool = pool.get_or_insert_with(|| UpstreamPool::new(self.policy));
            if let Err(err) = add_rule_upstreams(pool, rule, &self.clients) {
                tracing::error!("failed to create upstream for rule {}: {err}", rule.rule.name);
            }
        }

        let mut pool = pool.filter(|p| !p.is_empty())?;
        pool.init();
        Some(Arc::new(pool))
    }

    pub fn default_pool(&self) -> Arc<UpstreamPool> {
        self.default_pool.clone()
    }

    /// Registered models plus the configured extras, as served by
    /// `GET /v1/models`.
    pub fn model_list(&self) -> &ModelList {
        &self.models
    }

    /// Dump every pool, for `--test`.
    pub fn print(&self) {
        println!("\n-------- Models-Upstreams --------\n");
        let mut models: Vec<&String> = self.model_pools.keys().collect();
        models.sort();
        for model in models {
            println!("{model}");
            self.model_pools[model].print();
            println!();
        }

        println!("\n-------- Default-Upstreams --------\n");
        self.default_pool.print();
    }

    /// Show which upstreams would serve a model and how its name would be
    /// rewritten, for `--eval`.
    pub fn eval(&self, model: &str) {
        let pool = self
            .select_pool(model)
            .unwrap_or_else(|| self.default_pool.clone());
        if pool.is_empty() {
            println!("no upstream available for model {model}");
            return;
        }

        for up in pool.all() {
            println!(
                "  [{}] {} : {} -> {}",
                up.index,
                up.name(),
                model,
                up.rule.replace_model(model)
            );
        }
    }
}

fn add_rule_upstreams(
    pool: &mut UpstreamPool,
    rule: &Arc<CompiledRule>,
    clients: &HttpClients,
) -> Result<()> {
    for server_index in 0..rule.rule.servers.len() {
        for key_index in 0..rule.rule.keys.len() {
            let adapter = build_adapter(rule, server_index, key_index, clients)
                .with_context(|| format!("create upstream for rule {}", rule.rule.name))?;
            pool.add(rule.clone(), server_index, key_index, adapter);
        }
    }
    Ok(())
}

fn build_model_list(
    model_pools: &HashMap<String, Arc<UpstreamPool>>,
    extra_models: &[String],
) -> ModelList {
    let created = crate::provider::unix_timestamp();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut ids: Vec<&str> = Vec::new();
    for model in model_pools.keys().map(|s| s.as_str()) {
        if seen.insert(model) {
            ids.push(model);
        }
    }
    for model in extra_models.iter().map(|s| s.as_str()) {
        if seen.insert(model) {
            ids.push(model);
        }
    }
    ids.sort_unstable();

    ModelList {
        object: "list".to_string(),
        data: ids
            .into_iter()
            .map(|id| ModelCard {
                id: id.to_string(),
                object: "model".to_string(),
                created,
                owned_by: "system".to_string(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::config::parse_config;
    use crate::upstream::IndexSet;

    fn registry(yaml: &str) -> Registry {
        let conf = parse_config(yaml).unwrap();
        Registry::build(&conf, HttpClients::direct_only()).unwrap()
    }

    #[test]
    fn rule_expands_into_server_by_key_upstreams() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: r
    servers: ["https://a.example", "https://b.example"]
    keys: ["k1", "k2", "k3"]
    models: ["gpt-4"]
"#,
        );

        let pool = registry.select_pool("gpt-4").unwrap();
        assert_eq!(pool.len(), 6);
        let names: Vec<String> = pool.all().iter().map(|u| u.name()).collect();
        assert!(names.contains(&"r|s0:k0".to_string()));
        assert!(names.contains(&"r|s1:k2".to_string()));
    }

    #[test]
    fn static_mapping_beats_expression_rules() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: static
    servers: ["https://static.example"]
    keys: ["k"]
    models: ["gpt-4"]
  - name: dynamic
    servers: ["https://dynamic.example"]
    keys: ["k"]
    expr:
      match: 'Model startsWith "gpt-"'
"#,
        );

        let pool = registry.select_pool("gpt-4").unwrap();
        assert_eq!(pool.all()[0].rule.rule.name, "static");

        let pool = registry.select_pool("gpt-5").unwrap();
        assert_eq!(pool.all()[0].rule.rule.name, "dynamic");
    }

    #[test]
    fn unmatched_model_falls_back_to_none() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: fallback
    servers: ["https://fallback.example"]
    keys: ["k"]
    models: ["gpt-4"]
    default: true
"#,
        );

        assert!(registry.select_pool("claude-3").is_none());
        assert!(!registry.default_pool().is_empty());
    }

    #[test]
    fn default_pool_deduplicates_by_rule_name() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: dup
    servers: ["https://a.example"]
    keys: ["k"]
    models: ["m1"]
    default: true
  - name: dup
    servers: ["https://a.example"]
    keys: ["k"]
    models: ["m2"]
    default: true
"#,
        );

        assert_eq!(registry.default_pool().len(), 1);
    }

    #[test]
    fn rewrite_sources_are_registered_models() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: r
    servers: ["https://a.example"]
    keys: ["k"]
    models: ["gpt-4"]
    rewrite:
      - { src: "gpt-4-alias", dst: "gpt-4" }
"#,
        );

        assert!(registry.select_pool("gpt-4-alias").is_some());
    }

    #[test]
    fn negative_weight_disables_a_rule() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: gone
    servers: ["https://a.example"]
    keys: ["k"]
    models: ["gpt-4"]
    weight: -1
"#,
        );

        assert!(registry.select_pool("gpt-4").is_none());
    }

    #[test]
    fn expression_pool_serves_and_excludes() {
        let registry = registry(
            r#"
listen: ":8080"
rules:
  - name: dynamic
    servers: ["https://a.example", "https://b.example"]
    keys: ["k"]
    expr:
      match: 'Model startsWith "gpt-"'
      replace: 'Model + "-preview"'
"#,
        );

        let pool = registry.select_pool("gpt-5").unwrap();
        assert_eq!(pool.len(), 2);
        let up = pool.next(&IndexSet::new()).unwrap();
        assert_eq!(up.rule.replace_model("gpt-5"), "gpt-5-preview");
    }

    #[test]
    fn model_list_includes_extras_once() {
        let registry = registry(
            r#"
listen: ":8080"
extra-models: ["extra-model", "gpt-4"]
rules:
  - name: r
    servers: ["https://a.example"]
    keys: ["k"]
    models: ["gpt-4"]
"#,
        );

        let list = registry.model_list();
        assert_eq!(list.object, "list");
        let ids: Vec<&str> = list.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["extra-model", "gpt-4"]);
        assert!(list.data.iter().all(|m| m.object == "model"));
        assert!(list.data.iter().all(|m| m.owned_by == "system"));
    }
}
