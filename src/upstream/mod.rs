use std::sync::{Arc, Mutex};

use owo_colors::OwoColorize;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::Rule;
use crate::expr::{BoolVm, ExprError, StringVm};
use crate::provider::Adapter;

pub mod registry;

/// Load-balancing policy shared by every upstream of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    Random,
    #[default]
    RoundRobin,
    Weight,
}

/// Dense bitset over pool indices, used as the retry exclude-set.
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    words: Vec<u64>,
    len: usize,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, index: usize) {
        let word = index / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let bit = 1u64 << (index % 64);
        if self.words[word] & bit == 0 {
            self.words[word] |= bit;
            self.len += 1;
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|w| w & (1u64 << (index % 64)) != 0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A [`Rule`] with its expressions compiled once. Shared by every upstream
/// the rule expands into.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: Rule,
    matcher: Option<BoolVm>,
    replacer: Option<StringVm>,
}

impl CompiledRule {
    pub fn new(rule: Rule) -> Result<Self, ExprError> {
        let (matcher, replacer) = match &rule.expr {
            Some(expr) => (
                (!expr.r#match.is_empty())
                    .then(|| BoolVm::compile(&expr.r#match))
                    .transpose()?,
                (!expr.replace.is_empty())
                    .then(|| StringVm::compile(&expr.replace))
                    .transpose()?,
            ),
            None => (None, None),
        };
        Ok(Self {
            rule,
            matcher,
            replacer,
        })
    }

    /// Whether the rule's `match` expression accepts the model. Rules without
    /// one never match dynamically.
    pub fn matches_model(&self, model: &str) -> bool {
        self.matcher.as_ref().is_some_and(|vm| vm.run(model))
    }

    /// Outbound model name: literal rewrite pairs first, then the `replace`
    /// expression, else unchanged.
    pub fn replace_model(&self, model: &str) -> String {
        for rw in &self.rule.rewrite {
            if model == rw.src {
                return rw.dst.clone();
            }
        }
        if let Some(vm) = &self.replacer {
            return vm.run(model);
        }
        model.to_string()
    }

    fn effective_weight(&self) -> u64 {
        self.rule.weight.max(1) as u64
    }
}

/// A concrete dispatch endpoint: one (server, key) pair of a rule plus the
/// adapter that talks to it. Immutable after registry build.
pub struct Upstream {
    pub rule: Arc<CompiledRule>,
    /// Dense index within the owning pool; exclude-sets are keyed by it.
    pub index: usize,
    pub server_index: usize,
    pub key_index: usize,
    pub adapter: Box<dyn Adapter>,
}

impl Upstream {
    pub fn server(&self) -> &str {
        &self.rule.rule.servers[self.server_index]
    }

    /// Identity for logs: `rule|s{si}:k{ki}`, or masked server|key for
    /// anonymous rules.
    pub fn name(&self) -> String {
        if !self.rule.rule.name.is_empty() {
            format!(
                "{}|s{}:k{}",
                self.rule.rule.name, self.server_index, self.key_index
            )
        } else {
            format!("{}|{}", self.server(), self.masked_key())
        }
    }

    pub fn masked_key(&self) -> String {
        mask(10, &self.rule.rule.keys[self.key_index])
    }

    fn is_backup(&self) -> bool {
        self.rule.rule.backup
    }
}

/// Precomputed cumulative-weight table. Picks a pool index in O(log n).
#[derive(Debug)]
struct WeightedChooser {
    bounds: Vec<(u64, usize)>,
    total: u64,
}

impl WeightedChooser {
    fn build(entries: impl Iterator<Item = (usize, u64)>) -> Option<Self> {
        let mut bounds = Vec::new();
        let mut total = 0u64;
        for (index, weight) in entries {
            total += weight;
            bounds.push((total, index));
        }
        (total > 0).then_some(Self { bounds, total })
    }

    fn pick(&self) -> usize {
        let roll = rand::thread_rng().gen_range(1..=self.total);
        let at = self.bounds.partition_point(|(bound, _)| *bound < roll);
        self.bounds[at].1
    }
}

/// Ordered set of upstreams sharing a selection policy.
pub struct UpstreamPool {
    ups: Vec<Upstream>,
    policy: Policy,
    // 轮询游标，仅 round_robin 策略使用；串行化但不保证跨候选集公平。
    cursor: Mutex<usize>,
    chooser: Option<WeightedChooser>,
}

impl UpstreamPool {
    pub fn new(policy: Policy) -> Self {
        Self {
            ups: Vec::new(),
            policy,
            cursor: Mutex::new(0),
            chooser: None,
        }
    }

    /// Append an upstream; indices stay dense 0..N-1.
    pub fn add(
        &mut self,
        rule: Arc<CompiledRule>,
        server_index: usize,
        key_index: usize,
        adapter: Box<dyn Adapter>,
    ) {
        let index = self.ups.len();
        self.ups.push(Upstream {
            rule,
            index,
            server_index,
            key_index,
            adapter,
        });
    }

    /// Precompute the weighted chooser. Call once after all upstreams are
    /// added. The chooser covers non-backup members, or every member when
    /// the pool holds only backups.
    pub fn init(&mut self) {
        if self.policy != Policy::Weight || self.ups.is_empty() {
            return;
        }

        let mains = self
            .ups
            .iter()
            .filter(|u| !u.is_backup())
            .map(|u| (u.index, u.rule.effective_weight()));
        self.chooser = WeightedChooser::build(mains).or_else(|| {
            WeightedChooser::build(self.ups.iter().map(|u| (u.index, u.rule.effective_weight())))
        });
    }

    pub fn len(&self) -> usize {
        self.ups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ups.is_empty()
    }

    pub fn all(&self) -> &[Upstream] {
        &self.ups
    }

    pub fn at(&self, index: usize) -> Option<&Upstream> {
        self.ups.get(index)
    }

    /// Pick the next upstream.
    ///
    /// With a non-empty exclude-set this is a retry: any member whose index
    /// is not excluded is eligible (backups included) and the pick is
    /// uniform. With an empty exclude-set only non-backup members are
    /// eligible (all members when none exist) and the configured policy
    /// decides.
    pub fn next(&self, excluded: &IndexSet) -> Option<&Upstream> {
        if !excluded.is_empty() {
            let candidates: Vec<&Upstream> = self
                .ups
                .iter()
                .filter(|u| !excluded.contains(u.index))
                .collect();
            if candidates.is_empty() {
                return None;
            }
            let at = rand::thread_rng().gen_range(0..candidates.len());
            return Some(candidates[at]);
        }

        let mut candidates: Vec<&Upstream> = self.ups.iter().filter(|u| !u.is_backup()).collect();
        if candidates.is_empty() {
            // 全部都是 backup 时退化为使用全部 upstream。
            candidates = self.ups.iter().collect();
            if candidates.is_empty() {
                return None;
            }
        }

        match self.policy {
            Policy::Random => {
                let at = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[at])
            }
            Policy::RoundRobin => {
                let mut cursor = self.cursor.lock().expect("round-robin cursor poisoned");
                *cursor = (*cursor + 1) % candidates.len();
                Some(candidates[*cursor])
            }
            Policy::Weight => {
                let chooser = self.chooser.as_ref()?;
                self.ups.get(chooser.pick())
            }
        }
    }

    /// Human-readable pool listing for `--test` / `--eval`.
    pub fn print(&self) {
        for up in &self.ups {
            let marker = if up.is_backup() {
                format!("{}", "[backup]".bright_black())
            } else {
                format!("{}", "[main]  ".green())
            };
            let weight = if self.policy == Policy::Weight {
                format!(
                    " {}",
                    format!("(weight: {})", up.rule.effective_weight()).yellow()
                )
            } else {
                String::new()
            };
            println!("    -> {} {}{}", marker, up.name(), weight);
        }
    }
}

fn mask(left: usize, content: &str) -> String {
    let size = content.chars().count();
    if size < 16 {
        return "*".repeat(size);
    }
    let head: String = content.chars().take(left).collect();
    let tail: String = content.chars().skip(size - left).collect();
    format!("{}{}{}", head, "*".repeat(size - left * 2), tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::provider::{HttpClients, build_adapter};

    fn test_pool(policy: Policy, members: &[(bool, i32)]) -> UpstreamPool {
        let clients = HttpClients::direct_only();
        let mut pool = UpstreamPool::new(policy);
        for (i, (backup, weight)) in members.iter().enumerate() {
            let rule = Rule {
                name: format!("rule-{i}"),
                servers: vec!["http://127.0.0.1:1".to_string()],
                keys: vec!["test-key".to_string()],
                backup: *backup,
                weight: *weight,
                ..Default::default()
            };
            let compiled = Arc::new(CompiledRule::new(rule).unwrap());
            let adapter = build_adapter(&compiled, 0, 0, &clients).unwrap();
            pool.add(compiled, 0, 0, adapter);
        }
        pool.init();
        pool
    }

    #[test]
    fn index_bijection() {
        let pool = test_pool(Policy::Random, &[(false, 1), (false, 1), (false, 1)]);
        for _ in 0..50 {
            let up = pool.next(&IndexSet::new()).unwrap();
            assert_eq!(pool.at(up.index).unwrap().index, up.index);
        }
    }

    #[test]
    fn exclusion_is_strict() {
        let pool = test_pool(Policy::Random, &[(false, 1); 5]);
        for excluded_index in 0..5 {
            let mut excluded = IndexSet::new();
            excluded.insert(excluded_index);
            for _ in 0..50 {
                let up = pool.next(&excluded).unwrap();
                assert_ne!(up.index, excluded_index);
            }
        }
    }

    #[test]
    fn exhaustion_returns_none() {
        let pool = test_pool(Policy::RoundRobin, &[(false, 1), (false, 1), (true, 1)]);
        let mut used = IndexSet::new();
        for _ in 0..pool.len() {
            let up = pool.next(&used).expect("pool not yet exhausted");
            assert!(!used.contains(up.index));
            used.insert(up.index);
        }
        assert!(pool.next(&used).is_none());
    }

    #[test]
    fn first_pick_prefers_mains() {
        let pool = test_pool(Policy::Random, &[(true, 1), (false, 1), (true, 1)]);
        for _ in 0..50 {
            let up = pool.next(&IndexSet::new()).unwrap();
            assert_eq!(up.index, 1);
        }
    }

    #[test]
    fn backup_only_pool_still_serves() {
        let pool = test_pool(Policy::RoundRobin, &[(true, 1), (true, 1)]);
        assert!(pool.next(&IndexSet::new()).is_some());
    }

    #[test]
    fn retry_includes_backups() {
        let pool = test_pool(Policy::Random, &[(false, 1), (true, 1)]);
        let mut used = IndexSet::new();
        used.insert(0);
        let up = pool.next(&used).unwrap();
        assert_eq!(up.index, 1);
    }

    #[test]
    fn round_robin_is_fair_over_full_cycles() {
        let pool = test_pool(Policy::RoundRobin, &[(false, 1), (false, 1), (false, 1)]);
        let mut hits = [0usize; 3];
        for _ in 0..3 * 40 {
            let up = pool.next(&IndexSet::new()).unwrap();
            hits[up.index] += 1;
        }
        assert_eq!(hits, [40, 40, 40]);
    }

    #[test]
    fn weighted_draws_approach_configured_ratio() {
        let pool = test_pool(Policy::Weight, &[(false, 3), (false, 1)]);
        let mut hits = [0usize; 2];
        for _ in 0..10_000 {
            let up = pool.next(&IndexSet::new()).unwrap();
            hits[up.index] += 1;
        }
        let share = hits[0] as f64 / 10_000.0;
        assert!(
            (share - 0.75).abs() < 0.05,
            "expected ~75% for weight 3, got {share}"
        );
    }

    #[test]
    fn weighted_chooser_skips_backups_when_mains_exist() {
        let pool = test_pool(Policy::Weight, &[(true, 100), (false, 1)]);
        for _ in 0..50 {
            assert_eq!(pool.next(&IndexSet::new()).unwrap().index, 1);
        }
    }

    #[test]
    fn masking_hides_short_keys_entirely() {
        assert_eq!(mask(10, "short"), "*****");
        assert_eq!(
            mask(2, "0123456789abcdef"),
            format!("01{}ef", "*".repeat(12))
        );
    }

    #[test]
    fn index_set_basics() {
        let mut set = IndexSet::new();
        assert!(set.is_empty());
        set.insert(3);
        set.insert(70);
        set.insert(3);
        assert_eq!(set.len(), 2);
        assert!(set.contains(3));
        assert!(set.contains(70));
        assert!(!set.contains(0));
    }

    #[test]
    fn rewrite_pairs_win_over_replace_expression() {
        let rule = Rule {
            rewrite: vec![crate::config::ModelRewrite {
                src: "gpt-4".to_string(),
                dst: "gpt-4-turbo".to_string(),
            }],
            expr: Some(crate::config::Expr {
                r#match: String::new(),
                replace: r#"Model + "-preview""#.to_string(),
            }),
            ..Default::default()
        };
        let compiled = CompiledRule::new(rule).unwrap();
        assert_eq!(compiled.replace_model("gpt-4"), "gpt-4-turbo");
        assert_eq!(compiled.replace_model("gpt-5"), "gpt-5-preview");
    }
}
