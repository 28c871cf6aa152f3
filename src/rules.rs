use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;

/// One rename rule from the connect reply. `match_expression` is applied
/// case-insensitively; `\1`-style backreferences in the replacement are
/// rewritten to the `$1` form the regex crate expects.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawMetricRule {
    pub match_expression: String,
    #[serde(default)]
    pub replacement: String,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub each_segment: bool,
    #[serde(default)]
    pub replace_all: bool,
    #[serde(default)]
    pub terminate_chain: bool,
    #[serde(default)]
    pub eval_order: i64,
}

#[derive(Debug, Clone)]
struct MetricRule {
    re: Regex,
    replacement: String,
    ignore: bool,
    each_segment: bool,
    replace_all: bool,
    terminate_chain: bool,
    eval_order: i64,
}

enum RuleOutcome {
    Unmatched,
    Matched(String),
    Ignored,
}

impl MetricRule {
    fn compile(raw: RawMetricRule) -> Option<MetricRule> {
        let re = match Regex::new(&format!("(?i){}", raw.match_expression)) {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!("skipping rename rule '{}': {e}", raw.match_expression);
                return None;
            }
        };
        Some(MetricRule {
            re,
            replacement: transform_replacement(&raw.replacement),
            ignore: raw.ignore,
            each_segment: raw.each_segment,
            replace_all: raw.replace_all,
            terminate_chain: raw.terminate_chain,
            eval_order: raw.eval_order,
        })
    }

    fn apply(&self, name: &str) -> RuleOutcome {
        if self.each_segment {
            return self.apply_each_segment(name);
        }
        if !self.re.is_match(name) {
            return RuleOutcome::Unmatched;
        }
        if self.ignore {
            return RuleOutcome::Ignored;
        }
        let replaced = if self.replace_all {
            self.re.replace_all(name, self.replacement.as_str())
        } else {
            self.re.replace(name, self.replacement.as_str())
        };
        RuleOutcome::Matched(replaced.into_owned())
    }

    fn apply_each_segment(&self, name: &str) -> RuleOutcome {
        let mut matched = false;
        let segments: Vec<String> = name
            .split('/')
            .map(|seg| {
                if self.re.is_match(seg) {
                    matched = true;
                    self.re.replace(seg, self.replacement.as_str()).into_owned()
                } else {
                    seg.to_string()
                }
            })
            .collect();
        if !matched {
            return RuleOutcome::Unmatched;
        }
        if self.ignore {
            return RuleOutcome::Ignored;
        }
        RuleOutcome::Matched(segments.join("/"))
    }
}

// Collector replacements use `\1` backreferences; the regex crate wants `$1`.
fn transform_replacement(replacement: &str) -> String {
    let mut out = String::with_capacity(replacement.len());
    let mut chars = replacement.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek().is_some_and(|n| n.is_ascii_digit()) {
            out.push('$');
        } else {
            out.push(c);
        }
    }
    out
}

/// An ordered rule chain (url_rules, metric_name_rules or
/// transaction_name_rules). Applied in `eval_order`; an ignore match drops
/// the name entirely, `terminate_chain` stops after a match.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "Vec<RawMetricRule>")]
pub(crate) struct MetricRules(Vec<MetricRule>);

impl From<Vec<RawMetricRule>> for MetricRules {
    fn from(raw: Vec<RawMetricRule>) -> Self {
        let mut rules: Vec<MetricRule> = raw.into_iter().filter_map(MetricRule::compile).collect();
        rules.sort_by_key(|r| r.eval_order);
        MetricRules(rules)
    }
}

impl MetricRules {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the rewritten name, or None when an ignore rule matched.
    pub(crate) fn apply(&self, name: &str) -> Option<String> {
        let mut current = name.to_string();
        for rule in &self.0 {
            match rule.apply(&current) {
                RuleOutcome::Unmatched => {}
                RuleOutcome::Ignored => return None,
                RuleOutcome::Matched(renamed) => {
                    current = renamed;
                    if rule.terminate_chain {
                        break;
                    }
                }
            }
        }
        Some(current)
    }
}

const PLACEHOLDER: &str = "*";

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawSegmentRule {
    pub prefix: String,
    #[serde(default)]
    pub terms: Vec<String>,
}

#[derive(Debug, Clone)]
struct SegmentRule {
    prefix: String,
    terms: Vec<String>,
}

impl SegmentRule {
    fn apply(&self, name: &str) -> String {
        let Some(rest) = name.strip_prefix(&self.prefix) else {
            return name.to_string();
        };
        let Some(rest) = rest.strip_prefix('/') else {
            return name.to_string();
        };
        let mapped = rest.split('/').map(|seg| {
            if self.terms.iter().any(|t| t == seg) {
                seg
            } else {
                PLACEHOLDER
            }
        });
        // Collapse runs of placeholders.
        let mut collapsed: Vec<&str> = Vec::new();
        for seg in mapped {
            if seg == PLACEHOLDER && collapsed.last() == Some(&PLACEHOLDER) {
                continue;
            }
            collapsed.push(seg);
        }
        format!("{}/{}", self.prefix, collapsed.join("/"))
    }
}

/// Allow-list rules applied to frozen transaction names. Keyed by the first
/// two name segments; every deeper segment not on the rule's term list
/// becomes `*`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "Vec<RawSegmentRule>")]
pub(crate) struct SegmentRules(HashMap<String, SegmentRule>);

impl From<Vec<RawSegmentRule>> for SegmentRules {
    fn from(raw: Vec<RawSegmentRule>) -> Self {
        let mut rules = HashMap::new();
        for r in raw {
            let prefix = r.prefix.trim_end_matches('/').to_string();
            if prefix.split('/').count() != 2 || prefix.ends_with('/') || prefix.starts_with('/') {
                tracing::warn!("skipping segment term rule with bad prefix '{}'", r.prefix);
                continue;
            }
            rules.insert(
                prefix.clone(),
                SegmentRule {
                    prefix,
                    terms: r.terms,
                },
            );
        }
        SegmentRules(rules)
    }
}

impl SegmentRules {
    pub(crate) fn apply(&self, name: &str) -> String {
        if self.0.is_empty() {
            return name.to_string();
        }
        let mut it = name.split('/');
        let key = match (it.next(), it.next()) {
            (Some(a), Some(b)) => format!("{a}/{b}"),
            _ => return name.to_string(),
        };
        match self.0.get(&key) {
            Some(rule) => rule.apply(name),
            None => name.to_string(),
        }
    }
}
