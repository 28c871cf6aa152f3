use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use serde_json::Value;

use crate::limits::{
    ATTRIBUTE_KEY_LENGTH_LIMIT, ATTRIBUTE_USER_LIMIT, ATTRIBUTE_VALUE_LENGTH_LIMIT,
};

bitflags! {
    /// Destinations an attribute can be routed to. Browser is off by default
    /// for user attributes and must be opted into via an include rule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Destinations: u8 {
        const TXN_EVENTS = 1 << 0;
        const TXN_TRACES = 1 << 1;
        const ERROR_TRACES = 1 << 2;
        const BROWSER = 1 << 3;
    }
}

impl Destinations {
    pub(crate) const NONE: Destinations = Destinations::empty();

    /// Default destinations for user attributes: everything except browser.
    pub(crate) fn user_default() -> Destinations {
        Destinations::all() - Destinations::BROWSER
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttributeError {
    #[error("attribute key longer than {limit} bytes: {key}")]
    KeyTooLong { key: String, limit: usize },
    #[error("attribute '{key}' dropped: limit of {limit} user attributes reached")]
    LimitExceeded { key: String, limit: usize },
    #[error("user attributes are disabled by high security mode")]
    HighSecurity,
}

/// One scalar attribute value. Construction through the `From` impls is the
/// validation: only the supported scalar types convert.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Str(String),
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Null,
}

impl AttributeValue {
    /// Truncate oversized string values to the byte limit, backing up to a
    /// char boundary. A no-op for anything already within the limit.
    pub(crate) fn truncated(self) -> AttributeValue {
        match self {
            AttributeValue::Str(s) => {
                AttributeValue::Str(truncate_string(s, ATTRIBUTE_VALUE_LENGTH_LIMIT))
            }
            other => other,
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        match self {
            AttributeValue::Str(s) => Value::from(s.clone()),
            AttributeValue::Bool(b) => Value::from(*b),
            AttributeValue::Int(i) => Value::from(*i),
            AttributeValue::UInt(u) => Value::from(*u),
            AttributeValue::Float(f) => Value::from(*f),
            AttributeValue::Null => Value::Null,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Str(v.to_string())
    }
}
impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Str(v)
    }
}
impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}
impl From<f32> for AttributeValue {
    fn from(v: f32) -> Self {
        AttributeValue::Float(v as f64)
    }
}
impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}
impl From<()> for AttributeValue {
    fn from(_: ()) -> Self {
        AttributeValue::Null
    }
}

macro_rules! attr_from_int {
    ($($t:ty => $variant:ident as $wide:ty),*) => {
        $(impl From<$t> for AttributeValue {
            fn from(v: $t) -> Self { AttributeValue::$variant(v as $wide) }
        })*
    };
}
attr_from_int!(i8 => Int as i64, i16 => Int as i64, i32 => Int as i64, i64 => Int as i64,
               u8 => UInt as u64, u16 => UInt as u64, u32 => UInt as u64, u64 => UInt as u64);

/// Cut `s` down to at most `limit` bytes without splitting a code point.
pub(crate) fn truncate_string(s: String, limit: usize) -> String {
    if s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut s = s;
    s.truncate(end);
    s
}

pub(crate) fn validate_attribute_key(key: &str) -> Result<(), AttributeError> {
    if key.len() > ATTRIBUTE_KEY_LENGTH_LIMIT {
        return Err(AttributeError::KeyTooLong {
            key: truncate_string(key.to_string(), 32),
            limit: ATTRIBUTE_KEY_LENGTH_LIMIT,
        });
    }
    Ok(())
}

/// Include/exclude lists for one destination, straight from the config
/// surface. A pattern ending in `*` matches by prefix, anything else exactly.
#[derive(Debug, Clone, Default)]
pub(crate) struct DestinationConfig {
    pub enabled: bool,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct AttributeConfigInput {
    pub attributes: DestinationConfig,
    pub txn_events: DestinationConfig,
    pub txn_traces: DestinationConfig,
    pub error_traces: DestinationConfig,
    pub browser: DestinationConfig,
}

impl Default for AttributeConfigInput {
    fn default() -> Self {
        let on = DestinationConfig {
            enabled: true,
            ..Default::default()
        };
        AttributeConfigInput {
            attributes: on.clone(),
            txn_events: on.clone(),
            txn_traces: on.clone(),
            error_traces: on.clone(),
            browser: DestinationConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct Modifier {
    match_str: String,
    include: Destinations,
    exclude: Destinations,
}

impl Modifier {
    fn apply(&self, d: Destinations) -> Destinations {
        (d | self.include) - self.exclude
    }
}

/// Compiled attribute routing rules, built once at application start and
/// shared by every transaction.
#[derive(Debug)]
pub(crate) struct AttributeConfig {
    disabled: Destinations,
    exact: HashMap<String, Modifier>,
    // Sorted ascending by match string so longer, more specific prefixes
    // apply later and override shorter ones.
    wildcard: Vec<Modifier>,
}

impl AttributeConfig {
    pub(crate) fn new(input: &AttributeConfigInput) -> Self {
        let mut builder = ConfigBuilder {
            disabled: Destinations::NONE,
            exact: HashMap::new(),
            wildcard: HashMap::new(),
        };
        builder.process(&input.attributes, Destinations::all());
        builder.process(&input.txn_events, Destinations::TXN_EVENTS);
        builder.process(&input.txn_traces, Destinations::TXN_TRACES);
        builder.process(&input.error_traces, Destinations::ERROR_TRACES);
        builder.process(&input.browser, Destinations::BROWSER);

        let mut wildcard: Vec<Modifier> = builder.wildcard.into_values().collect();
        wildcard.sort_by(|a, b| a.match_str.cmp(&b.match_str));

        AttributeConfig {
            disabled: builder.disabled,
            exact: builder.exact,
            wildcard,
        }
    }

    pub(crate) fn apply(&self, key: &str, defaults: Destinations) -> Destinations {
        let mut d = defaults;
        for m in &self.wildcard {
            if key.starts_with(&m.match_str) {
                d = m.apply(d);
            }
        }
        if let Some(m) = self.exact.get(key) {
            d = m.apply(d);
        }
        d - self.disabled
    }
}

struct ConfigBuilder {
    disabled: Destinations,
    exact: HashMap<String, Modifier>,
    wildcard: HashMap<String, Modifier>,
}

impl ConfigBuilder {
    fn process(&mut self, cfg: &DestinationConfig, dest: Destinations) {
        if !cfg.enabled {
            self.disabled |= dest;
        }
        for pattern in &cfg.include {
            self.modifier(pattern).include |= dest;
        }
        for pattern in &cfg.exclude {
            self.modifier(pattern).exclude |= dest;
        }
    }

    fn modifier(&mut self, pattern: &str) -> &mut Modifier {
        let (table, match_str) = match pattern.strip_suffix('*') {
            Some(prefix) => (&mut self.wildcard, prefix.to_string()),
            None => (&mut self.exact, pattern.to_string()),
        };
        table.entry(match_str.clone()).or_insert_with(|| Modifier {
            match_str,
            include: Destinations::NONE,
            exclude: Destinations::NONE,
        })
    }
}

#[derive(Debug, Clone)]
struct StoredAttribute {
    value: AttributeValue,
    dests: Destinations,
}

/// Per-entity attribute bag: user attributes added through the public API
/// plus agent attributes captured from the request and response.
#[derive(Debug)]
pub(crate) struct Attributes {
    config: Arc<AttributeConfig>,
    user: HashMap<String, StoredAttribute>,
    agent: HashMap<&'static str, StoredAttribute>,
}

impl Attributes {
    pub(crate) fn new(config: Arc<AttributeConfig>) -> Self {
        Attributes {
            config,
            user: HashMap::new(),
            agent: HashMap::new(),
        }
    }

    pub(crate) fn add_user(
        &mut self,
        key: String,
        value: AttributeValue,
    ) -> Result<(), AttributeError> {
        validate_attribute_key(&key)?;
        if self.user.len() >= ATTRIBUTE_USER_LIMIT && !self.user.contains_key(&key) {
            return Err(AttributeError::LimitExceeded {
                key,
                limit: ATTRIBUTE_USER_LIMIT,
            });
        }
        let dests = self.config.apply(&key, Destinations::user_default());
        self.user.insert(
            key,
            StoredAttribute {
                value: value.truncated(),
                dests,
            },
        );
        Ok(())
    }

    pub(crate) fn add_agent(
        &mut self,
        key: &'static str,
        value: AttributeValue,
        defaults: Destinations,
    ) {
        let dests = self.config.apply(key, defaults);
        self.agent.insert(
            key,
            StoredAttribute {
                value: value.truncated(),
                dests,
            },
        );
    }

    pub(crate) fn user_json(&self, dest: Destinations) -> serde_json::Map<String, Value> {
        filtered(&self.user, dest)
    }

    pub(crate) fn agent_json(&self, dest: Destinations) -> serde_json::Map<String, Value> {
        self.agent
            .iter()
            .filter(|(_, a)| a.dests.intersects(dest))
            .map(|(k, a)| (k.to_string(), a.value.to_json()))
            .collect()
    }
}

fn filtered(
    attrs: &HashMap<String, StoredAttribute>,
    dest: Destinations,
) -> serde_json::Map<String, Value> {
    attrs
        .iter()
        .filter(|(_, a)| a.dests.intersects(dest))
        .map(|(k, a)| (k.clone(), a.value.to_json()))
        .collect()
}

// Agent attribute keys and their default destinations.
pub(crate) const ATTR_REQUEST_METHOD: &str = "request.method";
pub(crate) const ATTR_REQUEST_ACCEPT: &str = "request.headers.accept";
pub(crate) const ATTR_REQUEST_CONTENT_LENGTH: &str = "request.headers.contentLength";
pub(crate) const ATTR_REQUEST_CONTENT_TYPE: &str = "request.headers.contentType";
pub(crate) const ATTR_REQUEST_HOST: &str = "request.headers.host";
pub(crate) const ATTR_REQUEST_USER_AGENT: &str = "request.headers.userAgent";
pub(crate) const ATTR_REQUEST_REFERER: &str = "request.headers.referer";
pub(crate) const ATTR_RESPONSE_CODE: &str = "httpResponseCode";
pub(crate) const ATTR_HOST_DISPLAY_NAME: &str = "host.displayName";

pub(crate) fn agent_attribute_defaults(key: &str) -> Destinations {
    match key {
        ATTR_REQUEST_METHOD | ATTR_RESPONSE_CODE => {
            Destinations::TXN_EVENTS | Destinations::TXN_TRACES | Destinations::ERROR_TRACES
        }
        ATTR_REQUEST_REFERER => Destinations::ERROR_TRACES,
        _ => Destinations::TXN_TRACES | Destinations::ERROR_TRACES,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(
        include: &[&str],
        exclude: &[&str],
    ) -> AttributeConfig {
        let mut input = AttributeConfigInput::default();
        input.attributes.include = include.iter().map(|s| s.to_string()).collect();
        input.attributes.exclude = exclude.iter().map(|s| s.to_string()).collect();
        AttributeConfig::new(&input)
    }

    #[test]
    fn wildcard_precedence_longest_prefix_wins() {
        let c = config_with(
            &["request.*"],
            &["request.headers.*", "request.headers.cookie"],
        );
        let d = Destinations::user_default();
        assert_eq!(c.apply("request.headers.cookie", d), Destinations::NONE);
        assert_eq!(c.apply("request.headers.referer", d), Destinations::NONE);
        assert_eq!(c.apply("request.method", d), Destinations::all());
        assert_eq!(c.apply("response.status", d), d);
    }

    #[test]
    fn exclude_wins_over_include_on_same_pattern() {
        let c = config_with(&["secret"], &["secret"]);
        assert_eq!(
            c.apply("secret", Destinations::user_default()),
            Destinations::NONE
        );
    }

    #[test]
    fn disabled_destination_masks_everything() {
        let mut input = AttributeConfigInput::default();
        input.txn_events.enabled = false;
        input.attributes.include = vec!["always".to_string()];
        let c = AttributeConfig::new(&input);
        let result = c.apply("always", Destinations::user_default());
        assert!(!result.intersects(Destinations::TXN_EVENTS));
        assert!(result.intersects(Destinations::TXN_TRACES));
    }

    #[test]
    fn filter_never_emits_disabled_destinations() {
        let mut input = AttributeConfigInput::default();
        input.error_traces.enabled = false;
        input.browser.enabled = false;
        let c = AttributeConfig::new(&input);
        for key in ["a", "request.method", "request.headers.cookie", ""] {
            let r = c.apply(key, Destinations::all());
            assert!(!r.intersects(Destinations::ERROR_TRACES | Destinations::BROWSER));
        }
    }

    #[test]
    fn truncation_is_idempotent_and_char_safe() {
        let short = "hello".to_string();
        assert_eq!(truncate_string(short.clone(), 255), short);

        let long = "é".repeat(200); // 400 bytes
        let once = truncate_string(long, 255);
        assert!(once.len() <= 255);
        assert_eq!(truncate_string(once.clone(), 255), once);
    }

    #[test]
    fn user_attribute_limit_allows_replacement() {
        let config = Arc::new(AttributeConfig::new(&AttributeConfigInput::default()));
        let mut attrs = Attributes::new(config);
        for i in 0..ATTRIBUTE_USER_LIMIT {
            attrs.add_user(format!("k{i}"), AttributeValue::from(i as u64)).unwrap();
        }
        assert!(attrs.add_user("overflow".to_string(), AttributeValue::from(1)).is_err());
        // Replacing an existing key is still allowed at the cap.
        attrs.add_user("k0".to_string(), AttributeValue::from("new")).unwrap();
    }

    #[test]
    fn oversized_key_is_rejected() {
        let config = Arc::new(AttributeConfig::new(&AttributeConfigInput::default()));
        let mut attrs = Attributes::new(config);
        let key = "k".repeat(256);
        assert!(matches!(
            attrs.add_user(key, AttributeValue::Null),
            Err(AttributeError::KeyTooLong { .. })
        ));
    }

    #[test]
    fn browser_requires_explicit_include() {
        let mut input = AttributeConfigInput::default();
        input.browser.enabled = true;
        input.browser.include = vec!["shown".to_string()];
        let c = AttributeConfig::new(&input);
        let d = Destinations::user_default();
        assert!(c.apply("shown", d).intersects(Destinations::BROWSER));
        assert!(!c.apply("hidden", d).intersects(Destinations::BROWSER));
    }
}
