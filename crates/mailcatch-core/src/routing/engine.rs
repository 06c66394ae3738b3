//! Rule compilation and matching

use anyhow::{Context, Result};
use mailcatch_common::config::RouteConfig;
use mailcatch_common::types::Email;
use regex::Regex;
use tracing::{debug, info, warn};

use super::action::Action;

/// A compiled condition pattern
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Absent or empty: matches everything
    Any,
    Regex(Regex),
    /// Failed to compile: matches nothing
    Invalid,
}

impl Pattern {
    fn compile(rule: &str, field: &str, source: Option<&str>) -> Self {
        match source.map(str::trim).filter(|s| !s.is_empty()) {
            None => Pattern::Any,
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => Pattern::Regex(re),
                Err(e) => {
                    warn!(
                        rule = %rule,
                        field = %field,
                        pattern = %pattern,
                        error = %e,
                        "Invalid route pattern, rule will never match"
                    );
                    Pattern::Invalid
                }
            },
        }
    }

    /// Unanchored search
    pub fn is_match(&self, haystack: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Regex(re) => re.is_match(haystack),
            Pattern::Invalid => false,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self, Pattern::Invalid)
    }
}

/// A rule ready for matching
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: String,
    recipient: Pattern,
    sender: Pattern,
    subject: Pattern,
    /// Enabled actions in declared order
    pub actions: Vec<Action>,
}

impl CompiledRule {
    pub fn compile(config: &RouteConfig) -> Result<Self> {
        let condition = &config.condition;
        let actions = config
            .actions
            .iter()
            .filter(|a| a.enabled)
            .map(Action::from_config)
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("route {}", config.name))?;

        Ok(Self {
            name: config.name.clone(),
            recipient: Pattern::compile(
                &config.name,
                "recipient_pattern",
                condition.recipient_pattern.as_deref(),
            ),
            sender: Pattern::compile(
                &config.name,
                "sender_pattern",
                condition.sender_pattern.as_deref(),
            ),
            subject: Pattern::compile(
                &config.name,
                "subject_pattern",
                condition.subject_pattern.as_deref(),
            ),
            actions,
        })
    }

    /// All specified conditions must hold; recipients match if any does
    pub fn matches(&self, email: &Email) -> bool {
        let recipient = match &self.recipient {
            Pattern::Any => true,
            pattern => email.to.iter().any(|to| pattern.is_match(to)),
        };

        recipient && self.sender.is_match(&email.from) && self.subject.is_match(&email.subject)
    }

    /// Whether any pattern failed to compile
    pub fn is_disabled_by_error(&self) -> bool {
        self.recipient.is_invalid() || self.sender.is_invalid() || self.subject.is_invalid()
    }
}

/// Ordered, read-only set of enabled rules
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<CompiledRule>,
}

impl RouteTable {
    /// Compile enabled routes. Bad patterns only disable their own rule;
    /// a malformed action definition is a startup error.
    pub fn compile(routes: &[RouteConfig]) -> Result<Self> {
        let rules = routes
            .iter()
            .filter(|r| r.enabled)
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;

        let broken = rules.iter().filter(|r| r.is_disabled_by_error()).count();
        info!(
            rules = rules.len(),
            disabled_by_error = broken,
            "Compiled route table"
        );

        Ok(Self { rules })
    }

    /// Every matching rule, in configuration order
    pub fn matching<'a>(&'a self, email: &Email) -> Vec<&'a CompiledRule> {
        let matched: Vec<&CompiledRule> = self.rules.iter().filter(|r| r.matches(email)).collect();
        debug!(
            matched = ?matched.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(),
            "Evaluated routes"
        );
        matched
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailcatch_common::config::{ActionConfig, ActionKind, RouteCondition};
    use mailcatch_common::types::Headers;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn route(name: &str, recipient: Option<&str>, sender: Option<&str>, subject: Option<&str>) -> RouteConfig {
        RouteConfig {
            name: name.to_string(),
            condition: RouteCondition {
                recipient_pattern: recipient.map(str::to_string),
                sender_pattern: sender.map(str::to_string),
                subject_pattern: subject.map(str::to_string),
            },
            actions: vec![ActionConfig {
                kind: ActionKind::StoreLocal,
                config: HashMap::new(),
                enabled: true,
            }],
            enabled: true,
        }
    }

    fn email(to: &[&str], from: &str, subject: &str) -> Email {
        let now = Utc::now();
        Email {
            from: from.to_string(),
            to: to.iter().map(|s| s.to_string()).collect(),
            subject: subject.to_string(),
            date: now.into(),
            message_id: None,
            headers: Headers::new(),
            body: String::new(),
            html_body: String::new(),
            attachments: Vec::new(),
            raw: Vec::new(),
            received_at: now,
        }
    }

    fn names(table: &RouteTable, email: &Email) -> Vec<String> {
        table.matching(email).iter().map(|r| r.name.clone()).collect()
    }

    #[test]
    fn test_recipient_pattern() {
        let table = RouteTable::compile(&[route("capture", Some("capture@.*"), None, None)]).unwrap();

        assert_eq!(
            names(&table, &email(&["capture@test.com"], "a@x.com", "hi")),
            vec!["capture"]
        );
        assert!(names(&table, &email(&["other@test.com"], "a@x.com", "hi")).is_empty());
        assert_eq!(
            names(&table, &email(&["other@test.com", "capture@test.com"], "a@x.com", "hi")),
            vec!["capture"]
        );
    }

    #[test]
    fn test_all_matching_rules_fire_in_order() {
        let table = RouteTable::compile(&[
            route("first", Some("@test\\.com"), None, None),
            route("unrelated", None, Some("^nobody@"), None),
            route("second", None, None, Some("Invoice")),
        ])
        .unwrap();

        let matched = names(&table, &email(&["a@test.com"], "billing@x.com", "Your Invoice"));
        assert_eq!(matched, vec!["first", "second"]);
    }

    #[test]
    fn test_conditions_are_anded() {
        let table = RouteTable::compile(&[route("both", Some("^ops@"), Some("alerts"), None)]).unwrap();

        assert_eq!(names(&table, &email(&["ops@x.com"], "alerts@mon.io", "")).len(), 1);
        assert!(names(&table, &email(&["ops@x.com"], "people@mon.io", "")).is_empty());
    }

    #[test]
    fn test_empty_conditions_are_wildcards() {
        let table = RouteTable::compile(&[route("all", Some(""), None, Some("  "))]).unwrap();
        assert_eq!(names(&table, &email(&[], "", "")), vec!["all"]);
    }

    #[test]
    fn test_invalid_regex_only_disables_its_rule() {
        let table = RouteTable::compile(&[
            route("broken", Some("capture@(["), None, None),
            route("working", Some("capture@"), None, None),
        ])
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(
            names(&table, &email(&["capture@test.com"], "a@x.com", "")),
            vec!["working"]
        );
    }

    #[test]
    fn test_disabled_routes_and_actions_are_skipped() {
        let mut disabled = route("off", None, None, None);
        disabled.enabled = false;

        let mut partial = route("partial", None, None, None);
        partial.actions.push(ActionConfig {
            kind: ActionKind::Webhook,
            config: HashMap::new(),
            enabled: false,
        });

        let table = RouteTable::compile(&[disabled, partial]).unwrap();
        let matched = table.matching(&email(&["a@b.c"], "x@y.z", ""));
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].actions.len(), 1);
    }
}
