//! Router rules: priority-ordered matches that direct an `open` to an
//! external bridge or reject it outright.

use serde_json::{json, Map, Value};
use tracing::debug;

use crate::json as opt;

/// One dispatch rule. Either `matches` is present (an ordinary rule)
/// or the rule is privileged (superuser escalation).
#[derive(Debug, Clone)]
pub struct Rule {
    pub matches: Option<Map<String, Value>>,
    pub privileged: bool,
    pub spawn: Option<Vec<String>>,
    pub environ: Vec<String>,
    pub problem: Option<String>,
}

impl Rule {
    /// Build a rule from a validated manifest `bridges` entry. Entries
    /// with nothing to do are dropped.
    pub fn from_value(value: &Value) -> Option<Rule> {
        let matches = opt::get_object(value, "match").ok()?.cloned();
        let privileged = opt::get_bool(value, "privileged").ok()?.unwrap_or(false);
        let spawn = opt::get_strv(value, "spawn").ok()?;
        let environ = opt::get_strv(value, "environ").ok()?.unwrap_or_default();
        let problem = opt::get_str(value, "problem").ok()?.map(str::to_owned);

        if matches.is_none() != privileged {
            return None;
        }
        if spawn.is_none() && problem.is_none() {
            debug!("ignoring rule with neither \"spawn\" nor \"problem\"");
            return None;
        }

        Some(Rule {
            matches,
            privileged,
            spawn,
            environ,
            problem,
        })
    }

    /// Whether this rule claims the given `open` options.
    ///
    /// Every key in `match` must either hold the literal value from
    /// the open, or (with `null`) merely require the key to be
    /// present. A privileged rule instead claims opens that request
    /// superuser execution.
    pub fn matches(&self, options: &Value) -> bool {
        match self.matches {
            Some(ref matches) => matches.iter().all(|(key, expected)| match expected {
                Value::Null => options.get(key).is_some(),
                expected => options.get(key) == Some(expected),
            }),
            None => match options.get("superuser") {
                None | Some(Value::Null) | Some(Value::Bool(false)) => false,
                Some(_) => true,
            },
        }
    }

    /// The JSON shape printed by `--rules`.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        if let Some(ref matches) = self.matches {
            object.insert("match".into(), Value::Object(matches.clone()));
        }
        if self.privileged {
            object.insert("privileged".into(), Value::Bool(true));
        }
        if let Some(ref spawn) = self.spawn {
            object.insert("spawn".into(), json!(spawn));
        }
        if !self.environ.is_empty() {
            object.insert("environ".into(), json!(self.environ));
        }
        if let Some(ref problem) = self.problem {
            object.insert("problem".into(), Value::String(problem.clone()));
        }
        Value::Object(object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_presence_matching() {
        let rule = Rule::from_value(&json!({
            "match": {"payload": "pcp-metrics", "source": null},
            "spawn": ["pcp-bridge"],
        }))
        .unwrap();

        assert!(rule.matches(&json!({"payload": "pcp-metrics", "source": "direct"})));
        assert!(!rule.matches(&json!({"payload": "pcp-metrics"})));
        assert!(!rule.matches(&json!({"payload": "other", "source": "direct"})));
    }

    #[test]
    fn empty_match_claims_everything() {
        let rule = Rule::from_value(&json!({"match": {}, "problem": "not-supported"})).unwrap();
        assert!(rule.matches(&json!({"payload": "anything"})));
        assert_eq!(rule.problem.as_deref(), Some("not-supported"));
    }

    #[test]
    fn privileged_matches_superuser_opens() {
        let rule =
            Rule::from_value(&json!({"privileged": true, "spawn": ["sudo", "agent"]})).unwrap();

        assert!(rule.matches(&json!({"payload": "stream", "superuser": true})));
        assert!(rule.matches(&json!({"payload": "stream", "superuser": "require"})));
        assert!(!rule.matches(&json!({"payload": "stream"})));
        assert!(!rule.matches(&json!({"payload": "stream", "superuser": false})));
    }

    #[test]
    fn malformed_rules_dropped() {
        // match and privileged together, or neither.
        assert!(Rule::from_value(&json!({"spawn": ["x"]})).is_none());
        assert!(Rule::from_value(
            &json!({"match": {}, "privileged": true, "spawn": ["x"]})
        )
        .is_none());
        // nothing to do
        assert!(Rule::from_value(&json!({"match": {}})).is_none());
    }

    #[test]
    fn dump_shape() {
        let rule = Rule::from_value(&json!({
            "match": {"payload": "x"},
            "spawn": ["bridge", "--arg"],
            "environ": ["K=V"],
        }))
        .unwrap();
        assert_eq!(
            rule.to_value(),
            json!({
                "match": {"payload": "x"},
                "spawn": ["bridge", "--arg"],
                "environ": ["K=V"],
            })
        );
    }
}
