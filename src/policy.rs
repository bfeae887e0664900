//! Path policies.
//!
//! Vault path families differ in how payloads are shaped and which
//! operations make sense. KV v2 (`secret/data/...`) expects the secret under
//! an extra `data` key; system and auth endpoints take the payload as is.
//! The rules are fixed at build time and matched by longest prefix.

use crate::error::{MigrationError, Result};
use crate::migration::{Method, Task};
use crate::value::{Payload, Value};

/// Rule for one family of paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPolicy {
    /// Prefix this rule applies to (empty string matches everything)
    pub prefix: &'static str,
    /// Key the payload is nested under before writing, if any
    pub wrapper: Option<&'static str>,
    /// Methods allowed on the family
    pub methods: &'static [Method],
}

const ALL_METHODS: &[Method] = &[Method::Read, Method::Write, Method::Delete];

const DEFAULT_RULES: &[PathPolicy] = &[
    PathPolicy {
        prefix: "secret/data/",
        wrapper: Some("data"),
        methods: ALL_METHODS,
    },
    PathPolicy {
        prefix: "auth/token/roles/",
        wrapper: None,
        methods: ALL_METHODS,
    },
    PathPolicy {
        prefix: "sys/auth/",
        wrapper: None,
        methods: ALL_METHODS,
    },
    PathPolicy {
        prefix: "sys/mounts/",
        wrapper: None,
        methods: ALL_METHODS,
    },
    PathPolicy {
        prefix: "sys/policies/",
        wrapper: None,
        methods: ALL_METHODS,
    },
    PathPolicy {
        prefix: "sys/policy/",
        wrapper: None,
        methods: ALL_METHODS,
    },
];

const FALLBACK: PathPolicy = PathPolicy {
    prefix: "",
    wrapper: None,
    methods: ALL_METHODS,
};

impl PathPolicy {
    pub fn allows(&self, method: Method) -> bool {
        self.methods.contains(&method)
    }

    /// Nest `payload` under the wrapper key when this family requires one.
    pub fn wrap(&self, payload: Payload) -> Payload {
        match self.wrapper {
            Some(key) => {
                let mut outer = Payload::with_capacity(1);
                outer.insert(key.to_string(), Value::Mapping(payload));
                outer
            }
            None => payload,
        }
    }

    /// Strip the wrapper key from a stored value, if present.
    ///
    /// Values that are not wrapped (or families without a wrapper) are
    /// returned unchanged.
    pub fn unwrap_value<'a>(&self, value: &'a Value) -> &'a Value {
        let Some(key) = self.wrapper else {
            return value;
        };
        match value.as_mapping().and_then(|m| m.get(key)) {
            Some(inner @ Value::Mapping(_)) => inner,
            _ => value,
        }
    }
}

/// Ordered rule table with a catch-all fallback.
#[derive(Debug, Clone)]
pub struct PolicyTable {
    rules: Vec<PathPolicy>,
    fallback: PathPolicy,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.to_vec(),
            fallback: FALLBACK,
        }
    }
}

impl PolicyTable {
    /// Build a table from explicit rules; unmatched paths allow every method
    /// and are not wrapped.
    pub fn new(rules: Vec<PathPolicy>) -> Self {
        Self {
            rules,
            fallback: FALLBACK,
        }
    }

    /// Longest matching prefix wins.
    pub fn lookup(&self, path: &str) -> &PathPolicy {
        self.rules
            .iter()
            .filter(|rule| path.starts_with(rule.prefix))
            .max_by_key(|rule| rule.prefix.len())
            .unwrap_or(&self.fallback)
    }

    /// Reject tasks whose method is not allowed for their path family.
    pub fn check(&self, task: &Task) -> Result<()> {
        let policy = self.lookup(&task.path);
        if policy.allows(task.method) {
            Ok(())
        } else {
            Err(MigrationError::validation(format!(
                "method '{}' is not supported for path '{}'",
                task.method, task.path
            )))
        }
    }
}
