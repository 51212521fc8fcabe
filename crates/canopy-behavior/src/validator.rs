use std::collections::HashMap;

use regex::Regex;

use canopy_state::MemoryNode;
use canopy_tx::{canonical_keypath_string, Tx};
use canopy_types::Value;

use crate::error::{BehaviorError, BehaviorResult};

/// Decides whether a tx may be applied under a subtree. Runs before any
/// patches are applied.
pub trait Validator: Send + Sync {
    fn validate_tx(&self, state: &MemoryNode, tx: &Tx) -> BehaviorResult<()>;
}

/// Per-address write rules over keypath patterns.
///
/// Config shape (mounted at a subtree's `Validator` child):
///
/// ```json
/// {
///     "Content-Type": "validator/permissions",
///     "permissions": {
///         "96216849c49358b10257cb55b28ea603c874b05e": {
///             "^.*$": { "write": true }
///         },
///         "*": {
///             "^\\.index.*$": { "write": false },
///             "^\\.messages.*": { "write": true }
///         }
///     }
/// }
/// ```
///
/// The sender's own entry is consulted when present; otherwise the `"*"`
/// entry. Patterns match the canonical dotted keypath of each patch,
/// relative to the subtree the validator is mounted on. A matching deny rule
/// beats a matching allow rule; a patch matching no rule is denied.
pub struct PermissionsValidator {
    permissions: HashMap<String, Vec<WriteRule>>,
}

struct WriteRule {
    pattern: Regex,
    write: bool,
}

impl PermissionsValidator {
    pub fn from_config(config: &Value) -> BehaviorResult<Self> {
        let perms = config
            .get("permissions")
            .and_then(Value::as_map)
            .ok_or_else(|| BehaviorError::BadConfig("missing 'permissions' map".into()))?;

        let mut permissions = HashMap::new();
        for (subject, rules_val) in perms {
            let rules_map = rules_val
                .as_map()
                .ok_or_else(|| BehaviorError::BadConfig(format!("rules for '{subject}' not a map")))?;

            let mut rules = Vec::with_capacity(rules_map.len());
            for (pattern, rule) in rules_map {
                let regex = Regex::new(pattern)
                    .map_err(|e| BehaviorError::BadConfig(format!("bad pattern '{pattern}': {e}")))?;
                let write = rule.get("write").and_then(Value::as_bool).unwrap_or(false);
                rules.push(WriteRule { pattern: regex, write });
            }
            permissions.insert(subject.to_lowercase(), rules);
        }

        Ok(Self { permissions })
    }

    fn rules_for(&self, sender_hex: &str) -> Option<&[WriteRule]> {
        self.permissions
            .get(sender_hex)
            .or_else(|| self.permissions.get("*"))
            .map(Vec::as_slice)
    }
}

impl Validator for PermissionsValidator {
    fn validate_tx(&self, _state: &MemoryNode, tx: &Tx) -> BehaviorResult<()> {
        let sender_hex = tx.from.to_hex();
        let Some(rules) = self.rules_for(&sender_hex) else {
            return Err(BehaviorError::ValidationFailed(format!(
                "no write rules for sender {sender_hex}"
            )));
        };

        for patch in &tx.patches {
            let keypath_text = canonical_keypath_string(&patch.keypath);
            let mut allowed = false;
            for rule in rules {
                if rule.pattern.is_match(&keypath_text) {
                    if !rule.write {
                        return Err(BehaviorError::ValidationFailed(format!(
                            "sender {sender_hex} may not write {keypath_text}"
                        )));
                    }
                    allowed = true;
                }
            }
            if !allowed {
                return Err(BehaviorError::ValidationFailed(format!(
                    "no rule permits sender {sender_hex} to write {keypath_text}"
                )));
            }
        }
        Ok(())
    }
}
