//! Property maps attached to services, bundles, and components.
//!
//! Values are [`serde_json::Value`] so heterogeneous configuration can be
//! carried without a dedicated type per property.

use std::collections::HashMap;

use serde_json::Value;

/// Property key under which a registered service exposes its numeric id.
pub const SERVICE_ID: &str = "service.id";

/// A string-keyed property map.
pub type Properties = HashMap<String, Value>;

/// Copies every entry of `overrides` into `base`, replacing existing keys.
pub fn merge(base: &mut Properties, overrides: &Properties) {
    for (key, value) in overrides {
        base.insert(key.clone(), value.clone());
    }
}

/// Returns the boolean value of `key`, treating a missing or non-boolean
/// entry as `false`.
pub fn flag(properties: &Properties, key: &str) -> bool {
    properties.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_overrides_existing_keys() {
        let mut base = Properties::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!("keep")),
        ]);
        let overrides = Properties::from([("a".to_string(), json!(2))]);

        merge(&mut base, &overrides);

        assert_eq!(base.get("a"), Some(&json!(2)));
        assert_eq!(base.get("b"), Some(&json!("keep")));
    }

    #[test]
    fn flag_defaults_to_false() {
        let props = Properties::from([("on".to_string(), json!(true))]);
        assert!(flag(&props, "on"));
        assert!(!flag(&props, "off"));
        let odd = Properties::from([("on".to_string(), json!("yes"))]);
        assert!(!flag(&odd, "on"));
    }
}
