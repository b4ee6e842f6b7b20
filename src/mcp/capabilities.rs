use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Operation categories that may be negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Tools,
    Resources,
    Prompts,
    Sampling,
    Roots,
    Elicitation,
    Instructions,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::Resources => "resources",
            Capability::Prompts => "prompts",
            Capability::Sampling => "sampling",
            Capability::Roots => "roots",
            Capability::Elicitation => "elicitation",
            Capability::Instructions => "instructions",
        }
    }

    /// Capability a client-issued method depends on, if any.
    pub fn for_method(method: &str) -> Option<Capability> {
        let prefix = method.split('/').next().unwrap_or(method);
        match prefix {
            "tools" => Some(Capability::Tools),
            "resources" => Some(Capability::Resources),
            "prompts" => Some(Capability::Prompts),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities declared by the server plus the callback capabilities this
/// client declared. Read-only once the handshake completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilitySet {
    negotiated: BTreeSet<Capability>,
    pub resource_subscribe: bool,
    pub logging: bool,
    pub completions: bool,
}

impl CapabilitySet {
    /// Builds the set from the raw `capabilities` object of an initialize
    /// result. A key counts as declared when present and not `null`.
    pub fn from_handshake(
        server_capabilities: &Value,
        instructions: Option<&str>,
        client_declared: &[Capability],
    ) -> Self {
        let declared = |key: &str| {
            server_capabilities
                .get(key)
                .is_some_and(|value| !value.is_null())
        };

        let mut negotiated = BTreeSet::new();
        for (key, capability) in [
            ("tools", Capability::Tools),
            ("resources", Capability::Resources),
            ("prompts", Capability::Prompts),
        ] {
            if declared(key) {
                negotiated.insert(capability);
            }
        }
        if instructions.is_some_and(|text| !text.trim().is_empty()) {
            negotiated.insert(Capability::Instructions);
        }
        negotiated.extend(client_declared.iter().copied());

        let resource_subscribe = server_capabilities
            .pointer("/resources/subscribe")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Self {
            negotiated,
            resource_subscribe,
            logging: declared("logging"),
            completions: declared("completions"),
        }
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.negotiated.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.negotiated.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.negotiated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn server_keys_and_instructions_are_negotiated() {
        let caps = json!({"tools": {"listChanged": true}, "resources": null});
        let set = CapabilitySet::from_handshake(&caps, Some("Use add for sums."), &[]);

        assert!(set.supports(Capability::Tools));
        assert!(set.supports(Capability::Instructions));
        assert!(!set.supports(Capability::Resources));
        assert!(!set.supports(Capability::Prompts));
        assert!(!set.resource_subscribe);
    }

    #[test]
    fn blank_instructions_do_not_count() {
        let set = CapabilitySet::from_handshake(&json!({}), Some("   "), &[]);
        assert!(set.is_empty());
    }

    #[test]
    fn client_declared_callbacks_are_included() {
        let caps = json!({"resources": {"subscribe": true}, "logging": {}});
        let set = CapabilitySet::from_handshake(&caps, None, &[Capability::Sampling]);

        assert!(set.supports(Capability::Sampling));
        assert!(set.supports(Capability::Resources));
        assert!(set.resource_subscribe);
        assert!(set.logging);
        assert!(!set.completions);
    }

    #[test]
    fn method_prefix_selects_capability() {
        assert_eq!(
            Capability::for_method("resources/templates/list"),
            Some(Capability::Resources)
        );
        assert_eq!(Capability::for_method("tools/call"), Some(Capability::Tools));
        assert_eq!(Capability::for_method("ping"), None);
    }
}
