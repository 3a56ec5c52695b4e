use std::fmt;

/// Stable identifier for a provider endpoint (for example `ambient`).
#[derive(Clone, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ProviderId(pub String);

impl ProviderId {
    /// Creates a provider id from any string-like value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the provider id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ProviderId {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&ProviderId> for ProviderId {
    fn from(value: &ProviderId) -> Self {
        value.clone()
    }
}

/// Turns a model id into something safe to embed in a file name.
///
/// `zai-org/glm-4.6` becomes `zai-org_glm-4.6`.
pub fn sanitize_model_id(model: &str) -> String {
    model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_path_and_colon_separators() {
        assert_eq!(sanitize_model_id("zai-org/glm-4.6"), "zai-org_glm-4.6");
        assert_eq!(sanitize_model_id("llama3:8b"), "llama3_8b");
    }

    #[test]
    fn provider_id_displays_inner_value() {
        assert_eq!(ProviderId::new("ambient").to_string(), "ambient");
    }
}
