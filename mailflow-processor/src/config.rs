use std::collections::BTreeMap;

use serde::Deserialize;

/// A named processor chain as written in configuration
///
/// ```ron
/// (
///     name: "transport",
///     stages: [
///         (match: "HostIsLocal", mailet: "LocalDelivery", params: { "root": "/var/mail" }),
///         (match: "All", mailet: "Bounce"),
///     ],
///     fallthrough: Error,
/// )
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub fallthrough: Fallthrough,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    /// Matcher expression, e.g. `HostIs=example.com AND NOT SenderIsNull`
    #[serde(rename = "match")]
    pub matcher: String,
    pub mailet: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// What happens to a mail that passes every stage of a chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub enum Fallthrough {
    /// Drop it silently
    #[default]
    Ghost,
    /// Send it to the `"error"` state
    Error,
    /// Hand it to another processor
    Processor(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_processor() {
        let config: ProcessorConfig = ron::from_str(
            r#"(
                name: "transport",
                stages: [
                    (match: "HostIsLocal", mailet: "LocalDelivery", params: { "root": "/var/mail" }),
                    (match: "All", mailet: "Bounce"),
                ],
                fallthrough: Processor("error"),
            )"#,
        )
        .unwrap();

        assert_eq!(config.name, "transport");
        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[0].matcher, "HostIsLocal");
        assert_eq!(config.stages[0].params.get("root").map(String::as_str), Some("/var/mail"));
        assert!(config.stages[1].params.is_empty());
        assert_eq!(config.fallthrough, Fallthrough::Processor("error".to_string()));
    }

    #[test]
    fn test_defaults() {
        let config: ProcessorConfig = ron::from_str(r#"(name: "empty")"#).unwrap();
        assert!(config.stages.is_empty());
        assert_eq!(config.fallthrough, Fallthrough::Ghost);
    }
}
