/// Synthetic per-iteration variables exposed inside loop sections.
pub const METADATA_KEYS: &[&str] = &[
    "count",
    "index",
    "indexParity",
    "hasNext",
    "isLast",
    "isFirst",
    "odd",
    "even",
];

/// How iteration metadata keys are derived from the loop alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefixStrategy {
    /// Bare keys: `count`, `index`, ...
    None,
    /// `alias_count`, `alias_index`, ... (the default).
    AliasUnderscore,
    /// `alias?count`, `alias?index`, ...
    AliasQuestion,
    /// A verbatim prefix, e.g. `m_count`.
    Literal(String),
}

impl Default for PrefixStrategy {
    fn default() -> Self {
        PrefixStrategy::AliasUnderscore
    }
}

impl PrefixStrategy {
    /// Parses the `iterationMetadataPrefix` setting value.
    pub fn from_setting(value: &str) -> Self {
        match value {
            "none" | "" => PrefixStrategy::None,
            "<alias_>" => PrefixStrategy::AliasUnderscore,
            "<alias?>" => PrefixStrategy::AliasQuestion,
            literal => PrefixStrategy::Literal(literal.to_string()),
        }
    }

    pub fn apply(&self, alias: &str, key: &str) -> String {
        match self {
            PrefixStrategy::None => key.to_string(),
            PrefixStrategy::AliasUnderscore => format!("{alias}_{key}"),
            PrefixStrategy::AliasQuestion => format!("{alias}?{key}"),
            PrefixStrategy::Literal(prefix) => format!("{prefix}{key}"),
        }
    }
}

/// The full metadata key set for a loop alias under a prefix strategy.
pub fn metadata_keys(alias: &str, strategy: &PrefixStrategy) -> Vec<String> {
    METADATA_KEYS
        .iter()
        .map(|key| strategy.apply(alias, key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alias_underscore_naming() {
        let keys = metadata_keys("item", &PrefixStrategy::AliasUnderscore);
        assert_eq!(
            keys,
            vec![
                "item_count",
                "item_index",
                "item_indexParity",
                "item_hasNext",
                "item_isLast",
                "item_isFirst",
                "item_odd",
                "item_even",
            ]
        );
    }

    #[test]
    fn other_strategies() {
        assert_eq!(
            metadata_keys("it", &PrefixStrategy::None)[0],
            "count".to_string()
        );
        assert_eq!(
            metadata_keys("it", &PrefixStrategy::AliasQuestion)[3],
            "it?hasNext".to_string()
        );
        assert_eq!(
            metadata_keys("it", &PrefixStrategy::Literal("m_".into()))[0],
            "m_count".to_string()
        );
    }

    #[test]
    fn setting_round_trip() {
        assert_eq!(PrefixStrategy::from_setting("none"), PrefixStrategy::None);
        assert_eq!(
            PrefixStrategy::from_setting("<alias_>"),
            PrefixStrategy::AliasUnderscore
        );
        assert_eq!(
            PrefixStrategy::from_setting("<alias?>"),
            PrefixStrategy::AliasQuestion
        );
        assert_eq!(
            PrefixStrategy::from_setting("row"),
            PrefixStrategy::Literal("row".into())
        );
    }
}
