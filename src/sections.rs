/// Closed taxonomy of section tags and the static grammar each declares.
///
/// A section kind is dispatched from its tag name; unrecognized tags fall
/// back to [`SectionKind::Custom`], used for user tags and include-style
/// references. Behavior lives in a parallel table of grammar records rather
/// than trait objects, so adding a kind is an exhaustive-match affair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionKind {
    If,
    Else,
    Each,
    For,
    With,
    When,
    Is,
    Switch,
    Case,
    Set,
    Let,
    Include,
    Insert,
    Fragment,
    Custom,
}

impl SectionKind {
    /// The canonical tag for the kind; `Custom` has none.
    pub fn tag(self) -> Option<&'static str> {
        Some(match self {
            SectionKind::If => "if",
            SectionKind::Else => "else",
            SectionKind::Each => "each",
            SectionKind::For => "for",
            SectionKind::With => "with",
            SectionKind::When => "when",
            SectionKind::Is => "is",
            SectionKind::Switch => "switch",
            SectionKind::Case => "case",
            SectionKind::Set => "set",
            SectionKind::Let => "let",
            SectionKind::Include => "include",
            SectionKind::Insert => "insert",
            SectionKind::Fragment => "fragment",
            SectionKind::Custom => return None,
        })
    }

    /// Tag-name dispatch; the section factory.
    pub fn from_tag(tag: &str) -> SectionKind {
        match tag {
            "if" => SectionKind::If,
            "else" => SectionKind::Else,
            "each" => SectionKind::Each,
            "for" => SectionKind::For,
            "with" => SectionKind::With,
            "when" => SectionKind::When,
            "is" => SectionKind::Is,
            "switch" => SectionKind::Switch,
            "case" => SectionKind::Case,
            "set" => SectionKind::Set,
            "let" => SectionKind::Let,
            "include" => SectionKind::Include,
            "insert" => SectionKind::Insert,
            "fragment" => SectionKind::Fragment,
            _ => SectionKind::Custom,
        }
    }

    /// Block labels attach as children of their enclosing control section
    /// rather than opening an independent nesting level.
    pub fn is_block_label(self) -> bool {
        matches!(
            self,
            SectionKind::Else | SectionKind::Is | SectionKind::Case
        )
    }

    pub fn grammar(self) -> &'static SectionGrammar {
        match self {
            SectionKind::If => &IF,
            SectionKind::Else => &ELSE,
            SectionKind::Each => &EACH,
            SectionKind::For => &FOR,
            SectionKind::With => &WITH,
            SectionKind::When => &WHEN,
            SectionKind::Is => &IS,
            SectionKind::Switch => &SWITCH,
            SectionKind::Case => &CASE,
            SectionKind::Set => &SET,
            SectionKind::Let => &LET,
            SectionKind::Include => &INCLUDE,
            SectionKind::Insert => &INSERT,
            SectionKind::Fragment => &FRAGMENT,
            SectionKind::Custom => &CUSTOM,
        }
    }
}

/// One named slot in a section's parameter schema.
#[derive(Debug, Clone, Copy)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub required: bool,
    pub default_value: Option<&'static str>,
    /// Whether the slot's value participates in expression validation.
    pub can_have_expression: bool,
}

/// Static per-kind behavior record.
#[derive(Debug)]
pub struct SectionGrammar {
    pub kind: SectionKind,
    pub params: &'static [ParameterInfo],
    /// Kinds permitted as direct child block labels.
    pub block_labels: &'static [SectionKind],
    /// Whether positional parameters beyond the schema are accepted
    /// (condition lists, case operands, user-tag arguments).
    pub variadic: bool,
    /// Whether the section exposes loop iteration metadata to its children.
    pub iterable: bool,
    /// Whether the section may legally stay open until its parent scope
    /// closes, without an explicit end tag.
    pub allows_unterminated: bool,
    pub doc: &'static str,
}

const fn slot(
    name: &'static str,
    required: bool,
    can_have_expression: bool,
) -> ParameterInfo {
    ParameterInfo {
        name,
        required,
        default_value: None,
        can_have_expression,
    }
}

/// Default loop alias bound inside `#each` when none is declared.
pub const DEFAULT_LOOP_ALIAS: &str = "it";

static IF: SectionGrammar = SectionGrammar {
    kind: SectionKind::If,
    params: &[slot("condition", true, true)],
    block_labels: &[SectionKind::Else],
    variadic: true,
    iterable: false,
    allows_unterminated: false,
    doc: "Renders the body when the condition evaluates to true.",
};

static ELSE: SectionGrammar = SectionGrammar {
    kind: SectionKind::Else,
    params: &[],
    block_labels: &[],
    variadic: true,
    iterable: false,
    allows_unterminated: false,
    doc: "Fallback block of a condition or loop; `{#else if ...}` chains conditions.",
};

static EACH: SectionGrammar = SectionGrammar {
    kind: SectionKind::Each,
    params: &[slot("iterable", true, true)],
    block_labels: &[SectionKind::Else],
    variadic: true,
    iterable: true,
    allows_unterminated: false,
    doc: "Iterates the given iterable, binding each element to `it`.",
};

static FOR: SectionGrammar = SectionGrammar {
    kind: SectionKind::For,
    params: &[
        slot("alias", true, false),
        slot("in", true, false),
        slot("iterable", true, true),
    ],
    block_labels: &[SectionKind::Else],
    variadic: false,
    iterable: true,
    allows_unterminated: false,
    doc: "Iterates the given iterable, binding each element to a named alias.",
};

static WITH: SectionGrammar = SectionGrammar {
    kind: SectionKind::With,
    params: &[slot("object", true, true)],
    block_labels: &[],
    variadic: false,
    iterable: false,
    allows_unterminated: false,
    doc: "Brings the object's members into scope for the body.",
};

static WHEN: SectionGrammar = SectionGrammar {
    kind: SectionKind::When,
    params: &[slot("value", true, true)],
    block_labels: &[SectionKind::Is, SectionKind::Case, SectionKind::Else],
    variadic: false,
    iterable: false,
    allows_unterminated: false,
    doc: "Matches the tested value against `#is`/`#case` blocks.",
};

static SWITCH: SectionGrammar = SectionGrammar {
    kind: SectionKind::Switch,
    params: &[slot("value", true, true)],
    block_labels: &[SectionKind::Is, SectionKind::Case, SectionKind::Else],
    variadic: false,
    iterable: false,
    allows_unterminated: false,
    doc: "Matches the tested value against `#is`/`#case` blocks.",
};

static IS: SectionGrammar = SectionGrammar {
    kind: SectionKind::Is,
    params: &[],
    block_labels: &[],
    variadic: true,
    iterable: false,
    allows_unterminated: false,
    doc: "A match clause of `#when`/`#switch`; an optional leading operator compares the value.",
};

static CASE: SectionGrammar = SectionGrammar {
    kind: SectionKind::Case,
    params: &[],
    block_labels: &[],
    variadic: true,
    iterable: false,
    allows_unterminated: false,
    doc: "A match clause of `#when`/`#switch`; an optional leading operator compares the value.",
};

static SET: SectionGrammar = SectionGrammar {
    kind: SectionKind::Set,
    params: &[],
    block_labels: &[],
    variadic: true,
    iterable: false,
    allows_unterminated: true,
    doc: "Binds named values for the rest of the enclosing scope.",
};

static LET: SectionGrammar = SectionGrammar {
    kind: SectionKind::Let,
    params: &[],
    block_labels: &[],
    variadic: true,
    iterable: false,
    allows_unterminated: true,
    doc: "Binds named values for the rest of the enclosing scope.",
};

static INCLUDE: SectionGrammar = SectionGrammar {
    kind: SectionKind::Include,
    params: &[slot("template", true, false)],
    block_labels: &[],
    variadic: false,
    iterable: false,
    allows_unterminated: false,
    doc: "Includes another template, optionally overriding its insert blocks.",
};

static INSERT: SectionGrammar = SectionGrammar {
    kind: SectionKind::Insert,
    params: &[ParameterInfo {
        name: "name",
        required: false,
        default_value: Some("it"),
        can_have_expression: false,
    }],
    block_labels: &[],
    variadic: false,
    iterable: false,
    allows_unterminated: false,
    doc: "Marks a block an including template may override.",
};

static FRAGMENT: SectionGrammar = SectionGrammar {
    kind: SectionKind::Fragment,
    params: &[slot("id", true, false)],
    block_labels: &[],
    variadic: false,
    iterable: false,
    allows_unterminated: false,
    doc: "A named part of the template renderable on its own.",
};

static CUSTOM: SectionGrammar = SectionGrammar {
    kind: SectionKind::Custom,
    params: &[],
    block_labels: &[],
    variadic: true,
    iterable: false,
    allows_unterminated: false,
    doc: "A user tag; every parameter is treated as an expression.",
};

/// All kinds with a canonical tag, in completion order.
pub const DECLARED_KINDS: &[SectionKind] = &[
    SectionKind::If,
    SectionKind::Else,
    SectionKind::Each,
    SectionKind::For,
    SectionKind::With,
    SectionKind::When,
    SectionKind::Is,
    SectionKind::Switch,
    SectionKind::Case,
    SectionKind::Set,
    SectionKind::Let,
    SectionKind::Include,
    SectionKind::Insert,
    SectionKind::Fragment,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_falls_back_to_custom() {
        assert_eq!(SectionKind::from_tag("gravatar"), SectionKind::Custom);
        assert_eq!(SectionKind::from_tag("if"), SectionKind::If);
    }

    #[test]
    fn block_label_sets() {
        assert_eq!(SectionKind::If.grammar().block_labels, &[SectionKind::Else]);
        assert!(SectionKind::When
            .grammar()
            .block_labels
            .contains(&SectionKind::Is));
        assert!(SectionKind::Switch
            .grammar()
            .block_labels
            .contains(&SectionKind::Case));
        assert!(SectionKind::With.grammar().block_labels.is_empty());
    }

    #[test]
    fn loop_kinds_are_iterable() {
        assert!(SectionKind::Each.grammar().iterable);
        assert!(SectionKind::For.grammar().iterable);
        assert!(!SectionKind::If.grammar().iterable);
    }

    #[test]
    fn set_tolerates_missing_end_tag() {
        assert!(SectionKind::Set.grammar().allows_unterminated);
        assert!(SectionKind::Let.grammar().allows_unterminated);
        assert!(!SectionKind::Each.grammar().allows_unterminated);
    }

    #[test]
    fn every_declared_kind_round_trips_through_its_tag() {
        for kind in DECLARED_KINDS {
            let tag = kind.tag().expect("declared kinds have tags");
            assert_eq!(SectionKind::from_tag(tag), *kind);
        }
    }
}
