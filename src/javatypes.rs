use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Why a method is unusable as a template property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvalidMethodReason {
    Unknown,
    VoidReturn,
    FromObject,
    Static,
}

impl InvalidMethodReason {
    pub fn message(&self, name: &str) -> String {
        match self {
            InvalidMethodReason::Unknown => format!("Method `{name}` cannot be used here."),
            InvalidMethodReason::VoidReturn => {
                format!("Method `{name}` returns void and produces no value.")
            }
            InvalidMethodReason::FromObject => {
                format!("Method `{name}` is inherited from java.lang.Object and is not a template property.")
            }
            InvalidMethodReason::Static => {
                format!("Static method `{name}` cannot be called on an instance.")
            }
        }
    }
}

/// A lightweight search result from the provider's pattern query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaTypeInfo {
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaFieldInfo {
    pub name: String,
    pub type_signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JavaMethodInfo {
    pub name: String,
    pub return_type: String,
    #[serde(default)]
    pub parameter_types: Vec<String>,
}

/// The provider's wire shape for a resolved type, before finalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolvedJavaTypeData {
    pub signature: String,
    pub extended_types: Vec<String>,
    pub fields: Vec<JavaFieldInfo>,
    pub methods: Vec<JavaMethodInfo>,
    pub invalid_methods: HashMap<String, InvalidMethodReason>,
    pub iterable_of: Option<String>,
}

/// A resolved description of a host type: fields, usable methods, and
/// iterability. Value object consumed from the external provider; derived
/// fields are back-filled once at cache-insert time and the whole record is
/// immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedJavaType {
    pub signature: String,
    /// Erasure of the signature, without type arguments.
    pub name: String,
    pub type_arguments: Vec<String>,
    pub extended_types: Vec<String>,
    pub fields: Vec<JavaFieldInfo>,
    pub methods: Vec<JavaMethodInfo>,
    pub invalid_methods: HashMap<String, InvalidMethodReason>,
    pub is_iterable: bool,
    /// The erased collection type when iterable, e.g. `java.util.List`.
    pub iterable_type: Option<String>,
    /// The element type when iterable, e.g. `org.acme.Item`.
    pub iterable_of: Option<String>,
}

impl ResolvedJavaType {
    /// Computes derived fields from the provider payload. Invariants
    /// enforced here: a method name appears in at most one of `methods` and
    /// `invalid_methods`, and `iterable_of` is non-null iff `is_iterable`.
    pub fn finalize(data: ResolvedJavaTypeData) -> Self {
        let (name, type_arguments) = split_type_arguments(&data.signature);
        let name = name.to_string();

        let methods: Vec<JavaMethodInfo> = data
            .methods
            .into_iter()
            .filter(|method| !data.invalid_methods.contains_key(&method.name))
            .collect();

        let is_array = name.ends_with("[]");
        let mut is_iterable = is_array
            || data.iterable_of.is_some()
            || is_iterable_name(&name)
            || data.extended_types.iter().any(|t| {
                let (erased, _) = split_type_arguments(t);
                is_iterable_name(erased)
            });

        let iterable_of = if is_array {
            Some(name.trim_end_matches("[]").to_string())
        } else if let Some(of) = data.iterable_of {
            Some(of)
        } else if is_iterable {
            type_arguments.first().cloned()
        } else {
            None
        };
        // No element type means no iteration contract to offer.
        is_iterable = is_iterable && iterable_of.is_some();
        let iterable_type = is_iterable.then(|| name.clone());

        Self {
            signature: data.signature,
            name,
            type_arguments,
            extended_types: data.extended_types,
            fields: data.fields,
            methods,
            invalid_methods: data.invalid_methods,
            is_iterable,
            iterable_type,
            iterable_of,
        }
    }

    pub fn field(&self, name: &str) -> Option<&JavaFieldInfo> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Property-style method lookup: accepts the raw name, the `getX`/`isX`
    /// accessor conventions, and `name()` call syntax.
    pub fn method(&self, part: &str) -> Option<&JavaMethodInfo> {
        let bare = part.trim_end_matches("()");
        self.methods.iter().find(|method| {
            method.name == bare
                || method.name == accessor_name("get", bare)
                || method.name == accessor_name("is", bare)
        })
    }

    pub fn invalid_method_reason(&self, part: &str) -> Option<InvalidMethodReason> {
        let bare = part.trim_end_matches("()");
        self.invalid_methods.get(bare).copied()
    }

    /// The type signature a property access on this type produces, if the
    /// part resolves to a field or a usable method.
    pub fn member_type(&self, part: &str) -> Option<&str> {
        if let Some(field) = self.field(part.trim_end_matches("()")) {
            return Some(&field.type_signature);
        }
        self.method(part).map(|method| method.return_type.as_str())
    }
}

fn accessor_name(prefix: &str, property: &str) -> String {
    let mut chars = property.chars();
    match chars.next() {
        Some(first) => format!("{prefix}{}{}", first.to_ascii_uppercase(), chars.as_str()),
        None => prefix.to_string(),
    }
}

fn is_iterable_name(name: &str) -> bool {
    matches!(
        name,
        "java.lang.Iterable"
            | "java.util.Collection"
            | "java.util.List"
            | "java.util.Set"
            | "java.util.stream.Stream"
    )
}

/// Splits a generic signature into its erasure and type-argument list.
/// Shares the scanner's depth-tracking discipline so `Map<K,List<V>>` is
/// never split on its inner comma.
pub fn split_type_arguments(signature: &str) -> (&str, Vec<String>) {
    let Some(open) = signature.find('<') else {
        return (signature, Vec::new());
    };
    if !signature.ends_with('>') {
        return (signature, Vec::new());
    }
    let body = &signature[open + 1..signature.len() - 1];
    let mut arguments = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    for (idx, ch) in body.char_indices() {
        match ch {
            '<' => depth += 1,
            '>' => depth -= 1,
            ',' if depth == 0 => {
                let argument = body[start..idx].trim();
                if !argument.is_empty() {
                    arguments.push(argument.to_string());
                }
                start = idx + 1;
            }
            _ => {}
        }
    }
    let tail = body[start..].trim();
    if !tail.is_empty() {
        arguments.push(tail.to_string());
    }
    (&signature[..open], arguments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_nested_generics() {
        let (base, args) = split_type_arguments("java.util.Map<String,java.util.List<Item>>");
        assert_eq!(base, "java.util.Map");
        assert_eq!(args, vec!["String", "java.util.List<Item>"]);
    }

    #[test]
    fn plain_signature_has_no_arguments() {
        let (base, args) = split_type_arguments("org.acme.Item");
        assert_eq!(base, "org.acme.Item");
        assert!(args.is_empty());
    }

    #[test]
    fn list_of_items_is_iterable() {
        let resolved = ResolvedJavaType::finalize(ResolvedJavaTypeData {
            signature: "java.util.List<org.acme.Item>".into(),
            extended_types: vec![
                "java.util.Collection<org.acme.Item>".into(),
                "java.lang.Iterable<org.acme.Item>".into(),
            ],
            ..Default::default()
        });
        assert!(resolved.is_iterable);
        assert_eq!(resolved.iterable_type.as_deref(), Some("java.util.List"));
        assert_eq!(resolved.iterable_of.as_deref(), Some("org.acme.Item"));
    }

    #[test]
    fn arrays_iterate_their_element_type() {
        let resolved = ResolvedJavaType::finalize(ResolvedJavaTypeData {
            signature: "org.acme.Item[]".into(),
            ..Default::default()
        });
        assert!(resolved.is_iterable);
        assert_eq!(resolved.iterable_of.as_deref(), Some("org.acme.Item"));
    }

    #[test]
    fn plain_type_is_not_iterable() {
        let resolved = ResolvedJavaType::finalize(ResolvedJavaTypeData {
            signature: "org.acme.Item".into(),
            ..Default::default()
        });
        assert!(!resolved.is_iterable);
        assert!(resolved.iterable_of.is_none());
        assert!(resolved.iterable_type.is_none());
    }

    #[test]
    fn invalid_methods_never_shadow_usable_ones() {
        let mut invalid = HashMap::new();
        invalid.insert("wait".to_string(), InvalidMethodReason::FromObject);
        let resolved = ResolvedJavaType::finalize(ResolvedJavaTypeData {
            signature: "org.acme.Item".into(),
            methods: vec![
                JavaMethodInfo {
                    name: "wait".into(),
                    return_type: "void".into(),
                    parameter_types: Vec::new(),
                },
                JavaMethodInfo {
                    name: "getName".into(),
                    return_type: "java.lang.String".into(),
                    parameter_types: Vec::new(),
                },
            ],
            invalid_methods: invalid,
            ..Default::default()
        });
        assert!(resolved.method("wait").is_none());
        assert_eq!(
            resolved.invalid_method_reason("wait"),
            Some(InvalidMethodReason::FromObject)
        );
        assert!(resolved.method("name").is_some());
    }

    #[test]
    fn accessor_conventions() {
        let resolved = ResolvedJavaType::finalize(ResolvedJavaTypeData {
            signature: "org.acme.Item".into(),
            methods: vec![
                JavaMethodInfo {
                    name: "isActive".into(),
                    return_type: "boolean".into(),
                    parameter_types: Vec::new(),
                },
            ],
            ..Default::default()
        });
        assert!(resolved.method("active").is_some());
        assert!(resolved.method("isActive").is_some());
        assert!(resolved.method("active()").is_some());
        assert_eq!(resolved.member_type("active"), Some("boolean"));
    }
}
