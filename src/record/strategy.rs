//! The process-wide strategy table for polymorphic deserialization.
//!
//! Statically-typed reads dispatch through [`WireField`]
//! implementations; this module handles the rest: values read through
//! the any-object path whose runtime variant is named by a type tag.
//! Tags are resolved through the class-alias registry, then looked up
//! here; a registered strategy shapes the generically-read value. An
//! unregistered tag drops the value to null — the any-object branch of
//! the unknown-tag contract, and the default policy — or may be
//! configured to stay opaque or surface `unknown-type-tag`.
//!
//! [`WireField`]: super::WireField

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, LazyLock, RwLock};

use tracing::warn;

use crate::error::{WireError, WireResult};
use crate::value::Value;
use crate::wire_record;

/// Shapes a generically-read tagged value into its final form.
pub type TagStrategy = Arc<dyn Fn(Value) -> WireResult<Value> + Send + Sync>;

/// What to do with a type tag no strategy or alias resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UnknownTagPolicy {
    /// Keep the tag opaque: the value reads as `Typed(tag, inner)`.
    Keep = 0,
    /// Drop the value to null; the default, since this path only
    /// serves any-object reads.
    Null = 1,
    /// Surface `unknown-type-tag`.
    Error = 2,
}

static UNKNOWN_TAG_POLICY: AtomicU8 = AtomicU8::new(UnknownTagPolicy::Null as u8);

/// Sets the process-wide unknown-tag policy.
pub fn set_unknown_tag_policy(policy: UnknownTagPolicy) {
    UNKNOWN_TAG_POLICY.store(policy as u8, Ordering::SeqCst);
}

fn unknown_tag_policy() -> UnknownTagPolicy {
    match UNKNOWN_TAG_POLICY.load(Ordering::SeqCst) {
        1 => UnknownTagPolicy::Null,
        2 => UnknownTagPolicy::Error,
        _ => UnknownTagPolicy::Keep,
    }
}

#[derive(Default)]
struct AliasTable {
    /// alias → canonical name.
    canonical: HashMap<String, String>,
    /// canonical name → alias, for tag shortening.
    alias: HashMap<String, String>,
}

static ALIASES: LazyLock<RwLock<AliasTable>> = LazyLock::new(Default::default);

static STRATEGIES: LazyLock<RwLock<HashMap<String, TagStrategy>>> = LazyLock::new(|| {
    let mut map: HashMap<String, TagStrategy> = HashMap::new();
    map.insert(Thrown::type_tag().to_owned(), Arc::new(Ok::<_, WireError>));
    RwLock::new(map)
});

/// Registers an alias for a canonical type name; the engine itself
/// treats both as opaque strings.
pub fn register_alias(canonical: &str, alias: &str) {
    let mut table = ALIASES.write().expect("alias registry poisoned");
    table.canonical.insert(alias.to_owned(), canonical.to_owned());
    table.alias.insert(canonical.to_owned(), alias.to_owned());
}

/// Resolves a tag through the alias registry; unknown tags resolve to
/// themselves.
pub fn resolve_alias(tag: &str) -> String {
    ALIASES
        .read()
        .expect("alias registry poisoned")
        .canonical
        .get(tag)
        .cloned()
        .unwrap_or_else(|| tag.to_owned())
}

/// The registered short form of a canonical name, when one exists.
pub fn alias_of(canonical: &str) -> Option<String> {
    ALIASES
        .read()
        .expect("alias registry poisoned")
        .alias
        .get(canonical)
        .cloned()
}

/// Registers a strategy under a tag; later registrations shadow
/// earlier ones.
pub fn register_tag(tag: &str, strategy: TagStrategy) {
    STRATEGIES
        .write()
        .expect("strategy registry poisoned")
        .insert(tag.to_owned(), strategy);
}

/// Registers a record type under its own tag, making the tag known to
/// the any-object path.
pub fn register_record<T: super::WireRecord>() {
    register_tag(T::type_tag(), Arc::new(Ok::<_, WireError>));
}

fn lookup(tag: &str) -> Option<TagStrategy> {
    STRATEGIES
        .read()
        .expect("strategy registry poisoned")
        .get(tag)
        .cloned()
}

/// Routes a tagged value read by the any-object path: alias
/// resolution, strategy dispatch, then the unknown-tag policy.
pub(crate) fn resolve_typed(tag: String, inner: Value, offset: u64) -> WireResult<Value> {
    let resolved = resolve_alias(&tag);
    if let Some(strategy) = lookup(&resolved) {
        let shaped = strategy(inner)?;
        return Ok(Value::Typed(resolved, Box::new(shaped)));
    }
    match unknown_tag_policy() {
        UnknownTagPolicy::Keep => Ok(Value::Typed(resolved, Box::new(inner))),
        UnknownTagPolicy::Null => {
            warn!(tag = %resolved, "dropping value with unknown type tag");
            Ok(Value::Null)
        }
        UnknownTagPolicy::Error => Err(WireError::UnknownTypeTag {
            tag: resolved,
            offset,
            excerpt: String::new(),
        }),
    }
}

wire_record! {
    /// A carried error: the strategy form of a thrown failure, with its
    /// message and stack.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Thrown("Thrown") {
        /// The failure message.
        message: String => "message",
        /// The captured stack, outermost frame first.
        stack_trace: Vec<String> => "stackTrace",
    }
}

use super::WireRecord as _;

impl Thrown {
    /// Builds a carried error from a message and its stack frames.
    pub fn new(message: impl Into<String>, stack_trace: Vec<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace,
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The captured stack, outermost frame first.
    pub fn stack_trace(&self) -> &[String] {
        &self.stack_trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_resolve_both_ways() {
        register_alias("com.example.OrderData", "Order");
        assert_eq!(resolve_alias("Order"), "com.example.OrderData");
        assert_eq!(resolve_alias("Unmapped"), "Unmapped");
        assert_eq!(alias_of("com.example.OrderData").as_deref(), Some("Order"));
    }

    #[test]
    fn unknown_tags_drop_to_null_by_default() {
        let value = resolve_typed("Mystery".into(), Value::I64(5), 0).expect("typed");
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn registered_strategies_shape_the_value() {
        register_tag(
            "Upper",
            Arc::new(|v| match v {
                Value::Text(s) => Ok(Value::Text(s.to_uppercase())),
                other => Ok(other),
            }),
        );
        let value = resolve_typed("Upper".into(), Value::Text("abc".into()), 0).expect("typed");
        assert_eq!(
            value,
            Value::Typed("Upper".into(), Box::new(Value::Text("ABC".into())))
        );
    }

    #[test]
    fn thrown_registers_out_of_the_box() {
        assert!(lookup("Thrown").is_some());
    }
}
