//! The reflective marshaller: typed records driven through the writer
//! and reader contracts by cached field descriptors.
//!
//! A record type implements [`WireRecord`] by exposing a
//! [`Descriptor`]: an ordered list of field accessors, each knowing the
//! field's wire name and a read/write path specialized to the declared
//! kind. Descriptors are built once per type behind a `LazyLock` by the
//! [`wire_record!`] macro, which is this engine's stand-in for runtime
//! field reflection. Embedded base records contribute their fields
//! first, in declaration order.
//!
//! Types with a hand-written [`WireField`] implementation serialize
//! through their own read/write paths, the way externalizable values
//! do.

pub mod strategy;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use indexmap::IndexMap;
use smallvec::SmallVec;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::decoding::{FieldIn as _, FieldKey, ValueIn};
use crate::encoding::{FieldOut as _, ValueOut};
use crate::error::{WireError, WireResult};
use crate::value::Value;

/// One field of a record: its wire name and the paths that move it
/// between the object and a wire.
pub struct FieldAccessor<T> {
    name: &'static str,
    id: u64,
    leaf: bool,
    write: Box<dyn Fn(&T, &mut dyn ValueOut) -> WireResult<()> + Send + Sync>,
    read: Box<dyn Fn(&mut T, &mut dyn ValueIn) -> WireResult<()> + Send + Sync>,
    reset: Box<dyn Fn(&mut T) + Send + Sync>,
    eq: Box<dyn Fn(&T, &T) -> bool + Send + Sync>,
}

impl<T: 'static> FieldAccessor<T> {
    /// Builds an accessor from a pair of projection functions.
    pub fn new<F: WireField>(
        name: &'static str,
        get: fn(&T) -> &F,
        get_mut: fn(&mut T) -> &mut F,
    ) -> Self {
        Self {
            name,
            id: 0,
            leaf: false,
            write: Box::new(move |t, out| get(t).write_field(out)),
            read: Box::new(move |t, input| get_mut(t).read_field(input)),
            reset: Box::new(move |t| *get_mut(t) = F::default_value()),
            eq: Box::new(move |a, b| get(a).field_eq(get(b))),
        }
    }

    /// Marks the field's payload as small, asking the encoding to
    /// inline its composite form.
    pub fn leaf(mut self) -> Self {
        self.leaf = true;
        self
    }

    /// The declared wire name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Declaration index, used as the numeric field id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// The cached, ordered description of a record type's fields.
pub struct Descriptor<T: 'static> {
    type_tag: &'static str,
    fields: Vec<FieldAccessor<T>>,
}

impl<T: 'static> Descriptor<T> {
    /// Starts an empty descriptor for the given type tag.
    pub fn new(type_tag: &'static str) -> Self {
        Self {
            type_tag,
            fields: Vec::new(),
        }
    }

    /// Appends a field; ids follow declaration order.
    pub fn with_field(mut self, mut accessor: FieldAccessor<T>) -> Self {
        accessor.id = self.fields.len() as u64;
        self.fields.push(accessor);
        self
    }

    /// Embeds a base record: its fields come first, projected through
    /// the embedding field.
    pub fn embed<B: WireRecord>(
        mut self,
        get: fn(&T) -> &B,
        get_mut: fn(&mut T) -> &mut B,
    ) -> Self {
        for base in B::descriptor().fields.iter() {
            let id = self.fields.len() as u64;
            self.fields.push(FieldAccessor {
                name: base.name,
                id,
                leaf: base.leaf,
                write: Box::new(move |t, out| (base.write)(get(t), out)),
                read: Box::new(move |t, input| (base.read)(get_mut(t), input)),
                reset: Box::new(move |t| (base.reset)(get_mut(t))),
                eq: Box::new(move |a, b| (base.eq)(get(a), get(b))),
            });
        }
        self
    }

    /// The stable tag written by tagged emission.
    pub fn type_tag(&self) -> &'static str {
        self.type_tag
    }

    /// Number of fields, embedded bases included.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    fn index_of(&self, key: &FieldKey) -> Option<usize> {
        match key {
            FieldKey::Name(name) => self.fields.iter().position(|f| f.name == name),
            FieldKey::Id(id) => {
                let at = usize::try_from(*id).ok()?;
                (at < self.fields.len()).then_some(at)
            }
            FieldKey::Position(at) => (*at < self.fields.len()).then_some(*at),
        }
    }

    /// Writes every field, in declaration order.
    pub fn write(&self, value: &T, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_record(&mut |fields| {
            for accessor in &self.fields {
                let value_out = fields.field_id(accessor.id, accessor.name)?;
                let value_out = if accessor.leaf { value_out.leaf() } else { value_out };
                (accessor.write)(value, value_out)?;
            }
            Ok(())
        })
    }

    /// Writes the record behind its type tag.
    pub fn write_tagged(&self, value: &T, out: &mut dyn ValueOut) -> WireResult<()> {
        self.write(value, out.type_prefix(self.type_tag)?)
    }

    /// Reads a record, matching stream fields to accessors in any
    /// order. Stream fields with no accessor are skipped by length
    /// measure; in `overwrite` mode, accessors absent from the stream
    /// are reset to their defaults, otherwise the in-object value is
    /// kept (merge semantics).
    pub fn read(&self, target: &mut T, input: &mut dyn ValueIn, overwrite: bool) -> WireResult<()> {
        if let Some(tag) = input.read_type_prefix()? {
            let resolved = strategy::resolve_alias(&tag);
            if resolved != self.type_tag {
                warn!(tag = %resolved, expected = %self.type_tag, "reading mismatched type tag");
            }
        }
        let mut seen: SmallVec<[bool; 16]> = SmallVec::from_elem(false, self.fields.len());
        input.read_record(&mut |fields| {
            while let Some(key) = fields.next_field()? {
                match self.index_of(&key) {
                    Some(at) => {
                        (self.fields[at].read)(target, fields.value())?;
                        seen[at] = true;
                    }
                    None => {
                        let span = fields.value().read_length()?;
                        trace!(?key, span, "skipping unknown field");
                        fields.value().skip_value()?;
                    }
                }
            }
            Ok(())
        })?;
        if overwrite {
            for (at, accessor) in self.fields.iter().enumerate() {
                if !seen[at] {
                    (accessor.reset)(target);
                }
            }
        }
        Ok(())
    }

    /// Descriptor-derived equality: true iff every accessor reports
    /// equal.
    pub fn equal(&self, a: &T, b: &T) -> bool {
        self.fields.iter().all(|f| (f.eq)(a, b))
    }
}

/// A record type with a cached descriptor.
pub trait WireRecord: Sized + 'static {
    /// The descriptor, built once and cached for the life of the
    /// process.
    fn descriptor() -> &'static Descriptor<Self>;

    /// A record with every field at its default.
    fn default_record() -> Self;

    /// The stable type tag.
    fn type_tag() -> &'static str {
        Self::descriptor().type_tag()
    }

    /// Writes the record, untagged.
    fn write_to(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        Self::descriptor().write(self, out)
    }

    /// Writes the record behind its type tag.
    fn write_tagged_to(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        Self::descriptor().write_tagged(self, out)
    }

    /// Reads into `self`; see [`Descriptor::read`] for the `overwrite`
    /// semantics.
    fn read_from(&mut self, input: &mut dyn ValueIn, overwrite: bool) -> WireResult<()> {
        Self::descriptor().read(self, input, overwrite)
    }

    /// Reads a fresh record from the stream.
    fn from_wire(input: &mut dyn ValueIn) -> WireResult<Self> {
        let mut value = Self::default_record();
        value.read_from(input, true)?;
        Ok(value)
    }
}

/// Descriptor-derived equality.
pub fn records_equal<T: WireRecord>(a: &T, b: &T) -> bool {
    T::descriptor().equal(a, b)
}

/// Deep copy by routing the record through a binary wire and back.
pub fn deep_copy<T: WireRecord>(value: &T) -> WireResult<T> {
    let mut out = crate::encoding::BinaryOut::new(Default::default(), 0);
    value.write_to(&mut out)?;
    let bytes = out.finish();
    let mut input = crate::decoding::BinaryIn::new(Default::default(), bytes, 0);
    T::from_wire(&mut input)
}

/// A value that knows how to move itself across a wire; the static
/// strategy for its declared kind.
pub trait WireField: Sized + 'static {
    /// Emits the value.
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()>;

    /// Pulls the value in place.
    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()>;

    /// The default used by overwrite-mode reads.
    fn default_value() -> Self;

    /// Field-level equality.
    fn field_eq(&self, other: &Self) -> bool;
}

macro_rules! scalar_wire_field {
    ($($ty:ty => $write:ident / $read:ident),* $(,)?) => {
        $(
            impl WireField for $ty {
                fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
                    out.$write(*self)
                }

                fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
                    *self = input.$read()?;
                    Ok(())
                }

                fn default_value() -> Self {
                    Default::default()
                }

                fn field_eq(&self, other: &Self) -> bool {
                    self == other
                }
            }
        )*
    };
}

scalar_wire_field! {
    bool => write_bool / read_bool,
    i8 => write_i8 / read_i8,
    u8 => write_u8 / read_u8,
    i16 => write_i16 / read_i16,
    u16 => write_u16 / read_u16,
    i32 => write_i32 / read_i32,
    u32 => write_u32 / read_u32,
    i64 => write_i64 / read_i64,
    u64 => write_u64 / read_u64,
    NaiveTime => write_time / read_time,
    NaiveDate => write_date / read_date,
    NaiveDateTime => write_date_time / read_date_time,
}

impl WireField for f32 {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_f32(*self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = input.read_f32()?;
        Ok(())
    }

    fn default_value() -> Self {
        0.0
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other || (self.is_nan() && other.is_nan())
    }
}

impl WireField for f64 {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_f64(*self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = input.read_f64()?;
        Ok(())
    }

    fn default_value() -> Self {
        0.0
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other || (self.is_nan() && other.is_nan())
    }
}

impl WireField for String {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_text(self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = input.read_text()?;
        Ok(())
    }

    fn default_value() -> Self {
        String::new()
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl WireField for Bytes {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_byte_array(self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = Bytes::from(input.read_bytes()?);
        Ok(())
    }

    fn default_value() -> Self {
        Bytes::new()
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl WireField for DateTime<FixedOffset> {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_zoned_date_time(self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = input.read_zoned_date_time()?;
        Ok(())
    }

    fn default_value() -> Self {
        DateTime::UNIX_EPOCH.fixed_offset()
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl WireField for Uuid {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_uuid(*self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = input.read_uuid()?;
        Ok(())
    }

    fn default_value() -> Self {
        Uuid::nil()
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl WireField for Value {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_value(self)
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        *self = input.read_value()?;
        Ok(())
    }

    fn default_value() -> Self {
        Value::Null
    }

    fn field_eq(&self, other: &Self) -> bool {
        self == other
    }
}

impl<F: WireField> WireField for Option<F> {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        match self {
            None => out.write_null(),
            Some(inner) => inner.write_field(out),
        }
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        if input.is_null()? {
            *self = None;
            return Ok(());
        }
        let mut inner = F::default_value();
        inner.read_field(input)?;
        *self = Some(inner);
        Ok(())
    }

    fn default_value() -> Self {
        None
    }

    fn field_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.field_eq(b),
            _ => false,
        }
    }
}

impl<F: WireField> WireField for Vec<F> {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_sequence(&mut |items| {
            for item in self {
                item.write_field(items)?;
            }
            Ok(())
        })
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        self.clear();
        let items = &mut *self;
        input.read_sequence(&mut |seq| {
            while seq.has_next()? {
                let mut item = F::default_value();
                item.read_field(seq)?;
                items.push(item);
            }
            Ok(())
        })
    }

    fn default_value() -> Self {
        Vec::new()
    }

    fn field_eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other).all(|(a, b)| a.field_eq(b))
    }
}

impl<F: WireField, const N: usize> WireField for [F; N] {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_sequence(&mut |items| {
            for item in self {
                item.write_field(items)?;
            }
            Ok(())
        })
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        let mut at = 0usize;
        let slots = &mut *self;
        input.read_sequence(&mut |seq| {
            while seq.has_next()? {
                if at >= N {
                    return Err(WireError::TypeMismatch {
                        expected: "fixed-size array",
                        found: format!("more than {N} items"),
                        offset: 0,
                        excerpt: String::new(),
                    });
                }
                slots[at].read_field(seq)?;
                at += 1;
            }
            Ok(())
        })?;
        if at != N {
            return Err(WireError::Truncation {
                needed: N,
                available: at,
                offset: 0,
                excerpt: String::new(),
            });
        }
        Ok(())
    }

    fn default_value() -> Self {
        std::array::from_fn(|_| F::default_value())
    }

    fn field_eq(&self, other: &Self) -> bool {
        self.iter().zip(other).all(|(a, b)| a.field_eq(b))
    }
}

impl<F: WireField> WireField for IndexMap<String, F> {
    fn write_field(&self, out: &mut dyn ValueOut) -> WireResult<()> {
        out.write_map(&mut |fields| {
            for (key, item) in self {
                item.write_field(fields.field(key)?)?;
            }
            Ok(())
        })
    }

    fn read_field(&mut self, input: &mut dyn ValueIn) -> WireResult<()> {
        self.clear();
        let entries = &mut *self;
        input.read_record(&mut |fields| {
            while let Some(key) = fields.next_field()? {
                let name = match key {
                    FieldKey::Name(name) => name,
                    FieldKey::Id(id) => id.to_string(),
                    FieldKey::Position(at) => at.to_string(),
                };
                let mut item = F::default_value();
                item.read_field(fields.value())?;
                entries.insert(name, item);
            }
            Ok(())
        })
    }

    fn default_value() -> Self {
        IndexMap::new()
    }

    fn field_eq(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .iter()
                .all(|(k, a)| other.get(k).is_some_and(|b| a.field_eq(b)))
    }
}

/// Declares a record type and generates its [`WireRecord`] descriptor,
/// [`WireField`] path and `Default` at once.
///
/// ```ignore
/// wire_record! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Dto("Dto") {
///         one: i32 => "one",
///         two: Option<String> => "two",
///     }
/// }
/// ```
///
/// An embedded base record contributes its fields first:
///
/// ```ignore
/// wire_record! {
///     #[derive(Debug, Clone, PartialEq)]
///     pub struct Sub("Sub"): Base as base {
///         extra: i32 => "extra",
///     }
/// }
/// ```
#[macro_export]
macro_rules! wire_record {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident ($tag:literal)
        $(: $bty:ty as $bname:ident)?
        {
            $( $(#[$fmeta:meta])* $([$hint:ident])? $fname:ident : $fty:ty => $wname:literal ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $( $bname: $bty, )?
            $( $(#[$fmeta])* $vis $fname: $fty, )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $( $bname: <$bty as $crate::record::WireRecord>::default_record(), )?
                    $( $fname: <$fty as $crate::record::WireField>::default_value(), )*
                }
            }
        }

        impl $crate::record::WireRecord for $name {
            fn descriptor() -> &'static $crate::record::Descriptor<Self> {
                static DESCRIPTOR: std::sync::LazyLock<$crate::record::Descriptor<$name>> =
                    std::sync::LazyLock::new(|| {
                        $crate::record::Descriptor::new($tag)
                            $( .embed::<$bty>(|t: &$name| &t.$bname, |t: &mut $name| &mut t.$bname) )?
                            $(
                                .with_field({
                                    let accessor = $crate::record::FieldAccessor::new(
                                        $wname,
                                        |t: &$name| &t.$fname,
                                        |t: &mut $name| &mut t.$fname,
                                    );
                                    $( let accessor = accessor.$hint(); )?
                                    accessor
                                })
                            )*
                    });
                &DESCRIPTOR
            }

            fn default_record() -> Self {
                Default::default()
            }
        }

        impl $crate::record::WireField for $name {
            fn write_field(
                &self,
                out: &mut dyn $crate::encoding::ValueOut,
            ) -> $crate::error::WireResult<()> {
                $crate::record::WireRecord::write_to(self, out)
            }

            fn read_field(
                &mut self,
                input: &mut dyn $crate::decoding::ValueIn,
            ) -> $crate::error::WireResult<()> {
                $crate::record::WireRecord::read_from(self, input, true)
            }

            fn default_value() -> Self {
                Default::default()
            }

            fn field_eq(&self, other: &Self) -> bool {
                $crate::record::records_equal(self, other)
            }
        }
    };
}

/// Declares an enum carried on the wire as its variant name.
///
/// The first variant is the default; an unknown name fails with
/// `type-mismatch`.
#[macro_export]
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident ($tag:literal) {
            $first:ident => $fstr:literal
            $(, $var:ident => $vstr:literal )* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis enum $name {
            $first,
            $( $var, )*
        }

        impl Default for $name {
            fn default() -> Self {
                Self::$first
            }
        }

        impl $name {
            /// The wire form of the variant.
            $vis fn as_str(&self) -> &'static str {
                match self {
                    Self::$first => $fstr,
                    $( Self::$var => $vstr, )*
                }
            }

            /// Parses the wire form.
            $vis fn from_str(token: &str) -> Option<Self> {
                match token {
                    $fstr => Some(Self::$first),
                    $( $vstr => Some(Self::$var), )*
                    _ => None,
                }
            }
        }

        impl $crate::record::WireField for $name {
            fn write_field(
                &self,
                out: &mut dyn $crate::encoding::ValueOut,
            ) -> $crate::error::WireResult<()> {
                $crate::encoding::ValueOut::write_text(out, self.as_str())
            }

            fn read_field(
                &mut self,
                input: &mut dyn $crate::decoding::ValueIn,
            ) -> $crate::error::WireResult<()> {
                let token = $crate::decoding::ValueIn::read_text(input)?;
                *self = Self::from_str(&token).ok_or_else(|| {
                    $crate::error::WireError::TypeMismatch {
                        expected: $tag,
                        found: token,
                        offset: 0,
                        excerpt: String::new(),
                    }
                })?;
                Ok(())
            }

            fn default_value() -> Self {
                Default::default()
            }

            fn field_eq(&self, other: &Self) -> bool {
                self == other
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    wire_record! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Inner("Inner") {
            label: String => "label",
        }
    }

    wire_record! {
        #[derive(Debug, Clone, PartialEq)]
        pub struct Outer("Outer"): Inner as inner {
            count: i32 => "count",
            tags: Vec<String> => "tags",
        }
    }

    wire_enum! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum Side("Side") {
            Buy => "Buy",
            Sell => "Sell",
        }
    }

    #[test]
    fn embedded_base_fields_come_first() {
        let descriptor = Outer::descriptor();
        let names: Vec<_> = (0..descriptor.field_count())
            .map(|i| descriptor.fields[i].name)
            .collect();
        assert_eq!(names, vec!["label", "count", "tags"]);
        assert_eq!(descriptor.fields[2].id, 2);
    }

    #[test]
    fn enum_round_trips_by_name() {
        assert_eq!(Side::from_str("Sell"), Some(Side::Sell));
        assert_eq!(Side::from_str("Hold"), None);
        assert_eq!(Side::default(), Side::Buy);
    }

    #[test]
    fn descriptor_equality_sees_every_field() {
        let mut a = Outer::default();
        let b = Outer::default();
        assert!(records_equal(&a, &b));
        a.count = 3;
        assert!(!records_equal(&a, &b));
    }
}
