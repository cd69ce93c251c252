//! Round-trip coverage for both encodings, including the exact text
//! renderings the dialect guarantees.

use std::sync::Arc;

use bytes::Bytes;
use docwire::record::strategy;
use docwire::{
    Descriptor, ElasticBuffer, FieldAccessor, FieldIn as _, FieldOut as _, Value, ValueIn as _,
    ValueOut as _, WireConfig, WireError, WireField as _, WireRecord, deep_copy,
    documents_to_text, records_equal, wire_enum, wire_record,
};
use indexmap::IndexMap;
use indoc::indoc;
use ordered_float::NotNan;
use rstest::rstest;
use similar_asserts::assert_eq;

wire_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct ScalarValues("ScalarValues") {
        b_flag: bool => "B_FLAG",
        s_num: i16 => "S_NUM",
        d_num: f64 => "D_NUM",
        l_num: i64 => "L_NUM",
        i_num: i32 => "I_NUM",
        text: String => "TEXT",
    }
}

fn sample() -> ScalarValues {
    ScalarValues {
        b_flag: true,
        s_num: 12345,
        d_num: 123.456,
        l_num: 0,
        i_num: -12345789,
        text: "Hello World".to_owned(),
    }
}

#[test]
fn s1_text_rendering_of_a_composite_record() {
    let mut wire = WireConfig::Text.build(ElasticBuffer::new());
    wire.write_document(false, |doc| sample().write_field(doc.field("A")?))
        .expect("write");

    let framed = wire.bytes();
    let payload = std::str::from_utf8(&framed[4..]).expect("utf8");
    assert_eq!(
        payload,
        indoc! {"
            A: {
              B_FLAG: true,
              S_NUM: 12345,
              D_NUM: 123.456,
              L_NUM: 0,
              I_NUM: -12345789,
              TEXT: Hello World
            }
        "}
    );

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    let input = fields.read_field("A").expect("A").expect("present");
    let restored = ScalarValues::from_wire(input).expect("restore");
    assert!(records_equal(&restored, &sample()));
}

#[test]
fn s1_payload_is_valid_yaml() {
    let mut wire = WireConfig::Text.build(ElasticBuffer::new());
    wire.write_document(false, |doc| sample().write_field(doc.field("A")?))
        .expect("write");
    let framed = wire.bytes();
    let payload = std::str::from_utf8(&framed[4..]).expect("utf8");

    let parsed: serde_yaml::Value = serde_yaml::from_str(payload).expect("yaml");
    let record = &parsed["A"];
    assert_eq!(record["B_FLAG"], serde_yaml::Value::from(true));
    assert_eq!(record["S_NUM"], serde_yaml::Value::from(12345));
    assert_eq!(record["D_NUM"], serde_yaml::Value::from(123.456));
    assert_eq!(record["TEXT"], serde_yaml::Value::from("Hello World"));
}

#[rstest]
#[case::text(WireConfig::Text)]
#[case::binary(WireConfig::Binary)]
fn s2_narrow_pull_fails_and_cursor_stays(#[case] config: WireConfig) {
    let mut wire = config.build(ElasticBuffer::new());
    wire.write_document(false, |doc| doc.field("VALUE")?.write_i64(i64::MAX))
        .expect("write");

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    let value = fields.read_field("VALUE").expect("VALUE").expect("present");
    let err = value.read_i16().expect_err("range");
    assert!(matches!(err, WireError::RangeViolation { target: "i16", .. }));
    // The cursor did not move: the full-width pull still succeeds.
    assert_eq!(value.read_i64().expect("i64"), i64::MAX);
}

#[test]
fn s3_text_rendering_of_a_string_map() {
    let mut map = IndexMap::new();
    map.insert("hello".to_owned(), "world".to_owned());
    map.insert("hello1".to_owned(), "world1".to_owned());
    map.insert("hello2".to_owned(), "world2".to_owned());

    let mut wire = WireConfig::Text.build(ElasticBuffer::new());
    wire.write_document(false, |doc| map.write_field(doc.field("example")?))
        .expect("write");

    assert_eq!(
        documents_to_text(wire.buffer()),
        indoc! {"
            --- !!data
            example: {
              hello: world,
              hello1: world1,
              hello2: world2
            }
        "}
    );

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    let input = fields.read_field("example").expect("example").expect("present");
    let mut restored: IndexMap<String, String> = IndexMap::new();
    restored.read_field(input).expect("map");
    assert_eq!(restored, map);
}

wire_enum! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Side("Side") {
        Buy => "Buy",
        Sell => "Sell",
    }
}

wire_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct SmallDto("SmallDto") {
        one: i32 => "one",
    }
}

#[rstest]
#[case::text(WireConfig::Text)]
#[case::binary(WireConfig::Binary)]
fn s4_null_objects_pull_as_none(#[case] config: WireConfig) {
    let mut wire = config.build(ElasticBuffer::new());
    wire.write_document(false, |doc| {
        for name in ["a", "b", "c", "d"] {
            doc.field(name)?.write_value(&Value::Null)?;
        }
        Ok(())
    })
    .expect("write");

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");

    let input = fields.read_field("a").expect("a").expect("present");
    assert_eq!(input.read_value().expect("value"), Value::Null);

    let input = fields.read_field("b").expect("b").expect("present");
    let mut text: Option<String> = Some("old".to_owned());
    text.read_field(input).expect("text");
    assert_eq!(text, None);

    let input = fields.read_field("c").expect("c").expect("present");
    let mut side: Option<Side> = Some(Side::Sell);
    side.read_field(input).expect("enum");
    assert_eq!(side, None);

    let input = fields.read_field("d").expect("d").expect("present");
    let mut dto: Option<SmallDto> = Some(SmallDto { one: 9 });
    dto.read_field(input).expect("record");
    assert_eq!(dto, None);
}

wire_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct DtoV1("DTO") {
        one: i32 => "one",
    }
}

wire_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct DtoV3("DTO") {
        one: i32 => "one",
        two: i64 => "two",
        three: Option<String> => "three",
    }
}

#[rstest]
#[case::text(WireConfig::Text)]
#[case::binary(WireConfig::Binary)]
fn s5_forward_compatibility_fills_defaults(#[case] config: WireConfig) {
    let mut wire = config.build(ElasticBuffer::new());
    wire.write_document(false, |doc| {
        DtoV1 { one: 1 }.write_tagged_to(doc.field("dto")?)
    })
    .expect("write");

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    let input = fields.read_field("dto").expect("dto").expect("present");
    let restored = DtoV3::from_wire(input).expect("restore");
    assert_eq!(
        restored,
        DtoV3 {
            one: 1,
            two: 0,
            three: None,
        }
    );
}

#[rstest]
#[case::text(WireConfig::Text)]
#[case::binary(WireConfig::Binary)]
fn s6_backward_compatibility_skips_extra_fields(#[case] config: WireConfig) {
    let mut wire = config.build(ElasticBuffer::new());
    wire.write_document(false, |doc| {
        DtoV3 {
            one: 1,
            two: 2,
            three: Some("3".to_owned()),
        }
        .write_tagged_to(doc.field("dto")?)
    })
    .expect("write");

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    let input = fields.read_field("dto").expect("dto").expect("present");
    let restored = DtoV1::from_wire(input).expect("restore");
    assert_eq!(restored, DtoV1 { one: 1 });
}

/// Unknown tags drop to null on any-object reads, so round-trips of
/// typed values go through a registered tag.
fn register_wrapped() {
    strategy::register_tag("Wrapped", Arc::new(Ok::<_, WireError>));
}

fn assorted_values() -> Vec<Value> {
    let mut map = IndexMap::new();
    map.insert("k".to_owned(), Value::I64(1));
    map.insert("nested".to_owned(), Value::Sequence(vec![Value::Bool(false)]));
    vec![
        Value::Null,
        Value::Bool(true),
        Value::I64(-12345789),
        Value::I64(0),
        Value::U64(u64::MAX),
        Value::F64(NotNan::new(123.456).expect("not nan")),
        Value::Text("Hello World".to_owned()),
        Value::Text(String::new()),
        Value::Text("needs: quoting".to_owned()),
        Value::Text("say \"hi\"".to_owned()),
        Value::Bytes(Bytes::from_static(b"\x00\x01\x02")),
        Value::Time("12:34:56".parse().expect("time")),
        Value::Date("2021-06-01".parse().expect("date")),
        Value::DateTime("2021-06-01T12:34:56".parse().expect("date-time")),
        Value::ZonedDateTime(
            chrono::DateTime::parse_from_rfc3339("2021-06-01T12:34:56+02:00").expect("zoned"),
        ),
        Value::Uuid(uuid::Uuid::nil()),
        Value::TypeLiteral("SomeType".to_owned()),
        Value::Sequence(vec![Value::I64(1), Value::Text("x".to_owned())]),
        Value::Map(map),
        Value::Typed("Wrapped".to_owned(), Box::new(Value::I64(7))),
    ]
}

#[rstest]
#[case::text(WireConfig::Text)]
#[case::binary(WireConfig::Binary)]
#[case::fieldless(WireConfig::BinaryFieldless)]
fn every_value_round_trips(#[case] config: WireConfig) {
    register_wrapped();
    for value in assorted_values() {
        // A field-less wire elides names; name-keyed maps are out of
        // its universe.
        if config == WireConfig::BinaryFieldless && matches!(value, Value::Map(_)) {
            continue;
        }
        let mut wire = config.build(ElasticBuffer::new());
        wire.write_document(false, |doc| doc.field("v")?.write_value(&value))
            .expect("write");
        let mut doc = wire.read_document().expect("read");
        let fields = doc.fields().expect("fields");
        fields.next_field().expect("field").expect("present");
        let restored = fields.value().read_value().expect("value");
        assert_eq!(restored, value, "through {config:?}");
    }
}

#[rstest]
#[case::text_to_binary(WireConfig::Text, WireConfig::Binary)]
#[case::binary_to_text(WireConfig::Binary, WireConfig::Text)]
fn documents_translate_across_encodings(#[case] from: WireConfig, #[case] to: WireConfig) {
    let mut source = from.build(ElasticBuffer::new());
    source
        .write_document(false, |doc| {
            doc.field("flag")?.write_bool(true)?;
            doc.field("num")?.write_i32(-42)?;
            doc.field("text")?.write_text("carried across")?;
            doc.field("list")?.write_value(&Value::Sequence(vec![
                Value::I64(1),
                Value::I64(2),
            ]))?;
            Ok(())
        })
        .expect("write");

    let mut dest = to.build(ElasticBuffer::new());
    assert!(source.copy_document_to(&mut dest).expect("copy"));

    let mut doc = dest.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    assert!(
        fields.read_field("flag").expect("flag").expect("present").read_bool().expect("bool")
    );
    assert_eq!(
        fields.read_field("num").expect("num").expect("present").read_i64().expect("int"),
        -42
    );
    assert_eq!(
        fields.read_field("text").expect("text").expect("present").read_text().expect("text"),
        "carried across"
    );
}

wire_record! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Everything("Everything") {
        flag: bool => "flag",
        count: i32 => "count",
        ratio: f64 => "ratio",
        label: String => "label",
        blob: Bytes => "blob",
        items: Vec<i32> => "items",
        lookup: IndexMap<String, String> => "lookup",
        [leaf] fixed: [i32; 3] => "fixed",
        side: Side => "side",
        nested: SmallDto => "nested",
        maybe: Option<String> => "maybe",
        any: Value => "any",
    }
}

fn everything() -> Everything {
    let mut lookup = IndexMap::new();
    lookup.insert("a".to_owned(), "1".to_owned());
    lookup.insert("b".to_owned(), "2".to_owned());
    Everything {
        flag: true,
        count: -7,
        ratio: 2.5,
        label: "every kind".to_owned(),
        blob: Bytes::from_static(b"\xde\xad\xbe\xef"),
        items: vec![1, 2, 3],
        lookup,
        fixed: [9, 8, 7],
        side: Side::Sell,
        nested: SmallDto { one: 11 },
        maybe: Some("present".to_owned()),
        any: Value::Typed("Wrapped".to_owned(), Box::new(Value::I64(5))),
    }
}

#[rstest]
#[case::text(WireConfig::Text)]
#[case::binary(WireConfig::Binary)]
#[case::json(WireConfig::Json)]
fn marshalled_records_round_trip(#[case] config: WireConfig) {
    register_wrapped();
    let mut original = everything();
    if config == WireConfig::Json {
        // The JSON profile carries no type tags.
        original.any = Value::I64(5);
    }
    let mut wire = config.build(ElasticBuffer::new());
    wire.write_document(false, |doc| original.write_field(doc.field("all")?))
        .expect("write");

    let mut doc = wire.read_document().expect("read");
    let fields = doc.fields().expect("fields");
    let input = fields.read_field("all").expect("all").expect("present");
    let restored = Everything::from_wire(input).expect("restore");
    assert!(records_equal(&restored, &original), "through {config:?}");
}

#[test]
fn deep_copy_routes_through_a_binary_wire() {
    register_wrapped();
    let original = everything();
    let copied = deep_copy(&original).expect("copy");
    assert!(records_equal(&copied, &original));
}

#[test]
fn descriptor_embedding_orders_base_fields_first() {
    // Built by hand rather than by macro, the way a generated
    // descriptor would compose.
    #[derive(Debug, Default)]
    struct Extended {
        base: SmallDto,
        more: i64,
    }

    impl WireRecord for Extended {
        fn descriptor() -> &'static Descriptor<Self> {
            static DESCRIPTOR: std::sync::LazyLock<Descriptor<Extended>> =
                std::sync::LazyLock::new(|| {
                    Descriptor::new("Extended")
                        .embed::<SmallDto>(|t: &Extended| &t.base, |t: &mut Extended| &mut t.base)
                        .with_field(FieldAccessor::new(
                            "more",
                            |t: &Extended| &t.more,
                            |t: &mut Extended| &mut t.more,
                        ))
                });
            &DESCRIPTOR
        }

        fn default_record() -> Self {
            Self::default()
        }
    }

    let mut wire = WireConfig::Text.build(ElasticBuffer::new());
    let value = Extended {
        base: SmallDto { one: 5 },
        more: 6,
    };
    wire.write_document(false, |doc| value.write_to(doc.field("x")?))
        .expect("write");

    let framed = wire.bytes();
    let payload = std::str::from_utf8(&framed[4..]).expect("utf8");
    assert_eq!(
        payload,
        indoc! {"
            x: {
              one: 5,
              more: 6
            }
        "}
    );
}

#[test]
fn compressed_blob_survives_both_encodings() {
    let payload: Vec<u8> = (0..256u16).map(|b| b as u8).cycle().take(2048).collect();
    for config in [WireConfig::Text, WireConfig::Binary] {
        let mut wire = config.build(ElasticBuffer::new());
        wire.write_document(false, |doc| {
            doc.field("blob")?.write_compressed("gzip", &payload)
        })
        .expect("write");
        let mut doc = wire.read_document().expect("read");
        let fields = doc.fields().expect("fields");
        let input = fields.read_field("blob").expect("blob").expect("present");
        assert_eq!(input.read_compressed().expect("inflate"), payload);
    }
}
