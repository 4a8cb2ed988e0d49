//! Randomized round-trip coverage for the document codec: for every
//! generated document `d`, `decode(encode(d)) == d`, and re-encoding the
//! decoded form reproduces the original bytes.

use bson::{Bson, Document};
use oxgate::wire::decode_document_strict;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random_scalar(rng: &mut StdRng) -> Bson {
    match rng.gen_range(0..12) {
        0 => Bson::Double(rng.gen_range(-1_000_000i32..1_000_000) as f64 / 7.0),
        1 => {
            let len = rng.gen_range(0..24);
            let s: String = (0..len)
                .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
                .collect();
            Bson::String(s)
        }
        2 => {
            let mut bytes = vec![0u8; rng.gen_range(0..32)];
            rng.fill(&mut bytes[..]);
            Bson::Binary(bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes,
            })
        }
        3 => {
            let mut bytes = [0u8; 12];
            rng.fill(&mut bytes);
            Bson::ObjectId(bson::oid::ObjectId::from_bytes(bytes))
        }
        4 => Bson::Boolean(rng.r#gen()),
        5 => Bson::DateTime(bson::DateTime::from_millis(
            rng.gen_range(-253_402_300_800_000i64..253_402_300_799_999),
        )),
        6 => Bson::Null,
        7 => Bson::RegularExpression(bson::Regex {
            pattern: "^a[bc]+$".to_string(),
            options: "i".to_string(),
        }),
        8 => Bson::Int32(rng.r#gen()),
        9 => Bson::Timestamp(bson::Timestamp {
            time: rng.r#gen(),
            increment: rng.r#gen(),
        }),
        10 => Bson::Int64(rng.r#gen()),
        _ => {
            let mut bytes = [0u8; 16];
            rng.fill(&mut bytes);
            Bson::Decimal128(bson::Decimal128::from_bytes(bytes))
        }
    }
}

fn random_value(rng: &mut StdRng, depth: u32) -> Bson {
    if depth > 0 && rng.gen_range(0..4) == 0 {
        if rng.r#gen::<bool>() {
            Bson::Document(random_document(rng, depth - 1))
        } else {
            let len = rng.gen_range(0..5);
            Bson::Array((0..len).map(|_| random_value(rng, depth - 1)).collect())
        }
    } else {
        random_scalar(rng)
    }
}

fn random_document(rng: &mut StdRng, depth: u32) -> Document {
    let mut doc = Document::new();
    let fields = rng.gen_range(0..8);
    for i in 0..fields {
        doc.insert(format!("k{i}"), random_value(rng, depth));
    }
    doc
}

#[test]
fn random_documents_round_trip_byte_identical() {
    let mut rng = StdRng::seed_from_u64(0x0c5f_97ab);
    for case in 0..500 {
        let doc = random_document(&mut rng, 5);
        let bytes = bson::to_vec(&doc).unwrap();

        let (decoded, consumed) = decode_document_strict(&bytes).unwrap();
        assert_eq!(consumed, bytes.len(), "case {case}");

        let reencoded = bson::to_vec(&decoded).unwrap();
        assert_eq!(reencoded, bytes, "case {case}: bytes diverged");
    }
}

#[test]
fn random_documents_preserve_field_order() {
    let mut rng = StdRng::seed_from_u64(0xfeed_beef);
    for _ in 0..100 {
        let doc = random_document(&mut rng, 3);
        let bytes = bson::to_vec(&doc).unwrap();
        let (decoded, _) = decode_document_strict(&bytes).unwrap();
        let original: Vec<&String> = doc.keys().collect();
        let parsed: Vec<&String> = decoded.keys().collect();
        assert_eq!(original, parsed);
    }
}

#[test]
fn deeply_nested_document_round_trips() {
    let mut doc = Document::new();
    doc.insert("leaf", Bson::Int32(1));
    for _ in 0..100 {
        let mut outer = Document::new();
        outer.insert("n", Bson::Document(doc));
        doc = outer;
    }
    let bytes = bson::to_vec(&doc).unwrap();
    let (decoded, consumed) = decode_document_strict(&bytes).unwrap();
    assert_eq!(consumed, bytes.len());
    assert_eq!(bson::to_vec(&decoded).unwrap(), bytes);
}

#[test]
fn decimal128_edge_patterns_round_trip() {
    // Raw bit patterns covering zero, max-significand, NaN and infinity
    // encodings; the codec must pass them through untouched.
    let patterns: [[u8; 16]; 4] = [
        [0u8; 16],
        [0xff; 16],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x7c],
        [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0xf8],
    ];
    for bytes in patterns {
        let mut doc = Document::new();
        doc.insert("d", Bson::Decimal128(bson::Decimal128::from_bytes(bytes)));
        let encoded = bson::to_vec(&doc).unwrap();
        let (decoded, _) = decode_document_strict(&encoded).unwrap();
        assert_eq!(bson::to_vec(&decoded).unwrap(), encoded);
    }
}
