//! Total coercion of every variant kind to f64
//!
//! Used by the interpreter for arithmetic contexts. The coercion is
//! total: every kind maps to some double, with containers summing their
//! children (NaN propagates, ordering does not matter).

use crate::variant::Variant;

/// strtod-style prefix parse; empty or non-numeric text is 0.0.
fn numerify_str(s: &str) -> f64 {
    let s = s.trim_start();
    if s.is_empty() {
        return 0.0;
    }
    s[..longest_float_prefix(s)].parse::<f64>().unwrap_or(0.0)
}

/// Length of the longest prefix of `s` that parses as an f64.
fn longest_float_prefix(s: &str) -> usize {
    let mut best = 0;
    for end in (1..=s.len()).rev() {
        if s.is_char_boundary(end) && s[..end].parse::<f64>().is_ok() {
            best = end;
            break;
        }
    }
    best
}

/// Coerce `v` to f64.
pub fn numerify(v: &Variant) -> f64 {
    match v {
        Variant::Null | Variant::Undefined => 0.0,
        Variant::Boolean(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Variant::Number(f) | Variant::LongDouble(f) => *f,
        Variant::LongInt(i) => *i as f64,
        Variant::ULongInt(u) => *u as f64,
        Variant::Exception(a) | Variant::AtomString(a) => numerify_str(a.as_str()),
        Variant::String(d) => numerify_str(d.as_str()),
        Variant::BigInt(d) => d.value().to_f64(),
        Variant::ByteSeq(d) => {
            // little-endian reinterpretation of the first 8 bytes as a
            // signed integer
            let bytes = d.as_bytes();
            if bytes.is_empty() {
                return 0.0;
            }
            let mut buf = [0u8; 8];
            let n = bytes.len().min(8);
            buf[..n].copy_from_slice(&bytes[..n]);
            i64::from_le_bytes(buf) as f64
        }
        Variant::Dynamic(d) => match d.getter() {
            Some(getter) => match (getter.as_ref())(&[], true) {
                Ok(out) => numerify(&out),
                Err(_) => 0.0,
            },
            None => 0.0,
        },
        Variant::Native(d) => match d.ops().property_getter("__number") {
            Some(method) => match (method.as_ref())(&[], true) {
                Ok(out) => numerify(&out),
                Err(_) => 0.0,
            },
            None => 0.0,
        },
        Variant::Object(data) => data
            .borrow()
            .entries_cloned()
            .iter()
            .map(|(_, v)| numerify(v))
            .sum(),
        Variant::Array(data) => data
            .borrow()
            .elements_cloned()
            .iter()
            .map(numerify)
            .sum(),
        Variant::Set(data) => data
            .borrow()
            .members_ordered()
            .iter()
            .map(numerify)
            .sum(),
        Variant::Tuple(data) => data
            .borrow()
            .members_cloned()
            .iter()
            .map(numerify)
            .sum(),
        Variant::SortedArray(data) => data
            .borrow()
            .elements_cloned()
            .iter()
            .map(numerify)
            .sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bigint::BigInt;

    #[test]
    fn test_scalars() {
        assert_eq!(numerify(&Variant::null()), 0.0);
        assert_eq!(numerify(&Variant::undefined()), 0.0);
        assert_eq!(numerify(&Variant::boolean(true)), 1.0);
        assert_eq!(numerify(&Variant::boolean(false)), 0.0);
        assert_eq!(numerify(&Variant::longint(-5)), -5.0);
        assert_eq!(numerify(&Variant::ulongint(7)), 7.0);
        assert_eq!(numerify(&Variant::number(2.5)), 2.5);
    }

    #[test]
    fn test_strings() {
        assert_eq!(numerify(&Variant::string("")), 0.0);
        assert_eq!(numerify(&Variant::string("12.5")), 12.5);
        assert_eq!(numerify(&Variant::string("  -3e2xyz")), -300.0);
        assert_eq!(numerify(&Variant::string("abc")), 0.0);
        assert_eq!(numerify(&Variant::atom_string("42")), 42.0);
    }

    #[test]
    fn test_byte_seq_little_endian() {
        assert_eq!(numerify(&Variant::byte_seq(&[])), 0.0);
        assert_eq!(numerify(&Variant::byte_seq(&[1])), 1.0);
        assert_eq!(numerify(&Variant::byte_seq(&[0, 1])), 256.0);
        // trailing bytes beyond eight are ignored
        assert_eq!(
            numerify(&Variant::byte_seq(&[2, 0, 0, 0, 0, 0, 0, 0, 0xFF])),
            2.0
        );
    }

    #[test]
    fn test_bigint() {
        let v = Variant::bigint(BigInt::parse("-0x10", 0).unwrap());
        assert_eq!(numerify(&v), -16.0);
    }

    #[test]
    fn test_containers_sum() {
        let arr = Variant::array_from([
            Variant::longint(1),
            Variant::longint(2),
            Variant::string("3"),
        ]);
        assert_eq!(numerify(&arr), 6.0);

        let obj = Variant::object();
        obj.object_set("a", Variant::longint(10)).unwrap();
        obj.object_set("b", arr).unwrap();
        assert_eq!(numerify(&obj), 16.0);
    }

    #[test]
    fn test_nan_propagates() {
        let arr = Variant::array_from([Variant::number(f64::NAN), Variant::longint(1)]);
        assert!(numerify(&arr).is_nan());
    }
}
