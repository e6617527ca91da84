//! Recursive stringification through a byte sink
//!
//! Feeds a textual rendition of a variant to a caller-supplied sink.
//! Mappings separate key from value with `:` and entries with newlines;
//! sequences separate values with newlines. Byte sequences render as
//! uppercase hex.

use crate::error::Error;
use crate::numerify::numerify;
use crate::variant::Variant;

/// The byte sink; a non-`Ok` return aborts the walk.
pub type Sink<'a> = &'a mut dyn FnMut(&[u8]) -> Result<(), Error>;

fn put(sink: Sink, s: &str) -> Result<(), Error> {
    sink(s.as_bytes())
}

/// Stringify `v` into `sink`.
pub fn stringify(v: &Variant, sink: Sink) -> Result<(), Error> {
    match v {
        Variant::Null => put(sink, "null"),
        Variant::Undefined => put(sink, "undefined"),
        Variant::Boolean(b) => put(sink, if *b { "true" } else { "false" }),
        Variant::Number(f) | Variant::LongDouble(f) => put(sink, &format_double(*f)),
        Variant::LongInt(i) => put(sink, &i.to_string()),
        Variant::ULongInt(u) => put(sink, &u.to_string()),
        Variant::Exception(a) | Variant::AtomString(a) => put(sink, a.as_str()),
        Variant::String(d) => put(sink, d.as_str()),
        Variant::BigInt(d) => put(sink, &d.value().to_string()),
        Variant::ByteSeq(d) => {
            for b in d.as_bytes() {
                put(sink, &format!("{b:02X}"))?;
            }
            Ok(())
        }
        Variant::Dynamic(_) => put(sink, &format!("<dynamic: {:#x}>", v.ptr_id())),
        Variant::Native(_) => put(sink, &format!("<native: {:#x}>", v.ptr_id())),
        Variant::Object(data) => {
            for (k, val) in data.borrow().entries_cloned() {
                put(sink, &k)?;
                put(sink, ":")?;
                stringify(&val, sink)?;
                put(sink, "\n")?;
            }
            Ok(())
        }
        Variant::Array(data) => stringify_seq(&data.borrow().elements_cloned(), sink),
        Variant::Set(data) => stringify_seq(&data.borrow().members_ordered(), sink),
        Variant::Tuple(data) => stringify_seq(&data.borrow().members_cloned(), sink),
        Variant::SortedArray(data) => stringify_seq(&data.borrow().elements_cloned(), sink),
    }
}

fn stringify_seq(elems: &[Variant], sink: Sink) -> Result<(), Error> {
    for e in elems {
        stringify(e, sink)?;
        put(sink, "\n")?;
    }
    Ok(())
}

/// Stringify into an owned String.
pub fn stringify_to_string(v: &Variant) -> String {
    let mut out = Vec::new();
    let mut sink = |bytes: &[u8]| {
        out.extend_from_slice(bytes);
        Ok(())
    };
    stringify(v, &mut sink).expect("vec sink cannot fail");
    String::from_utf8(out).expect("stringify emits UTF-8")
}

fn format_double(f: f64) -> String {
    if f == f.trunc() && f.is_finite() && f.abs() < 1e15 {
        format!("{f:.0}")
    } else {
        format!("{f}")
    }
}

/// Convenience: numerify then render like a number variant would.
pub fn numerify_to_string(v: &Variant) -> String {
    format_double(numerify(v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars() {
        assert_eq!(stringify_to_string(&Variant::null()), "null");
        assert_eq!(stringify_to_string(&Variant::boolean(true)), "true");
        assert_eq!(stringify_to_string(&Variant::longint(-3)), "-3");
        assert_eq!(stringify_to_string(&Variant::string("hi")), "hi");
        assert_eq!(stringify_to_string(&Variant::number(2.0)), "2");
        assert_eq!(stringify_to_string(&Variant::number(2.5)), "2.5");
    }

    #[test]
    fn test_byte_seq_hex() {
        assert_eq!(
            stringify_to_string(&Variant::byte_seq(&[0xDE, 0xAD, 0x01])),
            "DEAD01"
        );
    }

    #[test]
    fn test_object_layout() {
        let obj = Variant::object();
        obj.object_set("a", Variant::longint(1)).unwrap();
        obj.object_set("b", Variant::string("x")).unwrap();
        assert_eq!(stringify_to_string(&obj), "a:1\nb:x\n");
    }

    #[test]
    fn test_array_layout() {
        let arr = Variant::array_from([Variant::longint(1), Variant::longint(2)]);
        assert_eq!(stringify_to_string(&arr), "1\n2\n");
    }

    #[test]
    fn test_nested() {
        let obj = Variant::object();
        obj.object_set(
            "xs",
            Variant::array_from([Variant::longint(1), Variant::longint(2)]),
        )
        .unwrap();
        assert_eq!(stringify_to_string(&obj), "xs:1\n2\n\n");
    }

    #[test]
    fn test_sink_abort() {
        let mut calls = 0;
        let mut sink = |_: &[u8]| {
            calls += 1;
            if calls > 2 {
                Err(Error::IoFailure)
            } else {
                Ok(())
            }
        };
        let arr = Variant::array_from([
            Variant::longint(1),
            Variant::longint(2),
            Variant::longint(3),
        ]);
        assert!(stringify(&arr, &mut sink).is_err());
    }
}
