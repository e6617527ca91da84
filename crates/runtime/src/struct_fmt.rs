//! Binary struct formats for readstruct/writestruct
//!
//! A format string is a whitespace- or colon-separated list of tokens:
//!
//! | Token | Meaning |
//! |-------|---------|
//! | `i8` `i16` `i32` `i64` | signed integer, native endian |
//! | `u8` `u16` `u32` `u64` | unsigned integer, native endian |
//! | `...le` / `...be`      | explicit little/big endian suffix |
//! | `f32` `f64`            | IEEE float, endian suffix allowed |
//! | `s<n>`                 | UTF-8 string in a fixed n-byte field |
//! | `b<n>`                 | byte sequence of n bytes |
//! | `p<n>`                 | n bytes of padding (skipped / zeroed) |
//!
//! Reading yields one variant per non-padding token, packed into a
//! tuple; writing consumes one argument per non-padding token.

use crate::error::{set_last_error, Error};
use vellum_core::Variant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Native,
    Little,
    Big,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Int { bytes: usize, signed: bool, endian: Endian },
    Float { bytes: usize, endian: Endian },
    Str { bytes: usize },
    Bytes { bytes: usize },
    Padding { bytes: usize },
}

impl Token {
    fn wire_size(&self) -> usize {
        match self {
            Token::Int { bytes, .. }
            | Token::Float { bytes, .. }
            | Token::Str { bytes }
            | Token::Bytes { bytes }
            | Token::Padding { bytes } => *bytes,
        }
    }

    fn consumes_arg(&self) -> bool {
        !matches!(self, Token::Padding { .. })
    }
}

fn parse_token(tok: &str) -> Result<Token, Error> {
    let (head, endian) = if let Some(h) = tok.strip_suffix("le") {
        (h, Endian::Little)
    } else if let Some(h) = tok.strip_suffix("be") {
        (h, Endian::Big)
    } else {
        (tok, Endian::Native)
    };

    let num = |s: &str| -> Result<usize, Error> {
        s.parse::<usize>()
            .map_err(|_| set_last_error(Error::InvalidValue))
    };

    match head {
        "i8" => Ok(Token::Int { bytes: 1, signed: true, endian }),
        "i16" => Ok(Token::Int { bytes: 2, signed: true, endian }),
        "i32" => Ok(Token::Int { bytes: 4, signed: true, endian }),
        "i64" => Ok(Token::Int { bytes: 8, signed: true, endian }),
        "u8" => Ok(Token::Int { bytes: 1, signed: false, endian }),
        "u16" => Ok(Token::Int { bytes: 2, signed: false, endian }),
        "u32" => Ok(Token::Int { bytes: 4, signed: false, endian }),
        "u64" => Ok(Token::Int { bytes: 8, signed: false, endian }),
        "f32" => Ok(Token::Float { bytes: 4, endian }),
        "f64" => Ok(Token::Float { bytes: 8, endian }),
        _ => {
            // sized tokens reject an endian suffix, so reparse the raw text
            if let Some(n) = tok.strip_prefix('s') {
                Ok(Token::Str { bytes: num(n)? })
            } else if let Some(n) = tok.strip_prefix('b') {
                Ok(Token::Bytes { bytes: num(n)? })
            } else if let Some(n) = tok.strip_prefix('p') {
                Ok(Token::Padding { bytes: num(n)? })
            } else {
                Err(set_last_error(Error::InvalidValue))
            }
        }
    }
}

fn parse_format(fmt: &str) -> Result<Vec<Token>, Error> {
    let toks: Vec<Token> = fmt
        .split(|c: char| c.is_whitespace() || c == ':')
        .filter(|t| !t.is_empty())
        .map(parse_token)
        .collect::<Result<_, _>>()?;
    if toks.is_empty() {
        return Err(set_last_error(Error::InvalidValue));
    }
    Ok(toks)
}

/// Total wire size of a format.
pub fn format_size(fmt: &str) -> Result<usize, Error> {
    Ok(parse_format(fmt)?.iter().map(Token::wire_size).sum())
}

fn order_bytes(buf: &mut [u8], endian: Endian) {
    let big = match endian {
        Endian::Native => cfg!(target_endian = "big"),
        Endian::Little => false,
        Endian::Big => true,
    };
    if big {
        buf.reverse();
    }
}

/// Decode `data` per `fmt` into one variant per non-padding token.
pub fn unpack(fmt: &str, data: &[u8]) -> Result<Vec<Variant>, Error> {
    let toks = parse_format(fmt)?;
    let need: usize = toks.iter().map(Token::wire_size).sum();
    if data.len() < need {
        return Err(set_last_error(Error::InvalidValue));
    }

    let mut out = Vec::new();
    let mut pos = 0usize;
    for tok in &toks {
        let field = &data[pos..pos + tok.wire_size()];
        pos += tok.wire_size();
        match tok {
            Token::Padding { .. } => {}
            Token::Int { bytes, signed, endian } => {
                let mut buf = [0u8; 8];
                buf[..*bytes].copy_from_slice(field);
                order_bytes(&mut buf[..*bytes], *endian);
                let raw = u64::from_le_bytes(buf);
                if *signed {
                    // sign-extend from the field width
                    let shift = 64 - bytes * 8;
                    out.push(Variant::longint(((raw << shift) as i64) >> shift));
                } else {
                    out.push(Variant::ulongint(raw));
                }
            }
            Token::Float { bytes, endian } => {
                let mut buf = [0u8; 8];
                buf[..*bytes].copy_from_slice(field);
                order_bytes(&mut buf[..*bytes], *endian);
                let v = if *bytes == 4 {
                    f32::from_le_bytes(buf[..4].try_into().unwrap()) as f64
                } else {
                    f64::from_le_bytes(buf)
                };
                out.push(Variant::number(v));
            }
            Token::Str { .. } => {
                // the field is NUL-padded; take up to the first NUL
                let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
                let s = std::str::from_utf8(&field[..end])
                    .map_err(|_| set_last_error(Error::InvalidValue))?;
                out.push(Variant::string(s));
            }
            Token::Bytes { .. } => out.push(Variant::byte_seq(field)),
        }
    }
    Ok(out)
}

/// Encode `args` per `fmt` into wire bytes.
pub fn pack(fmt: &str, args: &[Variant]) -> Result<Vec<u8>, Error> {
    let toks = parse_format(fmt)?;
    let needed = toks.iter().filter(|t| t.consumes_arg()).count();
    if args.len() < needed {
        return Err(set_last_error(Error::ArgumentMissed));
    }

    let mut out = Vec::with_capacity(toks.iter().map(Token::wire_size).sum());
    let mut arg = args.iter();
    for tok in &toks {
        match tok {
            Token::Padding { bytes } => out.extend(std::iter::repeat(0u8).take(*bytes)),
            Token::Int { bytes, signed, endian } => {
                let v = arg.next().unwrap();
                let raw = if *signed {
                    v.cast_to_i64(true)? as u64
                } else {
                    v.cast_to_u64(true)?
                };
                let mut buf = raw.to_le_bytes();
                order_bytes(&mut buf[..*bytes], *endian);
                out.extend_from_slice(&buf[..*bytes]);
            }
            Token::Float { bytes, endian } => {
                let v = vellum_core::numerify(arg.next().unwrap());
                if *bytes == 4 {
                    let mut buf = (v as f32).to_le_bytes();
                    order_bytes(&mut buf, *endian);
                    out.extend_from_slice(&buf);
                } else {
                    let mut buf = v.to_le_bytes();
                    order_bytes(&mut buf, *endian);
                    out.extend_from_slice(&buf);
                }
            }
            Token::Str { bytes } => {
                let v = arg.next().unwrap();
                let s = v
                    .as_str()
                    .ok_or_else(|| set_last_error(Error::WrongDataType))?;
                let mut field = vec![0u8; *bytes];
                let n = s.len().min(*bytes);
                field[..n].copy_from_slice(&s.as_bytes()[..n]);
                out.extend_from_slice(&field);
            }
            Token::Bytes { bytes } => {
                let v = arg.next().unwrap();
                let b = v
                    .as_bytes()
                    .ok_or_else(|| set_last_error(Error::WrongDataType))?;
                let mut field = vec![0u8; *bytes];
                let n = b.len().min(*bytes);
                field[..n].copy_from_slice(&b[..n]);
                out.extend_from_slice(&field);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_ints() {
        let fmt = "i8 u8 i16le u16be i32le u32be i64le u64be";
        let args = vec![
            Variant::longint(-5),
            Variant::ulongint(200),
            Variant::longint(-1000),
            Variant::ulongint(1000),
            Variant::longint(-123456),
            Variant::ulongint(123456),
            Variant::longint(i64::MIN),
            Variant::ulongint(u64::MAX),
        ];
        let wire = pack(fmt, &args).unwrap();
        assert_eq!(wire.len(), format_size(fmt).unwrap());
        let back = unpack(fmt, &wire).unwrap();
        for (a, b) in args.iter().zip(back.iter()) {
            assert!(a.equals(b), "{a:?} != {b:?}");
        }
    }

    #[test]
    fn test_round_trip_floats() {
        let fmt = "f32 f64be f64le";
        let args = vec![
            Variant::number(1.5),
            Variant::number(-2.25),
            Variant::number(3.14159),
        ];
        let wire = pack(fmt, &args).unwrap();
        let back = unpack(fmt, &wire).unwrap();
        assert_eq!(vellum_core::numerify(&back[0]), 1.5);
        assert_eq!(vellum_core::numerify(&back[1]), -2.25);
        assert_eq!(vellum_core::numerify(&back[2]), 3.14159);
    }

    #[test]
    fn test_strings_and_bytes() {
        let fmt = "s8 b4 p2 u8";
        let args = vec![
            Variant::string("hey"),
            Variant::byte_seq(&[1, 2, 3, 4]),
            Variant::ulongint(7),
        ];
        let wire = pack(fmt, &args).unwrap();
        assert_eq!(wire.len(), 8 + 4 + 2 + 1);
        let back = unpack(fmt, &wire).unwrap();
        assert_eq!(back.len(), 3); // padding yields nothing
        assert_eq!(back[0].as_str().unwrap(), "hey");
        assert_eq!(back[1].as_bytes().unwrap(), &[1, 2, 3, 4]);
        assert_eq!(back[2].cast_to_i64(false).unwrap(), 7);
    }

    #[test]
    fn test_string_truncation() {
        let wire = pack("s4", &[Variant::string("too long")]).unwrap();
        let back = unpack("s4", &wire).unwrap();
        assert_eq!(back[0].as_str().unwrap(), "too ");
    }

    #[test]
    fn test_colon_separator() {
        assert_eq!(format_size("u16le:u16le").unwrap(), 4);
    }

    #[test]
    fn test_errors() {
        assert!(parse_format("q9").is_err());
        assert!(unpack("u32", &[0, 1]).is_err());
        assert!(pack("u32 u32", &[Variant::ulongint(1)]).is_err());
        assert!(pack("s4", &[Variant::longint(1)]).is_err());
    }
}
