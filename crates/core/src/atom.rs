//! Interned atoms
//!
//! An atom is a process-wide interned string: two atoms with the same
//! content always compare equal by identity, which makes them cheap keys
//! for exception tags, event names, and endpoint identifiers.
//!
//! Interned strings are never freed. The registry leaks each distinct
//! string exactly once and hands out `&'static str` slices, so `as_str`
//! needs no locking after the initial intern.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, OnceLock};

/// A handle to an interned string. Zero is reserved for "no atom", hence
/// the non-zero representation (`Option<Atom>` is pointer-sized).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Atom(NonZeroU32);

struct Registry {
    by_str: HashMap<&'static str, Atom>,
    by_id: Vec<&'static str>,
}

static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();

fn registry() -> &'static Mutex<Registry> {
    REGISTRY.get_or_init(|| {
        Mutex::new(Registry {
            by_str: HashMap::new(),
            by_id: Vec::new(),
        })
    })
}

impl Atom {
    /// Intern `s`, returning the existing atom if the content was seen
    /// before on any thread.
    pub fn intern(s: &str) -> Atom {
        let mut reg = registry().lock().unwrap();
        if let Some(&atom) = reg.by_str.get(s) {
            return atom;
        }

        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        let id = u32::try_from(reg.by_id.len() + 1).expect("atom registry exhausted");
        let atom = Atom(NonZeroU32::new(id).unwrap());
        reg.by_id.push(leaked);
        reg.by_str.insert(leaked, atom);
        atom
    }

    /// Look up an existing atom without interning.
    pub fn find(s: &str) -> Option<Atom> {
        let reg = registry().lock().unwrap();
        reg.by_str.get(s).copied()
    }

    /// The interned content.
    pub fn as_str(self) -> &'static str {
        let reg = registry().lock().unwrap();
        reg.by_id[(self.0.get() - 1) as usize]
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The standard exception tags, pre-interned so they can be compared
/// against without taking the registry lock on the fast path.
pub mod except {
    use super::Atom;
    use std::sync::OnceLock;

    macro_rules! exception_tags {
        ($($fn_name:ident => $tag:literal),+ $(,)?) => {
            $(
                #[doc = concat!("The `", $tag, "` exception tag.")]
                pub fn $fn_name() -> Atom {
                    static CACHE: OnceLock<Atom> = OnceLock::new();
                    *CACHE.get_or_init(|| Atom::intern($tag))
                }
            )+
        };
    }

    exception_tags! {
        bad_encoding => "BadEncoding",
        bad_name => "BadName",
        bad_value => "BadValue",
        duplicate_key => "DuplicateKey",
        entity_gone => "EntityGone",
        invalid_value => "InvalidValue",
        max_iteration_count => "MaxIterationCount",
        memory_failure => "MemoryFailure",
        no_data => "NoData",
        not_ready => "NotReady",
        os_failure => "OSFailure",
        overflow => "Overflow",
        timeout => "Timeout",
        wrong_data_type => "WrongDataType",
        zero_divisor => "ZeroDivisor",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedup() {
        let a = Atom::intern("hello");
        let b = Atom::intern("hello");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "hello");
    }

    #[test]
    fn test_distinct_content_distinct_atoms() {
        let a = Atom::intern("alpha");
        let b = Atom::intern("beta");
        assert_ne!(a, b);
    }

    #[test]
    fn test_find() {
        let a = Atom::intern("find-me");
        assert_eq!(Atom::find("find-me"), Some(a));
        assert_eq!(Atom::find("never-interned-xyzzy"), None);
    }

    #[test]
    fn test_exception_tags_are_stable() {
        assert_eq!(except::zero_divisor(), except::zero_divisor());
        assert_eq!(except::overflow().as_str(), "Overflow");
    }

    #[test]
    fn test_cross_thread_identity() {
        let a = Atom::intern("shared-tag");
        let handle = std::thread::spawn(|| Atom::intern("shared-tag"));
        let b = handle.join().unwrap();
        assert_eq!(a, b);
    }
}
