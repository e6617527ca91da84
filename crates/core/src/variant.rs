//! The variant value model
//!
//! A `Variant` is the polymorphic value the interpreter talks about: a
//! single tagged union covering scalars, strings, binary payloads, bigints,
//! foreign values, and five container kinds.
//!
//! Scalars live inline in the enum and are never allocated; the per-heap
//! "singletons" of the original design are simply the enum variants
//! themselves. Allocated kinds hold an `Rc` payload: cloning a `Variant`
//! bumps a reference count, dropping the last handle releases the payload
//! and its heap accounting. Containers use `Rc<RefCell<..>>` because they
//! mutate in place; the runtime is single-threaded per instance, so no
//! locking is involved (cross-instance transfer goes through `move_heap`).

use crate::array::ArrData;
use crate::atom::Atom;
use crate::bigint::BigInt;
use crate::error::{set_last_error, Error};
use crate::heap::{self, INLINE_PAYLOAD};
use crate::object::ObjData;
use crate::set::SetData;
use crate::sorted::SortedData;
use crate::tuple::TupleData;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::rc::Rc;

/// Number of variant kinds, for per-kind statistics arrays.
pub const NR_KINDS: usize = 19;

/// The kind tag of a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum Kind {
    Null = 0,
    Undefined,
    Boolean,
    Exception,
    Number,
    LongInt,
    ULongInt,
    LongDouble,
    AtomString,
    String,
    ByteSeq,
    BigInt,
    Dynamic,
    Native,
    Object,
    Array,
    Set,
    Tuple,
    SortedArray,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Null => "null",
            Kind::Undefined => "undefined",
            Kind::Boolean => "boolean",
            Kind::Exception => "exception",
            Kind::Number => "number",
            Kind::LongInt => "longint",
            Kind::ULongInt => "ulongint",
            Kind::LongDouble => "longdouble",
            Kind::AtomString => "atomstring",
            Kind::String => "string",
            Kind::ByteSeq => "bsequence",
            Kind::BigInt => "bigint",
            Kind::Dynamic => "dynamic",
            Kind::Native => "native",
            Kind::Object => "object",
            Kind::Array => "array",
            Kind::Set => "set",
            Kind::Tuple => "tuple",
            Kind::SortedArray => "sortedarray",
        }
    }

    /// Containers participate in the reverse-update graph; everything
    /// else is immutable once constructed.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            Kind::Object | Kind::Array | Kind::Set | Kind::Tuple | Kind::SortedArray
        )
    }
}

// ---------------------------------------------------------------------------
// allocated payloads

pub struct StringData {
    value: Box<str>,
}

impl StringData {
    pub(crate) fn new(s: &str) -> Rc<StringData> {
        let data = StringData { value: s.into() };
        heap::account_alloc(Kind::String, data.extra_size());
        Rc::new(data)
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Out-of-line size: payload plus terminating NUL once it no longer
    /// fits the inline storage.
    pub(crate) fn extra_size(&self) -> usize {
        if self.value.len() + 1 > INLINE_PAYLOAD {
            self.value.len() + 1
        } else {
            0
        }
    }
}

impl Drop for StringData {
    fn drop(&mut self) {
        heap::account_free(Kind::String, self.extra_size());
    }
}

pub struct ByteSeqData {
    value: Box<[u8]>,
}

impl ByteSeqData {
    pub(crate) fn new(bytes: &[u8]) -> Rc<ByteSeqData> {
        let data = ByteSeqData {
            value: bytes.into(),
        };
        heap::account_alloc(Kind::ByteSeq, data.extra_size());
        Rc::new(data)
    }

    pub(crate) fn from_vec(bytes: Vec<u8>) -> Rc<ByteSeqData> {
        let data = ByteSeqData {
            value: bytes.into_boxed_slice(),
        };
        heap::account_alloc(Kind::ByteSeq, data.extra_size());
        Rc::new(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.value
    }

    pub(crate) fn extra_size(&self) -> usize {
        if self.value.len() > INLINE_PAYLOAD {
            self.value.len()
        } else {
            0
        }
    }
}

impl Drop for ByteSeqData {
    fn drop(&mut self) {
        heap::account_free(Kind::ByteSeq, self.extra_size());
    }
}

pub struct BigIntData {
    value: BigInt,
}

impl BigIntData {
    pub(crate) fn new(value: BigInt) -> Rc<BigIntData> {
        let data = BigIntData { value };
        heap::account_alloc(Kind::BigInt, data.extra_size());
        Rc::new(data)
    }

    pub fn value(&self) -> &BigInt {
        &self.value
    }

    /// Limbs beyond the single inline one are out-of-line.
    pub(crate) fn extra_size(&self) -> usize {
        (self.value.nr_limbs() - 1) * 8
    }
}

impl Drop for BigIntData {
    fn drop(&mut self) {
        heap::account_free(Kind::BigInt, self.extra_size());
    }
}

/// A foreign getter/setter method: receives arguments and a `silently`
/// flag, returns a variant.
pub type DynMethod = Rc<dyn Fn(&[Variant], bool) -> Result<Variant, Error>>;

pub struct DynamicData {
    getter: Option<DynMethod>,
    setter: Option<DynMethod>,
}

impl DynamicData {
    pub fn getter(&self) -> Option<&DynMethod> {
        self.getter.as_ref()
    }

    pub fn setter(&self) -> Option<&DynMethod> {
        self.setter.as_ref()
    }
}

impl Drop for DynamicData {
    fn drop(&mut self) {
        heap::account_free(Kind::Dynamic, 0);
    }
}

/// A property method resolved from a native entity.
pub type NativeMethod = Rc<dyn Fn(&[Variant], bool) -> Result<Variant, Error>>;

/// The operations table a native entity carries. A protocol layer exposes
/// its own per-layer operations by overriding `property_getter` and
/// chaining to the layer below.
pub trait NativeOps {
    /// Resolve a named property to a callable method.
    fn property_getter(&self, name: &str) -> Option<NativeMethod>;

    /// The interpreter started observing `event`/`sub` on this entity.
    fn on_observe(&self, _event: &str, _sub: &str) -> bool {
        false
    }

    /// The interpreter stopped observing.
    fn on_forget(&self, _event: &str, _sub: &str) -> bool {
        false
    }

    /// The last variant handle is going away.
    fn on_release(&self) {}
}

pub struct NativeData {
    name: String,
    ops: Rc<dyn NativeOps>,
}

impl NativeData {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ops(&self) -> &Rc<dyn NativeOps> {
        &self.ops
    }
}

impl Drop for NativeData {
    fn drop(&mut self) {
        self.ops.on_release();
        heap::account_free(Kind::Native, 0);
    }
}

// ---------------------------------------------------------------------------
// the variant itself

#[derive(Clone)]
pub enum Variant {
    Null,
    Undefined,
    Boolean(bool),
    Exception(Atom),
    Number(f64),
    LongInt(i64),
    ULongInt(u64),
    LongDouble(f64),
    AtomString(Atom),
    String(Rc<StringData>),
    ByteSeq(Rc<ByteSeqData>),
    BigInt(Rc<BigIntData>),
    Dynamic(Rc<DynamicData>),
    Native(Rc<NativeData>),
    Object(Rc<RefCell<ObjData>>),
    Array(Rc<RefCell<ArrData>>),
    Set(Rc<RefCell<SetData>>),
    Tuple(Rc<RefCell<TupleData>>),
    SortedArray(Rc<RefCell<SortedData>>),
}

impl Variant {
    // -- scalar constructors

    pub fn null() -> Variant {
        Variant::Null
    }

    pub fn undefined() -> Variant {
        Variant::Undefined
    }

    pub fn boolean(b: bool) -> Variant {
        Variant::Boolean(b)
    }

    pub fn exception(tag: Atom) -> Variant {
        Variant::Exception(tag)
    }

    pub fn number(v: f64) -> Variant {
        Variant::Number(v)
    }

    pub fn longint(v: i64) -> Variant {
        Variant::LongInt(v)
    }

    pub fn ulongint(v: u64) -> Variant {
        Variant::ULongInt(v)
    }

    pub fn longdouble(v: f64) -> Variant {
        Variant::LongDouble(v)
    }

    pub fn atom_string(s: &str) -> Variant {
        Variant::AtomString(Atom::intern(s))
    }

    // -- allocated constructors

    pub fn string(s: &str) -> Variant {
        Variant::String(StringData::new(s))
    }

    pub fn byte_seq(bytes: &[u8]) -> Variant {
        Variant::ByteSeq(ByteSeqData::new(bytes))
    }

    /// Reuse a caller-built buffer without copying.
    pub fn byte_seq_reuse(bytes: Vec<u8>) -> Variant {
        Variant::ByteSeq(ByteSeqData::from_vec(bytes))
    }

    pub fn bigint(value: BigInt) -> Variant {
        Variant::BigInt(BigIntData::new(value))
    }

    pub fn dynamic(getter: Option<DynMethod>, setter: Option<DynMethod>) -> Variant {
        heap::account_alloc(Kind::Dynamic, 0);
        Variant::Dynamic(Rc::new(DynamicData { getter, setter }))
    }

    pub fn native(name: impl Into<String>, ops: Rc<dyn NativeOps>) -> Variant {
        heap::account_alloc(Kind::Native, 0);
        Variant::Native(Rc::new(NativeData {
            name: name.into(),
            ops,
        }))
    }

    // -- queries

    pub fn kind(&self) -> Kind {
        match self {
            Variant::Null => Kind::Null,
            Variant::Undefined => Kind::Undefined,
            Variant::Boolean(_) => Kind::Boolean,
            Variant::Exception(_) => Kind::Exception,
            Variant::Number(_) => Kind::Number,
            Variant::LongInt(_) => Kind::LongInt,
            Variant::ULongInt(_) => Kind::ULongInt,
            Variant::LongDouble(_) => Kind::LongDouble,
            Variant::AtomString(_) => Kind::AtomString,
            Variant::String(_) => Kind::String,
            Variant::ByteSeq(_) => Kind::ByteSeq,
            Variant::BigInt(_) => Kind::BigInt,
            Variant::Dynamic(_) => Kind::Dynamic,
            Variant::Native(_) => Kind::Native,
            Variant::Object(_) => Kind::Object,
            Variant::Array(_) => Kind::Array,
            Variant::Set(_) => Kind::Set,
            Variant::Tuple(_) => Kind::Tuple,
            Variant::SortedArray(_) => Kind::SortedArray,
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind().is_container()
    }

    /// The reference count of the underlying payload. Scalars report 1;
    /// their count is advisory, like the original per-heap singletons.
    pub fn refc(&self) -> usize {
        match self {
            Variant::String(d) => Rc::strong_count(d),
            Variant::ByteSeq(d) => Rc::strong_count(d),
            Variant::BigInt(d) => Rc::strong_count(d),
            Variant::Dynamic(d) => Rc::strong_count(d),
            Variant::Native(d) => Rc::strong_count(d),
            Variant::Object(d) => Rc::strong_count(d),
            Variant::Array(d) => Rc::strong_count(d),
            Variant::Set(d) => Rc::strong_count(d),
            Variant::Tuple(d) => Rc::strong_count(d),
            Variant::SortedArray(d) => Rc::strong_count(d),
            _ => 1,
        }
    }

    /// Address identity of the payload, 0 for inline scalars. Identity is
    /// what the reverse-update walks key their frontier maps with.
    pub fn ptr_id(&self) -> usize {
        match self {
            Variant::String(d) => Rc::as_ptr(d) as usize,
            Variant::ByteSeq(d) => Rc::as_ptr(d) as usize,
            Variant::BigInt(d) => Rc::as_ptr(d) as usize,
            Variant::Dynamic(d) => Rc::as_ptr(d) as usize,
            Variant::Native(d) => Rc::as_ptr(d) as usize,
            Variant::Object(d) => Rc::as_ptr(d) as usize,
            Variant::Array(d) => Rc::as_ptr(d) as usize,
            Variant::Set(d) => Rc::as_ptr(d) as usize,
            Variant::Tuple(d) => Rc::as_ptr(d) as usize,
            Variant::SortedArray(d) => Rc::as_ptr(d) as usize,
            _ => 0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Variant::String(d) => Some(d.as_str()),
            Variant::AtomString(a) | Variant::Exception(a) => Some(a.as_str()),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Variant::ByteSeq(d) => Some(d.as_bytes()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Variant::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<&BigInt> {
        match self {
            Variant::BigInt(d) => Some(d.value()),
            _ => None,
        }
    }

    /// Cast a numeric-family variant to i64. With `force`, lossy casts
    /// succeed by truncation.
    pub fn cast_to_i64(&self, force: bool) -> Result<i64, Error> {
        match self {
            Variant::Boolean(b) => Ok(*b as i64),
            Variant::Number(f) | Variant::LongDouble(f) => {
                if !force && (f.is_nan() || *f > i64::MAX as f64 || *f < i64::MIN as f64) {
                    Err(set_last_error(Error::OutOfRange))
                } else {
                    Ok(*f as i64)
                }
            }
            Variant::LongInt(v) => Ok(*v),
            Variant::ULongInt(v) => {
                if *v > i64::MAX as u64 && !force {
                    Err(set_last_error(Error::OutOfRange))
                } else {
                    Ok(*v as i64)
                }
            }
            Variant::BigInt(d) => d.value().to_i64(force).map_err(set_last_error),
            Variant::String(_) | Variant::AtomString(_) => {
                let s = self.as_str().unwrap().trim();
                s.parse::<i64>()
                    .map_err(|_| set_last_error(Error::InvalidValue))
            }
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    pub fn cast_to_u64(&self, force: bool) -> Result<u64, Error> {
        match self {
            Variant::Boolean(b) => Ok(*b as u64),
            Variant::Number(f) | Variant::LongDouble(f) => {
                if !force && (f.is_nan() || *f < 0.0 || *f > u64::MAX as f64) {
                    Err(set_last_error(Error::OutOfRange))
                } else {
                    Ok(*f as u64)
                }
            }
            Variant::LongInt(v) => {
                if *v < 0 && !force {
                    Err(set_last_error(Error::OutOfRange))
                } else {
                    Ok(*v as u64)
                }
            }
            Variant::ULongInt(v) => Ok(*v),
            Variant::BigInt(d) => d.value().to_u64(force).map_err(set_last_error),
            Variant::String(_) | Variant::AtomString(_) => {
                let s = self.as_str().unwrap().trim();
                s.parse::<u64>()
                    .map_err(|_| set_last_error(Error::InvalidValue))
            }
            _ => Err(set_last_error(Error::WrongDataType)),
        }
    }

    /// Structural deep equality.
    pub fn equals(&self, other: &Variant) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// Total order over all variants: numeric-family values compare
    /// numerically; otherwise unlike kinds order by kind tag, like kinds
    /// by content. Containers compare element-wise (objects by sorted
    /// key).
    pub fn compare(&self, other: &Variant) -> Ordering {
        if let (Some(a), Some(b)) = (self.numeric_view(), other.numeric_view()) {
            return a.compare(&b);
        }
        let (ka, kb) = (self.kind(), other.kind());
        if ka != kb {
            return ka.cmp(&kb);
        }
        match (self, other) {
            (Variant::Null, Variant::Null) | (Variant::Undefined, Variant::Undefined) => {
                Ordering::Equal
            }
            (Variant::Exception(a), Variant::Exception(b))
            | (Variant::AtomString(a), Variant::AtomString(b)) => a.as_str().cmp(b.as_str()),
            (Variant::String(a), Variant::String(b)) => a.as_str().cmp(b.as_str()),
            (Variant::ByteSeq(a), Variant::ByteSeq(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Variant::Dynamic(a), Variant::Dynamic(b)) => {
                (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
            }
            (Variant::Native(a), Variant::Native(b)) => {
                (Rc::as_ptr(a) as usize).cmp(&(Rc::as_ptr(b) as usize))
            }
            (Variant::Object(a), Variant::Object(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                crate::object::compare_objects(&a.borrow(), &b.borrow())
            }
            (Variant::Array(a), Variant::Array(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                compare_seqs(&a.borrow().elements_cloned(), &b.borrow().elements_cloned())
            }
            (Variant::Set(a), Variant::Set(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                compare_seqs(&a.borrow().members_ordered(), &b.borrow().members_ordered())
            }
            (Variant::Tuple(a), Variant::Tuple(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                compare_seqs(&a.borrow().members_cloned(), &b.borrow().members_cloned())
            }
            (Variant::SortedArray(a), Variant::SortedArray(b)) => {
                if Rc::ptr_eq(a, b) {
                    return Ordering::Equal;
                }
                compare_seqs(&a.borrow().elements_cloned(), &b.borrow().elements_cloned())
            }
            _ => unreachable!("kinds already matched"),
        }
    }

    fn numeric_view(&self) -> Option<NumericView> {
        match self {
            Variant::Number(f) | Variant::LongDouble(f) => Some(NumericView::Float(*f)),
            Variant::LongInt(v) => Some(NumericView::Int(*v)),
            Variant::ULongInt(v) => Some(NumericView::UInt(*v)),
            Variant::BigInt(d) => Some(NumericView::Big(d.clone())),
            _ => None,
        }
    }

    /// Clone a container, either sharing children (`recursively` false)
    /// or cloning container children all the way down. Immutable values
    /// return a shared handle either way.
    pub fn clone_container(&self, recursively: bool) -> Result<Variant, Error> {
        match self {
            Variant::Object(d) => crate::object::clone_obj(&d.borrow(), recursively),
            Variant::Array(d) => crate::array::clone_arr(&d.borrow(), recursively),
            Variant::Set(d) => crate::set::clone_set(&d.borrow(), recursively),
            Variant::Tuple(d) => crate::tuple::clone_tuple(&d.borrow(), recursively),
            Variant::SortedArray(d) => crate::sorted::clone_sorted(&d.borrow(), recursively),
            _ => Ok(self.clone()),
        }
    }

    /// A fully detached deep copy: containers are cloned recursively,
    /// immutables shared. Used for fingerprint snapshots.
    pub(crate) fn deep_snapshot(&self) -> Variant {
        self.clone_container(true)
            .expect("deep clone of well-formed value")
    }
}

enum NumericView {
    Float(f64),
    Int(i64),
    UInt(u64),
    Big(Rc<BigIntData>),
}

impl NumericView {
    fn compare(&self, other: &NumericView) -> Ordering {
        use NumericView::*;
        match (self, other) {
            (Int(a), Int(b)) => a.cmp(b),
            (UInt(a), UInt(b)) => a.cmp(b),
            (Int(a), UInt(b)) => {
                if *a < 0 {
                    Ordering::Less
                } else {
                    (*a as u64).cmp(b)
                }
            }
            (UInt(a), Int(b)) => {
                if *b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(*b as u64))
                }
            }
            (Big(a), Big(b)) => a.value().cmp(b.value()),
            (Big(a), Int(b)) => a.value().cmp(&BigInt::from_i64(*b)),
            (Int(a), Big(b)) => BigInt::from_i64(*a).cmp(b.value()),
            (Big(a), UInt(b)) => a.value().cmp(&BigInt::from_u64(*b)),
            (UInt(a), Big(b)) => BigInt::from_u64(*a).cmp(b.value()),
            // once a float is involved, compare as floats with a total
            // order that places NaN above everything
            (a, b) => {
                let fa = a.as_f64();
                let fb = b.as_f64();
                fa.partial_cmp(&fb).unwrap_or_else(|| {
                    if fa.is_nan() && fb.is_nan() {
                        Ordering::Equal
                    } else if fa.is_nan() {
                        Ordering::Greater
                    } else {
                        Ordering::Less
                    }
                })
            }
        }
    }

    fn as_f64(&self) -> f64 {
        match self {
            NumericView::Float(f) => *f,
            NumericView::Int(v) => *v as f64,
            NumericView::UInt(v) => *v as f64,
            NumericView::Big(d) => d.value().to_f64(),
        }
    }
}

pub(crate) fn compare_seqs(a: &[Variant], b: &[Variant]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.compare(y) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    a.len().cmp(&b.len())
}

impl PartialEq for Variant {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl std::fmt::Debug for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Variant::Null => write!(f, "null"),
            Variant::Undefined => write!(f, "undefined"),
            Variant::Boolean(b) => write!(f, "{b}"),
            Variant::Exception(a) => write!(f, "exception({})", a.as_str()),
            Variant::Number(v) => write!(f, "{v}"),
            Variant::LongInt(v) => write!(f, "{v}L"),
            Variant::ULongInt(v) => write!(f, "{v}UL"),
            Variant::LongDouble(v) => write!(f, "{v}FL"),
            Variant::AtomString(a) => write!(f, "atom({})", a.as_str()),
            Variant::String(d) => write!(f, "{:?}", d.as_str()),
            Variant::ByteSeq(d) => write!(f, "bx{}", hex_of(d.as_bytes())),
            Variant::BigInt(d) => write!(f, "{}N", d.value()),
            Variant::Dynamic(d) => write!(f, "<dynamic:{:p}>", Rc::as_ptr(d)),
            Variant::Native(d) => write!(f, "<native:{}>", d.name()),
            Variant::Object(d) => crate::object::debug_obj(&d.borrow(), f),
            Variant::Array(d) => f.debug_list().entries(d.borrow().elements_cloned()).finish(),
            Variant::Set(d) => {
                write!(f, "set")?;
                f.debug_list().entries(d.borrow().members_ordered()).finish()
            }
            Variant::Tuple(d) => {
                write!(f, "tuple")?;
                f.debug_list().entries(d.borrow().members_cloned()).finish()
            }
            Variant::SortedArray(d) => {
                write!(f, "sorted")?;
                f.debug_list().entries(d.borrow().elements_cloned()).finish()
            }
        }
    }
}

fn hex_of(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Visit `l` and `r` in lock-step, calling `cb` at every position where
/// either side is a scalar or the kinds diverge. A non-zero return from
/// `cb` stops the walk and is propagated.
pub fn parallel_walk(
    l: Option<&Variant>,
    r: Option<&Variant>,
    cb: &mut dyn FnMut(Option<&Variant>, Option<&Variant>) -> i32,
) -> i32 {
    let (l, r) = match (l, r) {
        (Some(l), Some(r)) => (l, r),
        (l, r) => return cb(l, r),
    };
    if !l.is_container() || !r.is_container() || l.kind() != r.kind() {
        return cb(Some(l), Some(r));
    }

    let (ls, rs): (Vec<Variant>, Vec<Variant>) = match (l, r) {
        (Variant::Object(a), Variant::Object(b)) => {
            let a = a.borrow();
            let b = b.borrow();
            let mut r = 0;
            let la: Vec<_> = a.entries_cloned();
            let lb: Vec<_> = b.entries_cloned();
            for i in 0..la.len().max(lb.len()) {
                let (lk, lv) = match la.get(i) {
                    Some((k, v)) => (Some(Variant::string(k)), Some(v.clone())),
                    None => (None, None),
                };
                let (rk, rv) = match lb.get(i) {
                    Some((k, v)) => (Some(Variant::string(k)), Some(v.clone())),
                    None => (None, None),
                };
                r = cb(lk.as_ref(), rk.as_ref());
                if r != 0 {
                    return r;
                }
                r = parallel_walk(lv.as_ref(), rv.as_ref(), cb);
                if r != 0 {
                    return r;
                }
            }
            return r;
        }
        (Variant::Array(a), Variant::Array(b)) => {
            (a.borrow().elements_cloned(), b.borrow().elements_cloned())
        }
        (Variant::Set(a), Variant::Set(b)) => {
            (a.borrow().members_ordered(), b.borrow().members_ordered())
        }
        (Variant::Tuple(a), Variant::Tuple(b)) => {
            (a.borrow().members_cloned(), b.borrow().members_cloned())
        }
        (Variant::SortedArray(a), Variant::SortedArray(b)) => {
            (a.borrow().elements_cloned(), b.borrow().elements_cloned())
        }
        _ => unreachable!("kinds already matched"),
    };

    for i in 0..ls.len().max(rs.len()) {
        let r = parallel_walk(ls.get(i), rs.get(i), cb);
        if r != 0 {
            return r;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_kinds() {
        assert_eq!(Variant::null().kind(), Kind::Null);
        assert_eq!(Variant::boolean(true).kind(), Kind::Boolean);
        assert_eq!(Variant::number(1.5).kind(), Kind::Number);
        assert_eq!(Variant::longint(-7).kind(), Kind::LongInt);
        assert!(!Variant::number(0.0).is_container());
    }

    #[test]
    fn test_string_refc() {
        let s = Variant::string("hello world, long enough to be out of line");
        assert_eq!(s.refc(), 1);
        let s2 = s.clone();
        assert_eq!(s.refc(), 2);
        drop(s2);
        assert_eq!(s.refc(), 1);
    }

    #[test]
    fn test_heap_accounting_strings() {
        let before = heap::stats();
        {
            let _s = Variant::string("a string that is definitely longer than inline");
            let mid = heap::stats();
            assert_eq!(
                mid.nr_values[Kind::String as usize],
                before.nr_values[Kind::String as usize] + 1
            );
        }
        assert_eq!(heap::stats(), before);
    }

    #[test]
    fn test_numeric_cross_kind_compare() {
        assert!(Variant::longint(1).equals(&Variant::number(1.0)));
        assert!(Variant::ulongint(5).equals(&Variant::longint(5)));
        assert_eq!(
            Variant::longint(-1).compare(&Variant::ulongint(0)),
            Ordering::Less
        );
        let big = Variant::bigint(BigInt::parse("18446744073709551616", 10).unwrap());
        assert_eq!(big.compare(&Variant::ulongint(u64::MAX)), Ordering::Greater);
    }

    #[test]
    fn test_string_compare() {
        assert!(Variant::string("abc").equals(&Variant::string("abc")));
        assert_eq!(
            Variant::string("abc").compare(&Variant::string("abd")),
            Ordering::Less
        );
        // atoms and strings are distinct kinds
        assert!(!Variant::string("x").equals(&Variant::atom_string("x")));
    }

    #[test]
    fn test_cast_to_i64() {
        assert_eq!(Variant::number(3.0).cast_to_i64(false).unwrap(), 3);
        assert_eq!(Variant::string("42").cast_to_i64(false).unwrap(), 42);
        assert!(Variant::ulongint(u64::MAX).cast_to_i64(false).is_err());
        assert_eq!(Variant::ulongint(u64::MAX).cast_to_i64(true).unwrap(), -1);
        assert!(Variant::null().cast_to_i64(false).is_err());
    }

    #[test]
    fn test_immutability_of_scalars() {
        // cloning never exposes interior mutation for scalar kinds
        let a = Variant::string("fixed");
        let b = a.clone();
        assert_eq!(a.as_str(), b.as_str());
        assert_eq!(a.ptr_id(), b.ptr_id());
    }
}
