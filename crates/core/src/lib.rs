//! Vellum variant runtime
//!
//! The polymorphic, reference-counted value model of the Vellum
//! interpreter: scalar and container variants with structural sharing,
//! observer notifications on mutation, a reverse-update edge graph that
//! keeps unique-by-key collections consistent while their descendants
//! mutate, and the move-heap protocol for handing value graphs between
//! instances.
//!
//! Key design principles:
//! - `Variant` is one tagged union; the kind tag drives all dispatch.
//! - One instance, one thread, one heap: no locks inside the value
//!   model. The process-wide move heap is the only cross-thread door.
//! - Mutation runs a fixed pipeline: constraint check, vetoable pre
//!   observers, commit, set readjustment, post observers.
//!
//! # Modules
//!
//! - `error`: error kinds and thread-local last-error storage
//! - `atom`: process-wide interned strings
//! - `bigint`: arbitrary-precision two's-complement integers
//! - `variant`: the tagged union, equality, ordering, clones
//! - `heap`: per-thread value accounting
//! - `object` / `array` / `set` / `tuple` / `sorted`: the containers
//! - `observer`: pre/post mutation listeners
//! - `revise`: reverse-update edges and the constraint walks
//! - `container`: bulk operations between containers
//! - `numerify` / `stringify`: total coercion walkers
//! - `move_heap`: cross-instance graph migration

pub mod array;
pub mod atom;
pub mod bigint;
pub mod container;
pub mod error;
pub mod heap;
pub mod move_heap;
pub mod numerify;
pub mod object;
pub mod observer;
pub mod revise;
pub mod set;
pub mod sorted;
pub mod stringify;
pub mod tuple;
pub mod variant;

pub use atom::Atom;
pub use bigint::BigInt;
pub use error::{clear_last_error, last_error, set_last_error, take_last_error, Error};
pub use heap::{stats as heap_stats, HeapStats, VALUE_FOOTPRINT};
pub use move_heap::{move_heap_stats, move_in, move_out, MovedVariant};
pub use numerify::numerify;
pub use observer::{
    register_post_listener, register_pre_listener, revoke_listener, ChangeOp, ListenerHandle,
    PostHandler, PreHandler,
};
pub use sorted::{SortedCmp, SortedFlags};
pub use stringify::{stringify, stringify_to_string};
pub use variant::{parallel_walk, DynMethod, Kind, NativeMethod, NativeOps, Variant, NR_KINDS};
