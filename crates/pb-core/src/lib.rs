// pb-core: Typed parameter model and component registry for the hub.
//
// A `Parameter` is a 2-D grid of typed cells with clamping and change
// subscribers; a `Component` is a named, insertion-ordered bag of
// parameters; the `Registry` owns the local components of a hub process and
// allocates process-unique parameter ids.

pub mod component;
pub mod param;

pub use component::{Component, ParamIdAllocator, Registry};
pub use param::{ChangeCallback, ParamError, Parameter};
