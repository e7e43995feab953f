//! Marshal module - schema-driven binary encoding.
//!
//! - [`Marshal`] - consume-on-read byte buffer with typed accessors
//! - [`TypeDesc`] / [`Value`] - wire types and dynamically typed values
//! - [`TypeRegistry`] - struct layouts shared by both ends out-of-band
//!
//! Nothing but values travels on the wire: no type tags, no struct length
//! prefixes. Both ends decode by walking the same declared type list.
//!
//! # Example
//!
//! ```
//! use wirecall::marshal::{Marshal, StructValue, TypeDesc, TypeRegistry, Value};
//!
//! let mut registry = TypeRegistry::new();
//! registry
//!     .register("point", &[("x", TypeDesc::I32), ("y", TypeDesc::I32)])
//!     .unwrap();
//!
//! let p = Value::Struct(StructValue::new("point").field("x", 3).field("y", -4));
//! let ty = TypeDesc::structure("point");
//!
//! let mut m = Marshal::new();
//! m.write_value(&p, &ty, &registry).unwrap();
//! assert_eq!(m.len(), 8);
//! assert_eq!(m.read_value(&ty, &registry).unwrap(), p);
//! ```

mod buffer;
mod registry;
mod types;

pub use buffer::Marshal;
pub use registry::{Field, TypeRegistry};
pub use types::{StructValue, TypeDesc, Value};
