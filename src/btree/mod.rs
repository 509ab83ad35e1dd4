//! B+tree engine.
//!
//! - `node`: typed leaf/branch views over a cached page's bytes
//! - `cursor`: root-to-leaf paths and the range iterators built on them
//! - `tree`: search, insert/split, erase/collapse, open/close

pub(crate) mod cursor;
pub(crate) mod node;
pub(crate) mod tree;

pub use cursor::RawRange;
pub use tree::{Tree, TreeShape};
