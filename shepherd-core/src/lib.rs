mod span;
pub mod info;
pub mod prelude;
pub mod util;

pub use span::*;

/// Arrays and grids are limited to this number of dimensions.
pub const MAX_DIMS: usize = 3;
