pub(crate) use shepherd_core::prelude::*;
pub(crate) use std::sync::Arc;
