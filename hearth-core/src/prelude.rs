//! hearth prelude

pub use crate::{
    anyhow::{self, Context, Result},
    async_trait,
    shutdown::Shutdown,
    tokio,
    tracing::{self, debug, error, info, instrument, trace, warn},
};

pub use std::{io, sync::Arc};
