use crate::services::{Deputy, Sheriff};
use std::sync::Arc;

/// Shared Deputy handed to actix handlers and background tasks
pub type DeputyState = Arc<Deputy>;

/// Shared Sheriff handed to actix handlers and background tasks
pub type SheriffState = Arc<Sheriff>;
