pub mod deputy;
pub mod sheriff;

pub use deputy::configure_deputy;
pub use sheriff::configure_sheriff;

use actix_web::{error, web};

use crate::error::ProcmanError;

/// Malformed bodies answer with the same error payload as every other failure
pub(crate) fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req| {
        error::Error::from(ProcmanError::Validation(format!("malformed request body: {}", err)))
    })
}
