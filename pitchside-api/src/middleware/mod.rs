/// Middleware modules for the API server
///
/// - `security`: security response headers
/// - `cron`: shared-secret guard for the cron triggers
///
/// JWT authentication and the admin guard come from
/// [`pitchside_shared::auth::middleware`] and are wired up in [`crate::app`].

pub mod cron;
pub mod security;
