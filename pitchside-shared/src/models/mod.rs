/// Database models
///
/// One module per table family, each with async associated functions running runtime
/// `sqlx` queries. Functions that checkout runs inside a transaction take any
/// [`sqlx::PgExecutor`]; the rest take `&PgPool`.
///
/// # Models
///
/// - `user`: members and admins
/// - `season`: seasons
/// - `membership`: membership types and members' memberships
/// - `registration`: registrations, reservations and rosters
/// - `discount`: discount categories, codes and usage
/// - `payment`: charge attempts
/// - `payment_plan`: installment plans
/// - `waitlist`: waitlist entries
/// - `alternate`: alternates, games and per-game selections
/// - `ledger`: staged accounting entries
/// - `email`: transactional email outbox
/// - `stripe_event`: webhook de-duplication
///
/// # Example
///
/// ```no_run
/// use pitchside_shared::models::season::Season;
/// use pitchside_shared::db::pool::{create_pool, DatabaseConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = create_pool(DatabaseConfig::from_env()?).await?;
/// let seasons = Season::list(&pool).await?;
/// # Ok(())
/// # }
/// ```

pub mod alternate;
pub mod discount;
pub mod email;
pub mod ledger;
pub mod membership;
pub mod payment;
pub mod payment_plan;
pub mod registration;
pub mod season;
pub mod stripe_event;
pub mod user;
pub mod waitlist;
