/// Application state and router builder
///
/// This module defines the shared application state and provides
/// a function to build the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use pitchside_api::{app::{build_router, AppState}, config::Config};
/// use pitchside_shared::integrations::Integrations;
/// use sqlx::PgPool;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::from_env()?;
/// let pool = PgPool::connect(&config.database.url).await?;
/// let integrations = Integrations::from_config(&config.integrations)?;
/// let app = build_router(AppState::new(pool, config, integrations));
/// # Ok(())
/// # }
/// ```

use crate::{config::Config, error::ApiError, middleware::security::SecurityHeadersLayer, routes};
use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post, put},
    Router,
};
use pitchside_shared::auth::middleware::{authenticate_bearer, require_admin_middleware};
use pitchside_shared::integrations::Integrations;
use sqlx::PgPool;
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

/// Shared application state
///
/// Cloned for each request handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: PgPool,

    /// Application configuration
    pub config: Arc<Config>,

    /// Stripe, Xero, email and alert clients
    pub integrations: Arc<Integrations>,
}

impl AppState {
    pub fn new(db: PgPool, config: Config, integrations: Integrations) -> Self {
        Self {
            db,
            config: Arc::new(config),
            integrations: Arc::new(integrations),
        }
    }

    /// Gets JWT secret for token operations
    pub fn jwt_secret(&self) -> &str {
        &self.config.jwt.secret
    }
}

/// Builds the complete Axum router with all routes and middleware
///
/// # Architecture
///
/// ```text
/// /health                                   public
/// /v1/auth/{register,login,refresh}         public
/// /v1/webhooks/stripe                       Stripe signature
/// /v1/cron/*                                x-cron-secret
/// /v1/...                                   member (JWT)
/// /v1/...                                   admin (JWT + admin role)
/// ```
///
/// Member and admin routers may share a path with different methods, e.g.
/// `GET /v1/seasons/:id` for members and `PUT /v1/seasons/:id` for admins.
///
/// # Middleware Stack
///
/// Applied outermost first:
/// 1. Security headers
/// 2. CORS
/// 3. Logging (tower-http TraceLayer)
/// 4. Authentication (per router)
pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new().route("/health", get(routes::health::health_check));

    let auth_routes = Router::new()
        .route("/register", post(routes::auth::register))
        .route("/login", post(routes::auth::login))
        .route("/refresh", post(routes::auth::refresh));

    let webhook_routes = Router::new().route("/stripe", post(routes::webhooks::stripe_webhook));

    let cron_routes = Router::new()
        .route("/ledger-sync", post(routes::cron::ledger_sync))
        .route("/email-retry", post(routes::cron::email_retry))
        .route("/payment-plans", post(routes::cron::payment_plans))
        .route("/expire-reservations", post(routes::cron::expire_reservations))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::cron::cron_secret_layer,
        ));

    let member_routes = Router::new()
        .route("/me", get(routes::auth::me).put(routes::auth::update_me))
        // Seasons and memberships
        .route("/seasons", get(routes::seasons::list_seasons))
        .route("/seasons/:id", get(routes::seasons::get_season))
        .route("/seasons/:id/membership-types", get(routes::memberships::list_membership_types))
        .route("/seasons/:id/registrations", get(routes::registrations::list_registrations))
        .route("/memberships/me", get(routes::memberships::my_memberships))
        .route("/memberships/checkout", post(routes::memberships::checkout_membership))
        // Registrations
        .route("/registrations/me", get(routes::registrations::my_registrations))
        .route("/registrations/:id", get(routes::registrations::get_registration))
        .route("/registrations/:id/checkout", post(routes::registrations::checkout_registration))
        .route("/registrations/:id/reservation", delete(routes::registrations::cancel_reservation))
        // Payments
        .route("/payments/me", get(routes::payments::my_payments))
        .route("/payments/:id/confirm", post(routes::payments::confirm_payment))
        .route("/payment-plans/me", get(routes::payments::my_payment_plans))
        .route("/discount-codes/validate", post(routes::discounts::validate_code))
        // Waitlists and alternates
        .route(
            "/registrations/:id/waitlist",
            post(routes::waitlists::join_waitlist).delete(routes::waitlists::leave_waitlist),
        )
        .route("/registrations/:id/waitlist/position", get(routes::waitlists::waitlist_position))
        .route("/registrations/:id/alternates", post(routes::alternates::register_alternate))
        .layer(middleware::from_fn_with_state(state.clone(), jwt_auth_layer));

    let admin_routes = Router::new()
        .route("/seasons", post(routes::seasons::create_season))
        .route(
            "/seasons/:id",
            put(routes::seasons::update_season).delete(routes::seasons::delete_season),
        )
        .route("/membership-types", post(routes::memberships::create_membership_type))
        .route(
            "/membership-types/:id",
            put(routes::memberships::update_membership_type).delete(routes::memberships::delete_membership_type),
        )
        .route("/registrations", post(routes::registrations::create_registration))
        .route(
            "/registrations/:id",
            put(routes::registrations::update_registration).delete(routes::registrations::delete_registration),
        )
        .route("/registrations/:id/roster", get(routes::registrations::roster))
        .route(
            "/discount-categories",
            get(routes::discounts::list_categories).post(routes::discounts::create_category),
        )
        .route(
            "/discount-codes",
            get(routes::discounts::list_codes).post(routes::discounts::create_code),
        )
        .route("/discount-codes/:id", put(routes::discounts::update_code))
        .route("/registrations/:id/waitlist", get(routes::waitlists::list_waitlist))
        .route("/waitlist/:entry_id/offer", post(routes::waitlists::offer_spot))
        .route("/registrations/:id/alternates", get(routes::alternates::list_alternates))
        .route(
            "/registrations/:id/games",
            get(routes::alternates::list_games).post(routes::alternates::create_game),
        )
        .route("/games/:id/alternates", post(routes::alternates::select_alternates))
        .route("/admin/ledger", get(routes::admin::list_ledger_entries))
        .route("/admin/ledger/:id/retry", post(routes::admin::retry_ledger_entry))
        .layer(middleware::from_fn(require_admin_middleware))
        .layer(middleware::from_fn_with_state(state.clone(), jwt_auth_layer));

    let v1_routes = Router::new()
        .nest("/auth", auth_routes)
        .nest("/webhooks", webhook_routes)
        .nest("/cron", cron_routes)
        .merge(member_routes)
        .merge(admin_routes);

    let cors = if state.config.allows_any_origin() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
            .allow_credentials(true)
            .max_age(std::time::Duration::from_secs(3600))
    };

    Router::new()
        .merge(health_routes)
        .nest("/v1", v1_routes)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors)
        .layer(SecurityHeadersLayer::new(state.config.api.production))
        .with_state(state)
}

/// JWT authentication middleware layer
///
/// Validates the bearer token and injects an `AuthContext` into the request
/// extensions.
async fn jwt_auth_layer(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_context = authenticate_bearer(req.headers(), state.jwt_secret())?;
    req.extensions_mut().insert(auth_context);

    Ok(next.run(req).await)
}
