use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for Button Back.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::game::create_game,
        crate::routes::game::get_game,
        crate::routes::game::end_game,
        crate::routes::game::get_timer,
        crate::routes::game::click,
        crate::routes::admin::warm_cache,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::game::CreateGameRequest,
            crate::dto::game::GameSummary,
            crate::dto::game::TimerResponse,
            crate::dto::game::ClickRequest,
            crate::dto::game::ClickResponse,
            crate::dto::game::WarmResponse,
            crate::services::resilient_client::CircuitState,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "game", description = "Game lifecycle, timer and clicks"),
        (name = "admin", description = "Operational endpoints"),
    )
)]
pub struct ApiDoc;
