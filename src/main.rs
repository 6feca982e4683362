//! Noor chat server

use noor_chat::api;
use noor_chat::config::Settings;
use noor_chat::core::clock::SystemClock;
use noor_chat::core::persona::PersonaProfile;
use noor_chat::core::traits::Clock;
use noor_chat::infrastructure::gemini::GeminiModel;
use noor_chat::infrastructure::traits::LanguageModel;
use noor_chat::{Backend, Components};

use anyhow::anyhow;
use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::response::Html;
use axum::routing::get;
use di::Ref;
use di_axum::RouterServiceProviderExtensions;
use log::info;
use tokio::runtime::{Builder, Runtime};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let settings = Settings::from_env()?;
    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(web_server_task(settings))
}

async fn web_server_task(settings: Settings) -> anyhow::Result<()> {
    let persona = match &settings.persona_file {
        Some(path) => PersonaProfile::load(path).await?,
        None => PersonaProfile::builtin()?,
    };
    info!(
        "persona {} ({:?} conversation, {:?} prompt, {:?} on failure)",
        persona.name,
        settings.mode(),
        settings.prompt_variant,
        settings.failure_policy
    );

    let bind_address = settings.bind_address;
    let allowed_origins = settings
        .allowed_origins
        .iter()
        .map(|origin| origin.parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;

    let model: Ref<dyn LanguageModel> = Ref::new(GeminiModel::new(settings.model.clone()));
    let clock: Ref<dyn Clock> = Ref::new(SystemClock::new(settings.utc_offset));
    let backend = Backend::connect(&settings.store).await?;

    let provider = Components {
        settings,
        persona,
        model,
        clock,
        backend,
    }
    .into_services()?
    .build_provider()
    .map_err(|e| anyhow!("invalid service configuration: {e:?}"))?;

    // build our application with a route
    let app = Router::new()
        .route("/", get(index))
        .route("/session", get(api::chat::session))
        .nest_service(
            "/static",
            ServiceBuilder::new().service(ServeDir::new("static")),
        )
        .nest("/chat", api::chat::router())
        .layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_origin(allowed_origins),
        )
        .with_provider(provider);

    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    info!("Shutting down...");

    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(include_str!("../static/index.html"))
}
