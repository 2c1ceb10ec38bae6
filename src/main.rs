//src/main.rs

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod common;
mod config;
mod db;
mod handlers;
mod middleware;
mod models;
mod services;

use crate::config::{AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG controla o nível; padrão "info"
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;
    let app_state = AppState::new(&config).await?;

    sqlx::migrate!()
        .run(&app_state.db_pool)
        .await
        .context("Falha ao rodar as migrações do banco de dados.")?;

    tracing::info!("✅ Migrações do banco de dados executadas com sucesso!");

    let app = router(app_state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Falha ao iniciar o listener TCP em {}", config.bind_addr))?;
    tracing::info!("🚀 Servidor escutando em {}", listener.local_addr()?);

    axum::serve(listener, app).await.context("Erro no servidor Axum")?;
    Ok(())
}

fn router(app_state: AppState) -> Router {
    // Todas as rotas do CRM exigem o cabeçalho x-tenant-id (extrator TenantContext)
    let crm_routes = Router::new()
        // Configuração do funil
        .route(
            "/stages",
            post(handlers::funnel::create_stage).get(handlers::funnel::list_stages),
        )
        // Leads
        .route(
            "/leads",
            post(handlers::funnel::create_lead).get(handlers::funnel::list_leads),
        )
        .route("/leads/overdue", get(handlers::funnel::list_overdue_leads))
        .route(
            "/leads/{lead_id}/interactions",
            post(handlers::funnel::log_interaction),
        )
        // Movimentação
        .route("/leads/{lead_id}/check-move", post(handlers::funnel::check_move))
        .route("/leads/{lead_id}/move", post(handlers::funnel::move_lead));

    Router::new()
        .route("/api/health", get(handlers::funnel::health))
        .nest("/api/crm", crm_routes)
        .with_state(app_state)
}
