// src/handlers/funnel.rs

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;
use validator::Validate;

use crate::{
    common::{
        db_utils::get_rls_connection,
        error::{ApiError, AppError},
    },
    config::AppState,
    middleware::tenancy::TenantContext,
    models::funnel::StageKind,
};

// GET /api/health
pub async fn health(State(app_state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    app_state.funnel_service.ping().await?;
    Ok("OK")
}

// =============================================================================
//  ÁREA 1: ETAPAS DO FUNIL
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateStagePayload {
    #[validate(length(min = 1, message = "required"))]
    pub nome: String,

    #[serde(default)]
    pub tipo: StageKind,

    #[serde(default)]
    pub posicao: i32,

    // Ausente ou vazio: sem restrição de destino
    #[serde(default)]
    pub etapas_permitidas: Option<Vec<Uuid>>,

    // Lido de forma estrita; aceita os nomes antigos (tipo/interacao/campo)
    #[serde(default)]
    pub acoes_obrigatorias: Vec<Value>,

    #[validate(range(min = 0.0, message = "invalid_duration"))]
    pub tempo_max_horas: Option<f64>,
}

// POST /api/crm/stages
pub async fn create_stage(
    State(app_state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateStagePayload>,
) -> Result<impl IntoResponse, ApiError> {
    payload.validate().map_err(AppError::ValidationError)?;

    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let stage = app_state
        .funnel_service
        .create_stage(
            &mut *rls_conn,
            tenant.0,
            payload.nome.trim(),
            payload.tipo,
            payload.posicao,
            payload.etapas_permitidas,
            &payload.acoes_obrigatorias,
            payload.tempo_max_horas,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(stage)))
}

// GET /api/crm/stages
pub async fn list_stages(
    State(app_state): State<AppState>,
    tenant: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let stages = app_state
        .funnel_service
        .list_stages(&mut *rls_conn, tenant.0)
        .await?;

    Ok((StatusCode::OK, Json(stages)))
}

// =============================================================================
//  ÁREA 2: LEADS
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateLeadPayload {
    #[validate(length(min = 1, message = "required"))]
    pub nome: String,

    #[validate(email(message = "invalid_email"))]
    pub email: Option<String>,
    pub telefone: Option<String>,
    pub origem: Option<String>,
    pub valor: Option<f64>,
    pub proxima_acao: Option<String>,

    // Ex: { "orcamento": "5000" }
    #[serde(default)]
    pub campos: Map<String, Value>,
}

// POST /api/crm/leads
pub async fn create_lead(
    State(app_state): State<AppState>,
    tenant: TenantContext,
    Json(payload): Json<CreateLeadPayload>,
) -> Result<impl IntoResponse, ApiError> {
    payload.validate().map_err(AppError::ValidationError)?;

    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let lead = app_state
        .funnel_service
        .create_lead(
            &mut *rls_conn,
            tenant.0,
            payload.nome.trim(),
            payload.email.as_deref(),
            payload.telefone.as_deref(),
            payload.origem.as_deref(),
            payload.valor,
            payload.proxima_acao.as_deref(),
            payload.campos,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(lead)))
}

// GET /api/crm/leads
pub async fn list_leads(
    State(app_state): State<AppState>,
    tenant: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let leads = app_state
        .funnel_service
        .list_leads(&mut *rls_conn, tenant.0)
        .await?;

    Ok((StatusCode::OK, Json(leads)))
}

// GET /api/crm/leads/overdue
pub async fn list_overdue_leads(
    State(app_state): State<AppState>,
    tenant: TenantContext,
) -> Result<impl IntoResponse, ApiError> {
    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let overdue = app_state
        .funnel_service
        .list_overdue_leads(&mut *rls_conn, tenant.0)
        .await?;

    Ok((StatusCode::OK, Json(overdue)))
}

// =============================================================================
//  ÁREA 3: INTERAÇÕES
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LogInteractionPayload {
    #[validate(length(min = 1, message = "required"))]
    pub tipo: String,
    pub descricao: Option<String>,
    pub agendada_para: Option<DateTime<Utc>>,
}

// POST /api/crm/leads/{lead_id}/interactions
pub async fn log_interaction(
    State(app_state): State<AppState>,
    tenant: TenantContext,
    Path(lead_id): Path<Uuid>,
    Json(payload): Json<LogInteractionPayload>,
) -> Result<impl IntoResponse, ApiError> {
    payload.validate().map_err(AppError::ValidationError)?;

    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let interaction = app_state
        .funnel_service
        .log_interaction(
            &mut *rls_conn,
            tenant.0,
            lead_id,
            payload.tipo.trim(),
            payload.descricao.as_deref(),
            payload.agendada_para,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(interaction)))
}

// =============================================================================
//  ÁREA 4: MOVIMENTAÇÃO (O PORTÃO)
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveLeadPayload {
    // Ausente não é erro de requisição: o validador responde "sem destino".
    pub etapa_destino_id: Option<Uuid>,

    #[serde(default)]
    pub motivo: String,
}

// POST /api/crm/leads/{lead_id}/check-move
pub async fn check_move(
    State(app_state): State<AppState>,
    tenant: TenantContext,
    Path(lead_id): Path<Uuid>,
    Json(payload): Json<MoveLeadPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let decision = app_state
        .funnel_service
        .check_transition(
            &mut *rls_conn,
            tenant.0,
            lead_id,
            payload.etapa_destino_id,
            &payload.motivo,
        )
        .await?;

    Ok((StatusCode::OK, Json(decision)))
}

// POST /api/crm/leads/{lead_id}/move
pub async fn move_lead(
    State(app_state): State<AppState>,
    tenant: TenantContext,
    Path(lead_id): Path<Uuid>,
    Json(payload): Json<MoveLeadPayload>,
) -> Result<impl IntoResponse, ApiError> {
    let mut rls_conn = get_rls_connection(&app_state, &tenant).await?;

    let lead = app_state
        .funnel_service
        .move_lead(
            &mut *rls_conn,
            tenant.0,
            lead_id,
            payload.etapa_destino_id,
            &payload.motivo,
        )
        .await?;

    Ok((StatusCode::OK, Json(lead)))
}
