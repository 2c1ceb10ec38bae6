use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::funnel::{RequirementError, TransitionDecision};

// Erros de domínio. Os handlers convertem para ApiError na borda HTTP.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Erro de validação")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Configuração de etapa inválida: {0}")]
    InvalidStageConfig(String),

    #[error("Ação obrigatória inválida: {0}")]
    InvalidRequirement(#[from] RequirementError),

    #[error("Recurso não encontrado: {0}")]
    ResourceNotFound(String),

    #[error("Transição recusada")]
    TransitionRejected(TransitionDecision),

    // Variante para erros de banco de dados
    #[error("Erro de banco de dados")]
    DatabaseError(#[from] sqlx::Error),

    // `anyhow::Error` guarda o contexto de qualquer outro erro inesperado.
    #[error("Erro interno do servidor")]
    InternalServerError(#[from] anyhow::Error),
}

/// Resposta de erro que vai para o cliente.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub error: String,
    pub details: Option<Value>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: message.into(),
            details: None,
        }
    }
}

impl AppError {
    pub fn to_api_error(&self) -> ApiError {
        match self {
            AppError::ValidationError(errors) => {
                let mut details = HashMap::new();
                for (field, field_errors) in errors.field_errors() {
                    let messages: Vec<String> = field_errors
                        .iter()
                        .map(|e| {
                            e.message
                                .as_ref()
                                .map(|m| m.to_string())
                                .unwrap_or_else(|| e.code.to_string())
                        })
                        .collect();
                    details.insert(field.to_string(), messages);
                }
                ApiError {
                    status: StatusCode::BAD_REQUEST,
                    error: "Um ou mais campos são inválidos.".into(),
                    details: Some(json!(details)),
                }
            }
            AppError::InvalidStageConfig(message) => ApiError::bad_request(message.clone()),
            AppError::InvalidRequirement(e) => ApiError::bad_request(e.to_string()),
            AppError::ResourceNotFound(what) => ApiError {
                status: StatusCode::NOT_FOUND,
                error: format!("{} não encontrado.", what),
                details: None,
            },
            AppError::TransitionRejected(decision) => ApiError {
                status: StatusCode::UNPROCESSABLE_ENTITY,
                error: decision
                    .message
                    .clone()
                    .unwrap_or_else(|| "Transição recusada.".into()),
                details: Some(json!(decision)),
            },

            // Banco e internos viram 500; o detalhe fica só no log.
            AppError::DatabaseError(_) | AppError::InternalServerError(_) => {
                tracing::error!("Erro Interno do Servidor: {:?}", self);
                ApiError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    error: "Ocorreu um erro inesperado.".into(),
                    details: None,
                }
            }
        }
    }
}

impl From<AppError> for ApiError {
    fn from(err: AppError) -> Self {
        err.to_api_error()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match self.details {
            Some(details) => json!({ "error": self.error, "details": details }),
            None => json!({ "error": self.error }),
        };
        (self.status, Json(body)).into_response()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.to_api_error().into_response()
    }
}
