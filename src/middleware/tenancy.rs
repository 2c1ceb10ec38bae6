// src/middleware/tenancy.rs

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use uuid::Uuid;

use crate::common::error::ApiError;

// Cabeçalho HTTP que identifica a agência (tenant)
pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Agência dona dos dados da requisição.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext(pub Uuid);

impl TenantContext {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let value = headers
            .get(TENANT_ID_HEADER)
            .ok_or_else(|| ApiError::bad_request("O cabeçalho X-Tenant-ID é obrigatório."))?;

        let value_str = value.to_str().map_err(|_| {
            ApiError::bad_request("Cabeçalho X-Tenant-ID contém caracteres inválidos.")
        })?;

        let tenant_id = Uuid::parse_str(value_str.trim()).map_err(|_| {
            ApiError::bad_request("Cabeçalho X-Tenant-ID inválido (não é um UUID).")
        })?;

        Ok(TenantContext(tenant_id))
    }
}

impl<S> FromRequestParts<S> for TenantContext
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let tenant = Self::from_headers(&parts.headers)?;
        tracing::debug!(tenant_id = %tenant.0, "tenant resolvido");
        Ok(tenant)
    }
}
