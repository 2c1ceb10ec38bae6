use crate::common::error::AppError;
use crate::config::AppState;
use crate::middleware::tenancy::TenantContext;

// ---
// Helper RLS: A "Chave" para o Banco de Dados
// ---
/// Adquire uma conexão da pool e define `app.tenant_id` para as políticas RLS.
pub(crate) async fn get_rls_connection(
    app_state: &AppState,
    tenant_ctx: &TenantContext,
) -> Result<sqlx::pool::PoolConnection<sqlx::Postgres>, AppError> {
    // O operador '?' converte sqlx::Error -> AppError::DatabaseError
    let mut conn = app_state.db_pool.acquire().await?;

    // `false`: vale para a sessão inteira, não só para a próxima transação.
    // A conexão volta para a pool com o valor, então sempre sobrescrevemos aqui.
    sqlx::query("SELECT set_config('app.tenant_id', $1, false)")
        .bind(tenant_ctx.0.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(conn)
}
