// src/db/funnel_repo.rs

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};
use uuid::Uuid;

use crate::{
    common::error::AppError,
    models::funnel::{Interaction, Lead, Stage, StageKind, StageRow},
};

#[derive(Clone)]
pub struct FunnelRepository {
    pool: PgPool,
}

impl FunnelRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    // Usado pelo health check, fora do contexto de tenant.
    pub async fn ping(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // =========================================================================
    //  ETAPAS DO FUNIL
    // =========================================================================

    pub async fn create_stage<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        nome: &str,
        tipo: StageKind,
        posicao: i32,
        etapas_permitidas: &[Uuid],
        acoes_obrigatorias: &Value,
        tempo_max_horas: Option<f64>,
    ) -> Result<Stage, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            INSERT INTO crm_etapas (
                tenant_id, nome, tipo, posicao,
                etapas_permitidas, acoes_obrigatorias, tempo_max_horas
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(nome)
        .bind(tipo)
        .bind(posicao)
        .bind(etapas_permitidas)
        .bind(acoes_obrigatorias)
        .bind(tempo_max_horas)
        .fetch_one(executor)
        .await
        .map_err(|e| {
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation() {
                    return AppError::InvalidStageConfig(format!(
                        "Já existe uma etapa chamada '{}'.",
                        nome
                    ));
                }
            }
            e.into()
        })?;

        Ok(row.into())
    }

    /// Etapas na ordem do funil
    pub async fn list_stages<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Vec<Stage>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let rows = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT * FROM crm_etapas
            WHERE tenant_id = $1
            ORDER BY posicao ASC, created_at ASC
            "#,
        )
        .bind(tenant_id)
        .fetch_all(executor)
        .await?;

        Ok(rows.into_iter().map(Stage::from).collect())
    }

    pub async fn find_stage<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        stage_id: Uuid,
    ) -> Result<Option<Stage>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, StageRow>(
            "SELECT * FROM crm_etapas WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(stage_id)
        .fetch_optional(executor)
        .await?;

        Ok(row.map(Stage::from))
    }

    /// Primeira etapa do funil (menor posição), onde os leads novos entram.
    pub async fn first_stage<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Option<Stage>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, StageRow>(
            r#"
            SELECT * FROM crm_etapas
            WHERE tenant_id = $1
            ORDER BY posicao ASC, created_at ASC
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(executor)
        .await?;

        Ok(row.map(Stage::from))
    }

    /// Quantos dos ids informados existem para o tenant.
    pub async fn count_stages<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        stage_ids: &[Uuid],
    ) -> Result<i64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM crm_etapas WHERE tenant_id = $1 AND id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(stage_ids)
        .fetch_one(executor)
        .await?;

        Ok(count)
    }

    // =========================================================================
    //  LEADS
    // =========================================================================

    pub async fn create_lead<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        nome: &str,
        email: Option<&str>,
        telefone: Option<&str>,
        origem: Option<&str>,
        valor: Option<f64>,
        proxima_acao: Option<&str>,
        campos: &Value,
        etapa_id: Option<Uuid>,
    ) -> Result<Lead, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        // Sem etapa inicial o lead fica fora do funil (e sem relógio de atraso).
        let lead = sqlx::query_as::<_, Lead>(
            r#"
            INSERT INTO crm_leads (
                tenant_id, nome, email, telefone, origem, valor,
                proxima_acao, campos, etapa_id, etapa_entrada_em
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9,
                CASE WHEN $9::uuid IS NULL THEN NULL ELSE NOW() END
            )
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(nome)
        .bind(email)
        .bind(telefone)
        .bind(origem)
        .bind(valor)
        .bind(proxima_acao)
        .bind(campos)
        .bind(etapa_id)
        .fetch_one(executor)
        .await?;

        Ok(lead)
    }

    pub async fn list_leads<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Vec<Lead>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let leads = sqlx::query_as::<_, Lead>(
            "SELECT * FROM crm_leads WHERE tenant_id = $1 ORDER BY created_at DESC",
        )
        .bind(tenant_id)
        .fetch_all(executor)
        .await?;

        Ok(leads)
    }

    pub async fn find_lead<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<Lead>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lead = sqlx::query_as::<_, Lead>(
            "SELECT * FROM crm_leads WHERE tenant_id = $1 AND id = $2",
        )
        .bind(tenant_id)
        .bind(lead_id)
        .fetch_optional(executor)
        .await?;

        Ok(lead)
    }

    /// Trava a linha do lead até o fim da transação (evita duas movimentações simultâneas).
    pub async fn find_lead_for_update<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
    ) -> Result<Option<Lead>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lead = sqlx::query_as::<_, Lead>(
            "SELECT * FROM crm_leads WHERE tenant_id = $1 AND id = $2 FOR UPDATE",
        )
        .bind(tenant_id)
        .bind(lead_id)
        .fetch_optional(executor)
        .await?;

        Ok(lead)
    }

    /// Grava a nova etapa e reinicia o relógio de permanência.
    /// O motivo só é sobrescrito quando informado.
    pub async fn update_lead_stage<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
        etapa_id: Uuid,
        motivo: Option<&str>,
    ) -> Result<Lead, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let lead = sqlx::query_as::<_, Lead>(
            r#"
            UPDATE crm_leads
            SET etapa_id = $1,
                etapa_entrada_em = NOW(),
                motivo_ganho_perda = COALESCE($2, motivo_ganho_perda),
                updated_at = NOW()
            WHERE id = $3 AND tenant_id = $4
            RETURNING *
            "#,
        )
        .bind(etapa_id)
        .bind(motivo)
        .bind(lead_id)
        .bind(tenant_id)
        .fetch_one(executor)
        .await?;

        Ok(lead)
    }

    // =========================================================================
    //  INTERAÇÕES
    // =========================================================================

    pub async fn create_interaction<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
        tipo: &str,
        descricao: Option<&str>,
        agendada_para: Option<DateTime<Utc>>,
    ) -> Result<Interaction, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let interaction = sqlx::query_as::<_, Interaction>(
            r#"
            INSERT INTO crm_interacoes (tenant_id, lead_id, tipo, descricao, agendada_para)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(tenant_id)
        .bind(lead_id)
        .bind(tipo)
        .bind(descricao)
        .bind(agendada_para)
        .fetch_one(executor)
        .await?;

        Ok(interaction)
    }

    pub async fn count_interactions<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
    ) -> Result<i64, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM crm_interacoes WHERE tenant_id = $1 AND lead_id = $2",
        )
        .bind(tenant_id)
        .bind(lead_id)
        .fetch_one(executor)
        .await?;

        Ok(count)
    }

    /// Existe alguma interação agendada para o futuro?
    pub async fn has_scheduled_interaction<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
    ) -> Result<bool, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let exists = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM crm_interacoes
                WHERE tenant_id = $1 AND lead_id = $2 AND agendada_para > NOW()
            )
            "#,
        )
        .bind(tenant_id)
        .bind(lead_id)
        .fetch_one(executor)
        .await?;

        Ok(exists)
    }
}
