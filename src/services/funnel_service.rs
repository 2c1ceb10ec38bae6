// src/services/funnel_service.rs

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{Acquire, Executor, PgConnection, Postgres};
use uuid::Uuid;

use crate::{
    common::error::AppError,
    db::FunnelRepository,
    models::funnel::{
        parse_requirements, AllowedStages, Interaction, Lead, OverdueLead, Stage, StageKind,
        TransitionContext, TransitionDecision,
    },
    services::funnel_validation::{evaluate_transition, hours_between, is_overdue, is_overdue_at},
};

#[derive(Clone)]
pub struct FunnelService {
    repo: FunnelRepository,
}

impl FunnelService {
    pub fn new(repo: FunnelRepository) -> Self {
        Self { repo }
    }

    pub async fn ping(&self) -> Result<(), AppError> {
        self.repo.ping().await
    }

    // =========================================================================
    //  1. CONFIGURAÇÃO DAS ETAPAS
    // =========================================================================

    /// Cria uma etapa. Aqui a leitura das ações é estrita: tipo desconhecido
    /// recusa a configuração em vez de ser ignorado.
    pub async fn create_stage<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        nome: &str,
        tipo: StageKind,
        posicao: i32,
        etapas_permitidas: Option<Vec<Uuid>>,
        acoes_obrigatorias: &[Value],
        tempo_max_horas: Option<f64>,
    ) -> Result<Stage, AppError>
    where
        E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres>,
    {
        let requirements = parse_requirements(acoes_obrigatorias)?;
        let acoes = serde_json::to_value(&requirements).map_err(anyhow::Error::from)?;
        let allowed_ids = AllowedStages::from(etapas_permitidas).ids();

        let mut tx = executor.begin().await?;

        if !allowed_ids.is_empty() {
            let found = self.repo.count_stages(&mut *tx, tenant_id, &allowed_ids).await?;
            if found != allowed_ids.len() as i64 {
                return Err(AppError::InvalidStageConfig(
                    "Uma ou mais etapas permitidas não existem.".into(),
                ));
            }
        }

        let stage = self
            .repo
            .create_stage(
                &mut *tx,
                tenant_id,
                nome,
                tipo,
                posicao,
                &allowed_ids,
                &acoes,
                tempo_max_horas,
            )
            .await?;

        tx.commit().await?;

        tracing::info!(
            %tenant_id,
            stage_id = %stage.id,
            acoes = stage.acoes_obrigatorias.len(),
            "✅ Etapa '{}' criada",
            stage.nome
        );
        Ok(stage)
    }

    pub async fn list_stages<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Vec<Stage>, AppError>
    where
        E: Executor<'e, Database = Postgres>,
    {
        self.repo.list_stages(executor, tenant_id).await
    }

    // =========================================================================
    //  2. LEADS E INTERAÇÕES
    // =========================================================================

    /// O lead entra na primeira etapa do funil, se houver alguma.
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
        campos: Map<String, Value>,
    ) -> Result<Lead, AppError>
    where
        E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres>,
    {
        let mut tx = executor.begin().await?;

        let first_stage = self.repo.first_stage(&mut *tx, tenant_id).await?;

        let lead = self
            .repo
            .create_lead(
                &mut *tx,
                tenant_id,
                nome,
                email,
                telefone,
                origem,
                valor,
                proxima_acao,
                &Value::Object(campos),
                first_stage.as_ref().map(|s| s.id),
            )
            .await?;

        tx.commit().await?;
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
        self.repo.list_leads(executor, tenant_id).await
    }

    pub async fn log_interaction<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
        tipo: &str,
        descricao: Option<&str>,
        agendada_para: Option<DateTime<Utc>>,
    ) -> Result<Interaction, AppError>
    where
        E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres>,
    {
        let mut tx = executor.begin().await?;

        self.repo
            .find_lead(&mut *tx, tenant_id, lead_id)
            .await?
            .ok_or_else(|| AppError::ResourceNotFound("Lead".into()))?;

        let interaction = self
            .repo
            .create_interaction(&mut *tx, tenant_id, lead_id, tipo, descricao, agendada_para)
            .await?;

        tx.commit().await?;
        Ok(interaction)
    }

    // =========================================================================
    //  3. MOVIMENTAÇÃO NO FUNIL
    // =========================================================================

    /// Avalia a movimentação sem gravar nada (pré-checagem da tela).
    pub async fn check_transition<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
        target_id: Option<Uuid>,
        reason: &str,
    ) -> Result<TransitionDecision, AppError>
    where
        E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres>,
    {
        let mut tx = executor.begin().await?;

        let lead = self
            .repo
            .find_lead(&mut *tx, tenant_id, lead_id)
            .await?
            .ok_or_else(|| AppError::ResourceNotFound("Lead".into()))?;

        let (_, _, decision) = self.evaluate(&mut *tx, tenant_id, &lead, target_id, reason).await?;

        tx.commit().await?;
        Ok(decision)
    }

    /// Move o lead se o validador aprovar. A linha fica travada entre a
    /// avaliação e a gravação.
    pub async fn move_lead<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
        lead_id: Uuid,
        target_id: Option<Uuid>,
        reason: &str,
    ) -> Result<Lead, AppError>
    where
        E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres>,
    {
        let mut tx = executor.begin().await?;

        let lead = self
            .repo
            .find_lead_for_update(&mut *tx, tenant_id, lead_id)
            .await?
            .ok_or_else(|| AppError::ResourceNotFound("Lead".into()))?;

        let (source, target, decision) =
            self.evaluate(&mut *tx, tenant_id, &lead, target_id, reason).await?;

        let target = match (decision.valid, target) {
            (true, Some(target)) => target,
            _ => {
                tracing::info!(
                    %tenant_id,
                    %lead_id,
                    rejection = ?decision.rejection,
                    "🚫 Movimentação recusada"
                );
                // O drop de `tx` faz rollback e solta a trava.
                return Err(AppError::TransitionRejected(decision));
            }
        };

        let motivo = Some(reason.trim()).filter(|r| !r.is_empty());
        let moved = self
            .repo
            .update_lead_stage(&mut *tx, tenant_id, lead_id, target.id, motivo)
            .await?;

        tx.commit().await?;

        tracing::info!(
            %tenant_id,
            %lead_id,
            from = ?lead.etapa_id,
            to = %target.id,
            atrasado = source.as_ref().is_some_and(|s| is_overdue(s, lead.etapa_entrada_em)),
            "➡️ Lead movido para '{}'",
            target.nome
        );
        Ok(moved)
    }

    // Busca origem, destino e contexto; o validador em si é puro.
    async fn evaluate(
        &self,
        conn: &mut PgConnection,
        tenant_id: Uuid,
        lead: &Lead,
        target_id: Option<Uuid>,
        reason: &str,
    ) -> Result<(Option<Stage>, Option<Stage>, TransitionDecision), AppError> {
        let source = match lead.etapa_id {
            Some(id) => self.repo.find_stage(&mut *conn, tenant_id, id).await?,
            None => None,
        };

        let target = match target_id {
            Some(id) => self.repo.find_stage(&mut *conn, tenant_id, id).await?,
            None => None,
        };

        let interactions = self.repo.count_interactions(&mut *conn, tenant_id, lead.id).await?;
        let scheduled = self
            .repo
            .has_scheduled_interaction(&mut *conn, tenant_id, lead.id)
            .await?;

        let ctx = TransitionContext {
            interactions_count: u32::try_from(interactions.max(0)).unwrap_or(u32::MAX),
            has_scheduled_next_action: scheduled,
            reason_text: reason.to_string(),
        };

        let decision = evaluate_transition(source.as_ref(), target.as_ref(), lead, &ctx);
        Ok((source, target, decision))
    }

    // =========================================================================
    //  4. ATRASOS
    // =========================================================================

    /// Leads que passaram do tempo máximo da etapa atual.
    pub async fn list_overdue_leads<'e, E>(
        &self,
        executor: E,
        tenant_id: Uuid,
    ) -> Result<Vec<OverdueLead>, AppError>
    where
        E: Executor<'e, Database = Postgres> + Acquire<'e, Database = Postgres>,
    {
        let mut tx = executor.begin().await?;
        let stages = self.repo.list_stages(&mut *tx, tenant_id).await?;
        let leads = self.repo.list_leads(&mut *tx, tenant_id).await?;
        tx.commit().await?;

        Ok(collect_overdue(stages, leads, Utc::now()))
    }
}

fn collect_overdue(stages: Vec<Stage>, leads: Vec<Lead>, now: DateTime<Utc>) -> Vec<OverdueLead> {
    let stages: HashMap<Uuid, Stage> = stages.into_iter().map(|s| (s.id, s)).collect();

    let mut overdue: Vec<OverdueLead> = leads
        .into_iter()
        .filter_map(|lead| {
            let stage = stages.get(&lead.etapa_id?)?;
            let entered_at = lead.etapa_entrada_em?;
            if !is_overdue_at(stage, Some(entered_at), now) {
                return None;
            }
            Some(OverdueLead {
                horas_na_etapa: hours_between(entered_at, now),
                etapa: stage.clone(),
                lead,
            })
        })
        .collect();

    // Mais atrasados primeiro
    overdue.sort_by(|a, b| b.horas_na_etapa.total_cmp(&a.horas_na_etapa));
    overdue
}
