// src/services/funnel_validation.rs

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::models::funnel::{
    Lead, RejectionKind, Requirement, Stage, TransitionContext, TransitionDecision,
};

const MILLIS_PER_HOUR: f64 = 3_600_000.0;
const NANOS_PER_HOUR: f64 = 3_600_000_000_000.0;

// =========================================================================
//  VALIDAÇÃO DE TRANSIÇÃO
// =========================================================================

/// Decide se o lead pode sair de `source` e entrar em `target`.
///
/// As checagens rodam sempre na mesma ordem e a primeira falha vence:
/// destino ausente, etapas permitidas, ações obrigatórias do destino e,
/// por último, motivo para ganho/perda. Nunca entra em pânico e não muta nada.
pub fn evaluate_transition(
    source: Option<&Stage>,
    target: Option<&Stage>,
    lead: &Lead,
    ctx: &TransitionContext,
) -> TransitionDecision {
    let Some(target) = target else {
        return TransitionDecision::rejected(
            RejectionKind::MissingTarget,
            "Nenhuma etapa de destino foi informada.",
        );
    };

    if let Some(source) = source {
        if !source.etapas_permitidas.permits(target.id) {
            return TransitionDecision::rejected(
                RejectionKind::DisallowedTransition,
                format!(
                    "Não é permitido mover de \"{}\" para \"{}\".",
                    format_stage_name(&source.nome),
                    format_stage_name(&target.nome)
                ),
            );
        }
    }

    for requirement in &target.acoes_obrigatorias {
        if let Some(decision) = check_requirement(requirement, target, lead, ctx) {
            return decision;
        }
    }

    if target.tipo.is_closing() && ctx.reason_text.trim().is_empty() {
        return TransitionDecision::rejected(
            RejectionKind::MissingExitReason,
            format!(
                "Informe o motivo para mover o lead para \"{}\".",
                format_stage_name(&target.nome)
            ),
        );
    }

    TransitionDecision::approved()
}

// Retorna a rejeição quando a ação não foi cumprida.
fn check_requirement(
    requirement: &Requirement,
    target: &Stage,
    lead: &Lead,
    ctx: &TransitionContext,
) -> Option<TransitionDecision> {
    let stage_name = format_stage_name(&target.nome);

    match requirement {
        Requirement::Interaction { min_count } => {
            (ctx.interactions_count < *min_count).then(|| {
                TransitionDecision::rejected(
                    RejectionKind::InsufficientInteractions,
                    format!(
                        "Para entrar em \"{}\" é necessário registrar pelo menos {} interação(ões).",
                        stage_name, min_count
                    ),
                )
            })
        }
        Requirement::FollowUp => {
            let scheduled = ctx.has_scheduled_next_action || lead.has_next_action();
            (!scheduled).then(|| {
                TransitionDecision::rejected(
                    RejectionKind::MissingFollowUp,
                    format!(
                        "Para entrar em \"{}\" é necessário agendar a próxima ação.",
                        stage_name
                    ),
                )
            })
        }
        Requirement::Field { field, label } => {
            let filled = lead.field_value(field).is_some_and(|v| is_filled(&v));
            (!filled).then(|| {
                TransitionDecision::rejected(
                    RejectionKind::MissingField,
                    format!(
                        "Para entrar em \"{}\" o campo \"{}\" precisa estar preenchido.",
                        stage_name,
                        label.as_deref().unwrap_or(field)
                    ),
                )
            })
        }
    }
}

// Só null e texto em branco contam como ausente; 0 e false são valores.
fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    }
}

/// "proposta_enviada" -> "Proposta Enviada". Apenas para mensagens.
pub fn format_stage_name(name: &str) -> String {
    name.replace('_', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// =========================================================================
//  TEMPO NA ETAPA
// =========================================================================

/// O lead passou do tempo máximo da etapa?
pub fn is_overdue(stage: &Stage, entered_at: Option<DateTime<Utc>>) -> bool {
    is_overdue_at(stage, entered_at, Utc::now())
}

/// Mesmo que [`is_overdue`], com o "agora" explícito.
pub fn is_overdue_at(
    stage: &Stage,
    entered_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    let Some(limit) = max_hours(stage) else {
        return false;
    };
    let Some(entered_at) = entered_at else {
        return false;
    };
    hours_between(entered_at, now) > limit
}

/// Horas (fracionárias) entre a entrada na etapa e `now`.
pub fn hours_between(entered_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let elapsed = now - entered_at;
    // num_nanoseconds só estoura depois de ~292 anos
    match elapsed.num_nanoseconds() {
        Some(nanos) => nanos as f64 / NANOS_PER_HOUR,
        None => elapsed.num_milliseconds() as f64 / MILLIS_PER_HOUR,
    }
}

fn max_hours(stage: &Stage) -> Option<f64> {
    stage
        .tempo_max_horas
        .filter(|h| h.is_finite() && *h > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::funnel::{AllowedStages, StageKind};
    use chrono::Duration;
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    fn stage(nome: &str, tipo: StageKind) -> Stage {
        Stage {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            nome: nome.to_string(),
            tipo,
            posicao: 0,
            etapas_permitidas: AllowedStages::Unrestricted,
            acoes_obrigatorias: Vec::new(),
            tempo_max_horas: None,
            created_at: Utc::now(),
        }
    }

    fn lead() -> Lead {
        Lead {
            id: Uuid::new_v4(),
            tenant_id: Uuid::nil(),
            nome: "Maria".into(),
            email: None,
            telefone: None,
            origem: None,
            valor: None,
            etapa_id: None,
            etapa_entrada_em: None,
            proxima_acao: None,
            motivo_ganho_perda: None,
            campos: json!({}),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ctx() -> TransitionContext {
        TransitionContext::default()
    }

    // --- destino ---

    #[test]
    fn missing_target_is_rejected() {
        let source = stage("novo", StageKind::Intermediate);
        let decision = evaluate_transition(Some(&source), None, &lead(), &ctx());
        assert!(!decision.valid);
        assert_eq!(decision.rejection, Some(RejectionKind::MissingTarget));
        assert!(decision.message.is_some());
    }

    // --- etapas permitidas ---

    #[test]
    fn disallowed_transition_names_both_stages() {
        let s2 = stage("S2", StageKind::Intermediate);
        let mut s1 = stage("S1", StageKind::Intermediate);
        s1.etapas_permitidas = AllowedStages::from(vec![s2.id]);
        let s3 = stage("S3", StageKind::Intermediate);

        let decision = evaluate_transition(Some(&s1), Some(&s3), &lead(), &ctx());
        assert!(!decision.valid);
        assert_eq!(decision.rejection, Some(RejectionKind::DisallowedTransition));
        let message = decision.message.unwrap();
        assert!(message.contains("S1"));
        assert!(message.contains("S3"));

        assert!(evaluate_transition(Some(&s1), Some(&s2), &lead(), &ctx()).valid);
    }

    #[test]
    fn allow_list_compares_ids_not_names() {
        let mut target = stage("proposta", StageKind::Intermediate);
        let twin = stage("proposta", StageKind::Intermediate);
        let mut source = stage("qualificacao", StageKind::Intermediate);
        source.etapas_permitidas = AllowedStages::from(vec![twin.id]);
        target.nome = twin.nome.clone();

        let decision = evaluate_transition(Some(&source), Some(&target), &lead(), &ctx());
        assert_eq!(decision.rejection, Some(RejectionKind::DisallowedTransition));
    }

    #[test]
    fn lead_without_stage_skips_allow_list() {
        let target = stage("novo", StageKind::Intermediate);
        assert!(evaluate_transition(None, Some(&target), &lead(), &ctx()).valid);
    }

    // --- ações obrigatórias ---

    #[test]
    fn interaction_requirement_needs_min_count() {
        let mut target = stage("reuniao", StageKind::Intermediate);
        target.acoes_obrigatorias = vec![Requirement::Interaction { min_count: 2 }];

        let one = TransitionContext { interactions_count: 1, ..ctx() };
        let decision = evaluate_transition(None, Some(&target), &lead(), &one);
        assert_eq!(decision.rejection, Some(RejectionKind::InsufficientInteractions));
        assert!(decision.message.unwrap().contains('2'));

        let two = TransitionContext { interactions_count: 2, ..ctx() };
        assert!(evaluate_transition(None, Some(&target), &lead(), &two).valid);
    }

    #[test]
    fn follow_up_accepts_context_flag_or_lead_next_action() {
        let mut target = stage("negociacao", StageKind::Intermediate);
        target.acoes_obrigatorias = vec![Requirement::FollowUp];

        let decision = evaluate_transition(None, Some(&target), &lead(), &ctx());
        assert_eq!(decision.rejection, Some(RejectionKind::MissingFollowUp));

        let scheduled = TransitionContext { has_scheduled_next_action: true, ..ctx() };
        assert!(evaluate_transition(None, Some(&target), &lead(), &scheduled).valid);

        let mut with_action = lead();
        with_action.proxima_acao = Some("Ligar na segunda".into());
        assert!(evaluate_transition(None, Some(&target), &with_action, &ctx()).valid);

        let mut blank_action = lead();
        blank_action.proxima_acao = Some("   ".into());
        assert!(!evaluate_transition(None, Some(&target), &blank_action, &ctx()).valid);
    }

    #[test]
    fn field_requirement_checks_presence() {
        let mut target = stage("proposta", StageKind::Intermediate);
        target.acoes_obrigatorias = vec![Requirement::Field { field: "budget".into(), label: None }];

        let missing = evaluate_transition(None, Some(&target), &lead(), &ctx());
        assert_eq!(missing.rejection, Some(RejectionKind::MissingField));
        assert!(missing.message.unwrap().contains("budget"));

        let mut blank = lead();
        blank.campos = json!({"budget": "   "});
        assert!(!evaluate_transition(None, Some(&target), &blank, &ctx()).valid);

        let mut empty = lead();
        empty.campos = json!({"budget": ""});
        assert!(!evaluate_transition(None, Some(&target), &empty, &ctx()).valid);

        let mut null = lead();
        null.campos = json!({"budget": null});
        assert!(!evaluate_transition(None, Some(&target), &null, &ctx()).valid);

        let mut filled = lead();
        filled.campos = json!({"budget": "100"});
        assert!(evaluate_transition(None, Some(&target), &filled, &ctx()).valid);
    }

    #[test]
    fn falsy_values_count_as_present() {
        let mut target = stage("proposta", StageKind::Intermediate);
        target.acoes_obrigatorias = vec![
            Requirement::Field { field: "desconto".into(), label: None },
            Requirement::Field { field: "aceita_termos".into(), label: None },
        ];
        let mut l = lead();
        l.campos = json!({"desconto": 0, "aceita_termos": false});
        assert!(evaluate_transition(None, Some(&target), &l, &ctx()).valid);
    }

    #[test]
    fn field_requirement_reads_fixed_columns_and_prefers_label() {
        let mut target = stage("qualificado", StageKind::Intermediate);
        target.acoes_obrigatorias = vec![Requirement::Field {
            field: "email".into(),
            label: Some("E-mail".into()),
        }];

        let decision = evaluate_transition(None, Some(&target), &lead(), &ctx());
        assert!(decision.message.unwrap().contains("\"E-mail\""));

        let mut l = lead();
        l.email = Some("maria@email.com".into());
        assert!(evaluate_transition(None, Some(&target), &l, &ctx()).valid);
    }

    #[test]
    fn first_unmet_requirement_wins() {
        let mut target = stage("proposta", StageKind::Intermediate);
        target.acoes_obrigatorias = vec![
            Requirement::FollowUp,
            Requirement::Interaction { min_count: 5 },
        ];
        let decision = evaluate_transition(None, Some(&target), &lead(), &ctx());
        assert_eq!(decision.rejection, Some(RejectionKind::MissingFollowUp));
    }

    #[test]
    fn allow_list_is_checked_before_requirements() {
        let mut target = stage("fechado", StageKind::Won);
        target.acoes_obrigatorias = vec![Requirement::FollowUp];
        let mut source = stage("novo", StageKind::Intermediate);
        source.etapas_permitidas = AllowedStages::from(vec![Uuid::new_v4()]);

        let decision = evaluate_transition(Some(&source), Some(&target), &lead(), &ctx());
        assert_eq!(decision.rejection, Some(RejectionKind::DisallowedTransition));
    }

    // --- motivo de ganho/perda ---

    #[test]
    fn closing_stage_requires_reason() {
        let target = stage("S2", StageKind::Lost);

        let blank = TransitionContext { reason_text: "  ".into(), ..ctx() };
        let decision = evaluate_transition(None, Some(&target), &lead(), &blank);
        assert!(!decision.valid);
        assert_eq!(decision.rejection, Some(RejectionKind::MissingExitReason));

        let reason = TransitionContext { reason_text: "price too high".into(), ..ctx() };
        let decision = evaluate_transition(None, Some(&target), &lead(), &reason);
        assert_eq!(decision, TransitionDecision::approved());
    }

    #[test]
    fn requirements_are_checked_before_reason() {
        let mut target = stage("ganho", StageKind::Won);
        target.acoes_obrigatorias = vec![Requirement::Interaction { min_count: 1 }];
        let decision = evaluate_transition(None, Some(&target), &lead(), &ctx());
        assert_eq!(decision.rejection, Some(RejectionKind::InsufficientInteractions));
    }

    #[test]
    fn intermediate_stage_does_not_require_reason() {
        let target = stage("contato", StageKind::Intermediate);
        assert!(evaluate_transition(None, Some(&target), &lead(), &ctx()).valid);
    }

    // --- nomes ---

    #[test]
    fn stage_names_are_title_cased() {
        assert_eq!(format_stage_name("proposta_enviada"), "Proposta Enviada");
        assert_eq!(format_stage_name("em negociação"), "Em Negociação");
        assert_eq!(format_stage_name("S1"), "S1");
        assert_eq!(format_stage_name(""), "");
    }

    #[test]
    fn stage_name_keeps_one_space_per_underscore() {
        assert_eq!(format_stage_name("a__b"), "A  B");
        assert_eq!(format_stage_name("_novo"), " Novo");
        assert_eq!(format_stage_name("fechado_"), "Fechado ");
    }

    // --- atraso ---

    #[test]
    fn overdue_is_false_without_limit_or_entry_time() {
        let now = Utc::now();
        let mut s = stage("contato", StageKind::Intermediate);
        assert!(!is_overdue_at(&s, Some(now - Duration::days(30)), now));

        s.tempo_max_horas = Some(0.0);
        assert!(!is_overdue_at(&s, Some(now - Duration::days(30)), now));

        s.tempo_max_horas = Some(24.0);
        assert!(!is_overdue_at(&s, None, now));
    }

    #[test]
    fn overdue_boundary_is_strict() {
        let now = Utc::now();
        let mut s = stage("contato", StageKind::Intermediate);
        s.tempo_max_horas = Some(24.0);

        assert!(!is_overdue_at(&s, Some(now - Duration::hours(24)), now));
        assert!(is_overdue_at(&s, Some(now - Duration::hours(24) - Duration::seconds(1)), now));
        assert!(!is_overdue_at(&s, Some(now - Duration::hours(23)), now));
    }

    #[test]
    fn overdue_detects_sub_millisecond_excess() {
        let now = Utc::now();
        let mut s = stage("contato", StageKind::Intermediate);
        s.tempo_max_horas = Some(24.0);

        let just_over = now - Duration::hours(24) - Duration::microseconds(1);
        assert!(is_overdue_at(&s, Some(just_over), now));
        assert!(hours_between(just_over, now) > 24.0);

        let nanos_over = now - Duration::hours(24) - Duration::nanoseconds(500);
        assert!(is_overdue_at(&s, Some(nanos_over), now));
    }

    #[test]
    fn overdue_uses_fractional_hours() {
        let now = Utc::now();
        let mut s = stage("contato", StageKind::Intermediate);
        s.tempo_max_horas = Some(1.5);
        assert!(is_overdue_at(&s, Some(now - Duration::minutes(91)), now));
        assert!(!is_overdue_at(&s, Some(now - Duration::minutes(90)), now));
    }

    #[test]
    fn overdue_against_wall_clock() {
        let mut s = stage("contato", StageKind::Intermediate);
        s.tempo_max_horas = Some(1.0);
        assert!(is_overdue(&s, Some(Utc::now() - Duration::hours(2))));
        assert!(!is_overdue(&s, Some(Utc::now())));
    }

    // --- propriedades ---

    proptest! {
        /// Sem destino a transição é sempre inválida.
        #[test]
        fn no_target_is_always_invalid(
            count in 0u32..100,
            scheduled in any::<bool>(),
            reason in ".*",
        ) {
            let c = TransitionContext {
                interactions_count: count,
                has_scheduled_next_action: scheduled,
                reason_text: reason,
            };
            let source = stage("novo", StageKind::Intermediate);
            let decision = evaluate_transition(Some(&source), None, &lead(), &c);
            prop_assert!(!decision.valid);
            prop_assert!(decision.message.is_some());
        }

        /// Sem lista de permitidas, qualquer destino passa a primeira barreira.
        #[test]
        fn unrestricted_source_permits_any_target(name in "[a-z_]{1,20}") {
            let source = stage("novo", StageKind::Intermediate);
            let target = stage(&name, StageKind::Intermediate);
            let decision = evaluate_transition(Some(&source), Some(&target), &lead(), &ctx());
            prop_assert!(decision.valid);
        }

        /// Interações suficientes se e somente se count >= mínimo.
        #[test]
        fn interaction_gate_matches_min_count(min in 1u32..20, count in 0u32..40) {
            let mut target = stage("reuniao", StageKind::Intermediate);
            target.acoes_obrigatorias = vec![Requirement::Interaction { min_count: min }];
            let c = TransitionContext { interactions_count: count, ..ctx() };
            let decision = evaluate_transition(None, Some(&target), &lead(), &c);
            prop_assert_eq!(decision.valid, count >= min);
        }

        /// Motivo em branco nunca fecha um lead.
        #[test]
        fn whitespace_reason_never_closes(reason in "[ \t\n]*", won in any::<bool>()) {
            let kind = if won { StageKind::Won } else { StageKind::Lost };
            let target = stage("fechamento", kind);
            let c = TransitionContext { reason_text: reason, ..ctx() };
            prop_assert!(!evaluate_transition(None, Some(&target), &lead(), &c).valid);
        }

        /// Atraso é estritamente maior que o limite.
        #[test]
        fn overdue_iff_elapsed_exceeds_limit(limit in 1u32..500, elapsed_minutes in 0i64..40_000) {
            let now = Utc::now();
            let mut s = stage("contato", StageKind::Intermediate);
            s.tempo_max_horas = Some(f64::from(limit));
            let entered = now - Duration::minutes(elapsed_minutes);
            prop_assert_eq!(
                is_overdue_at(&s, Some(entered), now),
                elapsed_minutes > i64::from(limit) * 60
            );
        }
    }
}
