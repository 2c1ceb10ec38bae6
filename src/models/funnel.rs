// src/models/funnel.rs

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

// --- ENUMS ---

// Mapeia o CREATE TYPE crm_stage_kind do banco.
// Os aliases em português são os valores antigos gravados pelo frontend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "crm_stage_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    #[default]
    #[serde(alias = "intermediaria")]
    Intermediate,
    #[serde(alias = "ganho")]
    Won,
    #[serde(alias = "perdido")]
    Lost,
}

impl StageKind {
    /// Etapas de fechamento (ganho ou perda) exigem um motivo para entrar.
    pub fn is_closing(self) -> bool {
        matches!(self, StageKind::Won | StageKind::Lost)
    }
}

// --- LISTA DE ETAPAS PERMITIDAS ---

/// Para onde um lead pode ir a partir de uma etapa.
///
/// No banco é uma lista opcional de ids; lista ausente ou vazia significa
/// "sem restrição", nunca "nenhum destino".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AllowedStages {
    #[default]
    Unrestricted,
    Restricted(BTreeSet<Uuid>),
}

impl AllowedStages {
    pub fn permits(&self, stage_id: Uuid) -> bool {
        match self {
            AllowedStages::Unrestricted => true,
            AllowedStages::Restricted(ids) => ids.contains(&stage_id),
        }
    }

    /// Ids na forma persistida (vazio quando não há restrição).
    pub fn ids(&self) -> Vec<Uuid> {
        match self {
            AllowedStages::Unrestricted => Vec::new(),
            AllowedStages::Restricted(ids) => ids.iter().copied().collect(),
        }
    }
}

impl From<Vec<Uuid>> for AllowedStages {
    fn from(ids: Vec<Uuid>) -> Self {
        if ids.is_empty() {
            AllowedStages::Unrestricted
        } else {
            AllowedStages::Restricted(ids.into_iter().collect())
        }
    }
}

impl From<Option<Vec<Uuid>>> for AllowedStages {
    fn from(ids: Option<Vec<Uuid>>) -> Self {
        ids.map(AllowedStages::from).unwrap_or_default()
    }
}

impl Serialize for AllowedStages {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.ids())
    }
}

impl<'de> Deserialize<'de> for AllowedStages {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<Vec<Uuid>>::deserialize(deserializer).map(AllowedStages::from)
    }
}

// --- AÇÕES OBRIGATÓRIAS ---

/// Pré-condição para um lead entrar numa etapa.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Requirement {
    /// Pelo menos `min_count` interações registradas.
    Interaction { min_count: u32 },
    /// Próxima ação agendada.
    FollowUp,
    /// Campo do lead preenchido.
    Field {
        field: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequirementError {
    #[error("A ação obrigatória na posição {0} não é um objeto.")]
    NotAnObject(usize),

    #[error("A ação obrigatória na posição {0} não informa o tipo.")]
    MissingKind(usize),

    #[error("Tipo de ação obrigatória desconhecido na posição {position}: '{kind}'.")]
    UnknownKind { position: usize, kind: String },

    #[error("A ação obrigatória na posição {0} não informa o nome do campo.")]
    MissingFieldName(usize),

    #[error("Quantidade mínima inválida na posição {position}: {value}.")]
    InvalidCount { position: usize, value: String },

    #[error("As ações obrigatórias devem ser uma lista.")]
    NotAList,
}

impl Requirement {
    /// Converte o JSON de configuração na variante canônica.
    /// Aceita as chaves antigas (`tipo`, `interacao`, `campo`, `minimo`...).
    pub fn from_value(position: usize, value: &Value) -> Result<Self, RequirementError> {
        let obj = value
            .as_object()
            .ok_or(RequirementError::NotAnObject(position))?;

        let kind = first_text(obj, &["type", "tipo"])
            .ok_or(RequirementError::MissingKind(position))?;

        match kind.to_lowercase().as_str() {
            "interaction" | "interacao" | "interação" => {
                let min_count = first_count(position, obj, &["min_count", "minimo", "quantidade"])?
                    .unwrap_or(1)
                    .max(1);
                Ok(Requirement::Interaction { min_count })
            }
            "follow_up" | "followup" | "proxima_acao" => Ok(Requirement::FollowUp),
            "field" | "campo" => {
                let field = first_text(obj, &["field", "campo"])
                    .ok_or(RequirementError::MissingFieldName(position))?;
                let label = first_text(obj, &["label", "rotulo"]);
                Ok(Requirement::Field { field, label })
            }
            _ => Err(RequirementError::UnknownKind { position, kind }),
        }
    }
}

/// Leitura estrita: qualquer entrada inválida rejeita a configuração inteira.
/// Usada quando o administrador grava uma etapa.
pub fn parse_requirements(values: &[Value]) -> Result<Vec<Requirement>, RequirementError> {
    values
        .iter()
        .enumerate()
        .map(|(position, value)| Requirement::from_value(position, value))
        .collect()
}

/// Leitura tolerante para linhas já gravadas: entradas desconhecidas são
/// descartadas (com aviso no log) para não travar o funil.
pub fn normalize_requirements(stage_id: Uuid, value: &Value) -> Vec<Requirement> {
    let items = match value {
        Value::Null => return Vec::new(),
        Value::Array(items) => items,
        _ => {
            tracing::warn!(%stage_id, "⚠️ {} Ignorando.", RequirementError::NotAList);
            return Vec::new();
        }
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(position, item)| match Requirement::from_value(position, item) {
            Ok(requirement) => Some(requirement),
            Err(e) => {
                tracing::warn!(%stage_id, "⚠️ Ação obrigatória ignorada: {}", e);
                None
            }
        })
        .collect()
}

fn first_text(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

// Chave presente com valor que não é inteiro >= 0 é erro, nunca o padrão.
// Aceita número inteiro, float sem parte fracionária (3.0) ou texto ("3").
fn first_count(
    position: usize,
    obj: &Map<String, Value>,
    keys: &[&str],
) -> Result<Option<u32>, RequirementError> {
    let Some(raw) = keys.iter().find_map(|key| obj.get(*key)) else {
        return Ok(None);
    };

    let invalid = || RequirementError::InvalidCount {
        position,
        value: raw.to_string(),
    };

    let n = match raw {
        Value::Null => return Ok(None),
        Value::Number(n) => match (n.as_u64(), n.as_f64()) {
            (Some(n), _) => n,
            (None, Some(f)) if f.is_finite() && f >= 0.0 && f.fract() == 0.0 => f as u64,
            _ => return Err(invalid()),
        },
        Value::String(s) => s.trim().parse::<u64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    Ok(Some(u32::try_from(n).unwrap_or(u32::MAX)))
}

// --- ETAPA ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub nome: String,
    pub tipo: StageKind,
    pub posicao: i32,
    pub etapas_permitidas: AllowedStages,
    pub acoes_obrigatorias: Vec<Requirement>,
    pub tempo_max_horas: Option<f64>,
    pub created_at: DateTime<Utc>,
}

// Linha crua de crm_etapas; as ações ficam em JSONB.
#[derive(Debug, Clone, FromRow)]
pub struct StageRow {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub nome: String,
    pub tipo: StageKind,
    pub posicao: i32,
    pub etapas_permitidas: Option<Vec<Uuid>>,
    pub acoes_obrigatorias: Value,
    pub tempo_max_horas: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<StageRow> for Stage {
    fn from(row: StageRow) -> Self {
        let acoes_obrigatorias = normalize_requirements(row.id, &row.acoes_obrigatorias);
        Self {
            id: row.id,
            tenant_id: row.tenant_id,
            nome: row.nome,
            tipo: row.tipo,
            posicao: row.posicao,
            etapas_permitidas: AllowedStages::from(row.etapas_permitidas),
            acoes_obrigatorias,
            tempo_max_horas: row.tempo_max_horas,
            created_at: row.created_at,
        }
    }
}

// --- LEAD ---

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub tenant_id: Uuid,

    pub nome: String,
    pub email: Option<String>,
    pub telefone: Option<String>,
    pub origem: Option<String>,
    pub valor: Option<f64>,

    pub etapa_id: Option<Uuid>,
    pub etapa_entrada_em: Option<DateTime<Utc>>,

    pub proxima_acao: Option<String>,
    pub motivo_ganho_perda: Option<String>,

    // CAMPOS PERSONALIZADOS
    // Ex: { "orcamento": "5000", "segmento": "varejo" }
    pub campos: Value,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    /// Valor de um campo pelo nome: colunas fixas primeiro, depois `campos`.
    pub fn field_value(&self, name: &str) -> Option<Value> {
        match name {
            "nome" => Some(Value::String(self.nome.clone())),
            "email" => self.email.clone().map(Value::String),
            "telefone" => self.telefone.clone().map(Value::String),
            "origem" => self.origem.clone().map(Value::String),
            "valor" => self.valor.map(Value::from),
            "proxima_acao" => self.proxima_acao.clone().map(Value::String),
            _ => self.campos.get(name).cloned(),
        }
    }

    pub fn has_next_action(&self) -> bool {
        self.proxima_acao
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}

// --- INTERAÇÕES ---

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub lead_id: Uuid,
    // Ex: "ligacao", "whatsapp", "reuniao"
    pub tipo: String,
    pub descricao: Option<String>,
    pub agendada_para: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// --- AVALIAÇÃO DE TRANSIÇÃO ---

/// Fatos pré-calculados pelo serviço antes de chamar o validador.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionContext {
    pub interactions_count: u32,
    pub has_scheduled_next_action: bool,
    pub reason_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    MissingTarget,
    DisallowedTransition,
    InsufficientInteractions,
    MissingFollowUp,
    MissingField,
    MissingExitReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionDecision {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<RejectionKind>,
}

impl TransitionDecision {
    pub fn approved() -> Self {
        Self { valid: true, message: None, rejection: None }
    }

    pub fn rejected(kind: RejectionKind, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: Some(message.into()),
            rejection: Some(kind),
        }
    }
}

// --- RESPOSTAS ---

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueLead {
    pub lead: Lead,
    pub etapa: Stage,
    pub horas_na_etapa: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_or_missing_allow_list_is_unrestricted() {
        assert_eq!(AllowedStages::from(None), AllowedStages::Unrestricted);
        assert_eq!(AllowedStages::from(Some(vec![])), AllowedStages::Unrestricted);
        assert!(AllowedStages::Unrestricted.permits(Uuid::new_v4()));
    }

    #[test]
    fn restricted_allow_list_checks_membership() {
        let b = Uuid::new_v4();
        let allowed = AllowedStages::from(vec![b]);
        assert!(allowed.permits(b));
        assert!(!allowed.permits(Uuid::new_v4()));
        assert_eq!(allowed.ids(), vec![b]);
    }

    #[test]
    fn allow_list_serializes_as_plain_list() {
        let b = Uuid::new_v4();
        assert_eq!(serde_json::to_value(AllowedStages::from(vec![b])).unwrap(), json!([b]));
        assert_eq!(serde_json::to_value(AllowedStages::Unrestricted).unwrap(), json!([]));

        let parsed: AllowedStages = serde_json::from_value(Value::Null).unwrap();
        assert_eq!(parsed, AllowedStages::Unrestricted);
    }

    #[test]
    fn canonical_requirements_parse() {
        let values = vec![
            json!({"type": "interaction", "min_count": 2}),
            json!({"type": "follow_up"}),
            json!({"type": "field", "field": "budget", "label": "Orçamento"}),
        ];
        let parsed = parse_requirements(&values).unwrap();
        assert_eq!(
            parsed,
            vec![
                Requirement::Interaction { min_count: 2 },
                Requirement::FollowUp,
                Requirement::Field { field: "budget".into(), label: Some("Orçamento".into()) },
            ]
        );
    }

    #[test]
    fn legacy_aliases_are_normalized() {
        let values = vec![
            json!({"tipo": "interacao", "minimo": "3"}),
            json!({"tipo": "proxima_acao"}),
            json!({"tipo": "campo", "campo": "orcamento", "rotulo": "Orçamento"}),
        ];
        let parsed = parse_requirements(&values).unwrap();
        assert_eq!(parsed[0], Requirement::Interaction { min_count: 3 });
        assert_eq!(parsed[1], Requirement::FollowUp);
        assert_eq!(
            parsed[2],
            Requirement::Field { field: "orcamento".into(), label: Some("Orçamento".into()) }
        );
    }

    #[test]
    fn interaction_min_count_defaults_to_one() {
        let parsed = Requirement::from_value(0, &json!({"type": "interaction"})).unwrap();
        assert_eq!(parsed, Requirement::Interaction { min_count: 1 });

        let zero = Requirement::from_value(0, &json!({"type": "interaction", "min_count": 0})).unwrap();
        assert_eq!(zero, Requirement::Interaction { min_count: 1 });
    }

    #[test]
    fn whole_float_min_count_is_accepted() {
        let parsed = Requirement::from_value(0, &json!({"type": "interaction", "min_count": 3.0})).unwrap();
        assert_eq!(parsed, Requirement::Interaction { min_count: 3 });
    }

    #[test]
    fn invalid_min_count_is_rejected_not_defaulted() {
        for bad in [json!(2.5), json!(-1), json!("dois"), json!(true), json!([3])] {
            let err = parse_requirements(&[json!({"type": "interaction", "min_count": bad})]).unwrap_err();
            assert!(
                matches!(err, RequirementError::InvalidCount { position: 0, .. }),
                "{bad} deveria ser recusado"
            );
        }

        let err = parse_requirements(&[
            json!({"type": "follow_up"}),
            json!({"tipo": "interacao", "minimo": -2}),
        ])
        .unwrap_err();
        assert_eq!(err, RequirementError::InvalidCount { position: 1, value: "-2".into() });
    }

    #[test]
    fn lenient_normalization_drops_invalid_counts() {
        let raw = json!([{"type": "interaction", "min_count": 2.5}, {"type": "follow_up"}]);
        assert_eq!(normalize_requirements(Uuid::new_v4(), &raw), vec![Requirement::FollowUp]);
    }

    #[test]
    fn strict_parsing_rejects_unknown_kinds() {
        let values = vec![json!({"type": "follow_up"}), json!({"type": "telepatia"})];
        let err = parse_requirements(&values).unwrap_err();
        assert_eq!(err, RequirementError::UnknownKind { position: 1, kind: "telepatia".into() });
    }

    #[test]
    fn strict_parsing_rejects_field_without_name() {
        let err = parse_requirements(&[json!({"type": "field", "field": "  "})]).unwrap_err();
        assert_eq!(err, RequirementError::MissingFieldName(0));

        let err = parse_requirements(&[json!("follow_up")]).unwrap_err();
        assert_eq!(err, RequirementError::NotAnObject(0));
    }

    #[test]
    fn lenient_normalization_drops_unknown_entries() {
        let raw = json!([
            {"type": "telepatia"},
            {"type": "follow_up"},
            42,
        ]);
        let parsed = normalize_requirements(Uuid::new_v4(), &raw);
        assert_eq!(parsed, vec![Requirement::FollowUp]);

        assert!(normalize_requirements(Uuid::new_v4(), &Value::Null).is_empty());
        assert!(normalize_requirements(Uuid::new_v4(), &json!({"type": "follow_up"})).is_empty());
        assert!(RequirementError::NotAList.to_string().contains("lista"));
    }

    #[test]
    fn stage_kind_accepts_legacy_names() {
        let kind: StageKind = serde_json::from_value(json!("perdido")).unwrap();
        assert_eq!(kind, StageKind::Lost);
        assert!(kind.is_closing());
        assert!(!StageKind::default().is_closing());
    }

    #[test]
    fn decision_omits_message_when_valid() {
        let json = serde_json::to_value(TransitionDecision::approved()).unwrap();
        assert_eq!(json, json!({"valid": true}));

        let json = serde_json::to_value(TransitionDecision::rejected(
            RejectionKind::MissingTarget,
            "x",
        ))
        .unwrap();
        assert_eq!(json, json!({"valid": false, "message": "x", "rejection": "missing_target"}));
    }
}
