//! # Modelo HMM por Iteração
//!
//! O modelo guarda as duas tabelas de parâmetros de um HMM discreto, em
//! **log-space**:
//! 1. Transição: $\log P(to \mid from)$, chave `(from, to)`.
//! 2. Emissão: $\log P(token \mid state)$, chave `(state, token)`.
//!
//! Cada iteração EM produz um `Model` novo; nenhum modelo é alterado depois de
//! construído. As tarefas de expectation recebem apenas `&Model`, o que as
//! torna funções puras da partição e do modelo da rodada anterior.
//!
//! ## Estados ocultos
//!
//! O conjunto de estados percorrido pelos algoritmos de programação dinâmica
//! é o conjunto (ordenado) de todos os **destinos** de transição. O estado
//! inicial (ex: `#`) só entra nesse conjunto se também for destino de alguma
//! transição.
//!
//! ## Persistência
//!
//! Um snapshot é gravado em JSON Lines, um [`ModelRecord`] por linha, ordenado
//! por `(kind, first, second)` para que duas execuções iguais gerem bytes iguais:
//!
//! ```text
//! {"kind":"transition","first":"#","second":"A","logProbability":-0.69}
//! {"kind":"emission","first":"A","second":"x","logProbability":-0.10}
//! {"kind":"log_likelihood","value":-12.5}
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EmError, Result};
use crate::logspace::{log_sum, LogProb};

/// Par ordenado de strings: `(from, to)` ou `(state, token)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StatePair {
    pub first: String,
    pub second: String,
}

impl StatePair {
    pub fn new(first: impl Into<String>, second: impl Into<String>) -> Self {
        Self {
            first: first.into(),
            second: second.into(),
        }
    }
}

impl fmt::Display for StatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.first, self.second)
    }
}

/// Tipo de parâmetro do HMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    Transition,
    Emission,
}

impl ParameterKind {
    pub fn name(&self) -> &'static str {
        match self {
            ParameterKind::Transition => "transition",
            ParameterKind::Emission => "emission",
        }
    }
}

/// Unidade de entrada do seeding, de saída de cada iteração e do snapshot persistido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelParameter {
    pub kind: ParameterKind,
    pub pair: StatePair,
    pub log_probability: f64,
}

impl ModelParameter {
    pub fn new(kind: ParameterKind, pair: StatePair, log_probability: f64) -> Self {
        Self {
            kind,
            pair,
            log_probability,
        }
    }
}

/// Contagem esperada parcial, produzida pela expectation e consumida por
/// exatamente uma maximization (a do estado de origem).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCount {
    pub kind: ParameterKind,
    pub target: String,
    /// Contagem acumulada em log-space.
    pub log_count: f64,
}

/// Linha persistida de um snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelRecord {
    Transition {
        first: String,
        second: String,
        #[serde(rename = "logProbability")]
        log_probability: f64,
    },
    Emission {
        first: String,
        second: String,
        #[serde(rename = "logProbability")]
        log_probability: f64,
    },
    /// Tipo reservado: log-verossimilhança total da rodada que gerou o snapshot.
    LogLikelihood { value: f64 },
}

impl From<ModelParameter> for ModelRecord {
    fn from(p: ModelParameter) -> Self {
        let ModelParameter {
            kind,
            pair: StatePair { first, second },
            log_probability,
        } = p;
        match kind {
            ParameterKind::Transition => ModelRecord::Transition {
                first,
                second,
                log_probability,
            },
            ParameterKind::Emission => ModelRecord::Emission {
                first,
                second,
                log_probability,
            },
        }
    }
}

/// Tabela `origem -> destino -> log-prob`.
type Table = BTreeMap<String, BTreeMap<String, f64>>;

/// Modelo HMM imutável de uma iteração.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Model {
    transitions: Table,
    emissions: Table,
    /// Destinos de transição, em ordem lexicográfica.
    states: Vec<String>,
}

impl Model {
    /// Monta o modelo a partir de parâmetros já normalizados.
    pub fn from_parameters<I: IntoIterator<Item = ModelParameter>>(params: I) -> Self {
        let mut transitions = Table::new();
        let mut emissions = Table::new();

        for p in params {
            let table = match p.kind {
                ParameterKind::Transition => &mut transitions,
                ParameterKind::Emission => &mut emissions,
            };
            table
                .entry(p.pair.first)
                .or_default()
                .insert(p.pair.second, p.log_probability);
        }

        let states: BTreeSet<String> = transitions
            .values()
            .flat_map(|targets| targets.keys().cloned())
            .collect();

        Self {
            transitions,
            emissions,
            states: states.into_iter().collect(),
        }
    }

    /// $\log P(to \mid from)$, `None` se a transição não existe.
    pub fn transition(&self, from: &str, to: &str) -> LogProb {
        self.transitions.get(from)?.get(to).copied()
    }

    /// $\log P(token \mid state)$, `None` se a emissão não existe.
    pub fn emission(&self, state: &str, token: &str) -> LogProb {
        self.emissions.get(state)?.get(token).copied()
    }

    /// Estados ocultos percorridos pelo forward-backward e pelo Viterbi.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    /// Número total de parâmetros (transições + emissões).
    pub fn len(&self) -> usize {
        let count = |t: &Table| t.values().map(BTreeMap::len).sum::<usize>();
        count(&self.transitions) + count(&self.emissions)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Todos os parâmetros, transições primeiro, em ordem `(first, second)`.
    pub fn parameters(&self) -> impl Iterator<Item = ModelParameter> + '_ {
        table_parameters(ParameterKind::Transition, &self.transitions)
            .chain(table_parameters(ParameterKind::Emission, &self.emissions))
    }

    /// Maior desvio $|\sum_t P(t \mid s) - 1|$ entre todas as distribuições do modelo.
    pub fn max_normalization_error(&self) -> f64 {
        self.transitions
            .values()
            .chain(self.emissions.values())
            .map(|targets| {
                let total: f64 = targets.values().map(|lp| lp.exp()).sum();
                (total - 1.0).abs()
            })
            .fold(0.0, f64::max)
    }

    /// Exportação legível (uma linha por parâmetro, em probabilidade).
    pub fn to_human_readable(&self) -> String {
        let mut out = String::new();
        for p in self.parameters() {
            out.push_str(&format!(
                "{}\t{}\t{}\t{:.6}\n",
                p.kind.name(),
                p.pair.first,
                p.pair.second,
                p.log_probability.exp()
            ));
        }
        out
    }
}

fn table_parameters(kind: ParameterKind, table: &Table) -> impl Iterator<Item = ModelParameter> + '_ {
    table.iter().flat_map(move |(first, targets)| {
        targets.iter().map(move |(second, &lp)| {
            ModelParameter::new(kind, StatePair::new(first.as_str(), second.as_str()), lp)
        })
    })
}

/// Modelo persistido junto com a log-verossimilhança da rodada que o produziu.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSnapshot {
    pub model: Model,
    /// `None` para o Model(0), que vem do seeding.
    pub log_likelihood: Option<f64>,
}

impl ModelSnapshot {
    /// Serializa em JSON Lines determinístico.
    pub fn to_jsonl(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for param in self.model.parameters() {
            serde_json::to_writer(&mut out, &ModelRecord::from(param))?;
            out.push(b'\n');
        }
        if let Some(value) = self.log_likelihood {
            serde_json::to_writer(&mut out, &ModelRecord::LogLikelihood { value })?;
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Lê um snapshot; `location` só é usado nas mensagens de erro.
    pub fn from_jsonl(bytes: &[u8], location: &str) -> Result<Self> {
        let mut params = Vec::new();
        let mut log_likelihood = None;

        // from_slice valida o UTF-8 das strings: bytes inválidos viram RecordParse
        for (i, line) in bytes.split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record: ModelRecord =
                serde_json::from_slice(line).map_err(|source| EmError::RecordParse {
                    location: location.to_string(),
                    line: i + 1,
                    source,
                })?;
            match record {
                ModelRecord::Transition {
                    first,
                    second,
                    log_probability,
                } => params.push(ModelParameter::new(
                    ParameterKind::Transition,
                    StatePair { first, second },
                    log_probability,
                )),
                ModelRecord::Emission {
                    first,
                    second,
                    log_probability,
                } => params.push(ModelParameter::new(
                    ParameterKind::Emission,
                    StatePair { first, second },
                    log_probability,
                )),
                ModelRecord::LogLikelihood { value } => log_likelihood = Some(value),
            }
        }

        Ok(Self {
            model: Model::from_parameters(params),
            log_likelihood,
        })
    }
}

/// Normaliza pesos em log-space para que $\sum_t e^{w_t} = 1$.
///
/// Devolve `false` (e não altera nada) quando não há massa alguma.
pub(crate) fn normalize_log_weights(weights: &mut BTreeMap<String, f64>) -> bool {
    let Some(total) = log_sum(weights.values().map(|&w| Some(w))) else {
        return false;
    };
    for w in weights.values_mut() {
        *w -= total;
    }
    true
}
