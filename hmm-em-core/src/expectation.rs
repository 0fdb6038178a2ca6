//! # Expectation: Fase de Map
//!
//! Cada tarefa recebe uma [`CorpusPartition`] e o modelo da rodada anterior.
//! Para cada sequência da partição roda o forward-backward e acumula as
//! contagens esperadas por `(origem, tipo, destino)` com `log_add`.
//!
//! ## Saída (shuffle)
//!
//! | Chave                     | Valor                                  |
//! |---------------------------|----------------------------------------|
//! | `Source(origem)`          | `Count(ParameterCount)`, um por `(tipo, destino)` |
//! | `LogLikelihood` (reservada) | `Likelihood(parcial da partição)`    |
//!
//! Toda a saída é ordenada por chave e destino: rodar a mesma tarefa duas
//! vezes produz exatamente os mesmos registros, na mesma ordem.
//!
//! Uma sequência com probabilidade zero sob o modelo não tem expectativa
//! definida; ela é descartada com um aviso e contada em `skipped`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::corpus::{CorpusPartition, NumberedSequence};
use crate::error::Result;
use crate::forward_backward::ForwardBackward;
use crate::logspace::log_add;
use crate::model::{Model, ParameterCount, ParameterKind};
use crate::substrate::Storage;

/// Chave do shuffle de uma rodada.
///
/// `LogLikelihood` ordena antes de qualquer estado, então o redutor dela roda
/// junto com os demais e não colide com nenhum nome de estado.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoundKey {
    LogLikelihood,
    Source(String),
}

/// Parcial de log-verossimilhança de uma partição (ou soma de várias).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LikelihoodPartial {
    /// $\sum \log \alpha$ das sequências que contribuíram.
    pub log_likelihood: f64,
    pub sequences: usize,
    pub skipped: usize,
}

impl LikelihoodPartial {
    pub fn merge(self, other: Self) -> Self {
        Self {
            log_likelihood: self.log_likelihood + other.log_likelihood,
            sequences: self.sequences + other.sequences,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// Valor do shuffle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoundValue {
    Count(ParameterCount),
    Likelihood(LikelihoodPartial),
}

/// Tarefa de map de uma rodada. Não guarda estado entre partições.
#[derive(Debug, Clone, Copy)]
pub struct ExpectationTask<'a> {
    model: &'a Model,
    start_state: &'a str,
}

impl<'a> ExpectationTask<'a> {
    pub fn new(model: &'a Model, start_state: &'a str) -> Self {
        Self { model, start_state }
    }

    /// Lê a partição do armazenamento e processa as suas sequências.
    ///
    /// Uma linha inválida no corpus falha a tarefa inteira (`CorpusParse`).
    pub fn run<S: Storage + ?Sized>(
        &self,
        storage: &S,
        partition: &CorpusPartition,
    ) -> Result<Vec<(RoundKey, RoundValue)>> {
        let sequences = partition.load(storage)?;
        let out = self.process(&partition.location, &sequences)?;
        debug!(
            particao = partition.index,
            sequencias = sequences.len(),
            registros = out.len(),
            "expectation concluída"
        );
        Ok(out)
    }

    /// Processa sequências já lidas.
    pub fn process(
        &self,
        location: &str,
        sequences: &[NumberedSequence],
    ) -> Result<Vec<(RoundKey, RoundValue)>> {
        let mut counts: BTreeMap<(String, ParameterKind, String), f64> = BTreeMap::new();
        let mut likelihood = LikelihoodPartial::default();

        for numbered in sequences {
            let fb = ForwardBackward::compute(self.model, self.start_state, &numbered.sequence)?;
            let Some(expected) = fb.expected_counts() else {
                warn!(
                    local = location,
                    linha = numbered.line,
                    "sequência com probabilidade zero sob o modelo, ignorada"
                );
                likelihood.skipped += 1;
                continue;
            };

            likelihood.log_likelihood += expected.log_alpha;
            likelihood.sequences += 1;

            let tables = [
                (ParameterKind::Transition, expected.transitions),
                (ParameterKind::Emission, expected.emissions),
            ];
            for (kind, table) in tables {
                for (pair, log_count) in table {
                    counts
                        .entry((pair.first, kind, pair.second))
                        .and_modify(|c| *c = log_add(Some(*c), Some(log_count)).unwrap_or(*c))
                        .or_insert(log_count);
                }
            }
        }

        let mut out: Vec<(RoundKey, RoundValue)> = counts
            .into_iter()
            .map(|((source, kind, target), log_count)| {
                (
                    RoundKey::Source(source),
                    RoundValue::Count(ParameterCount {
                        kind,
                        target,
                        log_count,
                    }),
                )
            })
            .collect();
        out.push((RoundKey::LogLikelihood, RoundValue::Likelihood(likelihood)));
        Ok(out)
    }
}
