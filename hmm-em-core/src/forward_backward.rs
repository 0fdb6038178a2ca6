//! # Forward-Backward
//!
//! Para uma sequência $o_0 \ldots o_{N-1}$ e um modelo fixo, duas tabelas de
//! programação dinâmica resumem *todos* os caminhos de estados sem enumerá-los:
//!
//! ```text
//! forward(s, 0) = P(s | start) · P(o_0 | s)
//! forward(s, i) = Σ_p forward(p, i-1) · P(s | p) · P(o_i | s)
//!
//! backward(s, N-1) = 1
//! backward(s, i)   = Σ_n P(n | s) · P(o_{i+1} | n) · backward(n, i+1)
//! ```
//!
//! A verossimilhança da sequência é $\alpha = \sum_s forward(s, N-1)$ e, para
//! qualquer posição $i$, $\sum_s forward(s,i) \cdot backward(s,i) = \alpha$.
//!
//! ## Contagens esperadas
//!
//! - Transição `(from, to)`: $\sum_{i=0}^{N-2} forward(from,i) \cdot P(to|from) \cdot P(o_{i+1}|to) \cdot backward(to,i+1)$,
//!   mais a transição sintética a partir do estado inicial,
//!   $forward(to,0) \cdot backward(to,0)$ (a probabilidade inicial já está dentro de `forward`).
//! - Emissão `(state, token)`: $\sum_{i : o_i = token} forward(state,i) \cdot backward(state,i)$.
//!
//! Todas as contagens são divididas por $\alpha$ (subtração em log-space),
//! virando expectativas verdadeiras que podem ser somadas entre sequências.
//!
//! Toda a aritmética usa [`crate::logspace`].
//!
//! # Complexidade
//! $O(N \cdot S^2)$ em tempo e $O(N \cdot S)$ em memória, com $S$ estados.

use std::collections::BTreeMap;

use crate::corpus::ObservationSequence;
use crate::error::{EmError, Result};
use crate::logspace::{log_add, log_mul, log_product, log_sum, LogProb};
use crate::model::{Model, StatePair};

/// Contagens esperadas de uma sequência, já divididas por $\alpha$.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpectedCounts {
    pub log_alpha: f64,
    pub transitions: BTreeMap<StatePair, f64>,
    pub emissions: BTreeMap<StatePair, f64>,
}

/// Tabelas forward e backward de uma sequência.
#[derive(Debug, Clone)]
pub struct ForwardBackward<'a> {
    states: &'a [String],
    start_state: &'a str,
    observations: &'a [String],
    /// `trans[p][s] = log P(s | p)`
    trans: Vec<Vec<LogProb>>,
    /// `emit[i][s] = log P(o_i | s)`
    emit: Vec<Vec<LogProb>>,
    /// `forward[i][s]`
    forward: Vec<Vec<LogProb>>,
    /// `backward[i][s]`
    backward: Vec<Vec<LogProb>>,
    log_alpha: LogProb,
}

impl<'a> ForwardBackward<'a> {
    /// Preenche as duas tabelas. Falha com `InvalidSequence` se a sequência é vazia.
    pub fn compute(model: &'a Model, start_state: &'a str, sequence: &'a ObservationSequence) -> Result<Self> {
        let observations = sequence.tokens();
        if observations.is_empty() {
            return Err(EmError::InvalidSequence);
        }

        let states = model.states();
        let n_obs = observations.len();
        let n_states = states.len();

        let start: Vec<LogProb> = states
            .iter()
            .map(|s| model.transition(start_state, s))
            .collect();
        let trans: Vec<Vec<LogProb>> = states
            .iter()
            .map(|p| states.iter().map(|s| model.transition(p, s)).collect())
            .collect();
        let emit: Vec<Vec<LogProb>> = observations
            .iter()
            .map(|o| states.iter().map(|s| model.emission(s, o)).collect())
            .collect();

        // Forward
        let mut forward = vec![vec![None; n_states]; n_obs];
        for s in 0..n_states {
            forward[0][s] = log_mul(start[s], emit[0][s]);
        }
        for i in 1..n_obs {
            for s in 0..n_states {
                let value = log_sum(
                    (0..n_states).map(|p| log_product([forward[i - 1][p], trans[p][s], emit[i][s]])),
                );
                forward[i][s] = value;
            }
        }

        // Backward
        let mut backward = vec![vec![None; n_states]; n_obs];
        for s in 0..n_states {
            backward[n_obs - 1][s] = Some(0.0);
        }
        for i in (0..n_obs - 1).rev() {
            for s in 0..n_states {
                let value = log_sum(
                    (0..n_states).map(|n| log_product([trans[s][n], emit[i + 1][n], backward[i + 1][n]])),
                );
                backward[i][s] = value;
            }
        }

        let log_alpha = log_sum(forward[n_obs - 1].iter().copied());

        Ok(Self {
            states,
            start_state,
            observations,
            trans,
            emit,
            forward,
            backward,
            log_alpha,
        })
    }

    fn state_index(&self, state: &str) -> Option<usize> {
        self.states.binary_search_by(|s| s.as_str().cmp(state)).ok()
    }

    /// `forward(state, i)`; `None` também para estados desconhecidos.
    pub fn forward(&self, state: &str, i: usize) -> LogProb {
        self.forward.get(i)?[self.state_index(state)?]
    }

    /// `backward(state, i)`; `None` também para estados desconhecidos.
    pub fn backward(&self, state: &str, i: usize) -> LogProb {
        self.backward.get(i)?[self.state_index(state)?]
    }

    /// $\log \alpha$: log-verossimilhança da sequência. `None` se ela tem
    /// probabilidade zero sob o modelo.
    pub fn log_alpha(&self) -> LogProb {
        self.log_alpha
    }

    /// Contagens esperadas de transição e emissão.
    ///
    /// Devolve `None` quando $\alpha = 0$: não há expectativa a normalizar.
    pub fn expected_counts(&self) -> Option<ExpectedCounts> {
        let log_alpha = self.log_alpha?;
        let n_obs = self.observations.len();
        let n_states = self.states.len();

        let mut transitions: BTreeMap<StatePair, LogProb> = BTreeMap::new();
        let mut emissions: BTreeMap<StatePair, LogProb> = BTreeMap::new();

        // transição sintética a partir do estado inicial
        for s in 0..n_states {
            accumulate(
                &mut transitions,
                StatePair::new(self.start_state, self.states[s].as_str()),
                log_mul(self.forward[0][s], self.backward[0][s]),
            );
        }

        for i in 0..n_obs.saturating_sub(1) {
            for p in 0..n_states {
                if self.forward[i][p].is_none() {
                    continue;
                }
                for s in 0..n_states {
                    let value = log_product([
                        self.forward[i][p],
                        self.trans[p][s],
                        self.emit[i + 1][s],
                        self.backward[i + 1][s],
                    ]);
                    accumulate(
                        &mut transitions,
                        StatePair::new(self.states[p].as_str(), self.states[s].as_str()),
                        value,
                    );
                }
            }
        }

        for (i, token) in self.observations.iter().enumerate() {
            for s in 0..n_states {
                accumulate(
                    &mut emissions,
                    StatePair::new(self.states[s].as_str(), token.as_str()),
                    log_mul(self.forward[i][s], self.backward[i][s]),
                );
            }
        }

        let normalize = |table: BTreeMap<StatePair, LogProb>| -> BTreeMap<StatePair, f64> {
            table
                .into_iter()
                .filter_map(|(k, v)| v.map(|lp| (k, lp - log_alpha)))
                .collect()
        };

        Some(ExpectedCounts {
            log_alpha,
            transitions: normalize(transitions),
            emissions: normalize(emissions),
        })
    }
}

fn accumulate(table: &mut BTreeMap<StatePair, LogProb>, key: StatePair, value: LogProb) {
    if value.is_some() {
        let slot = table.entry(key).or_insert(None);
        *slot = log_add(*slot, value);
    }
}
