//! # Algoritmo de Viterbi: Decodificação Final
//!
//! Depois do treinamento, cada sequência do corpus recebe a sequência de
//! estados **mais provável** sob o modelo final.
//!
//! ## Algoritmo
//!
//! É a mesma recorrência do forward, trocando a soma pelo máximo e guardando
//! qual estado anterior venceu:
//!
//! ```text
//! Inicialização: viterbi[0][s] = P(s | start) · P(o_0 | s)
//!
//! Recursão:      viterbi[i][s] = max_p [viterbi[i-1][p] · P(s | p)] · P(o_i | s)
//!                backptr[i][s] = argmax_p (...)
//!
//! Backtracking:  parte do melhor estado da última coluna e segue os backptrs
//! ```
//!
//! ## Empates
//!
//! Estados são visitados em ordem lexicográfica e só um valor **estritamente**
//! maior substitui o melhor atual, então em caso de empate vence o primeiro
//! estado na ordem. A saída é reprodutível entre execuções.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::corpus::ObservationSequence;
use crate::error::{EmError, Result};
use crate::logspace::{beats, log_mul, log_product, LogProb};
use crate::model::Model;

/// Sequência de pares `(observação, estado)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedSequence {
    pairs: Vec<(String, String)>,
}

impl TaggedSequence {
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self { pairs }
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Apenas os estados, na ordem das observações.
    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(_, s)| s.as_str())
    }
}

/// Formato de saída: `(obs,estado)` separados por espaço.
impl fmt::Display for TaggedSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (obs, state)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "({obs},{state})")?;
        }
        Ok(())
    }
}

/// Resultado do Viterbi.
#[derive(Debug, Clone, PartialEq)]
pub struct ViterbiResult {
    pub tagged: TaggedSequence,
    /// Log-probabilidade conjunta do melhor caminho com as observações.
    pub log_probability: f64,
}

/// Retorna (índice, valor) do máximo de uma coluna; primeiro índice em empates.
fn best_in_column(column: &[LogProb]) -> (usize, LogProb) {
    let mut best = (0, None);
    for (i, &value) in column.iter().enumerate() {
        if beats(value, best.1) {
            best = (i, value);
        }
    }
    best
}

/// Decodifica uma sequência.
///
/// Falha com `InvalidSequence` para sequência vazia e com `NoViterbiPath`
/// quando todo caminho tem probabilidade zero.
pub fn viterbi_decode(
    model: &Model,
    start_state: &str,
    sequence: &ObservationSequence,
) -> Result<ViterbiResult> {
    let observations = sequence.tokens();
    if observations.is_empty() {
        return Err(EmError::InvalidSequence);
    }

    let states = model.states();
    let n_obs = observations.len();
    let n_states = states.len();

    // viterbi[s] = melhor log-prob de um caminho que termina em s na posição atual
    let mut viterbi: Vec<LogProb> = states
        .iter()
        .map(|s| log_mul(model.transition(start_state, s), model.emission(s, &observations[0])))
        .collect();
    // backptr[i][s] = estado anterior que maximizou viterbi[i][s]
    let mut backptr: Vec<Vec<usize>> = vec![vec![0usize; n_states]; n_obs];

    for i in 1..n_obs {
        let mut next = vec![None; n_states];

        for s in 0..n_states {
            let emit = model.emission(&states[s], &observations[i]);
            if emit.is_none() {
                continue;
            }

            let mut best_prev = 0;
            let mut best_score = None;
            for p in 0..n_states {
                let score = log_mul(viterbi[p], model.transition(&states[p], &states[s]));
                if beats(score, best_score) {
                    best_score = score;
                    best_prev = p;
                }
            }

            next[s] = log_product([best_score, emit]);
            backptr[i][s] = best_prev;
        }

        viterbi = next;
    }

    let (mut current, best_total) = best_in_column(&viterbi);
    let log_probability = best_total.ok_or(EmError::NoViterbiPath)?;

    // Backtracking
    let mut path = vec![0usize; n_obs];
    path[n_obs - 1] = current;
    for i in (1..n_obs).rev() {
        current = backptr[i][current];
        path[i - 1] = current;
    }

    let pairs = observations
        .iter()
        .zip(path)
        .map(|(obs, s)| (obs.clone(), states[s].clone()))
        .collect();

    Ok(ViterbiResult {
        tagged: TaggedSequence::new(pairs),
        log_probability,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tests::two_state_model;
    use crate::model::{ModelParameter, ParameterKind, StatePair};

    fn seq(tokens: &str) -> ObservationSequence {
        tokens.split_whitespace().collect()
    }

    #[test]
    fn test_two_state_example() {
        let model = two_state_model();
        let result = viterbi_decode(&model, "#", &seq("x y")).unwrap();
        assert_eq!(
            result.tagged.pairs(),
            &[
                ("x".to_string(), "A".to_string()),
                ("y".to_string(), "B".to_string())
            ]
        );
        // .5 * .9 * .4 * .8
        assert!((result.log_probability - 0.144f64.ln()).abs() < 1e-12);
        assert_eq!(result.tagged.to_string(), "(x,A) (y,B)");
    }

    #[test]
    fn test_long_sequence_does_not_underflow() {
        let model = two_state_model();
        let tokens = vec!["y"; 2000].join(" ");
        let result = viterbi_decode(&model, "#", &seq(&tokens)).unwrap();
        assert!(result.log_probability.is_finite());
        assert!(result.tagged.states().all(|s| s == "B"));
    }

    #[test]
    fn test_ties_break_by_state_order() {
        let p = |kind, a: &str, b: &str, prob: f64| {
            ModelParameter::new(kind, StatePair::new(a, b), f64::ln(prob))
        };
        use ParameterKind::{Emission as E, Transition as T};
        let model = Model::from_parameters(vec![
            p(T, "#", "L", 0.5),
            p(T, "#", "K", 0.5),
            p(T, "K", "K", 0.5),
            p(T, "K", "L", 0.5),
            p(T, "L", "K", 0.5),
            p(T, "L", "L", 0.5),
            p(E, "K", "a", 1.0),
            p(E, "L", "a", 1.0),
        ]);
        let result = viterbi_decode(&model, "#", &seq("a a a")).unwrap();
        assert!(result.tagged.states().all(|s| s == "K"));
    }

    #[test]
    fn test_no_path_for_unknown_token() {
        let model = two_state_model();
        let err = viterbi_decode(&model, "#", &seq("x z")).unwrap_err();
        assert!(matches!(err, EmError::NoViterbiPath));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        let model = two_state_model();
        let err = viterbi_decode(&model, "#", &ObservationSequence::new(vec![])).unwrap_err();
        assert!(matches!(err, EmError::InvalidSequence));
    }
}
